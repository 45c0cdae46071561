// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for helmsman-controller integration tests.
//!
//! Provides a [`TestContext`] over an in-memory SQLite store, a fleet of mock
//! runners hosting an `echo` module, and helpers to drive the HTTP router
//! with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use helmsman_model::DeploymentKey;
use helmsman_model::schema::{Data, Decl, Field, Metadata, Module, Verb, VerbRef};
use helmsman_model::verb::{JsonVerb, VerbError, VerbRegistry};
use serde_json::{Value, json};
use tower::ServiceExt;

use helmsman_controller::dal::Dal;
use helmsman_controller::handlers::ControllerHandlerState;
use helmsman_controller::persistence::{Persistence, SqlitePersistence};
use helmsman_controller::reconciler::{Reconciler, ReconcilerConfig};
use helmsman_controller::runner::{MockFleet, MockRunner, RunnerClients};
use helmsman_controller::server::build_router;
use helmsman_controller::types::DeploymentArtefact;

/// Helper macro to skip tests if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Everything a test needs to drive one controller.
pub struct TestContext {
    pub dal: Dal,
    pub fleet: Arc<MockFleet>,
    pub clients: Arc<RunnerClients>,
    pub state: Arc<ControllerHandlerState>,
    pub router: Router,
}

impl TestContext {
    /// Controller over a fresh in-memory SQLite store.
    pub async fn new() -> Self {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1)
            .await
            .expect("Failed to open in-memory SQLite");
        Self::with_persistence(Arc::new(persistence))
    }

    /// Controller over `persistence`.
    pub fn with_persistence(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_chunk_size(persistence, 1024 * 1024)
    }

    /// Controller streaming artefacts in `chunk_size` pieces.
    pub fn with_chunk_size(persistence: Arc<dyn Persistence>, chunk_size: usize) -> Self {
        let dal = Dal::new(persistence);
        let fleet = Arc::new(MockFleet::new());
        let clients = Arc::new(RunnerClients::new(fleet.clone()));
        let state = Arc::new(
            ControllerHandlerState::new(dal.clone(), clients.clone())
                .with_artefact_chunk_size(chunk_size)
                .with_runner_timeout(Duration::from_millis(500)),
        );
        let router = build_router(state.clone());
        Self {
            dal,
            fleet,
            clients,
            state,
            router,
        }
    }

    /// Reconciler with a long interval, for driving ticks by hand.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.dal.clone(),
            self.clients.clone(),
            ReconcilerConfig {
                interval: Duration::from_secs(3600),
                reservation_timeout: Duration::from_secs(5),
            },
        )
    }

    /// Add an idle `go` runner hosting the echo verbs and record its heartbeat.
    pub async fn add_runner(&self, port: u16) -> Arc<MockRunner> {
        let runner = self.fleet.add(Arc::new(
            MockRunner::new(format!("http://127.0.0.1:{port}"), "go")
                .with_registry(echo_registry()),
        ));
        self.dal
            .upsert_runner(&runner.heartbeat())
            .await
            .expect("Failed to upsert runner");
        runner
    }

    /// Upload an artefact and create an echo deployment with no replicas.
    pub async fn create_echo_deployment(&self, content: &[u8]) -> DeploymentKey {
        let digest = self
            .dal
            .create_artefact(content)
            .await
            .expect("Failed to store artefact");
        self.dal
            .create_deployment(
                "go",
                &echo_module(),
                &[DeploymentArtefact {
                    digest,
                    path: "main".to_string(),
                    executable: true,
                }],
            )
            .await
            .expect("Failed to create deployment")
    }

    /// Send a JSON request through the router.
    pub async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .expect("Failed to build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    /// Send a raw body through the router and parse an NDJSON response.
    pub async fn send_ndjson(
        &self,
        method: &str,
        uri: &str,
        body: Body,
    ) -> (StatusCode, Vec<Value>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .expect("Failed to build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let lines = bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).expect("Invalid NDJSON line"))
            .collect();
        (status, lines)
    }
}

/// Verbs hosted by the mock runners.
pub fn echo_registry() -> VerbRegistry {
    VerbRegistry::builder()
        .register(JsonVerb::new(
            VerbRef::new("echo", "echo"),
            "EchoRequest",
            "EchoResponse",
            |req: Value| async move {
                match req.get("name").and_then(Value::as_str) {
                    Some(name) => Ok(json!({"message": format!("Hello, {name}!")})),
                    None => Err(VerbError::new("name is required")),
                }
            },
        ))
        .expect("Failed to register echo")
        .build()
}

/// Schema of the echo module, reachable at `GET /echo/{name}` and `POST /echo`.
pub fn echo_module() -> Module {
    let mut module = Module::new("echo");
    module.decls = vec![
        Decl::Data(Data {
            name: "EchoRequest".to_string(),
            comments: vec![],
            fields: vec![Field {
                name: "name".to_string(),
                ty: "String".to_string(),
            }],
            metadata: vec![],
        }),
        Decl::Data(Data {
            name: "EchoResponse".to_string(),
            comments: vec![],
            fields: vec![Field {
                name: "message".to_string(),
                ty: "String".to_string(),
            }],
            metadata: vec![],
        }),
        Decl::Verb(Verb {
            name: "echo".to_string(),
            comments: vec!["Greets the caller.".to_string()],
            request: "EchoRequest".to_string(),
            response: "EchoResponse".to_string(),
            metadata: vec![
                Metadata::Ingress {
                    method: "GET".to_string(),
                    path: "/echo/{name}".to_string(),
                },
                Metadata::Ingress {
                    method: "POST".to_string(),
                    path: "/echo".to_string(),
                },
            ],
        }),
    ];
    module
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
