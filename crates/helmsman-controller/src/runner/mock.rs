// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! [`MockRunner`] keeps the runner state machine in memory and serves calls
//! from a [`VerbRegistry`]. It follows the same contract a real runner does:
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | Idle | `reserve(d)` | Reserved(d) |
//! | Reserved(d) | `deploy(d)` | Assigned(d) |
//! | Reserved(d), Assigned(d) | `terminate(d)` | Idle |
//!
//! [`MockFleet`] is a [`ClientFactory`] that resolves endpoints to mock
//! runners registered with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use helmsman_model::schema::VerbRef;
use helmsman_model::verb::VerbRegistry;
use helmsman_model::{DeploymentKey, Labels, RunnerKey};
use serde_json::Value;

use super::traits::*;
use crate::error::{Error, Result};
use crate::types::{Runner, RunnerState};

#[derive(Debug)]
struct MockState {
    state: RunnerState,
    deployment: Option<DeploymentKey>,
}

/// A call received by a [`MockRunner`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Call body.
    pub request: CallRequest,
    /// Correlation metadata.
    pub context: CallContext,
}

/// In-process runner.
pub struct MockRunner {
    key: RunnerKey,
    endpoint: String,
    labels: Labels,
    registry: VerbRegistry,
    state: Mutex<MockState>,
    calls: Mutex<Vec<RecordedCall>>,
    /// When set, every operation fails with Unavailable.
    pub unreachable: AtomicBool,
    /// When set, `reserve` fails with Unavailable.
    pub fail_reserve: AtomicBool,
    /// When set, `reserve` never answers.
    pub hang_reserve: AtomicBool,
    /// When set, `deploy` fails with Internal.
    pub fail_deploy: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockRunner {
    /// An idle runner for `language` with no verbs.
    pub fn new(endpoint: impl Into<String>, language: &str) -> Self {
        Self {
            key: RunnerKey::new(),
            endpoint: endpoint.into(),
            labels: Labels::for_language(language),
            registry: VerbRegistry::default(),
            state: Mutex::new(MockState {
                state: RunnerState::Idle,
                deployment: None,
            }),
            calls: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            fail_reserve: AtomicBool::new(false),
            hang_reserve: AtomicBool::new(false),
            fail_deploy: AtomicBool::new(false),
        }
    }

    /// Serve calls from `registry`.
    pub fn with_registry(mut self, registry: VerbRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the placement labels.
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Runner key.
    pub fn key(&self) -> RunnerKey {
        self.key
    }

    /// Runner endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The heartbeat this runner would send now.
    pub fn heartbeat(&self) -> Runner {
        let state = lock(&self.state);
        Runner {
            key: self.key,
            endpoint: self.endpoint.clone(),
            state: state.state,
            deployment: state.deployment.clone(),
            labels: self.labels.clone(),
        }
    }

    /// Calls received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable(format!(
                "runner {} is unreachable",
                self.endpoint
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerClient for MockRunner {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn reserve(&self, deployment: &DeploymentKey) -> Result<()> {
        self.check_reachable()?;
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(Error::Unavailable(format!(
                "runner {} refused reservation",
                self.endpoint
            )));
        }
        if self.hang_reserve.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut state = lock(&self.state);
        match (state.state, &state.deployment) {
            (RunnerState::Idle, _) => {
                state.state = RunnerState::Reserved;
                state.deployment = Some(deployment.clone());
                Ok(())
            }
            (RunnerState::Reserved, Some(current)) if current == deployment => Ok(()),
            (other, _) => Err(Error::Conflict(format!(
                "runner {} is {other}, cannot reserve",
                self.endpoint
            ))),
        }
    }

    async fn deploy(&self, deployment: &DeploymentKey) -> Result<()> {
        self.check_reachable()?;
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "runner {} failed to deploy {deployment}",
                self.endpoint
            )));
        }
        let mut state = lock(&self.state);
        match (state.state, &state.deployment) {
            (RunnerState::Reserved, Some(current)) if current == deployment => {
                state.state = RunnerState::Assigned;
                Ok(())
            }
            (other, _) => Err(Error::Conflict(format!(
                "runner {} is {other}, not reserved for {deployment}",
                self.endpoint
            ))),
        }
    }

    async fn terminate(&self, deployment: &DeploymentKey) -> Result<Runner> {
        self.check_reachable()?;
        {
            let mut state = lock(&self.state);
            if state.deployment.as_ref() != Some(deployment) {
                return Err(Error::NotFound(format!(
                    "runner {} is not running {deployment}",
                    self.endpoint
                )));
            }
            state.state = RunnerState::Idle;
            state.deployment = None;
        }
        Ok(self.heartbeat())
    }

    async fn call(&self, request: &CallRequest, context: &CallContext) -> Result<CallResponse> {
        self.check_reachable()?;
        lock(&self.calls).push(RecordedCall {
            request: request.clone(),
            context: context.clone(),
        });
        let verb = self
            .registry
            .get(&request.verb)
            .ok_or_else(|| Error::NotFound(format!("verb {} not hosted", request.verb)))?;
        let body = serde_json::to_vec(&request.body)?;
        match verb.invoke(&body).await {
            Ok(out) => Ok(CallResponse::Body(serde_json::from_slice::<Value>(&out)?)),
            Err(e) => Ok(CallResponse::Error(CallError { message: e.message })),
        }
    }
}

/// Resolves endpoints to registered [`MockRunner`]s.
#[derive(Default)]
pub struct MockFleet {
    runners: Mutex<HashMap<String, Arc<MockRunner>>>,
}

impl MockFleet {
    /// Empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `runner` under its endpoint.
    pub fn add(&self, runner: Arc<MockRunner>) -> Arc<MockRunner> {
        lock(&self.runners).insert(runner.endpoint().to_string(), Arc::clone(&runner));
        runner
    }

    /// The runner at `endpoint`.
    pub fn get(&self, endpoint: &str) -> Option<Arc<MockRunner>> {
        lock(&self.runners).get(endpoint).cloned()
    }

    /// All runners hosting `verb`'s module in state Assigned.
    pub fn serving(&self, verb: &VerbRef) -> Vec<Arc<MockRunner>> {
        lock(&self.runners)
            .values()
            .filter(|r| {
                let hb = r.heartbeat();
                hb.state == RunnerState::Assigned
                    && hb.deployment.as_ref().map(|d| d.module()) == Some(verb.module.as_str())
            })
            .cloned()
            .collect()
    }
}

impl ClientFactory for MockFleet {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn RunnerClient>> {
        let runner = self
            .get(endpoint)
            .ok_or_else(|| Error::Unavailable(format!("no runner listening at {endpoint}")))?;
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use helmsman_model::verb::{JsonVerb, VerbError};
    use serde_json::json;

    use super::*;

    fn echo_registry() -> VerbRegistry {
        VerbRegistry::builder()
            .register(JsonVerb::new(
                VerbRef::new("echo", "echo"),
                "EchoRequest",
                "EchoResponse",
                |req: Value| async move {
                    match req["name"].as_str() {
                        Some(name) => Ok(json!({"message": format!("Hello, {name}!")})),
                        None => Err(VerbError::new("name is required")),
                    }
                },
            ))
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_state_machine() {
        let runner = MockRunner::new("http://127.0.0.1:9001", "go");
        let d = DeploymentKey::new("echo");
        let other = DeploymentKey::new("echo");

        assert!(runner.deploy(&d).await.is_err());
        runner.reserve(&d).await.unwrap();
        runner.reserve(&d).await.unwrap();
        assert!(runner.reserve(&other).await.is_err());
        runner.deploy(&d).await.unwrap();
        assert_eq!(runner.heartbeat().state, RunnerState::Assigned);

        assert!(runner.terminate(&other).await.unwrap_err().is_not_found());
        let hb = runner.terminate(&d).await.unwrap();
        assert_eq!(hb.state, RunnerState::Idle);
        assert_eq!(hb.deployment, None);
    }

    #[tokio::test]
    async fn test_call_outcomes() {
        let runner = MockRunner::new("http://127.0.0.1:9002", "go").with_registry(echo_registry());
        let context = CallContext::default();

        let ok = runner
            .call(
                &CallRequest {
                    verb: VerbRef::new("echo", "echo"),
                    body: json!({"name": "Bob"}),
                },
                &context,
            )
            .await
            .unwrap();
        assert_eq!(ok, CallResponse::Body(json!({"message": "Hello, Bob!"})));

        let app_err = runner
            .call(
                &CallRequest {
                    verb: VerbRef::new("echo", "echo"),
                    body: json!({}),
                },
                &context,
            )
            .await
            .unwrap();
        assert!(matches!(app_err, CallResponse::Error(e) if e.message == "name is required"));

        let missing = runner
            .call(
                &CallRequest {
                    verb: VerbRef::new("echo", "shout"),
                    body: json!({}),
                },
                &context,
            )
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_fleet_resolves_endpoints() {
        let fleet = MockFleet::new();
        let runner = fleet.add(Arc::new(MockRunner::new("http://127.0.0.1:9003", "go")));
        runner.unreachable.store(true, Ordering::SeqCst);

        let client = fleet.connect("http://127.0.0.1:9003").unwrap();
        assert!(matches!(client.ping().await, Err(Error::Unavailable(_))));
        assert!(matches!(
            fleet.connect("http://127.0.0.1:1"),
            Err(Error::Unavailable(_))
        ));
    }
}
