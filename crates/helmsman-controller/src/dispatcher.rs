// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Verb call routing.
//!
//! [`Dispatcher::call`] resolves the destination module to a live runner,
//! settles which request the call belongs to, forwards it, and records a call
//! event whatever the outcome.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use helmsman_model::{Origin, RequestName};
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::runner::{CallContext, CallRequest, CallResponse, RunnerClients};
use crate::types::{CallEvent, Route};

/// Result of a routed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Request the call was recorded against.
    pub request_name: RequestName,
    /// What the verb returned.
    pub response: CallResponse,
}

/// Routes calls to runners.
#[derive(Clone)]
pub struct Dispatcher {
    dal: Dal,
    clients: Arc<RunnerClients>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(dal: Dal, clients: Arc<RunnerClients>) -> Self {
        Self { dal, clients }
    }

    /// Route `request` to a runner serving its module.
    ///
    /// An empty caller chain means the call comes from outside the system:
    /// unless the caller already minted one, a new ingress request name is
    /// created for it. A call from inside a chain must carry its request name.
    pub async fn call(
        &self,
        request: CallRequest,
        mut context: CallContext,
        source_addr: &str,
    ) -> Result<CallOutcome> {
        let routes = self.dal.routing_table(Some(&request.verb.module)).await?;
        let Some(route) = routes.choose(&mut rand::thread_rng()).cloned() else {
            return Err(Error::NotFound(format!(
                "no routes for module {}",
                request.verb.module
            )));
        };

        let request_name = match (context.request_name.take(), context.callers.is_empty()) {
            (Some(name), _) => name,
            (None, true) => {
                self.dal
                    .create_request(Origin::Ingress, &request.verb.to_string(), source_addr)
                    .await?
            }
            (None, false) => {
                return Err(Error::InvalidArgument(
                    "request name is required for calls inside a call chain".to_string(),
                ));
            }
        };

        let source_verb = context.source_verb().cloned();
        context.push_caller(&request.verb);
        context.request_name = Some(request_name.clone());

        debug!(
            verb = %request.verb,
            request = %request_name,
            route = %route,
            "Dispatching call"
        );
        let started_at = Utc::now();
        let timer = Instant::now();
        let result = self.forward(&route, &request, &context).await;
        let duration = timer.elapsed();

        let (response, error) = match &result {
            Ok(CallResponse::Body(body)) => (Some(body.to_string()), None),
            Ok(CallResponse::Error(e)) => (None, Some(e.message.clone())),
            Err(e) => (None, Some(e.to_string())),
        };
        let event = CallEvent {
            request_name: Some(request_name.clone()),
            deployment: route.deployment.clone(),
            time: started_at,
            source_verb,
            dest_verb: request.verb.clone(),
            duration,
            request: request.body.to_string(),
            response,
            error,
        };
        if let Err(e) = self.dal.insert_call_event(&event).await {
            warn!(request = %request_name, error = %e, "Failed to record call event");
        }

        Ok(CallOutcome {
            request_name,
            response: result?,
        })
    }

    async fn forward(
        &self,
        route: &Route,
        request: &CallRequest,
        context: &CallContext,
    ) -> Result<CallResponse> {
        let client = self.clients.get(&route.endpoint).await?;
        client.call(request, context).await
    }
}

#[cfg(test)]
mod tests {
    use helmsman_model::schema::{Module, VerbRef};
    use helmsman_model::verb::{JsonVerb, VerbError, VerbRegistry};
    use helmsman_model::DeploymentKey;
    use serde_json::{Value, json};

    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::runner::{MockFleet, MockRunner};
    use crate::types::{DeploymentArtefact, RunnerState};

    fn registry() -> VerbRegistry {
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

    async fn setup() -> (Dispatcher, Dal, Arc<MockRunner>, DeploymentKey) {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        let dal = Dal::new(Arc::new(persistence));
        let fleet = Arc::new(MockFleet::new());
        let runner = fleet.add(Arc::new(
            MockRunner::new("http://127.0.0.1:9301", "go").with_registry(registry()),
        ));

        let digest = dal.create_artefact(b"echo").await.unwrap();
        let key = dal
            .create_deployment(
                "go",
                &Module::new("echo"),
                &[DeploymentArtefact {
                    digest,
                    path: "main".to_string(),
                    executable: true,
                }],
            )
            .await
            .unwrap();
        dal.replace_deployment(&key, 1).await.unwrap();

        let mut heartbeat = runner.heartbeat();
        heartbeat.state = RunnerState::Assigned;
        heartbeat.deployment = Some(key.clone());
        dal.upsert_runner(&heartbeat).await.unwrap();

        let dispatcher = Dispatcher::new(dal.clone(), Arc::new(RunnerClients::new(fleet)));
        (dispatcher, dal, runner, key)
    }

    fn echo(body: Value) -> CallRequest {
        CallRequest {
            verb: VerbRef::new("echo", "echo"),
            body,
        }
    }

    #[tokio::test]
    async fn test_external_call_mints_request_and_records_event() {
        let (dispatcher, dal, runner, key) = setup().await;

        let outcome = dispatcher
            .call(echo(json!({"name": "Bob"})), CallContext::default(), "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(
            outcome.response,
            CallResponse::Body(json!({"message": "Hello, Bob!"}))
        );
        assert_eq!(outcome.request_name.origin(), Origin::Ingress);

        let calls = runner.calls();
        let received = &calls[0].context;
        assert_eq!(received.request_name.as_ref(), Some(&outcome.request_name));
        assert_eq!(received.callers, vec![VerbRef::new("echo", "echo")]);

        let events = dal.list_call_events(&outcome.request_name).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].deployment, key);
        assert_eq!(events[0].source_verb, None);
        assert_eq!(events[0].error, None);
    }

    #[tokio::test]
    async fn test_application_error_is_recorded() {
        let (dispatcher, dal, _, _) = setup().await;

        let outcome = dispatcher
            .call(echo(json!({})), CallContext::default(), "127.0.0.1")
            .await
            .unwrap();
        assert!(matches!(outcome.response, CallResponse::Error(_)));
        let events = dal.list_call_events(&outcome.request_name).await.unwrap();
        assert_eq!(events[0].error.as_deref(), Some("name is required"));
    }

    #[tokio::test]
    async fn test_chained_call_requires_request_name() {
        let (dispatcher, _, _, _) = setup().await;
        let context = CallContext {
            request_name: None,
            callers: vec![VerbRef::new("time", "time")],
        };
        let err = dispatcher
            .call(echo(json!({"name": "Bob"})), context, "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_chained_call_propagates_name_and_source() {
        let (dispatcher, dal, runner, _) = setup().await;
        let name = RequestName::new(Origin::Cron, "nightly");
        dal.persistence()
            .create_request(&name, "127.0.0.1")
            .await
            .unwrap();
        let context = CallContext {
            request_name: Some(name.clone()),
            callers: vec![VerbRef::new("time", "time")],
        };

        let outcome = dispatcher
            .call(echo(json!({"name": "Bob"})), context, "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(outcome.request_name, name);
        assert_eq!(
            runner.calls()[0].context.callers,
            vec![VerbRef::new("time", "time"), VerbRef::new("echo", "echo")]
        );
        let events = dal.list_call_events(&name).await.unwrap();
        assert_eq!(events[0].source_verb, Some(VerbRef::new("time", "time")));
    }

    #[tokio::test]
    async fn test_unknown_module_is_not_found() {
        let (dispatcher, _, _, _) = setup().await;
        let err = dispatcher
            .call(
                CallRequest {
                    verb: VerbRef::new("time", "time"),
                    body: json!({}),
                },
                CallContext::default(),
                "127.0.0.1",
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
