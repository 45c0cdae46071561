// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner client trait definitions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use helmsman_model::schema::VerbRef;
use helmsman_model::{DeploymentKey, RequestName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::Runner;

/// Header carrying one entry of the caller chain. Repeated, outermost first.
pub const VERB_HEADER: &str = "Helmsman-Verb";

/// Header carrying the correlating request name.
pub const REQUEST_NAME_HEADER: &str = "Helmsman-Request-Name";

/// Body of a verb call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Verb to invoke.
    pub verb: VerbRef,
    /// JSON request body.
    #[serde(default)]
    pub body: Value,
}

/// Correlation metadata sent alongside a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Request the call belongs to.
    pub request_name: Option<RequestName>,
    /// Verbs on the path to this call, outermost first.
    pub callers: Vec<VerbRef>,
}

impl CallContext {
    /// Append `verb` unless it is already the last entry.
    pub fn push_caller(&mut self, verb: &VerbRef) {
        if self.callers.last() != Some(verb) {
            self.callers.push(verb.clone());
        }
    }

    /// The immediate caller, if any.
    pub fn source_verb(&self) -> Option<&VerbRef> {
        self.callers.last()
    }
}

/// Application-level failure reported by a verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    /// Message produced by the verb.
    pub message: String,
}

/// Outcome of a verb call that reached the verb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponse {
    /// The verb returned a body.
    Body(Value),
    /// The verb returned an error.
    Error(CallError),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeploymentRequest {
    pub deployment_key: DeploymentKey,
}

/// Operations the control plane invokes on a runner.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    /// Check the runner is reachable.
    async fn ping(&self) -> Result<()>;

    /// Ask the runner to hold itself for `deployment`.
    async fn reserve(&self, deployment: &DeploymentKey) -> Result<()>;

    /// Fetch and start `deployment`. The runner must be reserved for it.
    async fn deploy(&self, deployment: &DeploymentKey) -> Result<()>;

    /// Stop `deployment`, returning the runner's heartbeat afterwards.
    async fn terminate(&self, deployment: &DeploymentKey) -> Result<Runner>;

    /// Invoke a verb hosted by the runner.
    async fn call(&self, request: &CallRequest, context: &CallContext) -> Result<CallResponse>;
}

/// Creates clients for runner endpoints.
pub trait ClientFactory: Send + Sync {
    /// A client for `endpoint`. Must not perform I/O.
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn RunnerClient>>;
}

/// Client cache keyed by endpoint.
///
/// The lock is held only while looking up or inserting a client, never for
/// the duration of a call.
pub struct RunnerClients {
    factory: Arc<dyn ClientFactory>,
    cache: Mutex<HashMap<String, Arc<dyn RunnerClient>>>,
}

impl RunnerClients {
    /// Empty cache over `factory`.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The cached client for `endpoint`, creating it on first use.
    pub async fn get(&self, endpoint: &str) -> Result<Arc<dyn RunnerClient>> {
        let mut cache = self.cache.lock().await;
        if let Some(client) = cache.get(endpoint) {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.connect(endpoint)?;
        cache.insert(endpoint.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Drop the cached client for `endpoint`.
    pub async fn evict(&self, endpoint: &str) {
        self.cache.lock().await.remove(endpoint);
    }

    /// Number of cached clients.
    pub async fn cached_count(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::runner::MockRunner;

    struct CountingFactory {
        connects: AtomicUsize,
    }

    impl ClientFactory for CountingFactory {
        fn connect(&self, endpoint: &str) -> Result<Arc<dyn RunnerClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockRunner::new(endpoint, "go")))
        }
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_endpoint() {
        let factory = Arc::new(CountingFactory {
            connects: AtomicUsize::new(0),
        });
        let clients = RunnerClients::new(factory.clone());

        let a = clients.get("http://a").await.unwrap();
        let again = clients.get("http://a").await.unwrap();
        clients.get("http://b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(clients.cached_count().await, 2);

        clients.evict("http://a").await;
        clients.get("http://a").await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_push_caller_suppresses_repeat() {
        let mut context = CallContext::default();
        let echo = VerbRef::new("echo", "echo");
        let time = VerbRef::new("time", "time");
        context.push_caller(&echo);
        context.push_caller(&echo);
        context.push_caller(&time);
        context.push_caller(&echo);
        assert_eq!(context.callers, vec![echo.clone(), time, echo.clone()]);
        assert_eq!(context.source_verb(), Some(&echo));
    }

    #[test]
    fn test_call_response_wire_form() {
        let ok = serde_json::to_value(CallResponse::Body(json!({"message": "hi"}))).unwrap();
        assert_eq!(ok, json!({"body": {"message": "hi"}}));

        let err: CallResponse =
            serde_json::from_value(json!({"error": {"message": "boom"}})).unwrap();
        assert_eq!(
            err,
            CallResponse::Error(CallError {
                message: "boom".to_string()
            })
        );
    }
}
