// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callable verbs.
//!
//! A runner hosts verbs behind the [`CallableVerb`] contract. The set of verbs
//! is assembled once with [`VerbRegistryBuilder`] and frozen into a
//! [`VerbRegistry`], which is cheap to clone and shared by reference with
//! whatever needs to dispatch calls.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ModelError;
use crate::schema::VerbRef;

/// Application-level failure returned by a verb.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct VerbError {
    /// Human readable message, surfaced to callers.
    pub message: String,
}

impl VerbError {
    /// Create a verb error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A verb that can be invoked with a JSON-encoded request body.
#[async_trait]
pub trait CallableVerb: Send + Sync {
    /// Fully qualified name.
    fn reference(&self) -> &VerbRef;

    /// Name of the request data type.
    fn request_type(&self) -> &str;

    /// Name of the response data type.
    fn response_type(&self) -> &str;

    /// Invoke the verb.
    async fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, VerbError>;
}

/// A [`CallableVerb`] backed by an async closure over JSON values.
pub struct JsonVerb<F> {
    reference: VerbRef,
    request_type: String,
    response_type: String,
    handler: F,
}

impl<F, Fut> JsonVerb<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, VerbError>> + Send,
{
    /// Wrap `handler` as verb `reference`.
    pub fn new(
        reference: VerbRef,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
        handler: F,
    ) -> Self {
        Self {
            reference,
            request_type: request_type.into(),
            response_type: response_type.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> CallableVerb for JsonVerb<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, VerbError>> + Send,
{
    fn reference(&self) -> &VerbRef {
        &self.reference
    }

    fn request_type(&self) -> &str {
        &self.request_type
    }

    fn response_type(&self) -> &str {
        &self.response_type
    }

    async fn invoke(&self, body: &[u8]) -> Result<Vec<u8>, VerbError> {
        let request: Value = serde_json::from_slice(body)
            .map_err(|e| VerbError::new(format!("invalid request body: {e}")))?;
        let response = (self.handler)(request).await?;
        serde_json::to_vec(&response).map_err(|e| VerbError::new(e.to_string()))
    }
}

/// Collects verbs before the registry is frozen.
#[derive(Default)]
pub struct VerbRegistryBuilder {
    verbs: BTreeMap<VerbRef, Arc<dyn CallableVerb>>,
}

impl VerbRegistryBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a verb. Registering the same reference twice is an error.
    pub fn register(mut self, verb: impl CallableVerb + 'static) -> Result<Self, ModelError> {
        let reference = verb.reference().clone();
        if self.verbs.contains_key(&reference) {
            return Err(ModelError::DuplicateVerb(reference.to_string()));
        }
        self.verbs.insert(reference, Arc::new(verb));
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> VerbRegistry {
        VerbRegistry {
            verbs: Arc::new(self.verbs),
        }
    }
}

/// Immutable set of callable verbs.
#[derive(Clone, Default)]
pub struct VerbRegistry {
    verbs: Arc<BTreeMap<VerbRef, Arc<dyn CallableVerb>>>,
}

impl VerbRegistry {
    /// Start building a registry.
    pub fn builder() -> VerbRegistryBuilder {
        VerbRegistryBuilder::new()
    }

    /// Look up a verb.
    pub fn get(&self, reference: &VerbRef) -> Option<&Arc<dyn CallableVerb>> {
        self.verbs.get(reference)
    }

    /// Registered references in sorted order.
    pub fn references(&self) -> impl Iterator<Item = &VerbRef> {
        self.verbs.keys()
    }

    /// Registered verbs belonging to `module`.
    pub fn for_module<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a VerbRef> + 'a {
        self.verbs.keys().filter(move |r| r.module == module)
    }

    /// Number of registered verbs.
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

impl std::fmt::Debug for VerbRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.verbs.keys()).finish()
    }
}
