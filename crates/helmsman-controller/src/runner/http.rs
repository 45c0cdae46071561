// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP runner client.
//!
//! Runners expose a small JSON API:
//!
//! | Route | Body | Response |
//! |-------|------|----------|
//! | `GET /ping` | | `{}` |
//! | `POST /reserve` | `{deployment_key}` | `{}` |
//! | `POST /deploy` | `{deployment_key}` | `{}` |
//! | `POST /terminate` | `{deployment_key}` | runner heartbeat |
//! | `POST /call` | `{verb, body}` | `{body}` or `{error: {message}}` |
//!
//! Failed requests carry an [`ErrorBody`], which is mapped back onto the
//! error taxonomy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helmsman_model::DeploymentKey;
use reqwest::{RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::traits::*;
use crate::error::{Error, ErrorBody, Result};
use crate::types::Runner;

/// Client for one runner endpoint.
#[derive(Clone)]
pub struct HttpRunnerClient {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpRunnerClient {
    /// Client for `endpoint` sharing `http`'s connection pool.
    pub fn new(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(body.into()),
            Err(_) => Err(Error::Internal(format!(
                "runner {} returned {status}",
                self.endpoint
            ))),
        }
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self.send(self.http.post(self.url(path)).json(body)).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("runner {}: invalid response: {e}", self.endpoint)))
    }

    async fn post_empty<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        self.send(self.http.post(self.url(path)).json(body)).await?;
        Ok(())
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        Error::Unavailable(format!("runner {}: {err}", self.endpoint))
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn ping(&self) -> Result<()> {
        self.send(self.http.get(self.url("ping"))).await?;
        Ok(())
    }

    async fn reserve(&self, deployment: &DeploymentKey) -> Result<()> {
        self.post_empty(
            "reserve",
            &DeploymentRequest {
                deployment_key: deployment.clone(),
            },
        )
        .await
    }

    async fn deploy(&self, deployment: &DeploymentKey) -> Result<()> {
        self.post_empty(
            "deploy",
            &DeploymentRequest {
                deployment_key: deployment.clone(),
            },
        )
        .await
    }

    async fn terminate(&self, deployment: &DeploymentKey) -> Result<Runner> {
        self.post(
            "terminate",
            &DeploymentRequest {
                deployment_key: deployment.clone(),
            },
        )
        .await
    }

    async fn call(&self, request: &CallRequest, context: &CallContext) -> Result<CallResponse> {
        let mut builder = self.http.post(self.url("call")).json(request);
        if let Some(name) = &context.request_name {
            builder = builder.header(REQUEST_NAME_HEADER, name.to_string());
        }
        for caller in &context.callers {
            builder = builder.header(VERB_HEADER, caller.to_string());
        }
        let response = self.send(builder).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("runner {}: invalid response: {e}", self.endpoint)))
    }
}

/// Creates [`HttpRunnerClient`]s sharing one connection pool.
#[derive(Clone)]
pub struct HttpClientFactory {
    http: reqwest::Client,
}

impl HttpClientFactory {
    /// Factory whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn RunnerClient>> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::InvalidArgument(format!("runner endpoint {endpoint:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidArgument(format!(
                "runner endpoint {endpoint:?} must be http or https"
            )));
        }
        Ok(Arc::new(HttpRunnerClient::new(endpoint, self.http.clone())))
    }
}
