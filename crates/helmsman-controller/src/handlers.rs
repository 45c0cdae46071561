// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP handlers for the controller API.
//!
//! Every handler takes the shared [`ControllerHandlerState`] and returns
//! either JSON or an NDJSON stream. Failures are [`Error`]s, rendered as
//! `{"code", "message"}` with the matching status.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use helmsman_model::schema::{Module, VerbRef};
use helmsman_model::{DeploymentKey, RequestName, Sha256};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::dal::{Dal, StatusFilter};
use crate::dispatcher::{CallOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::ingress::Ingress;
use crate::runner::{
    CallContext, CallRequest, CallResponse, REQUEST_NAME_HEADER, RunnerClients, VERB_HEADER,
};
use crate::schema_notifier::SchemaNotifier;
use crate::types::{DeploymentArtefact, Runner, Status};

/// Default size of artefact chunks streamed to runners.
pub const DEFAULT_ARTEFACT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default bound on the first ping to a registering runner.
pub const DEFAULT_RUNNER_TIMEOUT: Duration = Duration::from_secs(10);

const NDJSON: &str = "application/x-ndjson";
const PROBE_INITIAL_DELAY: Duration = Duration::from_millis(50);
const PROBE_MAX_DELAY: Duration = Duration::from_secs(1);

/// Shared state for controller handlers.
pub struct ControllerHandlerState {
    /// State repository.
    pub dal: Dal,
    /// Runner client cache.
    pub clients: Arc<RunnerClients>,
    /// Call router.
    pub dispatcher: Dispatcher,
    /// HTTP ingress.
    pub ingress: Ingress,
    /// Schema watch factory.
    pub notifier: SchemaNotifier,
    /// Maximum artefact chunk size in bytes.
    pub artefact_chunk_size: usize,
    /// How long a registering runner has to answer its first ping.
    pub runner_timeout: Duration,
    /// When the server started.
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl ControllerHandlerState {
    /// Create handler state over `dal` and `clients`.
    pub fn new(dal: Dal, clients: Arc<RunnerClients>) -> Self {
        let dispatcher = Dispatcher::new(dal.clone(), clients.clone());
        Self {
            ingress: Ingress::new(dal.clone(), dispatcher.clone()),
            notifier: SchemaNotifier::new(dal.clone()),
            dispatcher,
            dal,
            clients,
            artefact_chunk_size: DEFAULT_ARTEFACT_CHUNK_SIZE,
            runner_timeout: DEFAULT_RUNNER_TIMEOUT,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Set the artefact chunk size.
    pub fn with_artefact_chunk_size(mut self, size: usize) -> Self {
        self.artefact_chunk_size = size.max(1);
        self
    }

    /// Set the runner ping timeout.
    pub fn with_runner_timeout(mut self, timeout: Duration) -> Self {
        self.runner_timeout = timeout;
        self
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    /// Consume a runner's heartbeat stream.
    ///
    /// The first heartbeat is only accepted once the runner answers a ping on
    /// its advertised endpoint. Every heartbeat is upserted. When the stream
    /// ends, for whatever reason, the runner is deregistered.
    pub async fn register_runner<R>(&self, mut lines: Lines<R>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut registered: Option<Runner> = None;
        let result = self.relay_heartbeats(&mut lines, &mut registered).await;

        if let Some(runner) = registered {
            match self.dal.deregister_runner(&runner.key).await {
                Ok(()) => info!(runner = %runner.key, endpoint = %runner.endpoint, "Runner deregistered"),
                Err(e) if e.is_not_found() => debug!(runner = %runner.key, "Runner already gone"),
                Err(e) => warn!(runner = %runner.key, error = %e, "Failed to deregister runner"),
            }
            self.clients.evict(&runner.endpoint).await;
        }
        result
    }

    async fn relay_heartbeats<R>(
        &self,
        lines: &mut Lines<R>,
        registered: &mut Option<Runner>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| Error::InvalidArgument(format!("reading heartbeat stream: {e}")))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let runner: Runner = serde_json::from_str(&line)
                .map_err(|e| Error::InvalidArgument(format!("invalid heartbeat: {e}")))?;

            match registered.as_ref() {
                None => self.probe(&runner.endpoint).await?,
                Some(first) if first.key != runner.key => {
                    return Err(Error::InvalidArgument(format!(
                        "runner key changed from {} to {} mid-stream",
                        first.key, runner.key
                    )));
                }
                Some(_) => {}
            }

            self.dal.upsert_runner(&runner).await?;
            if registered.is_none() {
                info!(
                    runner = %runner.key,
                    endpoint = %runner.endpoint,
                    state = %runner.state,
                    "Runner registered"
                );
            }
            *registered = Some(runner);
        }
        Ok(())
    }

    async fn probe(&self, endpoint: &str) -> Result<()> {
        let client = self.clients.get(endpoint).await?;
        let deadline = Instant::now() + self.runner_timeout;
        let mut delay = PROBE_INITIAL_DELAY;
        loop {
            let err = match client.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if Instant::now() + delay >= deadline {
                return Err(Error::Unavailable(format!(
                    "runner at {endpoint} did not answer ping within {:?}: {}",
                    self.runner_timeout,
                    err.message()
                )));
            }
            debug!(endpoint, delay_ms = delay.as_millis() as u64, error = %err, "Runner not reachable yet");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(PROBE_MAX_DELAY);
        }
    }
}

type AppState = State<Arc<ControllerHandlerState>>;

fn source_addr(extensions: &Extensions) -> String {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn ndjson_line<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn ndjson_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(stream)).into_response()
}

fn with_request_name(mut response: Response, name: &RequestName) -> Response {
    if let Ok(value) = HeaderValue::from_str(&name.to_string()) {
        response.headers_mut().insert(REQUEST_NAME_HEADER, value);
    }
    response
}

// ============================================================================
// Fleet
// ============================================================================

/// GET /ping
pub async fn ping() -> Json<Value> {
    Json(json!({}))
}

/// GET /status
pub async fn status(
    State(state): AppState,
    Query(filter): Query<StatusFilter>,
) -> Result<Json<Status>> {
    Ok(Json(state.dal.status(filter).await?))
}

/// POST /runners/register
pub async fn register_runner(State(state): AppState, body: Body) -> Result<Json<Value>> {
    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    state.register_runner(reader.lines()).await?;
    Ok(Json(json!({})))
}

// ============================================================================
// Deployments
// ============================================================================

/// Replica count change.
#[derive(Debug, Deserialize)]
pub struct ReplicasRequest {
    /// Desired replica count.
    pub min_replicas: i32,
}

/// POST /deployments/{key}/replicas
pub async fn update_deployment(
    State(state): AppState,
    Path(key): Path<String>,
    Json(req): Json<ReplicasRequest>,
) -> Result<Json<Value>> {
    let key: DeploymentKey = key.parse()?;
    state
        .dal
        .set_deployment_replicas(&key, req.min_replicas)
        .await?;
    Ok(Json(json!({})))
}

/// Result of a replace.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplaceResponse {
    /// Deployment that was retired, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced: Option<DeploymentKey>,
}

/// POST /deployments/{key}/replace
pub async fn replace_deployment(
    State(state): AppState,
    Path(key): Path<String>,
    Json(req): Json<ReplicasRequest>,
) -> Result<Json<ReplaceResponse>> {
    let key: DeploymentKey = key.parse()?;
    let replaced = state.dal.replace_deployment(&key, req.min_replicas).await?;
    Ok(Json(ReplaceResponse { replaced }))
}

/// A deployment as served to runners.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentResponse {
    /// Published schema.
    pub schema: Module,
    /// Artefacts making up the deployment.
    pub artefacts: Vec<DeploymentArtefact>,
}

/// GET /deployments/{key}
pub async fn get_deployment(
    State(state): AppState,
    Path(key): Path<String>,
) -> Result<Json<DeploymentResponse>> {
    let key: DeploymentKey = key.parse()?;
    let deployment = state
        .dal
        .get_deployment(&key)
        .await
        .map_err(|e| e.context(format!("deployment {key}")))?;
    Ok(Json(DeploymentResponse {
        schema: deployment.published_schema(),
        artefacts: deployment.artefacts,
    }))
}

/// Artefacts the caller already holds.
#[derive(Debug, Default, Deserialize)]
pub struct ArtefactsRequest {
    /// Digests to skip.
    #[serde(default)]
    pub have_artefacts: Vec<Sha256>,
}

/// One NDJSON message of an artefact download.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArtefactChunk {
    /// Artefact the chunk belongs to.
    pub artefact: DeploymentArtefact,
    /// Base64-encoded bytes.
    pub chunk: String,
}

/// POST /deployments/{key}/artefacts
pub async fn deployment_artefacts(
    State(state): AppState,
    Path(key): Path<String>,
    Json(req): Json<ArtefactsRequest>,
) -> Result<Response> {
    let key: DeploymentKey = key.parse()?;
    let deployment = state.dal.get_deployment(&key).await?;
    let have: HashSet<Sha256> = req.have_artefacts.into_iter().collect();
    let wanted: Vec<DeploymentArtefact> = deployment
        .artefacts
        .into_iter()
        .filter(|a| !have.contains(&a.digest))
        .collect();
    debug!(deployment = %key, artefacts = wanted.len(), "Streaming deployment artefacts");

    let dal = state.dal.clone();
    let chunk_size = state.artefact_chunk_size as i64;
    let stream = async_stream::stream! {
        for artefact in wanted {
            let mut offset = 0i64;
            loop {
                let chunk = match dal.artefact_chunk(&artefact.digest, offset, chunk_size).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(digest = %artefact.digest, error = %e, "Failed to read artefact");
                        yield Err(e);
                        return;
                    }
                };
                let read = chunk.len() as i64;
                if read == 0 && offset > 0 {
                    break;
                }
                yield ndjson_line(&ArtefactChunk {
                    artefact: artefact.clone(),
                    chunk: BASE64.encode(&chunk),
                });
                offset += read;
                if read < chunk_size {
                    break;
                }
            }
        }
    };
    Ok(ndjson_response(stream))
}

/// Deployment creation request.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Implementation language.
    pub language: String,
    /// Module schema.
    pub schema: Module,
    /// Artefacts, which must already be uploaded.
    #[serde(default)]
    pub artefacts: Vec<DeploymentArtefact>,
}

/// Deployment creation result.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDeploymentResponse {
    /// New or existing deployment.
    pub deployment_key: DeploymentKey,
}

/// POST /deployments
pub async fn create_deployment(
    State(state): AppState,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<Json<CreateDeploymentResponse>> {
    let deployment_key = state
        .dal
        .create_deployment(&req.language, &req.schema, &req.artefacts)
        .await?;
    Ok(Json(CreateDeploymentResponse { deployment_key }))
}

// ============================================================================
// Artefacts
// ============================================================================

/// Digest diff request.
#[derive(Debug, Deserialize)]
pub struct ArtefactDiffsRequest {
    /// Digests the client holds.
    pub client_digests: Vec<Sha256>,
}

/// Digest diff result.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArtefactDiffsResponse {
    /// Digests the controller does not have.
    pub missing_digests: Vec<Sha256>,
}

/// POST /artefacts/diffs
pub async fn artefact_diffs(
    State(state): AppState,
    Json(req): Json<ArtefactDiffsRequest>,
) -> Result<Json<ArtefactDiffsResponse>> {
    let missing_digests = state.dal.missing_artefacts(&req.client_digests).await?;
    Ok(Json(ArtefactDiffsResponse { missing_digests }))
}

/// Upload result.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadArtefactResponse {
    /// Digest of the stored content.
    pub digest: Sha256,
}

/// POST /artefacts
pub async fn upload_artefact(
    State(state): AppState,
    body: Bytes,
) -> Result<Json<UploadArtefactResponse>> {
    let digest = state.dal.create_artefact(&body).await?;
    debug!(%digest, size = body.len(), "Stored artefact");
    Ok(Json(UploadArtefactResponse { digest }))
}

// ============================================================================
// Schema
// ============================================================================

/// GET /schema/pull
pub async fn pull_schema(State(state): AppState) -> Result<Response> {
    let mut watch = state.notifier.watch().await?;
    let stream = async_stream::stream! {
        while let Some(change) = watch.next().await {
            match change {
                Ok(change) => yield ndjson_line(&change),
                Err(e) => {
                    warn!(error = %e, "Schema watch failed");
                    yield Err(e);
                    return;
                }
            }
        }
    };
    Ok(ndjson_response(stream))
}

// ============================================================================
// Calls
// ============================================================================

fn call_context(headers: &HeaderMap) -> Result<CallContext> {
    let request_name = headers
        .get(REQUEST_NAME_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|e| Error::InvalidArgument(format!("{REQUEST_NAME_HEADER}: {e}")))?
                .parse::<RequestName>()
                .map_err(Error::from)
        })
        .transpose()?;
    let callers = headers
        .get_all(VERB_HEADER)
        .iter()
        .map(|value| {
            value
                .to_str()
                .map_err(|e| Error::InvalidArgument(format!("{VERB_HEADER}: {e}")))?
                .parse::<VerbRef>()
                .map_err(Error::from)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CallContext {
        request_name,
        callers,
    })
}

/// POST /call
pub async fn call(
    State(state): AppState,
    extensions: Extensions,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Result<Response> {
    let context = call_context(&headers)?;
    let CallOutcome {
        request_name,
        response,
    } = state
        .dispatcher
        .call(req, context, &source_addr(&extensions))
        .await?;
    Ok(with_request_name(Json(response).into_response(), &request_name))
}

/// ANY /ingress/{*path}
pub async fn ingress(
    State(state): AppState,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let path = format!("/{}", path.trim_start_matches('/'));
    let result = state
        .ingress
        .handle(method.as_str(), &path, &query, &body, &source_addr(&extensions))
        .await;
    match result {
        Ok(CallOutcome {
            request_name,
            response: CallResponse::Body(body),
        }) => with_request_name(Json(body).into_response(), &request_name),
        Ok(CallOutcome {
            request_name,
            response: CallResponse::Error(e),
        }) => with_request_name(
            (StatusCode::INTERNAL_SERVER_ERROR, e.message).into_response(),
            &request_name,
        ),
        Err(e) => {
            debug!(%method, %path, error = %e, "Ingress request failed");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use helmsman_model::Origin;
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::runner::{MockFleet, MockRunner};
    use crate::types::RunnerState;

    async fn test_state() -> (Arc<ControllerHandlerState>, Arc<MockFleet>) {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        let dal = Dal::new(Arc::new(persistence));
        let fleet = Arc::new(MockFleet::new());
        let clients = Arc::new(RunnerClients::new(fleet.clone()));
        let state = ControllerHandlerState::new(dal, clients)
            .with_runner_timeout(Duration::from_millis(200));
        (Arc::new(state), fleet)
    }

    fn lines(input: String) -> Lines<BufReader<io::Cursor<Vec<u8>>>> {
        BufReader::new(io::Cursor::new(input.into_bytes())).lines()
    }

    #[test]
    fn test_call_context_from_headers() {
        let name = RequestName::new(Origin::Ingress, "echo");
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_NAME_HEADER, name.to_string().parse().unwrap());
        headers.append(VERB_HEADER, "time.time".parse().unwrap());
        headers.append(VERB_HEADER, "echo.echo".parse().unwrap());

        let context = call_context(&headers).unwrap();
        assert_eq!(context.request_name, Some(name));
        assert_eq!(
            context.callers,
            vec![VerbRef::new("time", "time"), VerbRef::new("echo", "echo")]
        );
        assert_eq!(call_context(&HeaderMap::new()).unwrap(), CallContext::default());
    }

    #[test]
    fn test_call_context_rejects_bad_request_name() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_NAME_HEADER, "nonsense".parse().unwrap());
        assert!(matches!(
            call_context(&headers),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_register_stream_upserts_then_deregisters() {
        let (state, fleet) = test_state().await;
        let runner = fleet.add(Arc::new(MockRunner::new("http://127.0.0.1:9401", "go")));
        let heartbeat = serde_json::to_string(&runner.heartbeat()).unwrap();

        state
            .register_runner(lines(format!("{heartbeat}\n\n{heartbeat}\n")))
            .await
            .unwrap();

        assert!(state.dal.get_runner(&runner.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_stream_rejects_unreachable_runner() {
        let (state, fleet) = test_state().await;
        let runner = fleet.add(Arc::new(MockRunner::new("http://127.0.0.1:9402", "go")));
        runner.unreachable.store(true, Ordering::SeqCst);
        let heartbeat = serde_json::to_string(&runner.heartbeat()).unwrap();

        let err = state
            .register_runner(lines(format!("{heartbeat}\n")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert!(state.dal.get_runner(&runner.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_stream_rejects_key_change() {
        let (state, fleet) = test_state().await;
        let a = fleet.add(Arc::new(MockRunner::new("http://127.0.0.1:9403", "go")));
        let mut other = a.heartbeat();
        other.key = helmsman_model::RunnerKey::new();
        let input = format!(
            "{}\n{}\n",
            serde_json::to_string(&a.heartbeat()).unwrap(),
            serde_json::to_string(&other).unwrap()
        );

        let err = state.register_runner(lines(input)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(state.dal.get_runner(&a.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_stream_keeps_runner_while_open() {
        let (state, fleet) = test_state().await;
        let runner = fleet.add(Arc::new(MockRunner::new("http://127.0.0.1:9404", "go")));
        let heartbeat = serde_json::to_string(&runner.heartbeat()).unwrap();

        let (mut tx, rx) = tokio::io::duplex(4096);
        let state_clone = state.clone();
        let task = tokio::spawn(async move {
            state_clone
                .register_runner(BufReader::new(rx).lines())
                .await
        });

        tx.write_all(format!("{heartbeat}\n").as_bytes()).await.unwrap();
        let key = runner.key();
        let mut stored = None;
        for _ in 0..50 {
            if let Ok(runner) = state.dal.get_runner(&key).await {
                stored = Some(runner);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored.unwrap().state, RunnerState::Idle);

        drop(tx);
        task.await.unwrap().unwrap();
        assert!(state.dal.get_runner(&key).await.unwrap_err().is_not_found());
    }
}
