// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server for the controller API.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ping` | Liveness |
//! | GET | `/status` | Fleet snapshot |
//! | POST | `/runners/register` | Runner heartbeat stream (NDJSON) |
//! | POST | `/deployments` | Create a deployment |
//! | GET | `/deployments/{key}` | Schema and artefact list |
//! | POST | `/deployments/{key}/replicas` | Set replica count |
//! | POST | `/deployments/{key}/replace` | Make the deployment active |
//! | POST | `/deployments/{key}/artefacts` | Download artefacts (NDJSON) |
//! | POST | `/artefacts` | Upload an artefact |
//! | POST | `/artefacts/diffs` | Digests the controller lacks |
//! | GET | `/schema/pull` | Schema change stream (NDJSON) |
//! | POST | `/call` | Route a verb call |
//! | ANY | `/ingress/{*path}` | HTTP ingress |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::handlers::{self, ControllerHandlerState};

/// Build the API router.
pub fn build_router(state: Arc<ControllerHandlerState>) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/status", get(handlers::status))
        .route("/runners/register", post(handlers::register_runner))
        .route("/deployments", post(handlers::create_deployment))
        .route("/deployments/{key}", get(handlers::get_deployment))
        .route("/deployments/{key}/replicas", post(handlers::update_deployment))
        .route("/deployments/{key}/replace", post(handlers::replace_deployment))
        .route("/deployments/{key}/artefacts", post(handlers::deployment_artefacts))
        .route(
            "/artefacts",
            post(handlers::upload_artefact).layer(DefaultBodyLimit::disable()),
        )
        .route("/artefacts/diffs", post(handlers::artefact_diffs))
        .route("/schema/pull", get(handlers::pull_schema))
        .route("/call", post(handlers::call))
        .route("/ingress/{*path}", any(handlers::ingress))
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown_rx` flips to true.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ControllerHandlerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Controller API listening");

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            info!("Controller API received shutdown signal");
        })
        .await?;

    info!("Controller API stopped");
    Ok(())
}
