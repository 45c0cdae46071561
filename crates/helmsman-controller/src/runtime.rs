// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for helmsman-controller.
//!
//! [`ControllerRuntime`] runs the whole control plane inside an existing
//! tokio application: the HTTP API plus the heartbeat, reaper, reconciler and
//! change feed workers.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use helmsman_controller::persistence::SqlitePersistence;
//! use helmsman_controller::runner::HttpClientFactory;
//! use helmsman_controller::runtime::ControllerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = SqlitePersistence::connect("sqlite://helmsman.db", 4).await?;
//!
//!     let runtime = ControllerRuntime::builder()
//!         .persistence(Arc::new(persistence))
//!         .client_factory(Arc::new(HttpClientFactory::new(Duration::from_secs(10))?))
//!         .bind_addr("127.0.0.1:8892".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use helmsman_model::ControllerKey;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::change_feed::ChangeFeed;
use crate::dal::Dal;
use crate::handlers::{ControllerHandlerState, DEFAULT_ARTEFACT_CHUNK_SIZE, DEFAULT_RUNNER_TIMEOUT};
use crate::heartbeat::{ControllerHeartbeat, HeartbeatConfig};
use crate::persistence::Persistence;
use crate::reaper::{ReapTarget, Reaper, ReaperConfig};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::runner::{ClientFactory, RunnerClients};
use crate::server;

const SERVER_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Builder for [`ControllerRuntime`].
pub struct ControllerRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    client_factory: Option<Arc<dyn ClientFactory>>,
    bind_addr: SocketAddr,
    advertise_url: Option<String>,
    controller_key: Option<ControllerKey>,
    heartbeat: HeartbeatConfig,
    reaper: ReaperConfig,
    reconciler: ReconcilerConfig,
    change_feed_retry: Duration,
    artefact_chunk_size: usize,
    runner_timeout: Duration,
}

impl Default for ControllerRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            client_factory: None,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8892)),
            advertise_url: None,
            controller_key: None,
            heartbeat: HeartbeatConfig::default(),
            reaper: ReaperConfig::default(),
            reconciler: ReconcilerConfig::default(),
            change_feed_retry: Duration::from_secs(1),
            artefact_chunk_size: DEFAULT_ARTEFACT_CHUNK_SIZE,
            runner_timeout: DEFAULT_RUNNER_TIMEOUT,
        }
    }
}

impl ControllerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set how runner clients are created (required).
    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.client_factory = Some(factory);
        self
    }

    /// Set the bind address for the HTTP API.
    ///
    /// Default: `127.0.0.1:8892`. Port 0 picks a free port.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the endpoint recorded in the controller heartbeat.
    ///
    /// Default: `http://` followed by the bound address.
    pub fn advertise_url(mut self, url: impl Into<String>) -> Self {
        self.advertise_url = Some(url.into());
        self
    }

    /// Set this controller's identity. Default: a fresh key.
    pub fn controller_key(mut self, key: ControllerKey) -> Self {
        self.controller_key = Some(key);
        self
    }

    /// Set the heartbeat configuration.
    pub fn heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = config;
        self
    }

    /// Set the reaper configuration.
    pub fn reaper(mut self, config: ReaperConfig) -> Self {
        self.reaper = config;
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Set the delay before reopening a dropped change feed.
    ///
    /// Default: 1 second
    pub fn change_feed_retry(mut self, interval: Duration) -> Self {
        self.change_feed_retry = interval;
        self
    }

    /// Set the maximum artefact chunk size.
    ///
    /// Default: 1 MiB
    pub fn artefact_chunk_size(mut self, size: usize) -> Self {
        self.artefact_chunk_size = size;
        self
    }

    /// Set how long a registering runner has to answer its first ping.
    ///
    /// Default: 10 seconds
    pub fn runner_timeout(mut self, timeout: Duration) -> Self {
        self.runner_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControllerRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let client_factory = self
            .client_factory
            .ok_or_else(|| anyhow::anyhow!("client_factory is required"))?;
        if self.heartbeat.interval.is_zero() || self.reconciler.interval.is_zero() {
            anyhow::bail!("worker intervals must be non-zero");
        }

        Ok(ControllerRuntimeConfig {
            persistence,
            client_factory,
            bind_addr: self.bind_addr,
            advertise_url: self.advertise_url,
            controller_key: self.controller_key.unwrap_or_default(),
            heartbeat: self.heartbeat,
            reaper: self.reaper,
            reconciler: self.reconciler,
            change_feed_retry: self.change_feed_retry,
            artefact_chunk_size: self.artefact_chunk_size,
            runner_timeout: self.runner_timeout,
        })
    }
}

/// Configuration for a [`ControllerRuntime`].
pub struct ControllerRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    client_factory: Arc<dyn ClientFactory>,
    bind_addr: SocketAddr,
    advertise_url: Option<String>,
    controller_key: ControllerKey,
    heartbeat: HeartbeatConfig,
    reaper: ReaperConfig,
    reconciler: ReconcilerConfig,
    change_feed_retry: Duration,
    artefact_chunk_size: usize,
    runner_timeout: Duration,
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    // Allowed to finish before shutdown.
    may_exit: bool,
}

impl ControllerRuntimeConfig {
    /// Bind the API and spawn every worker.
    pub async fn start(self) -> Result<ControllerRuntime> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;
        let advertise_url = self
            .advertise_url
            .unwrap_or_else(|| format!("http://{bind_addr}"));

        let dal = Dal::new(self.persistence);
        let clients = Arc::new(RunnerClients::new(self.client_factory));
        let state = Arc::new(
            ControllerHandlerState::new(dal.clone(), clients.clone())
                .with_artefact_chunk_size(self.artefact_chunk_size)
                .with_runner_timeout(self.runner_timeout),
        );

        let mut workers = Vec::new();

        let heartbeat = ControllerHeartbeat::new(
            dal.clone(),
            self.controller_key,
            advertise_url.clone(),
            self.heartbeat,
        );
        let shutdown = heartbeat.shutdown_handle();
        workers.push(Worker {
            name: "Controller heartbeat",
            handle: tokio::spawn(async move { heartbeat.run().await }),
            shutdown,
            may_exit: false,
        });

        for target in [
            ReapTarget::Runners,
            ReapTarget::Controllers,
            ReapTarget::Reservations,
        ] {
            let reaper = Reaper::new(dal.clone(), target, self.reaper.clone());
            let shutdown = reaper.shutdown_handle();
            workers.push(Worker {
                name: match target {
                    ReapTarget::Runners => "Runner reaper",
                    ReapTarget::Controllers => "Controller reaper",
                    ReapTarget::Reservations => "Reservation reaper",
                },
                handle: tokio::spawn(async move { reaper.run().await }),
                shutdown,
                may_exit: false,
            });
        }

        let reconciler = Reconciler::new(dal.clone(), clients.clone(), self.reconciler);
        let shutdown = reconciler.shutdown_handle();
        workers.push(Worker {
            name: "Reconciler",
            handle: tokio::spawn(async move { reconciler.run().await }),
            shutdown,
            may_exit: false,
        });

        let change_feed = ChangeFeed::new(dal.clone(), self.change_feed_retry);
        let shutdown = change_feed.shutdown_handle();
        workers.push(Worker {
            name: "Change feed",
            handle: tokio::spawn(async move { change_feed.run().await }),
            shutdown,
            may_exit: !dal.has_change_feed(),
        });

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(server::serve(listener, state.clone(), server_shutdown_rx));

        info!(
            bind_addr = %bind_addr,
            advertise_url = %advertise_url,
            controller = %self.controller_key,
            change_feed = dal.has_change_feed(),
            "ControllerRuntime started"
        );

        Ok(ControllerRuntime {
            server_handle,
            server_shutdown_tx,
            workers,
            state,
            bind_addr,
            controller_key: self.controller_key,
        })
    }
}

/// A running controller that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControllerRuntime {
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    workers: Vec<Worker>,
    state: Arc<ControllerHandlerState>,
    bind_addr: SocketAddr,
    controller_key: ControllerKey,
}

impl ControllerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControllerRuntimeBuilder {
        ControllerRuntimeBuilder::new()
    }

    /// Get the bound address of the HTTP API.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get this controller's identity.
    pub fn controller_key(&self) -> &ControllerKey {
        &self.controller_key
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<ControllerHandlerState> {
        &self.state
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the HTTP server and every worker, then waits for them. Open
    /// streams that outlive the grace period are dropped.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControllerRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        for worker in &self.workers {
            worker.shutdown.notify_one();
        }

        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
            }
        }

        let mut server_handle = self.server_handle;
        match tokio::time::timeout(SERVER_GRACE_PERIOD, &mut server_handle).await {
            Ok(Ok(Ok(()))) => {
                info!("ControllerRuntime shutdown complete");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("ControllerRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Ok(Err(e)) => {
                error!("ControllerRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
            Err(_) => {
                warn!(
                    grace_secs = SERVER_GRACE_PERIOD.as_secs(),
                    "Open connections outlived the grace period, aborting server"
                );
                server_handle.abort();
                Ok(())
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && self
                .workers
                .iter()
                .all(|w| w.may_exit || !w.handle.is_finished())
    }
}
