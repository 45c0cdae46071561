// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replica reconciliation.
//!
//! Every tick re-derives, from the store, which deployments have a different
//! number of runners than they ask for, and takes one step per deployment:
//!
//! - **grow**: reserve an idle runner whose labels cover the deployment's
//!   language, ask the runner to reserve itself, commit, then deploy and mark
//!   the runner Assigned;
//! - **shrink**: terminate one randomly chosen Assigned runner and store the
//!   heartbeat it answers with.
//!
//! Nothing is queued between ticks. A failed step is logged and the same
//! delta is found again on the next tick. Concurrent controllers can race
//! for the same deployment; the store's claim guarantees each idle runner is
//! handed to at most one of them.

use std::sync::Arc;
use std::time::Duration;

use helmsman_model::{Labels, RunnerKey};
use rand::seq::SliceRandom;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dal::Dal;
use crate::error::{Error, Result};
use crate::reservation::with_reservation;
use crate::runner::RunnerClients;
use crate::types::{Reconciliation, RunnerState};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Bound on the reservation handshake, and the reservation's expiry.
    pub reservation_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            reservation_timeout: Duration::from_secs(120),
        }
    }
}

/// What one reconciliation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A runner was deployed to.
    Deployed(RunnerKey),
    /// A runner was terminated.
    Terminated(RunnerKey),
    /// Surplus runners are only reserved; they will be assigned or expire.
    Waiting,
}

/// Background worker converging replica counts.
pub struct Reconciler {
    dal: Dal,
    clients: Arc<RunnerClients>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(dal: Dal, clients: Arc<RunnerClients>, config: ReconcilerConfig) -> Self {
        Self {
            dal,
            clients,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            reservation_timeout_secs = self.config.reservation_timeout.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Reconciliation tick failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Take one step for every deployment that needs it.
    ///
    /// Per-deployment failures are logged and skipped. Only failing to read
    /// the deltas fails the tick.
    pub async fn tick(&self) -> Result<Vec<Action>> {
        let deltas = self.dal.deployments_needing_reconciliation().await?;
        if deltas.is_empty() {
            debug!("All deployments reconciled");
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(deltas.len());
        for delta in &deltas {
            let result = if delta.required_replicas > delta.assigned_replicas {
                self.grow(delta).await.map(Action::Deployed)
            } else {
                self.shrink(delta).await
            };
            match result {
                Ok(action) => actions.push(action),
                Err(e) if e.is_not_found() => debug!(
                    deployment = %delta.deployment,
                    error = %e,
                    "Nothing to act on"
                ),
                Err(e) => warn!(
                    deployment = %delta.deployment,
                    assigned = delta.assigned_replicas,
                    required = delta.required_replicas,
                    error = %e,
                    "Failed to reconcile deployment"
                ),
            }
        }
        Ok(actions)
    }

    async fn grow(&self, delta: &Reconciliation) -> Result<RunnerKey> {
        let deployment = &delta.deployment;
        let labels = Labels::for_language(&delta.language);
        let timeout = self.config.reservation_timeout;

        let handshake = async {
            let reservation = self.dal.reserve(deployment, timeout, &labels).await?;
            with_reservation(reservation, |runner| async move {
                let client = self.clients.get(&runner.endpoint).await?;
                client.reserve(deployment).await?;
                Ok(runner)
            })
            .await
        };
        let runner = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| {
                Error::Unavailable(format!("reservation for {deployment} timed out"))
            })??;

        let client = self.clients.get(&runner.endpoint).await?;
        client.deploy(deployment).await?;
        self.dal.assign_runner(&runner.key, deployment).await?;

        info!(
            deployment = %deployment,
            runner = %runner.key,
            endpoint = %runner.endpoint,
            "Deployed to runner"
        );
        Ok(runner.key)
    }

    async fn shrink(&self, delta: &Reconciliation) -> Result<Action> {
        let deployment = &delta.deployment;
        let assigned: Vec<_> = self
            .dal
            .runners_for_deployment(deployment)
            .await?
            .into_iter()
            .filter(|r| r.state == RunnerState::Assigned)
            .collect();
        let Some(victim) = assigned.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(Action::Waiting);
        };

        let client = self.clients.get(&victim.endpoint).await?;
        let heartbeat = client.terminate(deployment).await?;
        self.dal.upsert_runner(&heartbeat).await?;

        info!(
            deployment = %deployment,
            runner = %victim.key,
            state = %heartbeat.state,
            "Terminated runner"
        );
        Ok(Action::Terminated(victim.key))
    }
}
