// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps this controller's row live.
//!
//! Peers mark a controller Dead once its heartbeat is older than the
//! heartbeat timeout, so the interval must stay well below it. The default is
//! a quarter of the timeout.

use std::sync::Arc;
use std::time::Duration;

use helmsman_model::ControllerKey;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dal::Dal;

/// Configuration for the controller heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often to refresh the controller row.
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
        }
    }
}

/// Background worker that upserts this controller's row on an interval.
pub struct ControllerHeartbeat {
    dal: Dal,
    key: ControllerKey,
    endpoint: String,
    config: HeartbeatConfig,
    shutdown: Arc<Notify>,
}

impl ControllerHeartbeat {
    /// Create a heartbeat for controller `key` advertising `endpoint`.
    pub fn new(dal: Dal, key: ControllerKey, endpoint: String, config: HeartbeatConfig) -> Self {
        Self {
            dal,
            key,
            endpoint,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the heartbeat loop until shutdown.
    ///
    /// The first beat is sent immediately so the controller shows up in
    /// `status` as soon as it starts.
    pub async fn run(&self) {
        info!(
            controller = %self.key,
            endpoint = %self.endpoint,
            interval_ms = self.config.interval.as_millis() as u64,
            "Controller heartbeat started"
        );

        self.beat().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Controller heartbeat received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    self.beat().await;
                }
            }
        }

        info!("Controller heartbeat stopped");
    }

    async fn beat(&self) {
        match self.dal.upsert_controller(&self.key, &self.endpoint).await {
            Ok(()) => debug!(controller = %self.key, "Controller heartbeat sent"),
            Err(e) => error!(controller = %self.key, error = %e, "Failed to send controller heartbeat"),
        }
    }
}
