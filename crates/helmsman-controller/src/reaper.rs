// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers for reaping stale state.
//!
//! Three independent reapers run, one per [`ReapTarget`]:
//! - runners whose heartbeat is older than the timeout are marked Dead and
//!   lose their deployment;
//! - controllers whose heartbeat is older than the timeout are marked Dead;
//! - reservations past their expiry are released back to Idle.
//!
//! The reservation reaper is the backstop for controllers that crash between
//! reserving a runner and resolving the reservation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dal::Dal;
use crate::error::Result;

/// What a [`Reaper`] cleans up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapTarget {
    /// Heartbeat-silent runners.
    Runners,
    /// Heartbeat-silent controllers.
    Controllers,
    /// Expired runner reservations.
    Reservations,
}

impl fmt::Display for ReapTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Runners => "runner",
            Self::Controllers => "controller",
            Self::Reservations => "reservation",
        })
    }
}

/// Configuration shared by the reapers.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often the runner and controller reapers run.
    pub interval: Duration,
    /// Heartbeat age after which runners and controllers are dead.
    pub heartbeat_timeout: Duration,
    /// How often expired reservations are released.
    pub reservation_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
            heartbeat_timeout: Duration::from_secs(10),
            reservation_interval: Duration::from_secs(120),
        }
    }
}

/// Background worker that reaps one kind of stale state.
pub struct Reaper {
    dal: Dal,
    target: ReapTarget,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl Reaper {
    /// Create a reaper for `target`.
    pub fn new(dal: Dal, target: ReapTarget, config: ReaperConfig) -> Self {
        Self {
            dal,
            target,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn interval(&self) -> Duration {
        match self.target {
            ReapTarget::Reservations => self.config.reservation_interval,
            ReapTarget::Runners | ReapTarget::Controllers => self.config.interval,
        }
    }

    /// Run the reaper loop until shutdown.
    pub async fn run(&self) {
        info!(
            target_kind = %self.target,
            interval_ms = self.interval().as_millis() as u64,
            heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(target_kind = %self.target, "Reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval()) => {
                    if let Err(e) = self.reap().await {
                        error!(target_kind = %self.target, error = %e, "Reaper tick failed");
                    }
                }
            }
        }

        info!(target_kind = %self.target, "Reaper stopped");
    }

    /// Run one pass, returning how many rows were reaped.
    pub async fn reap(&self) -> Result<u64> {
        let count = match self.target {
            ReapTarget::Runners => {
                self.dal
                    .kill_stale_runners(self.config.heartbeat_timeout)
                    .await?
            }
            ReapTarget::Controllers => {
                self.dal
                    .kill_stale_controllers(self.config.heartbeat_timeout)
                    .await?
            }
            ReapTarget::Reservations => self.dal.expire_runner_reservations().await?,
        };

        if count > 0 {
            match self.target {
                ReapTarget::Runners => info!(count, "Reaped stale runners"),
                ReapTarget::Controllers => info!(count, "Reaped stale controllers"),
                ReapTarget::Reservations => info!(count, "Expired runner reservations"),
            }
        } else {
            debug!(target_kind = %self.target, "Nothing to reap");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use helmsman_model::{ControllerKey, Labels, RunnerKey};

    use super::*;
    use crate::persistence::SqlitePersistence;
    use crate::types::{ControllerState, Runner, RunnerState};

    async fn dal() -> Dal {
        let persistence = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        Dal::new(Arc::new(persistence))
    }

    fn config(timeout: Duration) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(3600),
            heartbeat_timeout: timeout,
            reservation_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_runner_reaper_marks_silent_runners_dead() {
        let dal = dal().await;
        let runner = Runner {
            key: RunnerKey::new(),
            endpoint: "http://127.0.0.1:9100".to_string(),
            state: RunnerState::Idle,
            deployment: None,
            labels: Labels::for_language("go"),
        };
        dal.upsert_runner(&runner).await.unwrap();

        let fresh = Reaper::new(dal.clone(), ReapTarget::Runners, config(Duration::from_secs(60)));
        assert_eq!(fresh.reap().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let eager = Reaper::new(dal.clone(), ReapTarget::Runners, config(Duration::from_millis(1)));
        assert_eq!(eager.reap().await.unwrap(), 1);
        assert_eq!(
            dal.get_runner(&runner.key).await.unwrap().state,
            RunnerState::Dead
        );
        assert_eq!(eager.reap().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_controller_reaper_marks_silent_controllers_dead() {
        let dal = dal().await;
        dal.upsert_controller(&ControllerKey::new(), "http://127.0.0.1:8892")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaper = Reaper::new(
            dal.clone(),
            ReapTarget::Controllers,
            config(Duration::from_millis(1)),
        );
        assert_eq!(reaper.reap().await.unwrap(), 1);
        assert!(dal.list_controllers(false).await.unwrap().is_empty());
        let all = dal.list_controllers(true).await.unwrap();
        assert_eq!(all[0].state, ControllerState::Dead);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let reaper = Reaper::new(dal().await, ReapTarget::Reservations, ReaperConfig::default());
        let shutdown = reaper.shutdown_handle();
        let handle = tokio::spawn(async move { reaper.run().await });
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
