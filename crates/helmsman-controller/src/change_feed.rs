// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that relays the store's deployment change feed.
//!
//! On PostgreSQL a trigger publishes every deployments mutation on a
//! `LISTEN/NOTIFY` channel, so changes made by any controller reach every
//! controller's subscribers. This worker listens on that channel and hands
//! each notice to [`Dal::publish_change`]. If the listener connection drops
//! it is reopened after `retry_interval`.
//!
//! Backends without a change feed publish in-process from the `Dal`, and the
//! worker exits immediately.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dal::Dal;
use crate::persistence::ChangeStream;

/// Background worker relaying store change notifications.
pub struct ChangeFeed {
    dal: Dal,
    retry_interval: Duration,
    shutdown: Arc<Notify>,
}

enum Exit {
    Shutdown,
    Reconnect,
}

impl ChangeFeed {
    /// Create a relay that reconnects after `retry_interval`.
    pub fn new(dal: Dal, retry_interval: Duration) -> Self {
        Self {
            dal,
            retry_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Relay notifications until shutdown.
    pub async fn run(&self) {
        if !self.dal.has_change_feed() {
            debug!("Store has no change feed, deployment changes are published in-process");
            return;
        }

        info!("Change feed started");

        loop {
            match self.dal.change_stream().await {
                Ok(Some(stream)) => {
                    info!("Listening for deployment changes");
                    if let Exit::Shutdown = self.relay(stream).await {
                        break;
                    }
                }
                Ok(None) => {
                    warn!("Store stopped offering a change feed");
                    break;
                }
                Err(e) => error!(error = %e, "Failed to open change feed"),
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }

        info!("Change feed stopped");
    }

    async fn relay(&self, mut stream: ChangeStream) -> Exit {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Change feed received shutdown signal");
                    return Exit::Shutdown;
                }

                item = stream.next() => match item {
                    Some(Ok(notice)) => {
                        debug!(deployment = %notice.key, deleted = notice.deleted, "Deployment changed");
                        if let Err(e) = self.dal.publish_change(notice).await {
                            error!(error = %e, "Failed to publish deployment change");
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Change feed error, reconnecting");
                        return Exit::Reconnect;
                    }
                    None => {
                        warn!("Change feed closed, reconnecting");
                        return Exit::Reconnect;
                    }
                }
            }
        }
    }
}
