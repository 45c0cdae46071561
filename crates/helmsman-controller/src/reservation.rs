// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner reservations.
//!
//! A [`Reservation`] is a single-use handle on one runner claimed for one
//! deployment. `commit` and `rollback` consume it, so calling either twice is
//! a compile error. If the handle is dropped without either (an early return,
//! a panic, or a cancelled future), the underlying store transaction rolls
//! back. A controller crash leaves the expiry timestamp for the reaper.

use std::future::Future;

use chrono::{DateTime, Utc};
use helmsman_model::DeploymentKey;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::persistence::Claim;
use crate::types::Runner;

/// An exclusive, time-bounded claim on one runner.
pub struct Reservation {
    runner: Runner,
    deployment: DeploymentKey,
    expires_at: DateTime<Utc>,
    claim: Option<Box<dyn Claim>>,
}

impl Reservation {
    pub(crate) fn new(
        runner: Runner,
        deployment: DeploymentKey,
        expires_at: DateTime<Utc>,
        claim: Box<dyn Claim>,
    ) -> Self {
        Self {
            runner,
            deployment,
            expires_at,
            claim: Some(claim),
        }
    }

    /// The reserved runner.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// The deployment the runner is reserved for.
    pub fn deployment(&self) -> &DeploymentKey {
        &self.deployment
    }

    /// When the reaper releases the runner if the reservation is never resolved.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    fn take_claim(&mut self) -> Result<Box<dyn Claim>> {
        self.claim
            .take()
            .ok_or_else(|| Error::Internal("reservation already resolved".to_string()))
    }

    /// Make the reservation durable.
    pub async fn commit(mut self) -> Result<()> {
        self.take_claim()?.commit().await?;
        debug!(runner = %self.runner.key, deployment = %self.deployment, "Reservation committed");
        Ok(())
    }

    /// Release the runner back to Idle.
    pub async fn rollback(mut self) -> Result<()> {
        self.take_claim()?.rollback().await?;
        debug!(runner = %self.runner.key, deployment = %self.deployment, "Reservation rolled back");
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.claim.take().is_some() {
            warn!(
                runner = %self.runner.key,
                deployment = %self.deployment,
                "Reservation dropped unresolved, rolling back"
            );
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("runner", &self.runner.key)
            .field("deployment", &self.deployment)
            .field("expires_at", &self.expires_at)
            .field("resolved", &self.claim.is_none())
            .finish()
    }
}

/// Run `f` against the reserved runner, committing on success and rolling
/// back on failure.
///
/// The caller's error is returned even if the rollback itself fails.
pub async fn with_reservation<F, Fut, T>(reservation: Reservation, f: F) -> Result<T>
where
    F: FnOnce(Runner) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f(reservation.runner().clone()).await {
        Ok(value) => {
            reservation.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let runner = reservation.runner().key;
            if let Err(rollback) = reservation.rollback().await {
                warn!(runner = %runner, error = %rollback, "Failed to roll back reservation");
            }
            Err(err)
        }
    }
}
