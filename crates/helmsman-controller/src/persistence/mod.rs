// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the control plane.
//!
//! The store is the single source of truth. Every backend implements the same
//! [`Persistence`] contract; mutual exclusion for reservations is delegated to
//! the store (row locks on PostgreSQL, a compare-and-swap update inside a
//! transaction on SQLite).

pub mod postgres;
pub mod sqlite;

mod rows;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use helmsman_model::schema::{IngressRoutingEntry, Module};
use helmsman_model::{ControllerKey, DeploymentKey, Labels, RequestName, RunnerKey, Sha256};

use crate::error::Result;
use crate::types::{
    CallEvent, Controller, Deployment, DeploymentArtefact, IngressRoute, IngressRouteEntry,
    LogEvent, Reconciliation, Route, Runner,
};

/// The store half of a runner reservation.
///
/// Holds the open transaction in which the runner row was claimed. Exactly one
/// of `commit` or `rollback` consumes it; dropping it rolls the transaction back.
#[async_trait]
pub trait Claim: Send {
    /// Make the reservation visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Release the runner back to Idle.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A deployment row changed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// The deployment that changed.
    pub key: DeploymentKey,
    /// True if the row was deleted.
    pub deleted: bool,
}

/// Change notices produced by the store itself.
pub type ChangeStream = BoxStream<'static, Result<ChangeNotice>>;

/// Durable storage for controllers, runners, deployments, artefacts, ingress
/// routes, requests and events.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Controllers
    // ------------------------------------------------------------------

    /// Insert or refresh a controller heartbeat, marking it live.
    async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> Result<()>;

    /// Mark controllers silent for longer than `timeout` as dead.
    async fn kill_stale_controllers(&self, timeout: Duration) -> Result<u64>;

    /// Live controllers, or every controller when `all` is set.
    async fn list_controllers(&self, all: bool) -> Result<Vec<Controller>>;

    // ------------------------------------------------------------------
    // Runners
    // ------------------------------------------------------------------

    /// Insert or refresh a runner from a heartbeat.
    ///
    /// Conflict if another runner already owns the endpoint; NotFound if the
    /// heartbeat names an unknown deployment.
    async fn upsert_runner(&self, runner: &Runner) -> Result<()>;

    /// Remove a runner. NotFound if it does not exist.
    async fn deregister_runner(&self, key: &RunnerKey) -> Result<()>;

    /// Load one runner.
    async fn get_runner(&self, key: &RunnerKey) -> Result<Runner>;

    /// Non-dead runners, or every runner when `all` is set.
    async fn list_runners(&self, all: bool) -> Result<Vec<Runner>>;

    /// Runners reserved for or assigned to `deployment`.
    async fn runners_for_deployment(&self, deployment: &DeploymentKey) -> Result<Vec<Runner>>;

    /// Up to `limit` idle runners whose labels contain `labels`.
    async fn idle_runners(&self, labels: &Labels, limit: i64) -> Result<Vec<Runner>>;

    /// Mark runners silent for longer than `timeout` as dead.
    async fn kill_stale_runners(&self, timeout: Duration) -> Result<u64>;

    /// Claim one idle runner matching `labels` for `deployment`.
    ///
    /// The runner row is updated to Reserved inside a transaction that the
    /// returned [`Claim`] owns. NotFound if no idle runner matches.
    async fn reserve_runner(
        &self,
        deployment: &DeploymentKey,
        expires_at: DateTime<Utc>,
        labels: &Labels,
    ) -> Result<(Runner, Box<dyn Claim>)>;

    /// Promote a reserved runner to Assigned.
    async fn assign_runner(&self, runner: &RunnerKey, deployment: &DeploymentKey) -> Result<()>;

    /// Return runners whose reservation expired to Idle.
    async fn expire_runner_reservations(&self) -> Result<u64>;

    // ------------------------------------------------------------------
    // Artefacts
    // ------------------------------------------------------------------

    /// Digests from `digests` that are not stored.
    async fn missing_artefacts(&self, digests: &[Sha256]) -> Result<Vec<Sha256>>;

    /// Store `content`, returning its digest. Storing the same bytes twice is a no-op.
    async fn create_artefact(&self, content: &[u8]) -> Result<Sha256>;

    /// Up to `length` bytes of an artefact starting at byte `offset`.
    async fn artefact_chunk(&self, digest: &Sha256, offset: i64, length: i64) -> Result<Vec<u8>>;

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Create a deployment, or return the existing one with the same module
    /// schema and artefact set.
    async fn create_deployment(
        &self,
        language: &str,
        schema: &Module,
        artefacts: &[DeploymentArtefact],
        ingress_routes: &[IngressRoutingEntry],
    ) -> Result<DeploymentKey>;

    /// Load one deployment including its artefacts.
    async fn get_deployment(&self, key: &DeploymentKey) -> Result<Deployment>;

    /// Deployments with replicas, or every deployment when `all` is set.
    async fn list_deployments(&self, all: bool) -> Result<Vec<Deployment>>;

    /// Change the desired replica count.
    async fn set_deployment_replicas(&self, key: &DeploymentKey, min_replicas: i32) -> Result<()>;

    /// Make `new` the module's active deployment with `min_replicas`,
    /// retiring the previous one. Returns the retired deployment, if any.
    async fn replace_deployment(
        &self,
        new: &DeploymentKey,
        min_replicas: i32,
    ) -> Result<Option<DeploymentKey>>;

    /// Deployments whose reserved and assigned runner count differs from the target.
    async fn deployments_needing_reconciliation(&self) -> Result<Vec<Reconciliation>>;

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Assigned runners of active deployments, optionally for one module.
    async fn routing_table(&self, module: Option<&str>) -> Result<Vec<Route>>;

    /// Ingress routes for `method` joined with the runners serving them.
    async fn ingress_routes(&self, method: &str) -> Result<Vec<IngressRoute>>;

    /// Declared ingress routes of active deployments, or all when `all` is set.
    async fn list_ingress_routes(&self, all: bool) -> Result<Vec<IngressRouteEntry>>;

    // ------------------------------------------------------------------
    // Requests and events
    // ------------------------------------------------------------------

    /// Record an inbound request.
    async fn create_request(&self, name: &RequestName, source_addr: &str) -> Result<()>;

    /// Record a verb call.
    async fn insert_call_event(&self, call: &CallEvent) -> Result<()>;

    /// Record a log line from a deployment.
    async fn insert_log_event(&self, log: &LogEvent) -> Result<()>;

    /// Calls recorded against a request, oldest first.
    async fn list_call_events(&self, request: &RequestName) -> Result<Vec<CallEvent>>;

    // ------------------------------------------------------------------
    // Change feed
    // ------------------------------------------------------------------

    /// True if [`Persistence::change_stream`] reports every deployment mutation,
    /// including those made by other controllers.
    fn has_change_feed(&self) -> bool;

    /// Open the store's own change feed, if it has one.
    async fn change_stream(&self) -> Result<Option<ChangeStream>>;

    /// Check the store is reachable.
    async fn health_check(&self) -> Result<()>;
}
