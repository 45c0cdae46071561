// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State repository.
//!
//! [`Dal`] is the typed facade every other component uses. It wraps a
//! [`Persistence`] backend and owns the in-process deployment change topic.
//!
//! Deployment changes reach the topic in one of two ways:
//! - backends with a store-level change feed (PostgreSQL) are drained by the
//!   [`ChangeFeed`](crate::change_feed::ChangeFeed) worker, which sees
//!   mutations from every controller;
//! - for the others, the `Dal` publishes after each committed mutation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use helmsman_model::schema::Module;
use helmsman_model::{ControllerKey, DeploymentKey, Labels, Origin, RequestName, RunnerKey, Sha256};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::persistence::{ChangeNotice, ChangeStream, Persistence};
use crate::pubsub::{Subscription, Topic};
use crate::reservation::Reservation;
use crate::types::{
    CallEvent, Controller, Deployment, DeploymentArtefact, DeploymentNotification, IngressRoute,
    LogEvent, Reconciliation, Route, Runner, Status,
};

/// Which parts of the fleet [`Dal::status`] includes in full.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct StatusFilter {
    /// Include dead controllers.
    pub all_controllers: bool,
    /// Include dead runners.
    pub all_runners: bool,
    /// Include deployments with zero replicas.
    pub all_deployments: bool,
    /// Include ingress routes of inactive deployments.
    pub all_ingress_routes: bool,
}

/// Typed operations over the store plus the deployment change topic.
#[derive(Clone)]
pub struct Dal {
    persistence: Arc<dyn Persistence>,
    changes: Topic<DeploymentNotification>,
}

impl Dal {
    /// Wrap a persistence backend.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            changes: Topic::new(),
        }
    }

    /// The underlying backend.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    // ------------------------------------------------------------------
    // Change notifications
    // ------------------------------------------------------------------

    /// Subscribe to deployment changes published from now on.
    pub fn subscribe_deployment_changes(&self) -> Subscription<DeploymentNotification> {
        self.changes.subscribe()
    }

    /// Whether the backend reports changes itself.
    pub fn has_change_feed(&self) -> bool {
        self.persistence.has_change_feed()
    }

    /// Open the backend's change feed.
    pub async fn change_stream(&self) -> Result<Option<ChangeStream>> {
        self.persistence.change_stream().await
    }

    /// Resolve a raw change notice into a notification and publish it.
    pub async fn publish_change(&self, notice: ChangeNotice) -> Result<()> {
        let notification = if notice.deleted {
            DeploymentNotification::Deleted(notice.key)
        } else {
            match self.persistence.get_deployment(&notice.key).await {
                Ok(deployment) => DeploymentNotification::Changed(deployment),
                Err(e) if e.is_not_found() => DeploymentNotification::Deleted(notice.key),
                Err(e) => return Err(e),
            }
        };
        let delivered = self.changes.publish(notification);
        debug!(subscribers = delivered, "Published deployment change");
        Ok(())
    }

    async fn publish_local(&self, key: &DeploymentKey) -> Result<()> {
        if self.persistence.has_change_feed() {
            return Ok(());
        }
        self.publish_change(ChangeNotice {
            key: key.clone(),
            deleted: false,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Controllers and status
    // ------------------------------------------------------------------

    /// Record a heartbeat for this controller.
    pub async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> Result<()> {
        self.persistence.upsert_controller(key, endpoint).await
    }

    /// Mark silent controllers dead.
    pub async fn kill_stale_controllers(&self, timeout: Duration) -> Result<u64> {
        self.persistence.kill_stale_controllers(timeout).await
    }

    /// Controllers, optionally including dead ones.
    pub async fn list_controllers(&self, all: bool) -> Result<Vec<Controller>> {
        self.persistence.list_controllers(all).await
    }

    /// Full fleet snapshot.
    pub async fn status(&self, filter: StatusFilter) -> Result<Status> {
        Ok(Status {
            controllers: self.persistence.list_controllers(filter.all_controllers).await?,
            runners: self.persistence.list_runners(filter.all_runners).await?,
            deployments: self.persistence.list_deployments(filter.all_deployments).await?,
            ingress_routes: self
                .persistence
                .list_ingress_routes(filter.all_ingress_routes)
                .await?,
            routes: self.persistence.routing_table(None).await?,
        })
    }

    // ------------------------------------------------------------------
    // Runners
    // ------------------------------------------------------------------

    /// Insert or refresh a runner from its heartbeat.
    pub async fn upsert_runner(&self, runner: &Runner) -> Result<()> {
        self.persistence.upsert_runner(runner).await
    }

    /// Remove a runner.
    pub async fn deregister_runner(&self, key: &RunnerKey) -> Result<()> {
        self.persistence.deregister_runner(key).await
    }

    /// Load one runner.
    pub async fn get_runner(&self, key: &RunnerKey) -> Result<Runner> {
        self.persistence.get_runner(key).await
    }

    /// Runners reserved for or assigned to `deployment`.
    pub async fn runners_for_deployment(&self, deployment: &DeploymentKey) -> Result<Vec<Runner>> {
        self.persistence.runners_for_deployment(deployment).await
    }

    /// Idle runners whose labels contain `labels`.
    pub async fn idle_runners(&self, labels: &Labels, limit: i64) -> Result<Vec<Runner>> {
        self.persistence.idle_runners(labels, limit).await
    }

    /// Mark silent runners dead.
    pub async fn kill_stale_runners(&self, timeout: Duration) -> Result<u64> {
        self.persistence.kill_stale_runners(timeout).await
    }

    /// Claim an idle runner matching `labels` for `deployment` until `timeout`
    /// from now.
    ///
    /// NotFound if no idle runner matches.
    pub async fn reserve(
        &self,
        deployment: &DeploymentKey,
        timeout: Duration,
        labels: &Labels,
    ) -> Result<Reservation> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::InvalidArgument(format!("reservation timeout: {e}")))?;
        let expires_at = Utc::now() + timeout;
        let (runner, claim) = self
            .persistence
            .reserve_runner(deployment, expires_at, labels)
            .await?;
        debug!(runner = %runner.key, deployment = %deployment, "Reserved runner");
        Ok(Reservation::new(runner, deployment.clone(), expires_at, claim))
    }

    /// Promote a reserved runner to Assigned.
    pub async fn assign_runner(&self, runner: &RunnerKey, deployment: &DeploymentKey) -> Result<()> {
        self.persistence.assign_runner(runner, deployment).await
    }

    /// Release reservations past their expiry.
    pub async fn expire_runner_reservations(&self) -> Result<u64> {
        self.persistence.expire_runner_reservations().await
    }

    // ------------------------------------------------------------------
    // Artefacts
    // ------------------------------------------------------------------

    /// Digests the store does not have.
    pub async fn missing_artefacts(&self, digests: &[Sha256]) -> Result<Vec<Sha256>> {
        self.persistence.missing_artefacts(digests).await
    }

    /// Store artefact content.
    pub async fn create_artefact(&self, content: &[u8]) -> Result<Sha256> {
        self.persistence.create_artefact(content).await
    }

    /// A slice of an artefact.
    pub async fn artefact_chunk(&self, digest: &Sha256, offset: i64, length: i64) -> Result<Vec<u8>> {
        self.persistence.artefact_chunk(digest, offset, length).await
    }

    // ------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------

    /// Validate `schema` and create a deployment, or return the identical one.
    pub async fn create_deployment(
        &self,
        language: &str,
        schema: &Module,
        artefacts: &[DeploymentArtefact],
    ) -> Result<DeploymentKey> {
        if language.is_empty() {
            return Err(Error::InvalidArgument("language is required".to_string()));
        }
        schema.validate()?;
        let ingress = schema.ingress_routes();
        let key = self
            .persistence
            .create_deployment(language, schema, artefacts, &ingress)
            .await?;
        info!(deployment = %key, module = %schema.name, language, "Created deployment");
        self.publish_local(&key).await?;
        Ok(key)
    }

    /// Load one deployment with artefacts.
    pub async fn get_deployment(&self, key: &DeploymentKey) -> Result<Deployment> {
        self.persistence.get_deployment(key).await
    }

    /// Deployments, optionally including retired ones.
    pub async fn list_deployments(&self, all: bool) -> Result<Vec<Deployment>> {
        self.persistence.list_deployments(all).await
    }

    /// Change the desired replica count.
    pub async fn set_deployment_replicas(&self, key: &DeploymentKey, min_replicas: i32) -> Result<()> {
        if min_replicas < 0 {
            return Err(Error::InvalidArgument(format!(
                "min_replicas must not be negative, got {min_replicas}"
            )));
        }
        self.persistence
            .set_deployment_replicas(key, min_replicas)
            .await?;
        info!(deployment = %key, min_replicas, "Updated deployment replicas");
        self.publish_local(key).await
    }

    /// Make `new` the active deployment of its module, returning the retired one.
    pub async fn replace_deployment(
        &self,
        new: &DeploymentKey,
        min_replicas: i32,
    ) -> Result<Option<DeploymentKey>> {
        if min_replicas < 0 {
            return Err(Error::InvalidArgument(format!(
                "min_replicas must not be negative, got {min_replicas}"
            )));
        }
        let replaced = self.persistence.replace_deployment(new, min_replicas).await?;
        match &replaced {
            Some(old) => {
                info!(deployment = %new, replaced = %old, min_replicas, "Replaced deployment")
            }
            None => info!(deployment = %new, min_replicas, "Activated deployment"),
        }
        self.publish_local(new).await?;
        if let Some(old) = &replaced {
            self.publish_local(old).await?;
        }
        Ok(replaced)
    }

    /// Deployments whose replica count has drifted from the target.
    pub async fn deployments_needing_reconciliation(&self) -> Result<Vec<Reconciliation>> {
        self.persistence.deployments_needing_reconciliation().await
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Live routes, optionally for one module.
    pub async fn routing_table(&self, module: Option<&str>) -> Result<Vec<Route>> {
        self.persistence.routing_table(module).await
    }

    /// Ingress routes for an HTTP method with their serving runners.
    pub async fn ingress_routes(&self, method: &str) -> Result<Vec<IngressRoute>> {
        self.persistence.ingress_routes(method).await
    }

    // ------------------------------------------------------------------
    // Requests and events
    // ------------------------------------------------------------------

    /// Mint and persist a request name.
    pub async fn create_request(
        &self,
        origin: Origin,
        key: &str,
        source_addr: &str,
    ) -> Result<RequestName> {
        let name = RequestName::new(origin, key);
        self.persistence.create_request(&name, source_addr).await?;
        Ok(name)
    }

    /// Record a verb call.
    pub async fn insert_call_event(&self, call: &CallEvent) -> Result<()> {
        self.persistence.insert_call_event(call).await
    }

    /// Record a log line.
    pub async fn insert_log_event(&self, log: &LogEvent) -> Result<()> {
        self.persistence.insert_log_event(log).await
    }

    /// Calls recorded against a request.
    pub async fn list_call_events(&self, request: &RequestName) -> Result<Vec<CallEvent>> {
        self.persistence.list_call_events(request).await
    }

    /// Check the store is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.persistence.health_check().await
    }
}
