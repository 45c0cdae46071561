// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema change notifications.
//!
//! A [`SchemaWatch`] turns deployment notifications into per-module
//! ADDED / CHANGED / REMOVED events. Each watch keeps its own view of the
//! world, seeded from a snapshot of the active deployments when it is opened:
//!
//! - `modules`: module name to the deployment currently published for it,
//!   with the content hash and replica count last sent;
//! - `deployments`: deployment key to module name, used to resolve deletions
//!   which only carry the key.
//!
//! Rules for a change to deployment `d` of module `m`:
//!
//! | Known state for `m` | Change | Event |
//! |---------------------|--------|-------|
//! | none, or at 0 replicas | `d` now > 0 | ADDED |
//! | `d` at > 0 | `d` now 0 | REMOVED |
//! | `d` at > 0 | hash changed | CHANGED |
//! | `d` | hash unchanged | none |
//! | another deployment at > 0 | `d` now > 0 | CHANGED (replacement) |
//! | another deployment | `d` at 0 | none (retired or not yet active) |
//! | `d` | row deleted | REMOVED if it was > 0 |
//!
//! The hash covers the schema with its runtime section, so a replica count
//! change always changes it.

use std::collections::{HashMap, VecDeque};

use helmsman_model::schema::Module;
use helmsman_model::{DeploymentKey, Sha256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dal::Dal;
use crate::error::Result;
use crate::pubsub::Subscription;
use crate::types::{Deployment, DeploymentNotification};

/// Kind of schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A module became active.
    Added,
    /// An active module's schema or replica count changed.
    Changed,
    /// A module was retired or deleted.
    Removed,
}

/// One event on a schema watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Module the change is about.
    pub module_name: String,
    /// Deployment that caused it.
    pub deployment_key: DeploymentKey,
    /// What happened.
    pub change_type: ChangeType,
    /// Published schema, absent for deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Module>,
    /// More catch-up events immediately follow.
    pub more: bool,
}

#[derive(Debug, Clone)]
struct Published {
    deployment: DeploymentKey,
    hash: Sha256,
    min_replicas: i32,
}

/// Per-watch view of which deployment each module publishes.
#[derive(Debug, Default)]
struct NotifierState {
    modules: HashMap<String, Published>,
    deployments: HashMap<DeploymentKey, String>,
}

impl NotifierState {
    fn apply(&mut self, notification: DeploymentNotification) -> Result<Option<SchemaChange>> {
        match notification {
            DeploymentNotification::Changed(deployment) => self.changed(deployment),
            DeploymentNotification::Deleted(key) => Ok(self.deleted(key)),
        }
    }

    fn changed(&mut self, deployment: Deployment) -> Result<Option<SchemaChange>> {
        let schema = deployment.published_schema();
        let hash = schema.content_hash()?;
        let module = deployment.module.clone();
        let key = deployment.key.clone();
        let replicas = deployment.min_replicas;
        self.deployments.insert(key.clone(), module.clone());

        let change_type = match self.modules.get(&module) {
            Some(current) if current.deployment == key => {
                if current.hash == hash && current.min_replicas == replicas {
                    return Ok(None);
                }
                match (current.min_replicas > 0, replicas > 0) {
                    (true, false) => Some(ChangeType::Removed),
                    (false, true) => Some(ChangeType::Added),
                    (true, true) => Some(ChangeType::Changed),
                    (false, false) => None,
                }
            }
            Some(current) => {
                if replicas == 0 {
                    return Ok(None);
                }
                if current.min_replicas > 0 {
                    Some(ChangeType::Changed)
                } else {
                    Some(ChangeType::Added)
                }
            }
            None if replicas > 0 => Some(ChangeType::Added),
            None => None,
        };

        self.modules.insert(
            module.clone(),
            Published {
                deployment: key.clone(),
                hash,
                min_replicas: replicas,
            },
        );

        Ok(change_type.map(|change_type| SchemaChange {
            module_name: module,
            deployment_key: key,
            change_type,
            schema: Some(schema),
            more: false,
        }))
    }

    fn deleted(&mut self, key: DeploymentKey) -> Option<SchemaChange> {
        let module = self.deployments.remove(&key)?;
        if self.modules.get(&module)?.deployment != key {
            return None;
        }
        let published = self.modules.remove(&module)?;
        (published.min_replicas > 0).then(|| SchemaChange {
            module_name: module,
            deployment_key: key,
            change_type: ChangeType::Removed,
            schema: None,
            more: false,
        })
    }
}

/// Opens schema watches.
#[derive(Clone)]
pub struct SchemaNotifier {
    dal: Dal,
}

impl SchemaNotifier {
    /// Notifier over `dal`'s deployment change topic.
    pub fn new(dal: Dal) -> Self {
        Self { dal }
    }

    /// Open a watch, seeded with one ADDED event per active deployment.
    ///
    /// The subscription is taken before the snapshot is read, so a change
    /// racing with the snapshot is seen at worst twice and deduplicated.
    pub async fn watch(&self) -> Result<SchemaWatch> {
        let subscription = self.dal.subscribe_deployment_changes();
        let snapshot = self.dal.list_deployments(false).await?;

        let mut state = NotifierState::default();
        let mut backlog = VecDeque::with_capacity(snapshot.len());
        for deployment in snapshot {
            if let Some(change) = state.changed(deployment)? {
                backlog.push_back(change);
            }
        }
        let last = backlog.len().saturating_sub(1);
        for (i, change) in backlog.iter_mut().enumerate() {
            change.more = i < last;
        }
        debug!(
            subscriber = subscription.id(),
            catch_up = backlog.len(),
            "Schema watch opened"
        );

        Ok(SchemaWatch {
            subscription,
            backlog,
            state,
        })
    }
}

/// A subscriber's stream of schema changes.
pub struct SchemaWatch {
    subscription: Subscription<DeploymentNotification>,
    backlog: VecDeque<SchemaChange>,
    state: NotifierState,
}

impl SchemaWatch {
    /// The next event. `None` once the change topic is closed.
    pub async fn next(&mut self) -> Option<Result<SchemaChange>> {
        if let Some(change) = self.backlog.pop_front() {
            return Some(Ok(change));
        }
        loop {
            let notification = self.subscription.recv().await?;
            match self.state.apply(notification) {
                Ok(Some(change)) => return Some(Ok(change)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
