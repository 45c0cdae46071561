// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain values returned by the state repository.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use helmsman_model::schema::{Module, ModuleRuntime, VerbRef};
use helmsman_model::{ControllerKey, DeploymentKey, Labels, RequestName, RunnerKey, Sha256};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    /// Available for reservation.
    Idle,
    /// Claimed for a deployment that has not started yet.
    Reserved,
    /// Running a deployment.
    Assigned,
    /// Missed its heartbeat deadline.
    Dead,
}

impl RunnerState {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reserved => "reserved",
            Self::Assigned => "assigned",
            Self::Dead => "dead",
        }
    }

    /// True for the states that carry a deployment.
    pub fn has_deployment(&self) -> bool {
        matches!(self, Self::Reserved | Self::Assigned)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "reserved" => Ok(Self::Reserved),
            "assigned" => Ok(Self::Assigned),
            "dead" => Ok(Self::Dead),
            other => Err(Error::InvalidArgument(format!("unknown runner state {other:?}"))),
        }
    }
}

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// Heartbeating.
    Live,
    /// Missed its heartbeat deadline.
    Dead,
}

impl FromStr for ControllerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "dead" => Ok(Self::Dead),
            other => Err(Error::InvalidArgument(format!(
                "unknown controller state {other:?}"
            ))),
        }
    }
}

/// A control-plane instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    /// Identity.
    pub key: ControllerKey,
    /// Advertised endpoint.
    pub endpoint: String,
    /// Liveness.
    pub state: ControllerState,
}

/// A worker process.
///
/// `deployment` is present exactly when `state` is Reserved or Assigned; the
/// store enforces this with a check constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    /// Identity.
    pub key: RunnerKey,
    /// Endpoint the control plane calls back on.
    pub endpoint: String,
    /// Lifecycle state.
    pub state: RunnerState,
    /// Deployment the runner is reserved for or running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentKey>,
    /// Placement labels.
    #[serde(default)]
    pub labels: Labels,
}

/// An artefact belonging to a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentArtefact {
    /// Content digest.
    pub digest: Sha256,
    /// Path relative to the deployment root.
    pub path: String,
    /// Whether the file is marked executable.
    pub executable: bool,
}

/// A versioned unit of schema and artefacts for one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Identity.
    pub key: DeploymentKey,
    /// Module name.
    pub module: String,
    /// Implementation language.
    pub language: String,
    /// Desired replica count. Zero means retired.
    pub min_replicas: i32,
    /// Module schema as submitted.
    pub schema: Module,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deployment labels.
    #[serde(default)]
    pub labels: Labels,
    /// Artefacts, populated only when a single deployment is loaded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artefacts: Vec<DeploymentArtefact>,
}

impl Deployment {
    /// Schema with runtime information attached, as published to watchers.
    pub fn published_schema(&self) -> Module {
        self.schema.with_runtime(ModuleRuntime {
            language: self.language.clone(),
            create_time: self.created_at,
            min_replicas: self.min_replicas,
        })
    }
}

/// A live binding from a module to a runner endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Module served.
    pub module: String,
    /// Deployment being run.
    pub deployment: DeploymentKey,
    /// Runner serving it.
    pub runner: RunnerKey,
    /// Runner endpoint.
    pub endpoint: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.deployment, self.runner, self.endpoint)
    }
}

/// A declared HTTP entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRouteEntry {
    /// Deployment that declared it.
    pub deployment: DeploymentKey,
    /// Module name.
    pub module: String,
    /// Verb name.
    pub verb: String,
    /// HTTP method.
    pub method: String,
    /// Path pattern.
    pub path: String,
}

/// An ingress route joined with a runner that currently serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoute {
    /// Runner serving the route.
    pub runner: RunnerKey,
    /// Runner endpoint.
    pub endpoint: String,
    /// Module name.
    pub module: String,
    /// Verb name.
    pub verb: String,
    /// Path pattern.
    pub path: String,
}

/// A deployment whose assigned replica count differs from its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Deployment.
    pub deployment: DeploymentKey,
    /// Module name.
    pub module: String,
    /// Implementation language.
    pub language: String,
    /// Runners currently reserved for or running the deployment.
    pub assigned_replicas: i64,
    /// Desired replica count.
    pub required_replicas: i64,
}

/// Full fleet snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    /// Controllers.
    pub controllers: Vec<Controller>,
    /// Runners.
    pub runners: Vec<Runner>,
    /// Deployments.
    pub deployments: Vec<Deployment>,
    /// Declared ingress routes.
    pub ingress_routes: Vec<IngressRouteEntry>,
    /// Current routing table.
    pub routes: Vec<Route>,
}

/// A recorded verb call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Correlating request, if known.
    pub request_name: Option<RequestName>,
    /// Deployment that served the call.
    pub deployment: DeploymentKey,
    /// When the call started.
    pub time: DateTime<Utc>,
    /// Calling verb, absent for external calls.
    pub source_verb: Option<VerbRef>,
    /// Called verb.
    pub dest_verb: VerbRef,
    /// Wall time of the call.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Request body.
    pub request: String,
    /// Response body on success.
    pub response: Option<String>,
    /// Error message on failure.
    pub error: Option<String>,
}

/// A log record emitted by a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Deployment that logged.
    pub deployment: DeploymentKey,
    /// Correlating request, if any.
    pub request_name: Option<RequestName>,
    /// Time of the record.
    pub time: DateTime<Utc>,
    /// Numeric level (trace=1 .. error=17).
    pub level: i32,
    /// Structured attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Message.
    pub message: String,
    /// Attached error, if any.
    pub error: Option<String>,
}

/// A change to the deployments table.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentNotification {
    /// The deployment was inserted or updated; carries its current state.
    Changed(Deployment),
    /// The deployment row was removed.
    Deleted(DeploymentKey),
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
