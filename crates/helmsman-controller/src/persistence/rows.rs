// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row shapes shared by both backends, and their conversion into domain types.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use helmsman_model::schema::Module;
use helmsman_model::{DeploymentKey, Labels, ModelError, Sha256};
use sqlx::types::Json;

use crate::error::{Error, Result};
use crate::types::{
    CallEvent, Controller, ControllerState, Deployment, DeploymentArtefact, IngressRoute,
    IngressRouteEntry, Reconciliation, Route, Runner, RunnerState,
};

/// Parse a key column, treating malformed values as store corruption.
fn column<T>(value: &str, name: &'static str) -> Result<T>
where
    T: FromStr<Err = ModelError>,
{
    value
        .parse()
        .map_err(|e: ModelError| Error::Internal(format!("column {name}: {e}")))
}

/// Absolute instant `timeout` ago.
pub(super) fn cutoff(timeout: Duration) -> Result<DateTime<Utc>> {
    let timeout = chrono::Duration::from_std(timeout)
        .map_err(|e| Error::InvalidArgument(format!("timeout out of range: {e}")))?;
    Ok(Utc::now() - timeout)
}

/// Sorted, deduplicated digest bytes.
pub(super) fn digest_set<'a>(digests: impl IntoIterator<Item = &'a Sha256>) -> BTreeSet<Vec<u8>> {
    digests.into_iter().map(|d| d.as_bytes().to_vec()).collect()
}

/// `missing N artefacts: d1, d2`
pub(super) fn missing_artefacts_error(missing: &[Sha256]) -> Error {
    let list = missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Error::InvalidArgument(format!("missing {} artefacts: {list}", missing.len()))
}

#[derive(sqlx::FromRow)]
pub(super) struct ControllerRow {
    key: String,
    endpoint: String,
    state: String,
}

impl TryFrom<ControllerRow> for Controller {
    type Error = Error;

    fn try_from(row: ControllerRow) -> Result<Self> {
        Ok(Self {
            key: column(&row.key, "controllers.key")?,
            endpoint: row.endpoint,
            state: ControllerState::from_str(&row.state)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct RunnerRow {
    key: String,
    endpoint: String,
    state: String,
    deployment: Option<String>,
    labels: Json<Labels>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = Error;

    fn try_from(row: RunnerRow) -> Result<Self> {
        Ok(Self {
            key: column(&row.key, "runners.key")?,
            endpoint: row.endpoint,
            state: RunnerState::from_str(&row.state)?,
            deployment: row
                .deployment
                .as_deref()
                .map(|d| column(d, "deployments.key"))
                .transpose()?,
            labels: row.labels.0,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct DeploymentRow {
    key: String,
    module: String,
    language: String,
    min_replicas: i32,
    schema: Json<Module>,
    created_at: DateTime<Utc>,
    labels: Json<Labels>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = Error;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        Ok(Self {
            key: column(&row.key, "deployments.key")?,
            module: row.module,
            language: row.language,
            min_replicas: row.min_replicas,
            schema: row.schema.0,
            created_at: row.created_at,
            labels: row.labels.0,
            artefacts: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ArtefactRow {
    digest: Vec<u8>,
    path: String,
    executable: bool,
}

impl TryFrom<ArtefactRow> for DeploymentArtefact {
    type Error = Error;

    fn try_from(row: ArtefactRow) -> Result<Self> {
        Ok(Self {
            digest: Sha256::from_slice(&row.digest)
                .map_err(|e| Error::Internal(format!("column artefacts.digest: {e}")))?,
            path: row.path,
            executable: row.executable,
        })
    }
}

/// A candidate deployment for idempotent creation.
#[derive(sqlx::FromRow)]
pub(super) struct ExistingDeploymentRow {
    pub(super) id: i64,
    pub(super) key: String,
    pub(super) schema: Json<Module>,
}

#[derive(sqlx::FromRow)]
pub(super) struct DigestRow {
    pub(super) deployment_id: i64,
    pub(super) digest: Vec<u8>,
}

#[derive(sqlx::FromRow)]
pub(super) struct RouteRow {
    module: String,
    deployment: String,
    runner: String,
    endpoint: String,
}

impl TryFrom<RouteRow> for Route {
    type Error = Error;

    fn try_from(row: RouteRow) -> Result<Self> {
        Ok(Self {
            module: row.module,
            deployment: column(&row.deployment, "deployments.key")?,
            runner: column(&row.runner, "runners.key")?,
            endpoint: row.endpoint,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct IngressRouteRow {
    runner: String,
    endpoint: String,
    module: String,
    verb: String,
    path: String,
}

impl TryFrom<IngressRouteRow> for IngressRoute {
    type Error = Error;

    fn try_from(row: IngressRouteRow) -> Result<Self> {
        Ok(Self {
            runner: column(&row.runner, "runners.key")?,
            endpoint: row.endpoint,
            module: row.module,
            verb: row.verb,
            path: row.path,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct IngressEntryRow {
    deployment: String,
    module: String,
    verb: String,
    method: String,
    path: String,
}

impl TryFrom<IngressEntryRow> for IngressRouteEntry {
    type Error = Error;

    fn try_from(row: IngressEntryRow) -> Result<Self> {
        Ok(Self {
            deployment: column(&row.deployment, "deployments.key")?,
            module: row.module,
            verb: row.verb,
            method: row.method,
            path: row.path,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ReconciliationRow {
    deployment: String,
    module: String,
    language: String,
    assigned_replicas: i64,
    required_replicas: i64,
}

impl TryFrom<ReconciliationRow> for Reconciliation {
    type Error = Error;

    fn try_from(row: ReconciliationRow) -> Result<Self> {
        Ok(Self {
            deployment: column(&row.deployment, "deployments.key")?,
            module: row.module,
            language: row.language,
            assigned_replicas: row.assigned_replicas,
            required_replicas: row.required_replicas,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct CallEventRow {
    payload: Json<CallEvent>,
}

impl From<CallEventRow> for CallEvent {
    fn from(row: CallEventRow) -> Self {
        row.payload.0
    }
}

/// Convert every row, failing on the first malformed one.
pub(super) fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// The first stored deployment with the same schema and artefact digest set.
pub(super) fn find_existing(
    candidates: Vec<ExistingDeploymentRow>,
    digests: Vec<DigestRow>,
    schema: &Module,
    wanted: &BTreeSet<Vec<u8>>,
) -> Result<Option<DeploymentKey>> {
    let mut by_deployment: HashMap<i64, BTreeSet<Vec<u8>>> = HashMap::new();
    for row in digests {
        by_deployment
            .entry(row.deployment_id)
            .or_default()
            .insert(row.digest);
    }
    let empty = BTreeSet::new();
    candidates
        .into_iter()
        .find(|c| {
            by_deployment.get(&c.id).unwrap_or(&empty) == wanted && &c.schema.0 == schema
        })
        .map(|c| column(&c.key, "deployments.key"))
        .transpose()
}

/// Requested digests absent from `present`, deduplicated, in request order.
pub(super) fn missing_from(requested: &[Sha256], present: &[Vec<u8>]) -> Vec<Sha256> {
    let present: BTreeSet<&[u8]> = present.iter().map(Vec::as_slice).collect();
    let mut seen = BTreeSet::new();
    requested
        .iter()
        .filter(|d| !present.contains(d.as_bytes().as_slice()) && seen.insert(**d))
        .copied()
        .collect()
}
