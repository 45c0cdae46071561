// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Intended for a single controller. Timestamps are always bound from the
//! application so comparisons stay consistent, and label matching happens in
//! Rust. There is no store-level change feed; the state repository publishes
//! deployment changes itself after each commit.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_model::schema::{IngressRoutingEntry, Module};
use helmsman_model::{ControllerKey, DeploymentKey, Labels, RequestName, RunnerKey, Sha256};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use super::rows::{
    ArtefactRow, CallEventRow, ControllerRow, DeploymentRow, DigestRow, ExistingDeploymentRow,
    IngressEntryRow, IngressRouteRow, ReconciliationRow, RouteRow, RunnerRow, convert, cutoff,
    digest_set, find_existing, missing_artefacts_error, missing_from,
};
use super::{ChangeStream, Claim, Persistence};
use crate::error::{Error, Result};
use crate::types::{
    CallEvent, Controller, Deployment, DeploymentArtefact, IngressRoute, IngressRouteEntry,
    LogEvent, Reconciliation, Route, Runner, RunnerState,
};

const RUNNER_SELECT: &str = r#"
    SELECT r.key, r.endpoint, r.state, d.key AS deployment, r.labels
    FROM runners r
    LEFT JOIN deployments d ON d.id = r.deployment_id
"#;

const DEPLOYMENT_SELECT: &str = r#"
    SELECT d.key, m.name AS module, m.language, d.min_replicas, d.schema,
           d.created_at, d.labels
    FROM deployments d
    JOIN modules m ON m.id = d.module_id
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/helmsman.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(format!("failed to create directory {parent:?}: {e}"))
            })?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy()), 5).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    ///
    /// In-memory databases are per connection, so they are forced onto a
    /// single connection.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let max_connections = if url.contains(":memory:") {
            1
        } else {
            max_connections
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| Error::Internal(format!("failed to run migrations: {e}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn deployment_id(
        tx: &mut Transaction<'static, Sqlite>,
        key: &DeploymentKey,
    ) -> Result<i64> {
        sqlx::query_scalar("SELECT id FROM deployments WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {key}")))
    }

    async fn present_digests(&self, digests: &[Sha256]) -> Result<Vec<(i64, Vec<u8>)>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT id, digest FROM artefacts WHERE digest IN (");
        let mut separated = query.separated(", ");
        for digest in digests {
            separated.push_bind(digest.as_bytes().to_vec());
        }
        separated.push_unseparated(")");
        Ok(query.build_query_as().fetch_all(&self.pool).await?)
    }
}

/// An open transaction in which the runner row was moved to Reserved.
struct SqliteClaim {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl Claim for SqliteClaim {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct IdleRow {
    id: i64,
    key: String,
    endpoint: String,
    labels: Json<Labels>,
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO controllers (key, endpoint, state, created_at, last_seen)
            VALUES (?, ?, 'live', ?, ?)
            ON CONFLICT (key) DO UPDATE
            SET endpoint = excluded.endpoint, state = 'live', last_seen = excluded.last_seen
            "#,
        )
        .bind(key.to_string())
        .bind(endpoint)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kill_stale_controllers(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE controllers SET state = 'dead' WHERE state = 'live' AND last_seen < ?",
        )
        .bind(cutoff(timeout)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_controllers(&self, all: bool) -> Result<Vec<Controller>> {
        let rows: Vec<ControllerRow> = sqlx::query_as(
            "SELECT key, endpoint, state FROM controllers WHERE (? OR state = 'live') ORDER BY key",
        )
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn upsert_runner(&self, runner: &Runner) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let deployment_id = match &runner.deployment {
            Some(key) => Some(Self::deployment_id(&mut tx, key).await?),
            None => None,
        };
        // A reaped runner restarting on the same endpoint comes back under a new key.
        sqlx::query("DELETE FROM runners WHERE endpoint = ? AND key <> ? AND state = 'dead'")
            .bind(&runner.endpoint)
            .bind(runner.key.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO runners (key, endpoint, state, deployment_id, labels, created_at, last_seen)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE
            SET endpoint = excluded.endpoint,
                state = excluded.state,
                deployment_id = excluded.deployment_id,
                labels = excluded.labels,
                last_seen = excluded.last_seen,
                reservation_timeout = CASE
                    WHEN excluded.state = 'reserved' THEN runners.reservation_timeout
                    ELSE NULL
                END
            "#,
        )
        .bind(runner.key.to_string())
        .bind(&runner.endpoint)
        .bind(runner.state.as_str())
        .bind(deployment_id)
        .bind(Json(&runner.labels))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn deregister_runner(&self, key: &RunnerKey) -> Result<()> {
        let result = sqlx::query("DELETE FROM runners WHERE key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("runner {key}")));
        }
        Ok(())
    }

    async fn get_runner(&self, key: &RunnerKey) -> Result<Runner> {
        let row: Option<RunnerRow> = sqlx::query_as(&format!("{RUNNER_SELECT} WHERE r.key = ?"))
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("runner {key}")))?
            .try_into()
    }

    async fn list_runners(&self, all: bool) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE (? OR r.state <> 'dead') ORDER BY r.key"
        ))
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn runners_for_deployment(&self, deployment: &DeploymentKey) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE d.key = ? AND r.state IN ('reserved', 'assigned') ORDER BY r.key"
        ))
        .bind(deployment.to_string())
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn idle_runners(&self, labels: &Labels, limit: i64) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE r.state = 'idle' ORDER BY random()"
        ))
        .fetch_all(&self.pool)
        .await?;
        let runners: Vec<Runner> = convert(rows)?;
        Ok(runners
            .into_iter()
            .filter(|r| r.labels.matches(labels))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn kill_stale_runners(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET state = 'dead', deployment_id = NULL, reservation_timeout = NULL
            WHERE state <> 'dead' AND last_seen < ?
            "#,
        )
        .bind(cutoff(timeout)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reserve_runner(
        &self,
        deployment: &DeploymentKey,
        expires_at: DateTime<Utc>,
        labels: &Labels,
    ) -> Result<(Runner, Box<dyn Claim>)> {
        let mut tx = self.pool.begin().await?;
        let deployment_id = Self::deployment_id(&mut tx, deployment).await?;

        let candidates: Vec<IdleRow> = sqlx::query_as(
            "SELECT id, key, endpoint, labels FROM runners WHERE state = 'idle' ORDER BY random()",
        )
        .fetch_all(&mut *tx)
        .await?;

        for candidate in candidates.into_iter().filter(|c| c.labels.0.matches(labels)) {
            let claimed = sqlx::query(
                r#"
                UPDATE runners
                SET state = 'reserved', deployment_id = ?, reservation_timeout = ?
                WHERE id = ? AND state = 'idle'
                "#,
            )
            .bind(deployment_id)
            .bind(expires_at)
            .bind(candidate.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if claimed == 0 {
                continue;
            }
            let runner = Runner {
                key: candidate
                    .key
                    .parse()
                    .map_err(|e| Error::Internal(format!("column runners.key: {e}")))?,
                endpoint: candidate.endpoint,
                state: RunnerState::Reserved,
                deployment: Some(deployment.clone()),
                labels: candidate.labels.0,
            };
            return Ok((runner, Box::new(SqliteClaim { tx })));
        }

        Err(Error::NotFound(format!(
            "no idle runners for deployment {deployment}"
        )))
    }

    async fn assign_runner(&self, runner: &RunnerKey, deployment: &DeploymentKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET state = 'assigned', reservation_timeout = NULL
            WHERE key = ?
              AND state IN ('reserved', 'assigned')
              AND deployment_id = (SELECT id FROM deployments WHERE key = ?)
            "#,
        )
        .bind(runner.to_string())
        .bind(deployment.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "runner {runner} is not reserved for {deployment}"
            )));
        }
        Ok(())
    }

    async fn expire_runner_reservations(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET state = 'idle', deployment_id = NULL, reservation_timeout = NULL
            WHERE state = 'reserved' AND reservation_timeout < ?
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn missing_artefacts(&self, digests: &[Sha256]) -> Result<Vec<Sha256>> {
        let present: Vec<Vec<u8>> = self
            .present_digests(digests)
            .await?
            .into_iter()
            .map(|(_, d)| d)
            .collect();
        Ok(missing_from(digests, &present))
    }

    async fn create_artefact(&self, content: &[u8]) -> Result<Sha256> {
        let digest = Sha256::of(content);
        sqlx::query(
            r#"
            INSERT INTO artefacts (digest, content, created_at) VALUES (?, ?, ?)
            ON CONFLICT (digest) DO NOTHING
            "#,
        )
        .bind(digest.as_bytes().as_slice())
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(digest)
    }

    async fn artefact_chunk(&self, digest: &Sha256, offset: i64, length: i64) -> Result<Vec<u8>> {
        let chunk: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT substr(content, ?, ?) FROM artefacts WHERE digest = ?")
                .bind(offset + 1)
                .bind(length)
                .bind(digest.as_bytes().as_slice())
                .fetch_optional(&self.pool)
                .await?;
        chunk.ok_or_else(|| Error::NotFound(format!("artefact {digest}")))
    }

    async fn create_deployment(
        &self,
        language: &str,
        schema: &Module,
        artefacts: &[DeploymentArtefact],
        ingress_routes: &[IngressRoutingEntry],
    ) -> Result<DeploymentKey> {
        let wanted = digest_set(artefacts.iter().map(|a| &a.digest));
        let requested: Vec<Sha256> = artefacts.iter().map(|a| a.digest).collect();
        let found = self.present_digests(&requested).await?;
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<ExistingDeploymentRow> = sqlx::query_as(
            r#"
            SELECT d.id, d.key, d.schema
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE m.name = ?
            ORDER BY d.id
            "#,
        )
        .bind(&schema.name)
        .fetch_all(&mut *tx)
        .await?;
        if !candidates.is_empty() {
            let digests: Vec<DigestRow> = sqlx::query_as(
                r#"
                SELECT da.deployment_id, a.digest
                FROM deployment_artefacts da
                JOIN artefacts a ON a.id = da.artefact_id
                JOIN deployments d ON d.id = da.deployment_id
                JOIN modules m ON m.id = d.module_id
                WHERE m.name = ?
                "#,
            )
            .bind(&schema.name)
            .fetch_all(&mut *tx)
            .await?;
            if let Some(existing) = find_existing(candidates, digests, schema, &wanted)? {
                debug!(deployment = %existing, "Deployment already exists");
                return Ok(existing);
            }
        }

        let present: Vec<Vec<u8>> = found.iter().map(|(_, d)| d.clone()).collect();
        let missing = missing_from(&requested, &present);
        if !missing.is_empty() {
            return Err(missing_artefacts_error(&missing));
        }

        let module_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO modules (language, name) VALUES (?, ?)
            ON CONFLICT (name) DO UPDATE SET language = excluded.language
            RETURNING id
            "#,
        )
        .bind(language)
        .bind(&schema.name)
        .fetch_one(&mut *tx)
        .await?;

        let key = DeploymentKey::new(&schema.name);
        let deployment_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO deployments (created_at, module_id, key, schema, labels)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(module_id)
        .bind(key.to_string())
        .bind(Json(schema))
        .bind(Json(Labels::for_language(language)))
        .fetch_one(&mut *tx)
        .await?;

        for artefact in artefacts {
            let artefact_id = found
                .iter()
                .find(|(_, d)| d.as_slice() == artefact.digest.as_bytes().as_slice())
                .map(|(id, _)| *id)
                .ok_or_else(|| missing_artefacts_error(&[artefact.digest]))?;
            sqlx::query(
                r#"
                INSERT INTO deployment_artefacts (artefact_id, deployment_id, executable, path)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(artefact_id)
            .bind(deployment_id)
            .bind(artefact.executable)
            .bind(&artefact.path)
            .execute(&mut *tx)
            .await?;
        }

        for route in ingress_routes {
            sqlx::query(
                r#"
                INSERT INTO ingress_routes (method, path, deployment_id, module, verb)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&route.method)
            .bind(&route.path)
            .bind(deployment_id)
            .bind(&schema.name)
            .bind(&route.verb)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(key)
    }

    async fn get_deployment(&self, key: &DeploymentKey) -> Result<Deployment> {
        let row: Option<DeploymentRow> =
            sqlx::query_as(&format!("{DEPLOYMENT_SELECT} WHERE d.key = ?"))
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await?;
        let mut deployment: Deployment = row
            .ok_or_else(|| Error::NotFound(format!("deployment {key}")))?
            .try_into()?;

        let artefacts: Vec<ArtefactRow> = sqlx::query_as(
            r#"
            SELECT a.digest, da.path, da.executable
            FROM deployment_artefacts da
            JOIN artefacts a ON a.id = da.artefact_id
            JOIN deployments d ON d.id = da.deployment_id
            WHERE d.key = ?
            ORDER BY da.path
            "#,
        )
        .bind(key.to_string())
        .fetch_all(&self.pool)
        .await?;
        deployment.artefacts = convert(artefacts)?;
        Ok(deployment)
    }

    async fn list_deployments(&self, all: bool) -> Result<Vec<Deployment>> {
        let rows: Vec<DeploymentRow> = sqlx::query_as(&format!(
            "{DEPLOYMENT_SELECT} WHERE (? OR d.min_replicas > 0) ORDER BY d.id"
        ))
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn set_deployment_replicas(&self, key: &DeploymentKey, min_replicas: i32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(i64, i32)> =
            sqlx::query_as("SELECT id, min_replicas FROM deployments WHERE key = ?")
                .bind(key.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let (deployment_id, prev) =
            current.ok_or_else(|| Error::NotFound(format!("deployment {key}")))?;

        sqlx::query("UPDATE deployments SET min_replicas = ? WHERE id = ?")
            .bind(min_replicas)
            .bind(deployment_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO events (time_stamp, deployment_id, type, payload)
            VALUES (?, ?, 'deployment_updated', ?)
            "#,
        )
        .bind(Utc::now())
        .bind(deployment_id)
        .bind(Json(json!({
            "min_replicas": min_replicas,
            "prev_min_replicas": prev,
        })))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_deployment(
        &self,
        new: &DeploymentKey,
        min_replicas: i32,
    ) -> Result<Option<DeploymentKey>> {
        let mut tx = self.pool.begin().await?;
        let target: Option<(i64, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT d.id, d.module_id, m.name, m.language
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE d.key = ?
            "#,
        )
        .bind(new.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let (new_id, module_id, module, language) =
            target.ok_or_else(|| Error::NotFound(format!("deployment {new}")))?;

        let active: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, key FROM deployments
            WHERE module_id = ? AND min_replicas > 0
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(module_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((old_id, _)) = &active
            && *old_id == new_id
        {
            return Err(Error::Conflict(format!("deployment already exists: {new}")));
        }

        sqlx::query("UPDATE deployments SET min_replicas = ? WHERE id = ?")
            .bind(min_replicas)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;
        let replaced = match active {
            Some((old_id, old_key)) => {
                sqlx::query("UPDATE deployments SET min_replicas = 0 WHERE id = ?")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                Some(
                    old_key
                        .parse::<DeploymentKey>()
                        .map_err(|e| Error::Internal(format!("column deployments.key: {e}")))?,
                )
            }
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO events (time_stamp, deployment_id, type, payload)
            VALUES (?, ?, 'deployment_created', ?)
            "#,
        )
        .bind(Utc::now())
        .bind(new_id)
        .bind(Json(json!({
            "language": language,
            "module": module,
            "min_replicas": min_replicas,
            "replaced": replaced.as_ref().map(ToString::to_string),
        })))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(replaced)
    }

    async fn deployments_needing_reconciliation(&self) -> Result<Vec<Reconciliation>> {
        let rows: Vec<ReconciliationRow> = sqlx::query_as(
            r#"
            SELECT d.key AS deployment, m.name AS module, m.language,
                   COUNT(r.id) AS assigned_replicas,
                   d.min_replicas AS required_replicas
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            LEFT JOIN runners r
                ON r.deployment_id = d.id AND r.state IN ('reserved', 'assigned')
            GROUP BY d.id, d.key, m.name, m.language, d.min_replicas
            HAVING COUNT(r.id) <> d.min_replicas
            ORDER BY d.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn routing_table(&self, module: Option<&str>) -> Result<Vec<Route>> {
        let rows: Vec<RouteRow> = sqlx::query_as(
            r#"
            SELECT m.name AS module, d.key AS deployment, r.key AS runner, r.endpoint
            FROM runners r
            JOIN deployments d ON d.id = r.deployment_id
            JOIN modules m ON m.id = d.module_id
            WHERE r.state = 'assigned'
              AND d.min_replicas > 0
              AND (? IS NULL OR m.name = ?)
            ORDER BY m.name, r.key
            "#,
        )
        .bind(module)
        .bind(module)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn ingress_routes(&self, method: &str) -> Result<Vec<IngressRoute>> {
        let rows: Vec<IngressRouteRow> = sqlx::query_as(
            r#"
            SELECT r.key AS runner, r.endpoint, ir.module, ir.verb, ir.path
            FROM ingress_routes ir
            JOIN deployments d ON d.id = ir.deployment_id
            JOIN runners r ON r.deployment_id = d.id
            WHERE ir.method = ? AND r.state = 'assigned' AND d.min_replicas > 0
            ORDER BY ir.path, r.key
            "#,
        )
        .bind(method)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn list_ingress_routes(&self, all: bool) -> Result<Vec<IngressRouteEntry>> {
        let rows: Vec<IngressEntryRow> = sqlx::query_as(
            r#"
            SELECT d.key AS deployment, ir.module, ir.verb, ir.method, ir.path
            FROM ingress_routes ir
            JOIN deployments d ON d.id = ir.deployment_id
            WHERE (? OR d.min_replicas > 0)
            ORDER BY ir.id
            "#,
        )
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn create_request(&self, name: &RequestName, source_addr: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests (origin, key, source_addr, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(name.origin().as_str())
        .bind(name.to_string())
        .bind(source_addr)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_call_event(&self, call: &CallEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deployment_id = Self::deployment_id(&mut tx, &call.deployment).await?;
        let request_id: Option<i64> = match &call.request_name {
            Some(name) => Some(
                sqlx::query_scalar(
                    r#"
                    INSERT INTO requests (origin, key, source_addr, created_at)
                    VALUES (?, ?, '', ?)
                    ON CONFLICT (key) DO UPDATE SET key = excluded.key
                    RETURNING id
                    "#,
                )
                .bind(name.origin().as_str())
                .bind(name.to_string())
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO events (time_stamp, deployment_id, request_id, type, payload)
            VALUES (?, ?, ?, 'call', ?)
            "#,
        )
        .bind(call.time)
        .bind(deployment_id)
        .bind(request_id)
        .bind(Json(call))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_log_event(&self, log: &LogEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (time_stamp, deployment_id, request_id, type, payload)
            VALUES (
                ?,
                (SELECT id FROM deployments WHERE key = ?),
                (SELECT id FROM requests WHERE key = ?),
                'log',
                ?
            )
            "#,
        )
        .bind(log.time)
        .bind(log.deployment.to_string())
        .bind(log.request_name.as_ref().map(ToString::to_string))
        .bind(Json(log))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_call_events(&self, request: &RequestName) -> Result<Vec<CallEvent>> {
        let rows: Vec<CallEventRow> = sqlx::query_as(
            r#"
            SELECT e.payload
            FROM events e
            JOIN requests r ON r.id = e.request_id
            WHERE r.key = ? AND e.type = 'call'
            ORDER BY e.id
            "#,
        )
        .bind(request.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CallEvent::from).collect())
    }

    fn has_change_feed(&self) -> bool {
        false
    }

    async fn change_stream(&self) -> Result<Option<ChangeStream>> {
        Ok(None)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
