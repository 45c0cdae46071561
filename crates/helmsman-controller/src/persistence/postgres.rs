// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Reservations lock the claimed runner row with `FOR UPDATE SKIP LOCKED`, so
//! concurrent controllers never claim the same runner. Deployment mutations
//! fire the `deployments_notify_change` trigger, which is the change feed for
//! every controller connected to the database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use helmsman_model::schema::{IngressRoutingEntry, Module};
use helmsman_model::{ControllerKey, DeploymentKey, Labels, RequestName, RunnerKey, Sha256};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::rows::{
    ArtefactRow, CallEventRow, ControllerRow, DeploymentRow, DigestRow, ExistingDeploymentRow,
    IngressEntryRow, IngressRouteRow, ReconciliationRow, RouteRow, RunnerRow, convert, cutoff,
    digest_set, find_existing, missing_artefacts_error, missing_from,
};
use super::{ChangeNotice, ChangeStream, Claim, Persistence};
use crate::error::{Error, Result};
use crate::types::{
    CallEvent, Controller, Deployment, DeploymentArtefact, IngressRoute, IngressRouteEntry,
    LogEvent, Reconciliation, Route, Runner, RunnerState,
};

/// Channel the deployment trigger notifies on.
pub const CHANGE_CHANNEL: &str = "deployment_changes";

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

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| Error::Internal(format!("failed to run migrations: {e}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn deployment_id(
        tx: &mut Transaction<'static, Postgres>,
        key: &DeploymentKey,
    ) -> Result<i64> {
        sqlx::query_scalar("SELECT id FROM deployments WHERE key = $1")
            .bind(key.to_string())
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment {key}")))
    }
}

/// An open transaction holding the claimed runner row lock.
struct PgClaim {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Claim for PgClaim {
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
struct ClaimedRow {
    id: i64,
    key: String,
    endpoint: String,
    labels: Json<Labels>,
}

#[derive(Deserialize)]
struct TriggerPayload {
    action: String,
    key: String,
}

impl TryFrom<&str> for ChangeNotice {
    type Error = Error;

    fn try_from(payload: &str) -> Result<Self> {
        let payload: TriggerPayload = serde_json::from_str(payload)?;
        Ok(Self {
            key: payload
                .key
                .parse()
                .map_err(|e| Error::Internal(format!("change notification: {e}")))?,
            deleted: payload.action == "DELETE",
        })
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn upsert_controller(&self, key: &ControllerKey, endpoint: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO controllers (key, endpoint, state, last_seen)
            VALUES ($1, $2, 'live', NOW())
            ON CONFLICT (key) DO UPDATE
            SET endpoint = EXCLUDED.endpoint, state = 'live', last_seen = NOW()
            "#,
        )
        .bind(key.to_string())
        .bind(endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kill_stale_controllers(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE controllers SET state = 'dead' WHERE state = 'live' AND last_seen < $1",
        )
        .bind(cutoff(timeout)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_controllers(&self, all: bool) -> Result<Vec<Controller>> {
        let rows: Vec<ControllerRow> = sqlx::query_as(
            "SELECT key, endpoint, state FROM controllers WHERE ($1 OR state = 'live') ORDER BY key",
        )
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn upsert_runner(&self, runner: &Runner) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deployment_id = match &runner.deployment {
            Some(key) => Some(Self::deployment_id(&mut tx, key).await?),
            None => None,
        };
        // A reaped runner restarting on the same endpoint comes back under a new key.
        sqlx::query("DELETE FROM runners WHERE endpoint = $1 AND key <> $2 AND state = 'dead'")
            .bind(&runner.endpoint)
            .bind(runner.key.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO runners (key, endpoint, state, deployment_id, labels, last_seen)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (key) DO UPDATE
            SET endpoint = EXCLUDED.endpoint,
                state = EXCLUDED.state,
                deployment_id = EXCLUDED.deployment_id,
                labels = EXCLUDED.labels,
                last_seen = NOW(),
                reservation_timeout = CASE
                    WHEN EXCLUDED.state = 'reserved' THEN runners.reservation_timeout
                    ELSE NULL
                END
            "#,
        )
        .bind(runner.key.to_string())
        .bind(&runner.endpoint)
        .bind(runner.state.as_str())
        .bind(deployment_id)
        .bind(Json(&runner.labels))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn deregister_runner(&self, key: &RunnerKey) -> Result<()> {
        let result = sqlx::query("DELETE FROM runners WHERE key = $1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("runner {key}")));
        }
        Ok(())
    }

    async fn get_runner(&self, key: &RunnerKey) -> Result<Runner> {
        let row: Option<RunnerRow> = sqlx::query_as(&format!("{RUNNER_SELECT} WHERE r.key = $1"))
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("runner {key}")))?
            .try_into()
    }

    async fn list_runners(&self, all: bool) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE ($1 OR r.state <> 'dead') ORDER BY r.key"
        ))
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn runners_for_deployment(&self, deployment: &DeploymentKey) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE d.key = $1 AND r.state IN ('reserved', 'assigned') ORDER BY r.key"
        ))
        .bind(deployment.to_string())
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn idle_runners(&self, labels: &Labels, limit: i64) -> Result<Vec<Runner>> {
        let rows: Vec<RunnerRow> = sqlx::query_as(&format!(
            "{RUNNER_SELECT} WHERE r.state = 'idle' AND r.labels @> $1 ORDER BY random() LIMIT $2"
        ))
        .bind(Json(labels))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn kill_stale_runners(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET state = 'dead', deployment_id = NULL, reservation_timeout = NULL
            WHERE state <> 'dead' AND last_seen < $1
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

        let claimed: Option<ClaimedRow> = sqlx::query_as(
            r#"
            SELECT id, key, endpoint, labels
            FROM runners
            WHERE state = 'idle' AND labels @> $1
            ORDER BY random()
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(Json(labels))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(claimed) = claimed else {
            return Err(Error::NotFound(format!(
                "no idle runners for deployment {deployment}"
            )));
        };

        sqlx::query(
            r#"
            UPDATE runners
            SET state = 'reserved', deployment_id = $1, reservation_timeout = $2
            WHERE id = $3
            "#,
        )
        .bind(deployment_id)
        .bind(expires_at)
        .bind(claimed.id)
        .execute(&mut *tx)
        .await?;

        let runner = Runner {
            key: claimed
                .key
                .parse()
                .map_err(|e| Error::Internal(format!("column runners.key: {e}")))?,
            endpoint: claimed.endpoint,
            state: RunnerState::Reserved,
            deployment: Some(deployment.clone()),
            labels: claimed.labels.0,
        };
        Ok((runner, Box::new(PgClaim { tx })))
    }

    async fn assign_runner(&self, runner: &RunnerKey, deployment: &DeploymentKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET state = 'assigned', reservation_timeout = NULL
            WHERE key = $1
              AND state IN ('reserved', 'assigned')
              AND deployment_id = (SELECT id FROM deployments WHERE key = $2)
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
            WHERE state = 'reserved' AND reservation_timeout < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn missing_artefacts(&self, digests: &[Sha256]) -> Result<Vec<Sha256>> {
        let wanted: Vec<Vec<u8>> = digests.iter().map(|d| d.as_bytes().to_vec()).collect();
        let present: Vec<Vec<u8>> =
            sqlx::query_scalar("SELECT digest FROM artefacts WHERE digest = ANY($1)")
                .bind(&wanted)
                .fetch_all(&self.pool)
                .await?;
        Ok(missing_from(digests, &present))
    }

    async fn create_artefact(&self, content: &[u8]) -> Result<Sha256> {
        let digest = Sha256::of(content);
        sqlx::query(
            "INSERT INTO artefacts (digest, content) VALUES ($1, $2) ON CONFLICT (digest) DO NOTHING",
        )
        .bind(digest.as_bytes().as_slice())
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(digest)
    }

    async fn artefact_chunk(&self, digest: &Sha256, offset: i64, length: i64) -> Result<Vec<u8>> {
        let chunk: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT substring(content FROM $2::INT FOR $3::INT) FROM artefacts WHERE digest = $1",
        )
        .bind(digest.as_bytes().as_slice())
        .bind(offset + 1)
        .bind(length)
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
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<ExistingDeploymentRow> = sqlx::query_as(
            r#"
            SELECT d.id, d.key, d.schema
            FROM deployments d
            JOIN modules m ON m.id = d.module_id
            WHERE m.name = $1
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
                WHERE m.name = $1
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

        let wanted: Vec<Vec<u8>> = wanted.into_iter().collect();
        let found: Vec<(i64, Vec<u8>)> =
            sqlx::query_as("SELECT id, digest FROM artefacts WHERE digest = ANY($1)")
                .bind(&wanted)
                .fetch_all(&mut *tx)
                .await?;
        let present: Vec<Vec<u8>> = found.iter().map(|(_, d)| d.clone()).collect();
        let requested: Vec<Sha256> = artefacts.iter().map(|a| a.digest).collect();
        let missing = missing_from(&requested, &present);
        if !missing.is_empty() {
            return Err(missing_artefacts_error(&missing));
        }

        let module_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO modules (language, name) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET language = EXCLUDED.language
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
            INSERT INTO deployments (module_id, key, schema, labels)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
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
                VALUES ($1, $2, $3, $4)
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
                VALUES ($1, $2, $3, $4, $5)
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
            sqlx::query_as(&format!("{DEPLOYMENT_SELECT} WHERE d.key = $1"))
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
            WHERE d.key = $1
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
            "{DEPLOYMENT_SELECT} WHERE ($1 OR d.min_replicas > 0) ORDER BY d.id"
        ))
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn set_deployment_replicas(&self, key: &DeploymentKey, min_replicas: i32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(i64, i32)> =
            sqlx::query_as("SELECT id, min_replicas FROM deployments WHERE key = $1 FOR UPDATE")
                .bind(key.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let (deployment_id, prev) =
            current.ok_or_else(|| Error::NotFound(format!("deployment {key}")))?;

        sqlx::query("UPDATE deployments SET min_replicas = $1 WHERE id = $2")
            .bind(min_replicas)
            .bind(deployment_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO events (deployment_id, type, payload) VALUES ($1, 'deployment_updated', $2)",
        )
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
            WHERE d.key = $1
            "#,
        )
        .bind(new.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let (new_id, module_id, module, language) =
            target.ok_or_else(|| Error::NotFound(format!("deployment {new}")))?;

        // Serializes concurrent replaces of the same module.
        sqlx::query("SELECT id FROM modules WHERE id = $1 FOR UPDATE")
            .bind(module_id)
            .execute(&mut *tx)
            .await?;

        let active: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, key FROM deployments
            WHERE module_id = $1 AND min_replicas > 0
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(module_id)
        .fetch_optional(&mut *tx)
        .await?;

        let replaced = match active {
            Some((old_id, _)) if old_id == new_id => {
                return Err(Error::Conflict(format!("deployment already exists: {new}")));
            }
            Some((old_id, old_key)) => {
                sqlx::query("UPDATE deployments SET min_replicas = $1 WHERE id = $2")
                    .bind(min_replicas)
                    .bind(new_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("UPDATE deployments SET min_replicas = 0 WHERE id = $1")
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                Some(
                    old_key
                        .parse::<DeploymentKey>()
                        .map_err(|e| Error::Internal(format!("column deployments.key: {e}")))?,
                )
            }
            None => {
                sqlx::query("UPDATE deployments SET min_replicas = $1 WHERE id = $2")
                    .bind(min_replicas)
                    .bind(new_id)
                    .execute(&mut *tx)
                    .await?;
                None
            }
        };

        sqlx::query(
            "INSERT INTO events (deployment_id, type, payload) VALUES ($1, 'deployment_created', $2)",
        )
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
                   d.min_replicas::BIGINT AS required_replicas
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
              AND ($1::TEXT IS NULL OR m.name = $1)
            ORDER BY m.name, r.key
            "#,
        )
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
            WHERE ir.method = $1 AND r.state = 'assigned' AND d.min_replicas > 0
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
            WHERE ($1 OR d.min_replicas > 0)
            ORDER BY ir.id
            "#,
        )
        .bind(all)
        .fetch_all(&self.pool)
        .await?;
        convert(rows)
    }

    async fn create_request(&self, name: &RequestName, source_addr: &str) -> Result<()> {
        sqlx::query("INSERT INTO requests (origin, key, source_addr) VALUES ($1, $2, $3)")
            .bind(name.origin().as_str())
            .bind(name.to_string())
            .bind(source_addr)
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
                    INSERT INTO requests (origin, key, source_addr) VALUES ($1, $2, '')
                    ON CONFLICT (key) DO UPDATE SET key = EXCLUDED.key
                    RETURNING id
                    "#,
                )
                .bind(name.origin().as_str())
                .bind(name.to_string())
                .fetch_one(&mut *tx)
                .await?,
            ),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO events (time_stamp, deployment_id, request_id, type, payload)
            VALUES ($1, $2, $3, 'call', $4)
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
                $1,
                (SELECT id FROM deployments WHERE key = $2),
                (SELECT id FROM requests WHERE key = $3),
                'log',
                $4
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
            WHERE r.key = $1 AND e.type = 'call'
            ORDER BY e.id
            "#,
        )
        .bind(request.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(CallEvent::from).collect())
    }

    fn has_change_feed(&self) -> bool {
        true
    }

    async fn change_stream(&self) -> Result<Option<ChangeStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        debug!(channel = CHANGE_CHANNEL, "Listening for deployment changes");
        let stream = listener
            .into_stream()
            .map(|notification| ChangeNotice::try_from(notification?.payload()));
        Ok(Some(stream.boxed()))
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_payload_parses() {
        let key = DeploymentKey::new("echo");
        let notice =
            ChangeNotice::try_from(format!(r#"{{"action":"UPDATE","key":"{key}"}}"#).as_str())
                .unwrap();
        assert_eq!(notice, ChangeNotice { key: key.clone(), deleted: false });

        let notice =
            ChangeNotice::try_from(format!(r#"{{"action":"DELETE","key":"{key}"}}"#).as_str())
                .unwrap();
        assert!(notice.deleted);
    }

    #[test]
    fn test_malformed_trigger_payload_is_internal() {
        assert!(matches!(
            ChangeNotice::try_from(r#"{"action":"INSERT","key":"nope"}"#),
            Err(Error::Internal(_))
        ));
    }
}
