// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! helmsman_controller::migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL schema, including the deployment change trigger.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgres");

/// SQLite schema for embedded and single-controller use.
pub static SQLITE: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Apply pending PostgreSQL migrations.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Apply pending SQLite migrations.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
