// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helmsman Controller - control plane server
//!
//! Runs the HTTP API together with the reconciler, reapers, controller
//! heartbeat and change feed relay against PostgreSQL or SQLite.

use std::sync::Arc;
use tracing::{info, warn};

use helmsman_controller::config::{Backend, Config};
use helmsman_controller::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use helmsman_controller::runner::HttpClientFactory;
use helmsman_controller::runtime::ControllerRuntime;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "helmsman_controller=info".into());
    let json = std::env::var("HELMSMAN_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    init_tracing();

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        advertise_url = %config.advertise_url,
        backend = ?config.backend,
        "Starting Helmsman Controller"
    );

    // Connect to database and apply migrations
    let persistence: Arc<dyn Persistence> = match config.backend {
        Backend::Postgres => Arc::new(
            PostgresPersistence::connect(&config.database_url, config.db_max_connections).await?,
        ),
        Backend::Sqlite => Arc::new(
            SqlitePersistence::connect(&config.database_url, config.db_max_connections).await?,
        ),
    };

    info!("Connected to database");

    let client_factory = Arc::new(HttpClientFactory::new(config.runner_timeout)?);

    // Start the runtime
    let runtime = ControllerRuntime::builder()
        .persistence(persistence)
        .client_factory(client_factory)
        .bind_addr(config.bind_addr)
        .advertise_url(&config.advertise_url)
        .heartbeat(config.heartbeat())
        .reaper(config.reaper())
        .reconciler(config.reconciler())
        .artefact_chunk_size(config.artefact_chunk_size)
        .runner_timeout(config.runner_timeout)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Controller ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    runtime.shutdown().await?;

    info!("Helmsman Controller stopped");
    Ok(())
}
