// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helmsman Controller - control plane for a fleet of runners
//!
//! The controller owns the desired state of every deployment and converges a
//! pool of generic runners towards it. It also routes verb calls between
//! modules and from plain HTTP, and streams schema changes to watchers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Clients (deploy tooling, schema watchers)             │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ HTTP + JSON / NDJSON
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    helmsman-controller (This Crate)                   │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌─────────────────┐    │
//! │  │ Reconciler │ │  Reapers   │ │ Dispatcher │ │ Schema notifier │    │
//! │  └────────────┘ └────────────┘ └────────────┘ └─────────────────┘    │
//! │                 ┌──────────────────────────────┐                      │
//! │                 │  Dal (state repository)      │                      │
//! │                 └──────────────────────────────┘                      │
//! └──────────────────────────────────────────────────────────────────────┘
//!         │ reserve / deploy / terminate / call          │
//!         ▼                                              ▼
//! ┌──────────────────────┐                 ┌──────────────────────────────┐
//! │  Runners (any lang)  │── heartbeats ──►│  PostgreSQL or SQLite        │
//! └──────────────────────┘                 └──────────────────────────────┘
//! ```
//!
//! # Runner lifecycle
//!
//! ```text
//!   register ──► IDLE ──reserve──► RESERVED ──deploy──► ASSIGNED
//!                 ▲                   │                    │
//!                 │      expiry       │      terminate     │
//!                 └───────────────────┴────────────────────┘
//!
//!   any state ──missed heartbeats──► DEAD
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HELMSMAN_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` URL |
//! | `HELMSMAN_BIND_ADDR` | No | `127.0.0.1:8892` | HTTP API address |
//! | `HELMSMAN_ADVERTISE_URL` | No | `http://<bind>` | Endpoint in the controller heartbeat |
//! | `HELMSMAN_RUNNER_TIMEOUT_SECS` | No | `10` | Heartbeat timeout |
//! | `HELMSMAN_RESERVATION_TIMEOUT_SECS` | No | `120` | Reservation expiry |
//! | `HELMSMAN_RECONCILE_INTERVAL_MS` | No | `1000` | Reconciler tick |
//! | `HELMSMAN_ARTEFACT_CHUNK_SIZE` | No | `1048576` | Artefact download chunk size |
//! | `HELMSMAN_DB_MAX_CONNECTIONS` | No | `10` | Database pool size |
//! | `HELMSMAN_LOG_FORMAT` | No | `text` | `json` for structured logs |
//!
//! # Modules
//!
//! - [`dal`]: Typed state repository and deployment change topic
//! - [`persistence`]: PostgreSQL and SQLite backends
//! - [`reconciler`]: Replica convergence
//! - [`reaper`]: Dead runner, dead controller and reservation expiry
//! - [`dispatcher`]: Verb call routing
//! - [`ingress`]: Plain HTTP entry points
//! - [`schema_notifier`]: Per-module schema change events
//! - [`server`]: HTTP API
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Database migrations for both backends.
pub mod migrations;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error taxonomy and its HTTP rendering.
pub mod error;

/// Domain values returned by the state repository.
pub mod types;

/// Storage backends.
pub mod persistence;

/// In-process broadcast topics.
pub mod pubsub;

/// Scoped runner reservations.
pub mod reservation;

/// Typed state repository.
pub mod dal;

/// Relay of the store's deployment change feed.
pub mod change_feed;

/// Controller heartbeat worker.
pub mod heartbeat;

/// Stale state reapers.
pub mod reaper;

/// Replica reconciliation worker.
pub mod reconciler;

/// Schema change notifications.
pub mod schema_notifier;

/// Runner protocol clients.
pub mod runner;

/// Verb call routing.
pub mod dispatcher;

/// Plain HTTP ingress.
pub mod ingress;

/// HTTP request handlers.
pub mod handlers;

/// HTTP server.
pub mod server;

/// Embeddable runtime for helmsman-controller.
pub mod runtime;

pub use config::Config;
pub use dal::Dal;
pub use error::Error;
pub use runtime::ControllerRuntime;
