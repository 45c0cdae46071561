// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helmsman Model - shared value types
//!
//! Types in this crate carry no I/O. They are shared between the control plane
//! (`helmsman-controller`) and anything that talks to it.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ControllerKey`], [`RunnerKey`] | Sortable identities (`C<ulid>`, `R<ulid>`) |
//! | [`DeploymentKey`] | `<module>-<10 hex chars>`, minted once per deployment |
//! | [`RequestName`] | Origin-tagged correlation id threaded through a call chain |
//! | [`Labels`] | Placement labels with one-level containment matching |
//! | [`Sha256`] | Content digest for artefacts and schema hashes |
//! | [`schema::Module`] | Module schema consumed by the control plane |
//! | [`verb::VerbRegistry`] | Immutable registry of callable verbs |

#![deny(missing_docs)]

/// Error type shared by all parsers and validators in this crate.
pub mod error;

/// Controller, runner and deployment keys.
pub mod keys;

/// Placement labels.
pub mod labels;

/// Request correlation names.
pub mod request_name;

/// Module schema model and validation.
pub mod schema;

/// SHA-256 content digests.
pub mod sha256;

/// Callable verb contract and registry.
pub mod verb;

pub use error::ModelError;
pub use keys::{ControllerKey, DeploymentKey, RunnerKey};
pub use labels::Labels;
pub use request_name::{Origin, RequestName};
pub use sha256::Sha256;
