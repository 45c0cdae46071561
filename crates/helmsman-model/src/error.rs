// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

/// Errors produced while parsing or validating model values.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ModelError {
    /// A controller, runner or deployment key is malformed.
    #[error("invalid {kind} key {value:?}: {reason}")]
    InvalidKey {
        /// Which kind of key was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A request name does not follow `<origin>-<key>-<hash>`.
    #[error("invalid request name {name:?}: {reason}")]
    InvalidRequestName {
        /// The rejected input.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An origin other than ingress, cron or pubsub.
    #[error("unknown origin {0:?}")]
    UnknownOrigin(String),

    /// A digest that is not 64 hex characters.
    #[error("invalid sha256 digest {0:?}")]
    InvalidDigest(String),

    /// A verb reference that is not `module.verb`.
    #[error("invalid verb reference {0:?}")]
    InvalidVerbRef(String),

    /// One or more schema validation failures.
    #[error("{}", .0.join("; "))]
    Schema(Vec<String>),

    /// The same verb was registered twice.
    #[error("verb {0} is already registered")]
    DuplicateVerb(String),

    /// Schema serialization failed.
    #[error("schema encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
