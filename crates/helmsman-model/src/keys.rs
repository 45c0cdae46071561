// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::ModelError;

macro_rules! ulid_key {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Ulid);

        impl $name {
            /// Mint a new key. Keys minted later sort after earlier ones.
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let invalid = |reason: &str| ModelError::InvalidKey {
                    kind: $kind,
                    value: s.to_string(),
                    reason: reason.to_string(),
                };
                let body = s
                    .strip_prefix($prefix)
                    .ok_or_else(|| invalid(concat!("must start with '", $prefix, "'")))?;
                Ulid::from_string(body)
                    .map(Self)
                    .map_err(|e| invalid(&e.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ModelError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> Self {
                key.to_string()
            }
        }
    };
}

ulid_key!(
    /// Identity of a control-plane instance.
    ControllerKey,
    "C",
    "controller"
);

ulid_key!(
    /// Identity of a runner process.
    RunnerKey,
    "R",
    "runner"
);

/// Globally unique deployment identity, `<module>-<10 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentKey {
    module: String,
    suffix: String,
}

impl DeploymentKey {
    /// Mint a fresh key for a deployment of `module`.
    pub fn new(module: &str) -> Self {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            module: module.to_string(),
            suffix: hex::encode(bytes),
        }
    }

    /// Module this deployment belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.module, self.suffix)
    }
}

impl FromStr for DeploymentKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ModelError::InvalidKey {
            kind: "deployment",
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let (module, suffix) = s
            .rsplit_once('-')
            .ok_or_else(|| invalid("expected <module>-<hash>"))?;
        if module.is_empty() {
            return Err(invalid("module name is empty"));
        }
        if suffix.len() != 10 || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("hash must be 10 hex characters"));
        }
        Ok(Self {
            module: module.to_string(),
            suffix: suffix.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for DeploymentKey {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeploymentKey> for String {
    fn from(key: DeploymentKey) -> Self {
        key.to_string()
    }
}
