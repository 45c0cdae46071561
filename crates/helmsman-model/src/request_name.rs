// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request names correlate every hop of a call chain back to the inbound
//! request that started it.
//!
//! The format is `{origin}-{key}-{hash}` where `key` is the caller-supplied
//! key with every run of non-alphanumeric characters replaced by `-` and
//! lowercased, and `hash` is 10 hex characters (5 random bytes).

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ModelError;

static NORMALISER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-zA-Z0-9]+").expect("static pattern compiles"));

/// What triggered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// An HTTP ingress request or an external `Call`.
    Ingress,
    /// A scheduled job.
    Cron,
    /// A pubsub delivery.
    Pubsub,
}

impl Origin {
    /// Lowercase name used in request names and in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Ingress => "ingress",
            Origin::Cron => "cron",
            Origin::Pubsub => "pubsub",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingress" => Ok(Origin::Ingress),
            "cron" => Ok(Origin::Cron),
            "pubsub" => Ok(Origin::Pubsub),
            other => Err(ModelError::UnknownOrigin(other.to_string())),
        }
    }
}

/// A globally unique, origin-tagged correlation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestName {
    origin: Origin,
    key: String,
    hash: [u8; 5],
}

impl RequestName {
    /// Mint a new request name for `key`.
    pub fn new(origin: Origin, key: &str) -> Self {
        let mut hash = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut hash);
        Self {
            origin,
            key: NORMALISER.replace_all(key, "-").to_lowercase(),
            hash,
        }
    }

    /// Parse a request name, returning its origin alongside it.
    ///
    /// Equivalent to `name.parse()` followed by [`RequestName::origin`].
    pub fn parse(name: &str) -> Result<(Origin, Self), ModelError> {
        let parsed: Self = name.parse()?;
        Ok((parsed.origin, parsed))
    }

    /// What triggered the request.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// The normalized key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.origin, self.key, hex::encode(self.hash))
    }
}

impl FromStr for RequestName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ModelError::InvalidRequestName {
            name: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() < 3 {
            return Err(invalid("should be <origin>-<key>-<hash>".to_string()));
        }
        let origin: Origin = parts[0].parse().map_err(|e: ModelError| invalid(e.to_string()))?;
        let last = parts[parts.len() - 1];
        let decoded = hex::decode(last).map_err(|e| invalid(e.to_string()))?;
        let hash: [u8; 5] = decoded
            .try_into()
            .map_err(|_| invalid("hash should be 5 bytes".to_string()))?;
        Ok(Self {
            origin,
            key: parts[1..parts.len() - 1].join("-"),
            hash,
        })
    }
}

impl TryFrom<String> for RequestName {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestName> for String {
    fn from(name: RequestName) -> Self {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_normalizes_key() {
        let cases = [
            (Origin::Ingress, "GET /users/{id}", "get-users-id-"),
            (Origin::Cron, "Nightly Report", "nightly-report"),
            (Origin::Pubsub, "orders.created", "orders-created"),
            (Origin::Ingress, "", ""),
            (Origin::Cron, "--a--b--", "-a-b-"),
        ];
        for (origin, key, normalized) in cases {
            let name = RequestName::new(origin, key);
            let (parsed_origin, parsed) = RequestName::parse(&name.to_string()).unwrap();
            assert_eq!(parsed_origin, origin);
            assert_eq!(parsed.key(), normalized, "key {key:?}");
            assert_eq!(parsed, name);
        }
    }

    #[test]
    fn test_format() {
        let name = RequestName::new(Origin::Ingress, "POST /echo");
        let text = name.to_string();
        assert!(text.starts_with("ingress-post-echo-"));
        assert_eq!(text.len(), "ingress-post-echo-".len() + 10);
    }

    #[test]
    fn test_rejects_malformed_names() {
        assert!("ingress-abc".parse::<RequestName>().is_err());
        assert!("http-key-0011223344".parse::<RequestName>().is_err());
        assert!("cron-key-zz11223344".parse::<RequestName>().is_err());
        assert!("cron-key-00112233".parse::<RequestName>().is_err());
        assert!("cron-key-0011223344".parse::<RequestName>().is_ok());
    }

    #[test]
    fn test_serde_as_string() {
        let name = RequestName::new(Origin::Pubsub, "topic");
        let json = serde_json::to_value(&name).unwrap();
        assert_eq!(json, serde_json::Value::String(name.to_string()));
        let back: RequestName = serde_json::from_value(json).unwrap();
        assert_eq!(back, name);
    }
}
