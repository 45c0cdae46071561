// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat key to scalar-or-list map used for runner placement.
///
/// Matching follows JSON containment: `{"languages": ["go"]}` is satisfied by
/// a runner labelled `{"languages": ["go", "kotlin"], "arch": "arm64"}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Map<String, Value>);

impl Labels {
    /// Empty label set.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Labels requiring a runner that supports `language`.
    pub fn for_language(language: &str) -> Self {
        Self::new().with("languages", Value::Array(vec![Value::from(language)]))
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a single label.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// True if these labels satisfy every requirement in `required`.
    pub fn matches(&self, required: &Labels) -> bool {
        required
            .0
            .iter()
            .all(|(key, want)| self.0.get(key).is_some_and(|have| contains(have, want)))
    }

    /// Iterate over the labels.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Labels {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn contains(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(have), Value::Object(want)) => want
            .iter()
            .all(|(k, w)| have.get(k).is_some_and(|h| contains(h, w))),
        (Value::Array(have), Value::Array(want)) => {
            want.iter().all(|w| have.iter().any(|h| contains(h, w)))
        }
        (Value::Array(have), scalar) => have.iter().any(|h| h == scalar),
        (have, want) => have == want,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(value: Value) -> Labels {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_list_is_subset() {
        let runner = labels(json!({"languages": ["go", "kotlin"], "os": "linux", "pid": 1234}));
        assert!(runner.matches(&labels(json!({"languages": ["kotlin"]}))));
        assert!(runner.matches(&labels(json!({"languages": ["go", "kotlin"]}))));
        assert!(!runner.matches(&labels(json!({"languages": ["rust"]}))));
        assert!(!runner.matches(&labels(json!({"languages": ["go", "rust"]}))));
    }

    #[test]
    fn test_scalar_equality() {
        let runner = labels(json!({"arch": "amd64", "gpu": false}));
        assert!(runner.matches(&labels(json!({"arch": "amd64"}))));
        assert!(!runner.matches(&labels(json!({"arch": "arm64"}))));
        assert!(runner.matches(&labels(json!({"gpu": false}))));
        assert!(!runner.matches(&labels(json!({"os": "linux"}))));
    }

    #[test]
    fn test_scalar_in_list() {
        let runner = labels(json!({"languages": ["go"]}));
        assert!(runner.matches(&labels(json!({"languages": "go"}))));
    }

    #[test]
    fn test_empty_requirement_matches_anything() {
        assert!(Labels::new().matches(&Labels::new()));
        assert!(Labels::for_language("go").matches(&Labels::new()));
    }

    #[test]
    fn test_for_language() {
        let runner = labels(json!({"languages": ["go", "python"]}));
        assert!(runner.matches(&Labels::for_language("python")));
        assert!(!runner.matches(&Labels::for_language("kotlin")));
    }
}
