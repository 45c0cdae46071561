// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module schema as seen by the control plane.
//!
//! The control plane treats a schema as mostly opaque: it stores it, hashes
//! it, hands it to watchers and reads two kinds of metadata from it (HTTP
//! ingress declarations and outbound `calls`). Field types are kept as their
//! textual form.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ModelError, Sha256};

/// Identifiers that cannot be used as verb or data names.
const RESERVED_IDENTIFIERS: &[&str] = &["Int", "Float", "String", "Bool", "Time"];

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// A reference to a verb in some module, written `module.verb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerbRef {
    /// Module the verb lives in.
    pub module: String,
    /// Verb name.
    pub name: String,
}

impl VerbRef {
    /// Build a reference from its parts.
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VerbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for VerbRef {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Self::new(module, name))
            }
            _ => Err(ModelError::InvalidVerbRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for VerbRef {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VerbRef> for String {
    fn from(r: VerbRef) -> Self {
        r.to_string()
    }
}

/// Metadata attached to a declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metadata {
    /// The verb is reachable over HTTP at `method path`.
    Ingress {
        /// HTTP method, upper case.
        method: String,
        /// Path pattern; `{name}` segments match any value.
        path: String,
    },
    /// The verb calls these other verbs.
    Calls {
        /// Callees.
        calls: Vec<VerbRef>,
    },
}

/// A field of a data declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type, e.g. `String`, `[Int]`, `echo.EchoRequest`.
    #[serde(rename = "type")]
    pub ty: String,
}

/// A callable entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verb {
    /// Verb name, unique within the module.
    pub name: String,
    /// Free-form documentation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// Request data type.
    pub request: String,
    /// Response data type.
    pub response: String,
    /// Attached metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

/// A data structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// Data name, unique within the module.
    pub name: String,
    /// Free-form documentation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// Fields in declaration order.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Attached metadata.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
}

/// A top-level declaration in a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decl {
    /// A verb.
    Verb(Verb),
    /// A data structure.
    Data(Data),
}

impl Decl {
    /// Name of the declaration.
    pub fn name(&self) -> &str {
        match self {
            Decl::Verb(v) => &v.name,
            Decl::Data(d) => &d.name,
        }
    }
}

/// Runtime information the control plane attaches when publishing a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRuntime {
    /// Implementation language of the deployment.
    pub language: String,
    /// When the deployment was created.
    pub create_time: DateTime<Utc>,
    /// Desired replica count.
    pub min_replicas: i32,
}

/// A module schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Free-form documentation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// Declarations in source order.
    #[serde(default)]
    pub decls: Vec<Decl>,
    /// Present only on schemas published by the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ModuleRuntime>,
}

/// An HTTP entry point declared by a verb's ingress metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoutingEntry {
    /// Verb name within the module.
    pub verb: String,
    /// HTTP method.
    pub method: String,
    /// Path pattern.
    pub path: String,
}

impl Module {
    /// An empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comments: Vec::new(),
            decls: Vec::new(),
            runtime: None,
        }
    }

    /// Iterate over verb declarations.
    pub fn verbs(&self) -> impl Iterator<Item = &Verb> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Verb(v) => Some(v),
            Decl::Data(_) => None,
        })
    }

    /// Find a verb by name.
    pub fn verb(&self, name: &str) -> Option<&Verb> {
        self.verbs().find(|v| v.name == name)
    }

    /// Every `(verb, method, path)` declared through ingress metadata.
    pub fn ingress_routes(&self) -> Vec<IngressRoutingEntry> {
        self.verbs()
            .flat_map(|verb| {
                verb.metadata.iter().filter_map(move |md| match md {
                    Metadata::Ingress { method, path } => Some(IngressRoutingEntry {
                        verb: verb.name.clone(),
                        method: method.clone(),
                        path: path.clone(),
                    }),
                    Metadata::Calls { .. } => None,
                })
            })
            .collect()
    }

    /// Copy of this module with `runtime` attached.
    pub fn with_runtime(&self, runtime: ModuleRuntime) -> Self {
        Self {
            runtime: Some(runtime),
            ..self.clone()
        }
    }

    /// Digest of the serialized module, runtime included.
    pub fn content_hash(&self) -> Result<Sha256, ModelError> {
        Ok(Sha256::of(&serde_json::to_vec(self)?))
    }

    /// Semantic checks possible on a single module.
    ///
    /// All problems are collected and reported together.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("module name is required".to_string());
        } else if !is_identifier(&self.name) {
            errors.push(format!("module name {:?} is not a valid identifier", self.name));
        }

        let mut verbs = HashSet::new();
        let mut data = HashSet::new();
        for decl in &self.decls {
            let name = decl.name();
            let (kind, seen) = match decl {
                Decl::Verb(_) => ("verb", &mut verbs),
                Decl::Data(_) => ("data structure", &mut data),
            };
            if name.is_empty() {
                errors.push(format!("{kind} name is required"));
                continue;
            }
            if RESERVED_IDENTIFIERS.contains(&name) {
                errors.push(format!("{kind} name {name:?} is a reserved word"));
            }
            if !seen.insert(name.to_string()) {
                errors.push(format!("duplicate {kind} {name:?}"));
            }
            match decl {
                Decl::Verb(verb) => {
                    for md in &verb.metadata {
                        if let Metadata::Ingress { method, path } = md {
                            if !HTTP_METHODS.contains(&method.as_str()) {
                                errors.push(format!(
                                    "verb {name:?}: unsupported ingress method {method:?}"
                                ));
                            }
                            if !path.starts_with('/') {
                                errors.push(format!(
                                    "verb {name:?}: ingress path {path:?} must start with '/'"
                                ));
                            }
                        }
                    }
                }
                Decl::Data(d) => {
                    if d.metadata.iter().any(|md| matches!(md, Metadata::Calls { .. })) {
                        errors.push(format!(
                            "data structure {name:?}: calls metadata is not valid on data structures"
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Schema(errors))
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
