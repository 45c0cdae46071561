// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plain HTTP ingress.
//!
//! Verbs declare `ingress` metadata such as `GET /echo/{name}`. An inbound
//! request is matched against the routes declared for its method, segment by
//! segment, and turned into a JSON request body:
//!
//! - `{name}` segments bind the matching path segment;
//! - for `POST` and `PUT` a JSON object body is merged in;
//! - for other methods query parameters are merged in, last value winning.
//!
//! Path bindings take precedence over body and query fields of the same name.

use helmsman_model::schema::VerbRef;
use helmsman_model::{Origin, RequestName};
use serde_json::{Map, Value};

use crate::dal::Dal;
use crate::dispatcher::{CallOutcome, Dispatcher};
use crate::error::{Error, Result};
use crate::runner::{CallContext, CallRequest};
use crate::types::IngressRoute;

/// Match `path` against `pattern`, returning the `{name}` bindings.
pub fn match_path(pattern: &str, path: &str) -> Option<Map<String, Value>> {
    let mut pattern_segments = pattern.trim_matches('/').split('/');
    let mut path_segments = path.trim_matches('/').split('/');
    let mut bindings = Map::new();
    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return Some(bindings),
            (Some(want), Some(have)) => {
                if let Some(name) = want.strip_prefix('{').and_then(|w| w.strip_suffix('}')) {
                    if have.is_empty() {
                        return None;
                    }
                    bindings.insert(name.to_string(), Value::String(have.to_string()));
                } else if want != have {
                    return None;
                }
            }
            _ => return None,
        }
    }
}

/// Build the verb request body for an inbound HTTP request.
pub fn request_body(
    method: &str,
    bindings: Map<String, Value>,
    query: &[(String, String)],
    body: &[u8],
) -> Result<Value> {
    let mut fields = Map::new();
    if matches!(method, "POST" | "PUT") {
        if !body.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(object)) => fields = object,
                Ok(_) => {
                    return Err(Error::InvalidArgument(
                        "request body must be a JSON object".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(Error::InvalidArgument(format!("invalid JSON body: {e}")));
                }
            }
        }
    } else {
        for (key, value) in query {
            fields.insert(key.clone(), Value::String(value.clone()));
        }
    }
    fields.extend(bindings);
    Ok(Value::Object(fields))
}

/// Resolves and forwards ingress requests.
#[derive(Clone)]
pub struct Ingress {
    dal: Dal,
    dispatcher: Dispatcher,
}

impl Ingress {
    /// Create an ingress over `dispatcher`.
    pub fn new(dal: Dal, dispatcher: Dispatcher) -> Self {
        Self { dal, dispatcher }
    }

    /// Find the route serving `method path`.
    pub async fn resolve(
        &self,
        method: &str,
        path: &str,
    ) -> Result<(IngressRoute, Map<String, Value>)> {
        self.dal
            .ingress_routes(method)
            .await?
            .into_iter()
            .find_map(|route| match_path(&route.path, path).map(|bindings| (route, bindings)))
            .ok_or_else(|| Error::NotFound(format!("no ingress route for {method} {path}")))
    }

    /// Serve one HTTP request.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: &[u8],
        source_addr: &str,
    ) -> Result<CallOutcome> {
        let (route, bindings) = self.resolve(method, path).await?;
        let request = CallRequest {
            verb: VerbRef::new(route.module, route.verb),
            body: request_body(method, bindings, query, body)?,
        };
        let request_name: RequestName = self
            .dal
            .create_request(Origin::Ingress, &format!("{method} {path}"), source_addr)
            .await?;
        let context = CallContext {
            request_name: Some(request_name),
            callers: Vec::new(),
        };
        self.dispatcher.call(request, context, source_addr).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_match_path() {
        let bindings = match_path("/echo/{name}", "/echo/bob").unwrap();
        assert_eq!(Value::Object(bindings), json!({"name": "bob"}));

        assert!(match_path("/echo/{name}", "/echo").is_none());
        assert!(match_path("/echo/{name}", "/echo/bob/extra").is_none());
        assert!(match_path("/echo/{name}", "/time/bob").is_none());
        assert!(match_path("/echo", "/echo/").is_some());

        let bindings = match_path("/users/{id}/posts/{post}", "/users/7/posts/42").unwrap();
        assert_eq!(Value::Object(bindings), json!({"id": "7", "post": "42"}));
    }

    #[test]
    fn test_get_merges_query_last_wins() {
        let bindings = match_path("/echo/{name}", "/echo/bob").unwrap();
        let query = vec![
            ("greeting".to_string(), "hi".to_string()),
            ("greeting".to_string(), "hello".to_string()),
            ("name".to_string(), "alice".to_string()),
        ];
        let body = request_body("GET", bindings, &query, b"").unwrap();
        assert_eq!(body, json!({"greeting": "hello", "name": "bob"}));
    }

    #[test]
    fn test_post_merges_json_body() {
        let bindings = match_path("/echo/{name}", "/echo/bob").unwrap();
        let query = vec![("ignored".to_string(), "x".to_string())];
        let body = request_body("POST", bindings, &query, br#"{"count": 2}"#).unwrap();
        assert_eq!(body, json!({"count": 2, "name": "bob"}));

        let empty = request_body("PUT", Map::new(), &[], b"  ").unwrap();
        assert_eq!(empty, json!({}));
    }

    #[test]
    fn test_post_rejects_non_object_body() {
        assert!(matches!(
            request_body("POST", Map::new(), &[], b"[1, 2]"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            request_body("POST", Map::new(), &[], b"{"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
