// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for the control plane.
//!
//! Every failure surfaced by the state repository, the background loops and
//! the RPC handlers is one of five kinds. Store errors are translated once,
//! in [`From<sqlx::Error>`], so nothing above the persistence layer ever looks
//! at database error codes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use helmsman_model::ModelError;
use serde::{Deserialize, Serialize};
use sqlx::error::ErrorKind;
use thiserror::Error;

/// Control plane errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unknown key, no matching route or no idle runner.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint violation or a racing replace.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed key or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A remote runner could not be reached in time.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Anything else, including store I/O failures.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type using the control plane [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status used on the RPC surface and on ingress.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::Conflict(m)
            | Self::InvalidArgument(m)
            | Self::Unavailable(m)
            | Self::Internal(m) => m,
        }
    }

    /// Rebuild an error from its wire form.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "not_found" => Self::NotFound(message),
            "conflict" => Self::Conflict(message),
            "invalid_argument" => Self::InvalidArgument(message),
            "unavailable" => Self::Unavailable(message),
            _ => Self::Internal(message),
        }
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{context}: {m}");
        match self {
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::Unavailable(m) => Self::Unavailable(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
        }
    }

    /// True for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Error {
    /// Translate a store error into the taxonomy.
    ///
    /// Uses the backend-neutral [`ErrorKind`], so PostgreSQL SQLSTATEs and
    /// SQLite extended result codes map identically.
    pub fn from_store(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("no rows".to_string()),
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::ForeignKeyViolation => Self::NotFound(
                    db.constraint()
                        .map(|c| format!("referenced row missing ({c})"))
                        .unwrap_or_else(|| "referenced row missing".to_string()),
                ),
                ErrorKind::UniqueViolation => Self::Conflict(db.message().to_string()),
                ErrorKind::CheckViolation | ErrorKind::NotNullViolation => {
                    Self::InvalidArgument(db.message().to_string())
                }
                _ => Self::Internal(err.to_string()),
            },
            sqlx::Error::PoolTimedOut => Self::Unavailable("database pool timed out".to_string()),
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::from_store(err)
    }
}

impl From<ModelError> for Error {
    fn from(err: ModelError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {err}"))
    }
}

/// JSON error body used by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// One of the codes returned by [`Error::code`].
    pub code: String,
    /// Human readable message.
    pub message: String,
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Self::from_code(&body.code, body.message)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.message().to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
