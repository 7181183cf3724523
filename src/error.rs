//! Error types for mass-blocker
//!
//! This module provides the error taxonomy shared by the request layer, the
//! collection/consumption loops and the operation engine:
//! - API failures that carry the received response (status, headers, body)
//! - transport failures where no response was received
//! - configuration errors for persisted state the engine cannot interpret
//! - storage errors from the SQLite-backed collaborators

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for mass-blocker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mass-blocker
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "api.client_id")
        key: Option<String>,
    },

    /// Persisted staged state references a stage the operation does not declare
    #[error("operation {operation} references unknown stage \"{stage}\"")]
    UnknownStage {
        /// Operation id
        operation: String,
        /// Stage name found in the persisted state
        stage: String,
    },

    /// Persisted state carries a type tag with no registered handler
    #[error("no handler registered for operation type \"{0}\"")]
    UnknownHandler(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The remote API answered with a non-success status
    #[error("API error: {0}")]
    Api(ApiFailure),

    /// Authentication is missing or could not be refreshed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Network error (no response received)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Transport failure without a response, raised by non-reqwest transports
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed URL or endpoint
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input to an engine entry point
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not found
    #[error("operation not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The response attached to this error, if one was received
    pub fn response(&self) -> Option<&ApiFailure> {
        match self {
            Error::Api(failure) => Some(failure),
            _ => None,
        }
    }

    /// HTTP status of the attached response
    pub fn status(&self) -> Option<u16> {
        self.response().map(|f| f.status)
    }

    /// JSON-friendly representation used for persisted error records
    pub fn to_record(&self) -> Value {
        match self {
            Error::Api(failure) => serde_json::json!({
                "kind": "api",
                "message": self.to_string(),
                "status": failure.status,
                "headers": failure.headers,
                "body": failure.body,
            }),
            Error::Network(_) | Error::Transport(_) => serde_json::json!({
                "kind": "network",
                "message": self.to_string(),
            }),
            _ => serde_json::json!({
                "kind": "other",
                "message": self.to_string(),
            }),
        }
    }
}

/// A non-success response received from the remote API
#[derive(Debug, Clone, PartialEq)]
pub struct ApiFailure {
    /// HTTP status code
    pub status: u16,
    /// Response headers, lower-cased names
    pub headers: HashMap<String, String>,
    /// Response body parsed as JSON (`Value::Null` if empty, `Value::String` if not JSON)
    pub body: Value,
}

impl ApiFailure {
    /// Look up a response header by (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {}", self.status)?;
        if let Some(detail) = self
            .body
            .get("detail")
            .or_else(|| self.body.get("error_description"))
            .and_then(Value::as_str)
        {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored value could not be decoded
    #[error("corrupt value for key {key}: {reason}")]
    CorruptValue {
        /// Storage key
        key: String,
        /// Decoder error
        reason: String,
    },
}
