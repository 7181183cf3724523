//! Core types shared across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote account, identified by `id`
///
/// `id` is the only identity key; `username` is informational and may change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserHandle {
    /// Stable account id
    pub id: String,
    /// Display handle at the time it was collected
    pub username: String,
}

impl UserHandle {
    /// Create a new handle
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// OAuth token set plus the identity it belongs to
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Bearer token for API calls
    pub access_token: String,
    /// Refresh token (absent for tokens without offline access)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: String,
    /// The authenticated account, substituted for `/:id/` in endpoints
    #[serde(default, rename = "self")]
    pub self_user: Option<UserHandle>,
}

/// What to do with the collected accounts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Block the accounts
    Block,
    /// Mute the accounts
    Mute,
}

impl Action {
    /// The queue that executes this action
    pub fn queue(self) -> QueueType {
        match self {
            Action::Block => QueueType::BlockQueue,
            Action::Mute => QueueType::MuteQueue,
        }
    }
}

/// The two action queues
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Pending blocks
    BlockQueue,
    /// Pending mutes
    MuteQueue,
}

impl QueueType {
    /// Both queues
    pub const ALL: [QueueType; 2] = [QueueType::BlockQueue, QueueType::MuteQueue];

    /// Operation id and type tag of this queue
    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::BlockQueue => "block_queue",
            QueueType::MuteQueue => "mute_queue",
        }
    }

    /// Endpoint the queue posts each item to
    pub fn endpoint(self) -> &'static str {
        match self {
            QueueType::BlockQueue => "/2/users/:id/blocking",
            QueueType::MuteQueue => "/2/users/:id/muting",
        }
    }

    /// The list this queue feeds
    pub fn list(self) -> ListType {
        match self {
            QueueType::BlockQueue => ListType::Blocked,
            QueueType::MuteQueue => ListType::Muted,
        }
    }

    /// Parse an operation id back into a queue type
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.as_str() == id)
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two remote account lists mirrored locally
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListType {
    /// Accounts blocked by the authenticated user
    Blocked,
    /// Accounts muted by the authenticated user
    Muted,
}

impl ListType {
    /// Both lists
    pub const ALL: [ListType; 2] = [ListType::Blocked, ListType::Muted];

    /// Operation id and type tag of the recurring sync for this list
    pub fn operation_id(self) -> &'static str {
        match self {
            ListType::Blocked => "collect_blocked",
            ListType::Muted => "collect_muted",
        }
    }

    /// Listing endpoint
    pub fn endpoint(self) -> &'static str {
        match self {
            ListType::Blocked => "/2/users/:id/blocking",
            ListType::Muted => "/2/users/:id/muting",
        }
    }

    /// The queue that adds accounts to this list
    pub fn queue(self) -> QueueType {
        match self {
            ListType::Blocked => QueueType::BlockQueue,
            ListType::Muted => QueueType::MuteQueue,
        }
    }
}

/// Log severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Debug detail
    Debug,
    /// Progress information
    Info,
    /// Something the user should look at
    Warn,
    /// Failure
    Error,
}

impl Severity {
    /// Lower-case name as persisted
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }

    /// Parse the persisted name, unknown values read as `Info`
    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Severity::Debug,
            "warn" => Severity::Warn,
            "error" => Severity::Error,
            _ => Severity::Info,
        }
    }
}

/// Context attached to log entries and error records
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContext {
    /// Operation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Stage of a multi-stage operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Account the entry is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserHandle>,
}

impl LogContext {
    /// Context naming only an operation
    pub fn operation(id: impl Into<String>) -> Self {
        Self {
            operation: Some(id.into()),
            ..Default::default()
        }
    }
}

/// One persisted log line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was written
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: Severity,
    /// Operation/stage/user context
    #[serde(default)]
    pub context: Option<LogContext>,
    /// Message
    pub text: String,
    /// Structured payload
    #[serde(default)]
    pub data: Option<Value>,
}

/// One persisted error record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error was recorded
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Operation/user context
    #[serde(default)]
    pub context: Option<LogContext>,
    /// Error payload (see [`crate::Error::to_record`])
    pub error: Value,
}

/// Events emitted by the engine
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A wake-up was installed for an operation
    OperationScheduled {
        /// Operation id
        id: String,
        /// When it will run
        at: DateTime<Utc>,
    },
    /// A multi-stage operation reached its terminal stage
    OperationCompleted {
        /// Operation id
        id: String,
    },
    /// A handler returned an error (the operation will be retried)
    OperationFailed {
        /// Operation id
        id: String,
        /// Error message
        error: String,
    },
    /// An account was blocked
    UserBlocked(UserHandle),
    /// An account was muted
    UserMuted(UserHandle),
    /// An item was permanently failed by an action queue
    ItemFailed {
        /// Queue that gave up on the item
        queue: QueueType,
        /// The account
        user: UserHandle,
        /// Error message
        error: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_self_field_name() {
        let token: Token = serde_json::from_str(
            r#"{"access_token": "a", "refresh_token": "r", "scope": "", "self": {"id": "1", "username": "me"}}"#,
        )
        .unwrap();
        assert_eq!(token.self_user, Some(UserHandle::new("1", "me")));

        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["self"]["id"], "1");
    }

    #[test]
    fn test_queue_and_list_names() {
        assert_eq!(QueueType::from_id("mute_queue"), Some(QueueType::MuteQueue));
        assert_eq!(QueueType::from_id("collect_muted"), None);
        assert_eq!(Action::Block.queue().list(), ListType::Blocked);
        assert_eq!(ListType::Muted.queue(), QueueType::MuteQueue);
        assert_eq!(ListType::Blocked.operation_id(), "collect_blocked");
    }

    #[test]
    fn test_log_entry_timestamp_is_millis() {
        let entry = LogEntry {
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
            severity: Severity::Warn,
            context: Some(LogContext::operation("op")),
            text: "hello".into(),
            data: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["timestamp"], 1_700_000_000_123_i64);
        assert_eq!(json["severity"], "warn");
        assert_eq!(json["context"]["operation"], "op");
        assert!(json["context"].get("stage").is_none());
    }
}
