//! Database layer for mass-blocker
//!
//! SQLite persistence for everything the engine needs to survive a restart.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`kv`]: Key-value store with a change-notification stream
//! - [`timers`]: Wake-up timers, at most one per operation id
//! - [`logs`]: Operation log entries and error records
//! - [`users`]: Local caches of known accounts (recently actioned, remote lists)
//! - [`cache`]: Response cache for idempotent API reads
//! - [`credentials`]: OAuth token storage

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use tokio::sync::broadcast;

use crate::Error;
use crate::error::DatabaseError;

mod cache;
mod credentials;
mod kv;
mod logs;
mod migrations;
mod timers;
mod users;

pub use cache::CachedResponse;
pub use users::UserStore;

/// Key the OAuth token is stored under
pub const CREDENTIALS_KEY: &str = "credentials";

/// A single key mutation delivered to [`Database::subscribe_changes`] subscribers
#[derive(Clone, Debug, PartialEq)]
pub struct StorageChange {
    /// Key that changed
    pub key: String,
    /// Value before the mutation (None if the key did not exist)
    pub old_value: Option<Value>,
    /// Value after the mutation (None if the key was removed)
    pub new_value: Option<Value>,
}

/// A pending wake-up timer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timer {
    /// Operation id the timer wakes
    pub id: String,
    /// Earliest time the timer may fire
    pub scheduled_time: DateTime<Utc>,
}

/// Database handle for mass-blocker
pub struct Database {
    pool: SqlitePool,
    changes: broadcast::Sender<StorageChange>,
}

fn query_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
