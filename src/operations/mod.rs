//! Resumable operations
//!
//! An operation is a unit of long-running work identified by a string id. Its
//! whole progress lives in one persisted [`OperationState`] under
//! `operation:{id}`, plus at most one wake-up timer. Whenever an operation
//! yields, it must leave either no state (finished) or state together with a
//! timer (suspended); the [`Dispatcher`] installs a fallback timer when a
//! handler forgets.
//!
//! Operation kinds:
//! - [`block_likers`]: multi-stage job collecting the likers/retweeters of a tweet
//! - [`action_queue`]: the long-lived block and mute queues
//! - [`user_list`]: the recurring sync of the remote block and mute lists

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::Result;
use crate::client::ApiRequester;
use crate::config::SchedulingConfig;
use crate::db::Database;
use crate::logging::OperationLogger;
use crate::membership::MembershipCache;
use crate::types::{Event, ListType, QueueType};

pub mod action_queue;
pub mod block_likers;
pub mod dispatcher;
pub mod staged;
pub mod user_list;

pub use action_queue::QueueState;
pub use block_likers::{BlockLikers, BlockLikersRequest, BlockLikersState, parse_tweet_id};
pub use dispatcher::{Dispatcher, FnHandler, OperationHandler};
pub use staged::{LoadStaged, StageResult, StagedHandler, StagedOperation, run_staged};
pub use user_list::UserListState;

/// Key prefix of persisted operation states
pub const OPERATION_PREFIX: &str = "operation:";

/// Storage key of an operation's state
pub fn storage_key(id: &str) -> String {
    format!("{}{}", OPERATION_PREFIX, id)
}

/// Persisted state of one operation, discriminated by `type`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationState {
    /// Block or mute the likers/retweeters of a tweet
    BlockLikers(BlockLikersState),
    /// Pending blocks
    BlockQueue(QueueState),
    /// Pending mutes
    MuteQueue(QueueState),
    /// Recurring sync of the remote block list
    CollectBlocked(UserListState),
    /// Recurring sync of the remote mute list
    CollectMuted(UserListState),
}

impl OperationState {
    /// The `type` tag handlers are registered under
    pub fn type_tag(&self) -> &'static str {
        match self {
            OperationState::BlockLikers(_) => "block_likers",
            OperationState::BlockQueue(_) => "block_queue",
            OperationState::MuteQueue(_) => "mute_queue",
            OperationState::CollectBlocked(_) => "collect_blocked",
            OperationState::CollectMuted(_) => "collect_muted",
        }
    }
}

/// Persist an operation's state, replacing any previous one
pub async fn add(db: &Database, id: &str, state: &OperationState) -> Result<()> {
    db.kv_put(&storage_key(id), state).await
}

/// Load and decode an operation's state
pub async fn get_state(db: &Database, id: &str) -> Result<Option<OperationState>> {
    db.kv_get_as(&storage_key(id)).await
}

/// Load an operation's state without decoding it
pub async fn get_raw(db: &Database, id: &str) -> Result<Option<Value>> {
    db.kv_get(&storage_key(id)).await
}

/// Ids of every persisted operation
pub async fn list(db: &Database) -> Result<Vec<String>> {
    Ok(db
        .kv_keys_with_prefix(OPERATION_PREFIX)
        .await?
        .into_iter()
        .filter_map(|key| key.strip_prefix(OPERATION_PREFIX).map(str::to_string))
        .collect())
}

/// Delete an operation's state (its timer is left alone)
pub async fn remove(db: &Database, id: &str) -> Result<()> {
    db.kv_remove(&[storage_key(id)]).await
}

/// `from` plus a configured delay
pub(crate) fn after(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    from + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Everything a handler needs while it runs
#[derive(Clone)]
pub struct Context {
    /// Persistent storage
    pub db: Arc<Database>,
    /// Authenticated API access
    pub api: Arc<dyn ApiRequester>,
    /// Block/mute membership lookups
    pub membership: Arc<MembershipCache>,
    /// Wake-up delays
    pub scheduling: SchedulingConfig,
    /// Event stream
    pub events: broadcast::Sender<Event>,
}

impl Context {
    /// Logger for an operation
    pub fn logger(&self, id: &str) -> OperationLogger {
        OperationLogger::for_operation(self.db.clone(), id)
    }

    /// Install (or replace) the wake-up of `id` at `at`
    pub async fn schedule(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.db.create_timer(id, at).await?;
        self.emit(Event::OperationScheduled {
            id: id.to_string(),
            at,
        });
        Ok(())
    }

    /// Install the wake-up of `id` after `delay`; returns the wake time
    pub async fn schedule_in(&self, id: &str, delay: Duration) -> Result<DateTime<Utc>> {
        let at = after(Utc::now(), delay);
        self.schedule(id, at).await?;
        Ok(at)
    }

    /// Broadcast an event; having no subscribers is fine
    pub fn emit(&self, event: Event) {
        self.events.send(event).ok();
    }
}

/// Register the handlers of every built-in operation kind
pub fn register_builtin(dispatcher: &mut Dispatcher) {
    dispatcher.register("block_likers", Arc::new(StagedHandler::<BlockLikers>::new()));
    for queue in QueueType::ALL {
        dispatcher.register(
            queue.as_str(),
            Arc::new(FnHandler::new(|ctx, id, state| {
                Box::pin(action_queue::process(ctx, id, state))
            })),
        );
    }
    for list in ListType::ALL {
        dispatcher.register(
            list.operation_id(),
            Arc::new(FnHandler::new(|ctx, id, state| {
                Box::pin(user_list::process(ctx, id, state))
            })),
        );
    }
}

/// Create the long-lived operations (both queues, both list syncs) if missing
pub async fn bootstrap(ctx: &Context) -> Result<()> {
    action_queue::bootstrap(ctx).await?;
    user_list::bootstrap(ctx).await
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
