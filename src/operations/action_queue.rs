//! Block and mute queues
//!
//! Each queue is a long-lived operation whose state holds the accounts still
//! to be blocked (or muted). Producers never touch that state: they write a
//! batch under a fresh `{queue}:{uuid}` key with [`append`], and the queue
//! merges all pending batches into its state when it wakes. The merged state
//! is persisted before the batch keys are deleted, so a crash in between only
//! causes a harmless re-merge.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Context, OperationState, add, get_raw, get_state};
use crate::Result;
use crate::client::{ApiResponse, Request};
use crate::consume::{ItemOutcome, consume};
use crate::db::{Database, UserStore};
use crate::error::Error;
use crate::logging::OperationLogger;
use crate::pagination::LoopResult;
use crate::types::{ErrorRecord, Event, LogContext, QueueType, UserHandle};

/// Persisted state of a queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Accounts still to be actioned, front first
    #[serde(default)]
    pub users: VecDeque<UserHandle>,
}

impl QueueState {
    fn into_operation(self, queue: QueueType) -> OperationState {
        match queue {
            QueueType::BlockQueue => OperationState::BlockQueue(self),
            QueueType::MuteQueue => OperationState::MuteQueue(self),
        }
    }
}

fn batch_prefix(queue: QueueType) -> String {
    format!("{}:", queue.as_str())
}

fn legacy_errors_key(queue: QueueType) -> String {
    format!("errors:{}", queue.as_str())
}

/// Queue `users` for the next run of `queue`; returns the batch key
pub async fn append(db: &Database, queue: QueueType, users: &[UserHandle]) -> Result<String> {
    let key = format!("{}{}", batch_prefix(queue), Uuid::new_v4());
    db.kv_put(&key, &users).await?;
    debug!(queue = %queue, batch = %key, users = users.len(), "batch appended");
    Ok(key)
}

async fn load(db: &Database, queue: QueueType) -> Result<QueueState> {
    match (queue, get_state(db, queue.as_str()).await?) {
        (_, None) => Ok(QueueState::default()),
        (QueueType::BlockQueue, Some(OperationState::BlockQueue(state)))
        | (QueueType::MuteQueue, Some(OperationState::MuteQueue(state))) => Ok(state),
        (_, Some(other)) => Err(Error::Config {
            message: format!(
                "operation {} holds a {} state",
                queue.as_str(),
                other.type_tag()
            ),
            key: None,
        }),
    }
}

/// Fold every pending batch into the queue's state
///
/// Accounts already queued are not added twice; new ones keep batch order.
/// Unreadable batches are left in place.
pub async fn merge_batches(db: &Database, queue: QueueType) -> Result<QueueState> {
    let mut state = load(db, queue).await?;
    let batches = db.kv_entries_with_prefix(&batch_prefix(queue)).await?;
    if batches.is_empty() {
        return Ok(state);
    }

    let mut known: HashSet<String> = state.users.iter().map(|u| u.id.clone()).collect();
    let mut merged_keys = Vec::with_capacity(batches.len());
    for (key, value) in batches {
        let users: Vec<UserHandle> = match serde_json::from_value(value) {
            Ok(users) => users,
            Err(e) => {
                warn!(queue = %queue, batch = %key, error = %e, "skipping unreadable batch");
                continue;
            }
        };
        for user in users {
            if known.insert(user.id.clone()) {
                state.users.push_back(user);
            }
        }
        merged_keys.push(key);
    }

    add(db, queue.as_str(), &state.clone().into_operation(queue)).await?;
    db.kv_remove(&merged_keys).await?;
    debug!(queue = %queue, batches = merged_keys.len(), queued = state.users.len(), "batches merged");
    Ok(state)
}

struct QueueOutcome<'a> {
    ctx: &'a Context,
    queue: QueueType,
    log: OperationLogger,
}

#[async_trait]
impl<'a> ItemOutcome<UserHandle> for QueueOutcome<'a> {
    async fn failed(&mut self, user: &UserHandle, error: &Error) -> Result<()> {
        self.log.record_error(error, Some(user)).await?;
        warn!(queue = %self.queue, user = %user.username, error = %error, "giving up on account");
        self.ctx.emit(Event::ItemFailed {
            queue: self.queue,
            user: user.clone(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn succeeded(&mut self, user: &UserHandle, _response: &ApiResponse) {
        let store = UserStore::recent(self.queue.list());
        if let Err(e) = self.ctx.db.put_user(store, user).await {
            warn!(queue = %self.queue, user = %user.username, error = %e, "failed to remember actioned account");
        }
        debug!(queue = %self.queue, user = %user.username, "account actioned");
        self.ctx.emit(match self.queue {
            QueueType::BlockQueue => Event::UserBlocked(user.clone()),
            QueueType::MuteQueue => Event::UserMuted(user.clone()),
        });
    }
}

/// Handler of both queues: merge batches, work through the queue, reschedule
///
/// A drained queue checks again after `queue_idle_interval`; a rate-limited
/// one resumes at the reset time. An error reschedules after
/// `queue_error_delay` and is then returned to the dispatcher.
pub async fn process(ctx: &Context, id: &str, _state: OperationState) -> Result<()> {
    let queue = QueueType::from_id(id).ok_or_else(|| Error::Config {
        message: format!("unknown queue id \"{}\"", id),
        key: None,
    })?;
    let mut state = merge_batches(&ctx.db, queue).await?;
    let queued = state.users.len();

    let endpoint = queue.endpoint();
    let mut outcome = QueueOutcome {
        ctx,
        queue,
        log: ctx.logger(id),
    };
    let result = consume(
        &*ctx.api,
        &mut state.users,
        |user: &UserHandle| Request::post(endpoint, json!({ "target_user_id": user.id })),
        &mut outcome,
    )
    .await;

    let remaining = state.users.len();
    add(&ctx.db, id, &state.into_operation(queue)).await?;
    if queued > 0 {
        info!(queue = %queue, processed = queued - remaining, remaining, "queue pass finished");
    }

    match result {
        LoopResult::Done => {
            ctx.schedule_in(id, ctx.scheduling.queue_idle_interval).await?;
            Ok(())
        }
        LoopResult::ResumeAfter(at) => {
            ctx.schedule(id, at).await?;
            Ok(())
        }
        LoopResult::Error(error) => {
            ctx.schedule_in(id, ctx.scheduling.queue_error_delay).await?;
            Err(error)
        }
    }
}

#[derive(Deserialize)]
struct LegacyError {
    #[serde(default)]
    user: Option<UserHandle>,
    #[serde(default)]
    error: Value,
}

async fn migrate_legacy_errors(db: &Database, queue: QueueType) -> Result<usize> {
    let key = legacy_errors_key(queue);
    let Some(value) = db.kv_get(&key).await? else {
        return Ok(0);
    };
    let errors: Vec<LegacyError> = serde_json::from_value(value)?;
    for legacy in &errors {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            context: Some(LogContext {
                user: legacy.user.clone(),
                ..LogContext::operation(queue.as_str())
            }),
            error: legacy.error.clone(),
        };
        db.append_error(&record).await?;
    }
    db.kv_remove(&[key]).await?;
    info!(queue = %queue, migrated = errors.len(), "migrated stored queue errors");
    Ok(errors.len())
}

/// Make sure both queues exist
///
/// A missing queue is created empty and woken after `bootstrap_delay`; an
/// existing one keeps whatever timer it has. Errors stored by older versions
/// under `errors:{queue}` are moved to the error log; a key that cannot be
/// migrated is left in place.
pub async fn bootstrap(ctx: &Context) -> Result<()> {
    for queue in QueueType::ALL {
        if let Err(e) = migrate_legacy_errors(&ctx.db, queue).await {
            warn!(queue = %queue, error = %e, "could not migrate stored queue errors, leaving them");
        }
        if get_raw(&ctx.db, queue.as_str()).await?.is_none() {
            add(
                &ctx.db,
                queue.as_str(),
                &QueueState::default().into_operation(queue),
            )
            .await?;
            ctx.schedule_in(queue.as_str(), ctx.scheduling.bootstrap_delay)
                .await?;
            info!(queue = %queue, "queue created");
        }
    }
    Ok(())
}
