//! Remote block and mute list sync
//!
//! `collect_blocked` and `collect_muted` periodically walk the authenticated
//! account's block (mute) list and mirror it into the remote-list store. A
//! walk may span several rate-limit windows; the accounts seen so far are kept
//! in the state. Once a walk completes the mirror is replaced, accounts this
//! engine actioned that the list now confirms are dropped from the
//! recently-actioned store, and the next walk is scheduled a full
//! `collect_interval` later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Context, OperationState, add, after, get_raw, remove};
use crate::Result;
use crate::client::Request;
use crate::db::{Database, UserStore};
use crate::error::Error;
use crate::pagination::{CollectLoopState, LoopResult, collect, user_handles};
use crate::types::{ListType, Severity, UserHandle};

/// Page size requested from the list endpoints
const PAGE_SIZE: u32 = 1000;

/// Persisted state of a list sync
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserListState {
    /// Position of the walk in progress
    #[serde(default)]
    pub collect_state: CollectLoopState,
    /// Accounts seen so far by the walk in progress
    #[serde(default)]
    pub users: Vec<UserHandle>,
    /// When the last complete walk finished
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub last_completion: Option<DateTime<Utc>>,
}

impl UserListState {
    fn into_operation(self, list: ListType) -> OperationState {
        match list {
            ListType::Blocked => OperationState::CollectBlocked(self),
            ListType::Muted => OperationState::CollectMuted(self),
        }
    }
}

fn list_for(id: &str) -> Result<ListType> {
    ListType::ALL
        .into_iter()
        .find(|list| list.operation_id() == id)
        .ok_or_else(|| Error::Config {
            message: format!("unknown list operation \"{}\"", id),
            key: None,
        })
}

/// Key older versions kept a whole list under
fn legacy_list_key(list: ListType) -> &'static str {
    match list {
        ListType::Blocked => "blocked",
        ListType::Muted => "muted",
    }
}

/// Handler of both list syncs
///
/// Storage failures are returned; API failures are logged and retried after
/// `list_error_delay`.
pub async fn process(ctx: &Context, id: &str, state: OperationState) -> Result<()> {
    let list = list_for(id)?;
    let mut state = match state {
        OperationState::CollectBlocked(state) | OperationState::CollectMuted(state) => state,
        other => {
            return Err(Error::Config {
                message: format!("operation {} holds a {} state", id, other.type_tag()),
                key: None,
            });
        }
    };
    let interval = ctx.scheduling.collect_interval;

    if let Some(last) = state.last_completion {
        let next = after(last, interval);
        if next > Utc::now() {
            ctx.schedule(id, next).await?;
            return Ok(());
        }
    }

    let request = Request::get(list.endpoint()).param("max_results", PAGE_SIZE);
    let result = collect(
        &*ctx.api,
        &request,
        state.collect_state.clone(),
        user_handles,
    )
    .await;
    state.collect_state = result.state;
    state.users.extend(result.collected_items);
    add(&ctx.db, id, &state.clone().into_operation(list)).await?;

    let log = ctx.logger(id);
    match result.result {
        LoopResult::Done => {
            let (added, removed) = ctx
                .db
                .replace_store(UserStore::remote(list), &state.users)
                .await?;
            let confirmed = ctx
                .db
                .remove_from_store(UserStore::recent(list), &state.users)
                .await?;
            info!(
                operation = %id,
                total = state.users.len(),
                added,
                removed,
                confirmed,
                "list synced"
            );
            log.info(format!(
                "Synced {} accounts ({} new, {} no longer listed).",
                state.users.len(),
                added,
                removed
            ))
            .await;

            let fresh = UserListState {
                last_completion: Some(Utc::now()),
                ..Default::default()
            };
            add(&ctx.db, id, &fresh.into_operation(list)).await?;
            ctx.schedule_in(id, interval).await?;
        }
        LoopResult::ResumeAfter(at) => {
            log.debug(format!(
                "Collected {} accounts so far, continuing at {}",
                state.users.len(),
                at
            ))
            .await;
            ctx.schedule(id, at).await?;
        }
        LoopResult::Error(error) => {
            log.log_with(Severity::Warn, error.to_string(), error.to_record())
                .await;
            ctx.schedule_in(id, ctx.scheduling.list_error_delay).await?;
        }
    }
    Ok(())
}

async fn migrate_legacy_list(db: &Database, list: ListType) -> Result<()> {
    #[derive(Deserialize)]
    struct StoredList {
        #[serde(default)]
        users: Vec<UserHandle>,
    }

    let key = legacy_list_key(list);
    let Some(stored) = db.kv_get_as::<StoredList>(key).await? else {
        return Ok(());
    };
    for user in &stored.users {
        db.put_user(UserStore::remote(list), user).await?;
    }
    db.kv_remove(&[key]).await?;
    info!(list = ?list, users = stored.users.len(), "migrated stored list");
    Ok(())
}

/// Make sure both list syncs exist and wake them after `bootstrap_delay`
///
/// The wake is installed even for existing syncs; a sync that ran recently
/// just reschedules itself. A stored list from older versions that cannot be
/// migrated is left in place.
pub async fn bootstrap(ctx: &Context) -> Result<()> {
    for list in ListType::ALL {
        if let Err(e) = migrate_legacy_list(&ctx.db, list).await {
            warn!(list = ?list, error = %e, "could not migrate stored list, leaving it");
        }
        let id = list.operation_id();
        if get_raw(&ctx.db, id).await?.is_none() {
            add(&ctx.db, id, &UserListState::default().into_operation(list)).await?;
            info!(operation = %id, "list sync created");
        }
        ctx.schedule_in(id, ctx.scheduling.bootstrap_delay).await?;
    }
    Ok(())
}

/// Stop both list syncs and forget what this engine recently actioned
pub async fn delete_list_state(ctx: &Context) -> Result<()> {
    for list in ListType::ALL {
        let id = list.operation_id();
        ctx.db.clear_timer(id).await?;
        remove(&ctx.db, id).await?;
        ctx.db.kv_remove(&[legacy_list_key(list)]).await?;
        ctx.db.clear_store(UserStore::recent(list)).await?;
    }
    info!("list sync state deleted");
    Ok(())
}
