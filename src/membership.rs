//! Membership cache
//!
//! Answers "is this account already blocked/muted (or about to be)?" so the
//! block-likers job can skip redundant calls. An account counts as a member of
//! a list when it is in any of:
//! - the recently-actioned store (this engine blocked/muted it)
//! - the mirror of the remote list from the last full sync
//! - the pending queue of the matching action queue
//!
//! The queue part is held in memory: [`MembershipCache::init`] loads it from
//! the key-value store and [`MembershipCache::on_change`] keeps it current from
//! the store's change stream. Answers are advisory; a false negative only costs
//! an extra idempotent API call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Result;
use crate::db::{Database, StorageChange, UserStore};
use crate::operations::storage_key;
use crate::types::{ListType, QueueType};

/// Cached list membership
pub struct MembershipCache {
    db: Arc<Database>,
    queued: RwLock<HashMap<QueueType, HashSet<String>>>,
}

impl MembershipCache {
    /// Create an empty cache; call [`init`](Self::init) before use
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            queued: RwLock::new(HashMap::new()),
        }
    }

    /// Load the queued ids of both action queues from the store
    pub async fn init(&self) -> Result<()> {
        for queue in QueueType::ALL {
            let value = self.db.kv_get(&storage_key(queue.as_str())).await?;
            self.queued
                .write()
                .await
                .insert(queue, queued_ids(value.as_ref()));
        }
        Ok(())
    }

    /// Apply one store mutation; keys other than the queue states are ignored
    pub async fn on_change(&self, key: &str, new_value: Option<&Value>) {
        let Some(queue) = QueueType::ALL
            .into_iter()
            .find(|q| storage_key(q.as_str()) == key)
        else {
            return;
        };
        let ids = queued_ids(new_value);
        debug!(queue = %queue, queued = ids.len(), "membership cache refreshed");
        self.queued.write().await.insert(queue, ids);
    }

    /// Whether the account is blocked, recently blocked or queued for blocking
    pub async fn is_blocked(&self, user_id: &str) -> Result<bool> {
        self.is_member(ListType::Blocked, user_id).await
    }

    /// Whether the account is muted, recently muted or queued for muting
    pub async fn is_muted(&self, user_id: &str) -> Result<bool> {
        self.is_member(ListType::Muted, user_id).await
    }

    /// Membership check for either list
    pub async fn is_member(&self, list: ListType, user_id: &str) -> Result<bool> {
        if self
            .db
            .get_user(UserStore::recent(list), user_id)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        if self
            .db
            .get_user(UserStore::remote(list), user_id)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        Ok(self
            .queued
            .read()
            .await
            .get(&list.queue())
            .is_some_and(|ids| ids.contains(user_id)))
    }

    /// Follow the store's change stream until `shutdown` is cancelled
    ///
    /// A lagging receiver reloads everything with [`init`](Self::init).
    pub fn spawn_listener(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<StorageChange>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(change) => self.on_change(&change.key, change.new_value.as_ref()).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "membership cache lagged behind the store, reloading");
                            if let Err(e) = self.init().await {
                                warn!(error = %e, "failed to reload membership cache");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

fn queued_ids(state: Option<&Value>) -> HashSet<String> {
    state
        .and_then(|s| s.get("users"))
        .and_then(Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(|u| u.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_db;
    use crate::types::UserHandle;
    use serde_json::json;

    #[tokio::test]
    async fn test_member_of_any_source() {
        let (db, _file) = test_db().await;
        db.kv_set(
            "operation:mute_queue",
            &json!({"type": "mute_queue", "users": [{"id": "3", "username": "three"}]}),
        )
        .await
        .unwrap();
        db.put_user(UserStore::RecentlyBlocked, &UserHandle::new("1", "one"))
            .await
            .unwrap();
        db.put_user(UserStore::RemoteBlocked, &UserHandle::new("2", "two"))
            .await
            .unwrap();

        let cache = MembershipCache::new(db.clone());
        cache.init().await.unwrap();

        assert!(cache.is_blocked("1").await.unwrap());
        assert!(cache.is_blocked("2").await.unwrap());
        assert!(!cache.is_blocked("3").await.unwrap());
        assert!(cache.is_muted("3").await.unwrap());
        assert!(!cache.is_muted("1").await.unwrap());
    }

    #[tokio::test]
    async fn test_on_change_tracks_queue_states_only() {
        let (db, _file) = test_db().await;
        let cache = MembershipCache::new(db);
        cache.init().await.unwrap();

        let state = json!({"type": "block_queue", "users": [{"id": "9", "username": "nine"}]});
        cache.on_change("operation:block_queue", Some(&state)).await;
        assert!(cache.is_blocked("9").await.unwrap());

        cache.on_change("block_queue:batch", Some(&state)).await;
        assert!(!cache.is_muted("9").await.unwrap());

        cache.on_change("operation:block_queue", None).await;
        assert!(!cache.is_blocked("9").await.unwrap());
    }

    #[tokio::test]
    async fn test_listener_follows_store() {
        let (db, _file) = test_db().await;
        let cache = Arc::new(MembershipCache::new(db.clone()));
        cache.init().await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = cache
            .clone()
            .spawn_listener(db.subscribe_changes(), shutdown.clone());

        db.kv_set(
            "operation:mute_queue",
            &json!({"type": "mute_queue", "users": [{"id": "5", "username": "five"}]}),
        )
        .await
        .unwrap();

        let mut seen = false;
        for _ in 0..50 {
            if cache.is_muted("5").await.unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(seen);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
