//! Local caches of known accounts.
//!
//! Four stores share one table:
//! - recently blocked / muted: accounts this engine actioned that the last
//!   remote-list sync has not confirmed yet
//! - remote blocked / muted: the remote lists as of the last full sync

use std::collections::HashSet;

use sqlx::Row;

use crate::Result;
use crate::types::{ListType, UserHandle};

use super::{Database, query_failed};

/// Which account cache a row belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UserStore {
    /// Blocked by this engine, not yet seen in the remote list
    RecentlyBlocked,
    /// Muted by this engine, not yet seen in the remote list
    RecentlyMuted,
    /// Remote block list
    RemoteBlocked,
    /// Remote mute list
    RemoteMuted,
}

impl UserStore {
    fn as_str(self) -> &'static str {
        match self {
            UserStore::RecentlyBlocked => "recently_blocked",
            UserStore::RecentlyMuted => "recently_muted",
            UserStore::RemoteBlocked => "remote_blocked",
            UserStore::RemoteMuted => "remote_muted",
        }
    }

    /// Recently-actioned store for a list
    pub fn recent(list: ListType) -> Self {
        match list {
            ListType::Blocked => UserStore::RecentlyBlocked,
            ListType::Muted => UserStore::RecentlyMuted,
        }
    }

    /// Remote mirror store for a list
    pub fn remote(list: ListType) -> Self {
        match list {
            ListType::Blocked => UserStore::RemoteBlocked,
            ListType::Muted => UserStore::RemoteMuted,
        }
    }
}

impl Database {
    /// Insert or update an account
    pub async fn put_user(&self, store: UserStore, user: &UserHandle) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO known_users (store, id, username)
            VALUES (?, ?, ?)
            ON CONFLICT(store, id) DO UPDATE SET username = excluded.username
            "#,
        )
        .bind(store.as_str())
        .bind(&user.id)
        .bind(&user.username)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to store user"))?;
        Ok(())
    }

    /// Look up an account by id
    pub async fn get_user(&self, store: UserStore, id: &str) -> Result<Option<UserHandle>> {
        let row = sqlx::query("SELECT id, username FROM known_users WHERE store = ? AND id = ?")
            .bind(store.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to read user"))?;

        Ok(row.map(|r| UserHandle {
            id: r.get("id"),
            username: r.get("username"),
        }))
    }

    /// Every id in a store
    pub async fn user_ids(&self, store: UserStore) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM known_users WHERE store = ?")
            .bind(store.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("Failed to list users"))?;
        Ok(ids.into_iter().collect())
    }

    /// Delete one account
    pub async fn delete_user(&self, store: UserStore, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM known_users WHERE store = ? AND id = ?")
            .bind(store.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to delete user"))?;
        Ok(())
    }

    /// Delete every account in a store
    pub async fn clear_store(&self, store: UserStore) -> Result<()> {
        sqlx::query("DELETE FROM known_users WHERE store = ?")
            .bind(store.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to clear user store"))?;
        Ok(())
    }

    /// Make a store hold exactly `users`: insert new ids, delete missing ones
    ///
    /// Returns (added, removed) counts.
    pub async fn replace_store(&self, store: UserStore, users: &[UserHandle]) -> Result<(usize, usize)> {
        let old_ids = self.user_ids(store).await?;
        let new_ids: HashSet<&str> = users.iter().map(|u| u.id.as_str()).collect();

        let mut added = 0;
        for user in users.iter().filter(|u| !old_ids.contains(&u.id)) {
            self.put_user(store, user).await?;
            added += 1;
        }

        let mut removed = 0;
        for id in old_ids.iter().filter(|id| !new_ids.contains(id.as_str())) {
            self.delete_user(store, id).await?;
            removed += 1;
        }

        Ok((added, removed))
    }

    /// Delete the given accounts from a store if present; returns how many were removed
    pub async fn remove_from_store(&self, store: UserStore, users: &[UserHandle]) -> Result<usize> {
        let existing = self.user_ids(store).await?;
        let mut removed = 0;
        for user in users.iter().filter(|u| existing.contains(&u.id)) {
            self.delete_user(store, &user.id).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
