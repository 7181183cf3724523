//! Key-value store with change notifications.
//!
//! Values are JSON documents. Every mutation is broadcast to
//! [`Database::subscribe_changes`] subscribers with the value before and after.
//! There are no cross-key transactions: concurrent writers to the same key race.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use tokio::sync::broadcast;

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, StorageChange, query_failed};

impl Database {
    /// Subscribe to key mutations
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    /// Read one key
    pub async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to read key"))?;

        raw.map(|s| decode(key, &s)).transpose()
    }

    /// Read one key and deserialize it
    pub async fn kv_get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv_get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                Error::Database(DatabaseError::CorruptValue {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })?)),
            None => Ok(None),
        }
    }

    /// Read several keys; missing keys are absent from the result
    pub async fn kv_get_many(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.kv_get(key).await? {
                values.insert(key.to_string(), value);
            }
        }
        Ok(values)
    }

    /// All entries whose key starts with `prefix`, ordered by key
    pub async fn kv_entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to scan keys"))?;

        rows.iter()
            .map(|row| -> Result<(String, Value)> {
                let key: String = row.get("key");
                let raw: String = row.get("value");
                let value = decode(&key, &raw)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Keys that start with `prefix`, ordered
    pub async fn kv_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("Failed to list keys"))
    }

    /// Write one key
    pub async fn kv_set(&self, key: &str, value: &Value) -> Result<()> {
        let old_value = self.kv_get(key).await?;
        let raw = serde_json::to_string(value)?;
        let now = chrono::Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&raw)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to write key"))?;

        self.notify(StorageChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value.clone()),
        });
        Ok(())
    }

    /// Serialize and write one key
    pub async fn kv_put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv_set(key, &serde_json::to_value(value)?).await
    }

    /// Write several keys
    pub async fn kv_set_many(&self, entries: &[(String, Value)]) -> Result<()> {
        for (key, value) in entries {
            self.kv_set(key, value).await?;
        }
        Ok(())
    }

    /// Remove keys; missing keys are ignored
    pub async fn kv_remove<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        for key in keys {
            let key = key.as_ref();
            let old_value = self.kv_get(key).await?;
            if old_value.is_none() {
                continue;
            }
            sqlx::query("DELETE FROM kv WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(query_failed("Failed to remove key"))?;

            self.notify(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
            });
        }
        Ok(())
    }

    fn notify(&self, change: StorageChange) {
        // No subscribers is not an error
        self.changes.send(change).ok();
    }
}

fn decode(key: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| {
        Error::Database(DatabaseError::CorruptValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}
