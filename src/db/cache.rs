//! Response cache for API reads requested with `cache: true`.

use serde_json::Value;
use sqlx::Row;

use crate::Result;

use super::{Database, query_failed};

/// A cached API response
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    /// HTTP status
    pub status: u16,
    /// Decoded body
    pub body: Value,
}

impl Database {
    /// Look up a cached response
    pub async fn cache_get(&self, key: &str) -> Result<Option<CachedResponse>> {
        let row = sqlx::query("SELECT status, body FROM response_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to read response cache"))?;

        row.map(|r| -> Result<CachedResponse> {
            let status: i64 = r.get("status");
            let body: String = r.get("body");
            Ok(CachedResponse {
                status: status as u16,
                body: serde_json::from_str(&body)?,
            })
        })
        .transpose()
    }

    /// Store a response
    pub async fn cache_put(&self, key: &str, response: &CachedResponse) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO response_cache (key, status, body, stored_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                status = excluded.status, body = excluded.body, stored_at = excluded.stored_at
            "#,
        )
        .bind(key)
        .bind(response.status as i64)
        .bind(serde_json::to_string(&response.body)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to write response cache"))?;
        Ok(())
    }
}
