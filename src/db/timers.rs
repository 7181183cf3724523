//! Wake-up timers.
//!
//! One row per operation id; creating a timer for an id that already has one
//! replaces it. The dispatcher claims due timers with [`Database::take_due_timers`],
//! which deletes them in the same statement so a fired timer never fires twice.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::Result;

use super::{Database, Timer, millis_to_datetime, query_failed};

impl Database {
    /// Create (or replace) the timer for `id`
    pub async fn create_timer(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timers (id, fire_at)
            VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET fire_at = excluded.fire_at
            "#,
        )
        .bind(id)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to create timer"))?;

        tracing::debug!(operation = %id, at = %at, "timer installed");
        Ok(())
    }

    /// The pending timer for `id`, if any
    pub async fn get_timer(&self, id: &str) -> Result<Option<Timer>> {
        let fire_at: Option<i64> = sqlx::query_scalar("SELECT fire_at FROM timers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to read timer"))?;

        Ok(fire_at.map(|ms| Timer {
            id: id.to_string(),
            scheduled_time: millis_to_datetime(ms),
        }))
    }

    /// All pending timers, earliest first
    pub async fn all_timers(&self) -> Result<Vec<Timer>> {
        let rows = sqlx::query("SELECT id, fire_at FROM timers ORDER BY fire_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("Failed to list timers"))?;

        Ok(rows.iter().map(row_to_timer).collect())
    }

    /// Remove the timer for `id`; returns whether one existed
    pub async fn clear_timer(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM timers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to clear timer"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub async fn take_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let rows = sqlx::query("DELETE FROM timers WHERE fire_at <= ? RETURNING id, fire_at")
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed("Failed to claim due timers"))?;

        let mut timers: Vec<Timer> = rows.iter().map(row_to_timer).collect();
        timers.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(timers)
    }
}

fn row_to_timer(row: &sqlx::sqlite::SqliteRow) -> Timer {
    Timer {
        id: row.get("id"),
        scheduled_time: millis_to_datetime(row.get("fire_at")),
    }
}
