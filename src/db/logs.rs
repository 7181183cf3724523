//! Operation log entries and error records.

use serde_json::Value;
use sqlx::Row;

use crate::Result;
use crate::types::{ErrorRecord, LogContext, LogEntry, Severity};

use super::{Database, millis_to_datetime, query_failed};

impl Database {
    /// Append a log entry, returning its row id
    pub async fn append_log(&self, entry: &LogEntry) -> Result<i64> {
        let operation = entry.context.as_ref().and_then(|c| c.operation.clone());
        let context = entry
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let data = entry.data.as_ref().map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO log_entries (timestamp, severity, operation, context, text, data)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.timestamp.timestamp_millis())
        .bind(entry.severity.as_str())
        .bind(operation)
        .bind(context)
        .bind(&entry.text)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to append log entry"))?;

        Ok(result.last_insert_rowid())
    }

    /// The newest `count` log entries, oldest first
    pub async fn last_log_entries(&self, count: usize) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, severity, context, text, data FROM log_entries
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to read log entries"))?;

        let mut entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// Every log entry written for an operation, oldest first
    pub async fn log_entries_for_operation(&self, operation: &str) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, severity, context, text, data FROM log_entries
            WHERE operation = ?
            ORDER BY id
            "#,
        )
        .bind(operation)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to read operation log"))?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Append an error record, returning its row id
    pub async fn append_error(&self, record: &ErrorRecord) -> Result<i64> {
        let context = record
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "INSERT INTO error_records (timestamp, context, error) VALUES (?, ?, ?)",
        )
        .bind(record.timestamp.timestamp_millis())
        .bind(context)
        .bind(serde_json::to_string(&record.error)?)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to append error record"))?;

        Ok(result.last_insert_rowid())
    }

    /// The newest `count` error records, oldest first
    pub async fn last_error_records(&self, count: usize) -> Result<Vec<ErrorRecord>> {
        let rows = sqlx::query(
            "SELECT timestamp, context, error FROM error_records ORDER BY id DESC LIMIT ?",
        )
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to read error records"))?;

        let mut records = rows
            .iter()
            .map(|row| -> Result<ErrorRecord> {
                let context: Option<String> = row.get("context");
                let error: String = row.get("error");
                Ok(ErrorRecord {
                    timestamp: millis_to_datetime(row.get("timestamp")),
                    context: parse_context(context)?,
                    error: serde_json::from_str(&error)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }
}

fn parse_context(raw: Option<String>) -> Result<Option<LogContext>> {
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<LogEntry> {
    let severity: String = row.get("severity");
    let context: Option<String> = row.get("context");
    let data: Option<String> = row.get("data");
    Ok(LogEntry {
        timestamp: millis_to_datetime(row.get("timestamp")),
        severity: Severity::parse(&severity),
        context: parse_context(context)?,
        text: row.get("text"),
        data: data
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()?,
    })
}
