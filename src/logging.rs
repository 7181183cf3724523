//! Operation log
//!
//! [`OperationLogger`] writes every line twice: as a `tracing` event with
//! structured fields for whoever subscribed, and as a persisted [`LogEntry`]
//! that forms the user-visible history of an operation. Permanent per-item
//! failures are kept separately as [`ErrorRecord`]s.
//!
//! Persisting log lines is best effort: a storage failure is reported through
//! `tracing` and never fails the operation that logged. Recording an error is
//! not best effort, since a lost error record would silently drop a work item.

use std::sync::Arc;

use chrono::{Local, Utc};
use serde_json::Value;

use crate::Result;
use crate::db::Database;
use crate::error::Error;
use crate::types::{ErrorRecord, LogContext, LogEntry, Severity, UserHandle};

/// Logger bound to an operation (and optionally a stage)
#[derive(Clone)]
pub struct OperationLogger {
    db: Arc<Database>,
    context: LogContext,
}

impl OperationLogger {
    /// Logger with an explicit context
    pub fn new(db: Arc<Database>, context: LogContext) -> Self {
        Self { db, context }
    }

    /// Logger for an operation id
    pub fn for_operation(db: Arc<Database>, id: &str) -> Self {
        Self::new(db, LogContext::operation(id))
    }

    /// The same logger with the stage context replaced
    pub fn with_stage(&self, stage: Option<&str>) -> Self {
        Self {
            db: self.db.clone(),
            context: LogContext {
                stage: stage.map(str::to_string),
                ..self.context.clone()
            },
        }
    }

    /// Context attached to every entry
    pub fn context(&self) -> &LogContext {
        &self.context
    }

    /// Log at debug severity
    pub async fn debug(&self, text: impl Into<String>) {
        self.log(Severity::Debug, text.into(), None).await
    }

    /// Log at info severity
    pub async fn info(&self, text: impl Into<String>) {
        self.log(Severity::Info, text.into(), None).await
    }

    /// Log at warn severity
    pub async fn warn(&self, text: impl Into<String>) {
        self.log(Severity::Warn, text.into(), None).await
    }

    /// Log at error severity
    pub async fn error(&self, text: impl Into<String>) {
        self.log(Severity::Error, text.into(), None).await
    }

    /// Log with a structured payload
    pub async fn log_with(&self, severity: Severity, text: impl Into<String>, data: Value) {
        self.log(severity, text.into(), Some(data)).await
    }

    async fn log(&self, severity: Severity, text: String, data: Option<Value>) {
        let operation = self.context.operation.as_deref().unwrap_or("-");
        let stage = self.context.stage.as_deref().unwrap_or("-");
        match severity {
            Severity::Debug => tracing::debug!(operation, stage, data = ?data, "{}", text),
            Severity::Info => tracing::info!(operation, stage, data = ?data, "{}", text),
            Severity::Warn => tracing::warn!(operation, stage, data = ?data, "{}", text),
            Severity::Error => tracing::error!(operation, stage, data = ?data, "{}", text),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            severity,
            context: Some(self.context.clone()),
            text,
            data,
        };
        if let Err(e) = self.db.append_log(&entry).await {
            tracing::warn!(operation, error = %e, "failed to persist log entry");
        }
    }

    /// Persist an error record, optionally about a specific account
    pub async fn record_error(&self, error: &Error, user: Option<&UserHandle>) -> Result<()> {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            context: Some(LogContext {
                user: user.cloned(),
                ..self.context.clone()
            }),
            error: error.to_record(),
        };
        self.db.append_error(&record).await?;
        Ok(())
    }
}

/// Render an entry as `S<local time> [operation]: text: data`
pub fn format_entry(entry: &LogEntry) -> String {
    let initial = entry.severity.as_str()[..1].to_ascii_uppercase();
    let mut line = format!(
        "{}{}",
        initial,
        entry
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(operation) = entry.context.as_ref().and_then(|c| c.operation.as_deref()) {
        line.push_str(&format!(" [{}]", operation));
    }
    line.push_str(": ");
    line.push_str(&entry.text);
    if let Some(data) = &entry.data {
        line.push_str(&format!(": {}", data));
    }
    line
}

/// The newest `count` persisted entries, oldest first
pub async fn last_entries(db: &Database, count: usize) -> Result<Vec<LogEntry>> {
    db.last_log_entries(count).await
}
