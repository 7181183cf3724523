//! The engine: wiring and lifecycle
//!
//! [`Engine`] owns the database, the API client, the membership cache and the
//! dispatcher, and exposes the operations an embedding application drives:
//! starting the wake loop, creating jobs, queueing accounts, inspecting and
//! cancelling operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ApiClient, ApiRequester};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::logging;
use crate::membership::MembershipCache;
use crate::operations::{
    self, BlockLikersRequest, Context, Dispatcher, OperationState, action_queue, block_likers,
    user_list,
};
use crate::types::{Action, ErrorRecord, Event, LogEntry, Token, UserHandle};

/// Capacity of the event channel; slower subscribers observe `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// How long shutdown waits for background tasks
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of a persisted operation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationInfo {
    /// Operation id
    pub id: String,
    /// `type` tag of its state
    pub kind: String,
    /// Current stage, for multi-stage operations
    pub stage: Option<String>,
    /// Next scheduled wake, if any
    pub next_wake: Option<DateTime<Utc>>,
}

/// Bulk block/mute engine (cloneable, all fields are shared)
#[derive(Clone)]
pub struct Engine {
    /// Database handle, public for embedding applications and tests
    pub db: Arc<Database>,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Engine {
    /// Open the database and build an engine talking to the configured API
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let client = ApiClient::new(&config, db.clone())?;
        Self::with_api(config, db, Arc::new(client))
    }

    /// Build an engine over an existing database and API requester
    pub fn with_api(config: Config, db: Arc<Database>, api: Arc<dyn ApiRequester>) -> Result<Self> {
        config.validate()?;
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ctx = Context {
            db: db.clone(),
            api,
            membership: Arc::new(MembershipCache::new(db.clone())),
            scheduling: config.scheduling.clone(),
            events,
        };
        let mut dispatcher = Dispatcher::new(ctx);
        operations::register_builtin(&mut dispatcher);

        Ok(Self {
            db,
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            shutdown: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn ctx(&self) -> &Context {
        self.dispatcher.context()
    }

    /// The configuration the engine runs with
    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// Bootstrap the built-in operations and start the background tasks
    ///
    /// On a fresh database every operation wakes shortly after start. When
    /// operations already existed (a restart), those without a timer are
    /// spread out starting `startup_stagger_initial` from now.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(Error::Other("engine already started".into()));
        }

        let ctx = self.ctx();
        let restart = !operations::list(&self.db).await?.is_empty();
        let changes = self.db.subscribe_changes();
        ctx.membership.init().await?;

        operations::bootstrap(ctx).await?;
        let scheduled = self.dispatcher.schedule_missing_timers(restart).await?;
        info!(restart, scheduled, "engine starting");

        tasks.push(
            ctx.membership
                .clone()
                .spawn_listener(changes, self.shutdown.clone()),
        );
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(shutdown).await }));
        Ok(())
    }

    /// Store the OAuth token (and the account it belongs to)
    pub async fn set_token(&self, token: &Token) -> Result<()> {
        self.db.set_token(token).await
    }

    /// Start a job blocking or muting the likers/retweeters of a tweet
    ///
    /// Returns the new operation's id.
    pub async fn block_likers(&self, request: BlockLikersRequest) -> Result<String> {
        block_likers::create(self.ctx(), request).await
    }

    /// Queue accounts to be blocked or muted
    pub async fn queue(&self, action: Action, users: &[UserHandle]) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        action_queue::append(&self.db, action.queue(), users).await?;
        Ok(())
    }

    /// Delete an operation and its timer
    pub async fn cancel(&self, id: &str) -> Result<()> {
        if operations::get_raw(&self.db, id).await?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        operations::remove(&self.db, id).await?;
        self.db.clear_timer(id).await?;
        info!(operation = %id, "operation cancelled");
        Ok(())
    }

    /// Every persisted operation, ordered by id
    pub async fn list_operations(&self) -> Result<Vec<OperationInfo>> {
        let mut ids = operations::list(&self.db).await?;
        ids.sort();
        let mut infos = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = operations::get_raw(&self.db, &id).await? else {
                continue;
            };
            let field = |name: &str| raw.get(name).and_then(Value::as_str).map(str::to_string);
            infos.push(OperationInfo {
                kind: field("type").unwrap_or_default(),
                stage: field("stage"),
                next_wake: self.db.get_timer(&id).await?.map(|t| t.scheduled_time),
                id,
            });
        }
        Ok(infos)
    }

    /// Decoded state of one operation
    pub async fn operation_state(&self, id: &str) -> Result<Option<OperationState>> {
        operations::get_state(&self.db, id).await
    }

    /// The newest `count` log entries, oldest first
    pub async fn recent_logs(&self, count: usize) -> Result<Vec<LogEntry>> {
        logging::last_entries(&self.db, count).await
    }

    /// The newest `count` error records, oldest first
    pub async fn recent_errors(&self, count: usize) -> Result<Vec<ErrorRecord>> {
        self.db.last_error_records(count).await
    }

    /// Whether an account is blocked, recently blocked or queued for blocking
    pub async fn is_blocked(&self, user_id: &str) -> Result<bool> {
        self.ctx().membership.is_blocked(user_id).await
    }

    /// Whether an account is muted, recently muted or queued for muting
    pub async fn is_muted(&self, user_id: &str) -> Result<bool> {
        self.ctx().membership.is_muted(user_id).await
    }

    /// Stop the list syncs and forget recently actioned accounts
    ///
    /// The syncs are recreated on the next [`start`](Self::start).
    pub async fn delete_list_state(&self) -> Result<()> {
        user_list::delete_list_state(self.ctx()).await
    }

    /// Subscribe to engine events
    ///
    /// Each subscriber receives every event; one that falls more than 1000
    /// events behind receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx().events.subscribe()
    }

    /// Stop the background tasks and close the database
    ///
    /// A handler in progress finishes its current step first; everything it
    /// persisted is picked up again on the next start. Tasks still running
    /// after 30 seconds are aborted before the database is closed.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_within(SHUTDOWN_TIMEOUT).await
    }

    async fn shutdown_within(&self, timeout: Duration) -> Result<()> {
        info!("initiating graceful shutdown");
        self.shutdown.cancel();

        let mut tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let outcome =
            tokio::time::timeout(timeout, futures::future::join_all(tasks.iter_mut())).await;
        match outcome {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "background task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!("timeout waiting for background tasks, aborting them");
                for task in &tasks {
                    task.abort();
                }
                // The pool must outlive every task that could still write to it
                futures::future::join_all(tasks).await;
            }
        }

        self.db.close().await;
        info!("shutdown complete");
        Ok(())
    }
}
