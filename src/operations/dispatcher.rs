//! Operation dispatcher
//!
//! Owns the `type` tag to handler registry and the wake loop. When a timer
//! fires the dispatcher loads the operation's state, runs the matching
//! handler, and afterwards makes sure the operation is not left with state but
//! no timer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Context, OperationState, after, get_raw, list};
use crate::Result;
use crate::error::Error;
use crate::types::Event;

/// Runs one kind of operation
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Advance operation `id` from `state`
    ///
    /// On return the handler has either deleted the state or persisted it
    /// along with a timer.
    async fn run(&self, ctx: &Context, id: &str, state: OperationState) -> Result<()>;
}

type HandlerFn =
    dyn for<'a> Fn(&'a Context, &'a str, OperationState) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// [`OperationHandler`] backed by an async function
pub struct FnHandler {
    f: Box<HandlerFn>,
}

impl FnHandler {
    /// Wrap `f`, typically `|ctx, id, state| Box::pin(handler(ctx, id, state))`
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Context, &'a str, OperationState) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl OperationHandler for FnHandler {
    async fn run(&self, ctx: &Context, id: &str, state: OperationState) -> Result<()> {
        (self.f)(ctx, id, state).await
    }
}

/// Handler registry and wake loop
pub struct Dispatcher {
    ctx: Context,
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl Dispatcher {
    /// Dispatcher with no handlers
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            handlers: HashMap::new(),
        }
    }

    /// Context handed to every handler
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Route states tagged `tag` to `handler`, replacing any previous one
    pub fn register(&mut self, tag: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(tag.into(), handler);
    }

    /// Run the handler of `id` once
    ///
    /// Handler errors are logged and recorded, not returned; the returned
    /// error is a storage failure of the dispatcher itself.
    pub async fn fire(&self, id: &str) -> Result<()> {
        let Some(raw) = get_raw(&self.ctx.db, id).await? else {
            error!(operation = %id, "timer fired for an operation without state, this is likely a bug");
            return Ok(());
        };

        let tag = raw.get("type").and_then(Value::as_str).unwrap_or_default();
        let Some(handler) = self.handlers.get(tag) else {
            let err = Error::UnknownHandler(tag.to_string());
            error!(operation = %id, error = %err, "cannot run operation");
            let log = self.ctx.logger(id);
            log.error(err.to_string()).await;
            if let Err(e) = log.record_error(&err, None).await {
                warn!(operation = %id, error = %e, "failed to record error");
            }
            return Ok(());
        };

        debug!(operation = %id, tag, "running operation");
        let outcome = match serde_json::from_value::<OperationState>(raw) {
            Ok(state) => handler.run(&self.ctx, id, state).await,
            Err(e) => Err(e.into()),
        };
        if let Err(err) = outcome {
            self.report_failure(id, &err).await;
        }

        if get_raw(&self.ctx.db, id).await?.is_none() {
            return Ok(());
        }
        if self.ctx.db.get_timer(id).await?.is_none() {
            warn!(
                operation = %id,
                "operation did not complete and set no wake-up, installing fallback timer"
            );
            self.ctx
                .schedule_in(id, self.ctx.scheduling.fallback_delay)
                .await?;
        }
        Ok(())
    }

    async fn report_failure(&self, id: &str, err: &Error) {
        error!(operation = %id, error = %err, "operation failed");
        let log = self.ctx.logger(id);
        log.error(format!("Operation failed: {}", err)).await;
        if let Err(e) = log.record_error(err, None).await {
            warn!(operation = %id, error = %e, "failed to record error");
        }
        self.ctx.emit(Event::OperationFailed {
            id: id.to_string(),
            error: err.to_string(),
        });
    }

    /// Give every persisted operation without a timer a wake-up
    ///
    /// Without `stagger` all of them wake shortly after now. With `stagger`
    /// the first waits `startup_stagger_initial` and each further one another
    /// `startup_stagger_step`, so a restart does not start everything at once.
    /// Returns how many timers were installed.
    pub async fn schedule_missing_timers(&self, stagger: bool) -> Result<usize> {
        let scheduling = &self.ctx.scheduling;
        let mut ids = list(&self.ctx.db).await?;
        ids.sort();

        let mut at = if stagger {
            after(Utc::now(), scheduling.startup_stagger_initial)
        } else {
            after(Utc::now(), scheduling.install_delay)
        };
        let mut installed = 0;
        for id in ids {
            if self.ctx.db.get_timer(&id).await?.is_some() {
                continue;
            }
            self.ctx.schedule(&id, at).await?;
            info!(operation = %id, at = %at, "scheduled missing timer");
            installed += 1;
            if stagger {
                at = after(at, scheduling.startup_stagger_step);
            }
        }
        Ok(installed)
    }

    /// Fire every timer that is due now; returns how many fired
    pub async fn run_due(&self) -> Result<usize> {
        let due = self.ctx.db.take_due_timers(Utc::now()).await?;
        let count = due.len();
        for timer in due {
            debug!(operation = %timer.id, scheduled = %timer.scheduled_time, "timer fired");
            if let Err(e) = self.fire(&timer.id).await {
                error!(operation = %timer.id, error = %e, "failed to dispatch operation");
            }
        }
        Ok(count)
    }

    /// Wake loop: poll for due timers until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            if let Err(e) = self.run_due().await {
                error!(error = %e, "failed to poll timers");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.scheduling.poll_interval) => {}
            }
        }
        info!("dispatcher stopped");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::tests::test_context;
    use crate::operations::{QueueState, add};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OperationHandler for Counting {
        async fn run(&self, _ctx: &Context, _id: &str, _state: OperationState) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("handler exploded".into()));
            }
            Ok(())
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail,
        })
    }

    fn queue_state() -> OperationState {
        OperationState::BlockQueue(QueueState::default())
    }

    #[tokio::test]
    async fn test_fire_without_state_is_a_no_op() {
        let (ctx, _file) = test_context().await;
        let handler = counting(false);
        let mut dispatcher = Dispatcher::new(ctx.clone());
        dispatcher.register("block_queue", handler.clone());

        dispatcher.fire("ghost").await.unwrap();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        assert!(ctx.db.get_timer("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_logged_and_not_retried() {
        let (ctx, _file) = test_context().await;
        ctx.db
            .kv_set("operation:odd", &json!({"type": "mystery"}))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(ctx.clone());

        dispatcher.fire("odd").await.unwrap();

        assert!(ctx.db.get_timer("odd").await.unwrap().is_none());
        let errors = ctx.db.last_error_records(1).await.unwrap();
        assert!(errors[0].error["message"].as_str().unwrap().contains("mystery"));
    }

    #[tokio::test]
    async fn test_failing_handler_gets_fallback_timer() {
        let (ctx, _file) = test_context().await;
        add(&ctx.db, "block_queue", &queue_state()).await.unwrap();
        let handler = counting(true);
        let mut dispatcher = Dispatcher::new(ctx.clone());
        dispatcher.register("block_queue", handler.clone());
        let mut events = ctx.events.subscribe();

        let before = Utc::now();
        dispatcher.fire("block_queue").await.unwrap();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        let timer = ctx.db.get_timer("block_queue").await.unwrap().unwrap();
        let delay = timer.scheduled_time - before;
        assert!(delay >= chrono::Duration::seconds(59) && delay <= chrono::Duration::seconds(61));
        assert!(matches!(events.recv().await.unwrap(), Event::OperationFailed { .. }));
        assert_eq!(ctx.db.last_error_records(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_timer_is_kept() {
        let (ctx, _file) = test_context().await;
        add(&ctx.db, "block_queue", &queue_state()).await.unwrap();
        let mut dispatcher = Dispatcher::new(ctx.clone());
        dispatcher.register(
            "block_queue",
            Arc::new(FnHandler::new(|ctx, id, _state| {
                Box::pin(async move {
                    ctx.schedule_in(id, Duration::from_secs(3600)).await?;
                    Ok(())
                })
            })),
        );

        dispatcher.fire("block_queue").await.unwrap();

        let timer = ctx.db.get_timer("block_queue").await.unwrap().unwrap();
        assert!(timer.scheduled_time > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_finished_operation_gets_no_timer() {
        let (ctx, _file) = test_context().await;
        add(&ctx.db, "block_queue", &queue_state()).await.unwrap();
        let mut dispatcher = Dispatcher::new(ctx.clone());
        dispatcher.register(
            "block_queue",
            Arc::new(FnHandler::new(|ctx, id, _state| {
                Box::pin(async move { crate::operations::remove(&ctx.db, id).await })
            })),
        );

        dispatcher.fire("block_queue").await.unwrap();

        assert!(ctx.db.get_timer("block_queue").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_schedule_missing_timers_fresh_install() {
        let (ctx, _file) = test_context().await;
        for id in ["a", "b", "c"] {
            add(&ctx.db, id, &queue_state()).await.unwrap();
        }
        ctx.db
            .create_timer("b", Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(ctx.clone());

        let before = Utc::now();
        assert_eq!(dispatcher.schedule_missing_timers(false).await.unwrap(), 2);

        for id in ["a", "c"] {
            let timer = ctx.db.get_timer(id).await.unwrap().unwrap();
            assert!(timer.scheduled_time - before <= chrono::Duration::seconds(2));
        }
        let kept = ctx.db.get_timer("b").await.unwrap().unwrap();
        assert!(kept.scheduled_time > Utc::now() + chrono::Duration::minutes(100));
    }

    #[tokio::test]
    async fn test_schedule_missing_timers_staggered() {
        let (ctx, _file) = test_context().await;
        for id in ["a", "b", "c"] {
            add(&ctx.db, id, &queue_state()).await.unwrap();
        }
        let dispatcher = Dispatcher::new(ctx.clone());

        // Timers are stored with millisecond precision
        let before = chrono::DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        assert_eq!(dispatcher.schedule_missing_timers(true).await.unwrap(), 3);

        let timers = ctx.db.all_timers().await.unwrap();
        let offsets: Vec<i64> = timers
            .iter()
            .map(|t| (t.scheduled_time - before).num_seconds())
            .collect();
        assert_eq!(offsets, vec![300, 360, 420]);
    }

    #[tokio::test]
    async fn test_run_due_fires_each_due_timer_once() {
        let (ctx, _file) = test_context().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = Dispatcher::new(ctx.clone());
        let recorder = seen.clone();
        dispatcher.register(
            "block_queue",
            Arc::new(FnHandler::new(move |ctx, id, _state| {
                recorder.lock().unwrap().push(id.to_string());
                Box::pin(async move { crate::operations::remove(&ctx.db, id).await })
            })),
        );
        for id in ["due-1", "due-2", "later"] {
            add(&ctx.db, id, &queue_state()).await.unwrap();
        }
        ctx.db
            .create_timer("due-1", Utc::now() - chrono::Duration::seconds(2))
            .await
            .unwrap();
        ctx.db
            .create_timer("due-2", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        ctx.db
            .create_timer("later", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(dispatcher.run_due().await.unwrap(), 2);
        assert_eq!(dispatcher.run_due().await.unwrap(), 0);

        assert_eq!(*seen.lock().unwrap(), vec!["due-1", "due-2"]);
        assert!(ctx.db.get_timer("later").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (ctx, _file) = test_context().await;
        let dispatcher = Arc::new(Dispatcher::new(ctx));
        let shutdown = CancellationToken::new();

        let task = {
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
