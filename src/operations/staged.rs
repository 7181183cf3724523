//! Multi-stage operation runner
//!
//! A staged operation declares an ordered list of stage names and keeps the
//! current one in its persisted state. [`run_staged`] runs stages in order
//! within one invocation until a stage asks to sleep, persisting after every
//! transition, so a crash never replays a completed stage.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::dispatcher::OperationHandler;
use super::{Context, OperationState, add, remove};
use crate::Result;
use crate::error::Error;
use crate::logging::OperationLogger;
use crate::types::Event;

/// What a stage asks for when it returns
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageResult {
    /// The stage finished; continue with the next one
    StageDone,
    /// Suspend and run this stage again at the given time
    SleepUntil(DateTime<Utc>),
}

/// An operation made of named stages
#[async_trait]
pub trait StagedOperation: Send {
    /// Stage names in execution order
    fn stages(&self) -> &'static [&'static str];

    /// The persisted current stage (`None` before the first run)
    fn stage(&self) -> Option<&str>;

    /// Record the current stage
    fn set_stage(&mut self, stage: &str);

    /// Snapshot of the persistable state
    fn to_state(&self) -> OperationState;

    /// Run one stage
    async fn run_stage(
        &mut self,
        ctx: &Context,
        stage: &str,
        log: &OperationLogger,
    ) -> Result<StageResult>;
}

/// Run `op` from its current stage until it sleeps or finishes
///
/// Errors leave the state as last persisted; the stage that failed runs again
/// on the next wake.
pub async fn run_staged<O: StagedOperation + ?Sized>(
    ctx: &Context,
    id: &str,
    op: &mut O,
) -> Result<()> {
    let stages = op.stages();
    let first = stages.first().ok_or_else(|| Error::Config {
        message: format!("operation {} declares no stages", id),
        key: None,
    })?;

    let mut index = match op.stage() {
        None => {
            op.set_stage(first);
            0
        }
        Some(current) => stages
            .iter()
            .position(|s| *s == current)
            .ok_or_else(|| Error::UnknownStage {
                operation: id.to_string(),
                stage: current.to_string(),
            })?,
    };

    let log = ctx.logger(id);
    loop {
        let stage = stages[index];
        let stage_log = log.with_stage(Some(stage));
        match op.run_stage(ctx, stage, &stage_log).await? {
            StageResult::SleepUntil(at) => {
                add(&ctx.db, id, &op.to_state()).await?;
                ctx.schedule(id, at).await?;
                return Ok(());
            }
            StageResult::StageDone if index + 1 < stages.len() => {
                index += 1;
                op.set_stage(stages[index]);
                add(&ctx.db, id, &op.to_state()).await?;
            }
            StageResult::StageDone => {
                remove(&ctx.db, id).await?;
                ctx.db.clear_timer(id).await?;
                info!(operation = %id, "operation completed");
                log.info("Done.").await;
                ctx.emit(Event::OperationCompleted { id: id.to_string() });
                return Ok(());
            }
        }
    }
}

/// Loads a staged operation from its persisted state
pub trait LoadStaged: StagedOperation + Sized {
    /// Build the operation, or fail when the state belongs to another kind
    fn load(id: &str, state: OperationState) -> Result<Self>;
}

/// [`OperationHandler`] running a [`LoadStaged`] type through [`run_staged`]
pub struct StagedHandler<O> {
    _op: PhantomData<fn() -> O>,
}

impl<O> StagedHandler<O> {
    /// Handler for `O`
    pub fn new() -> Self {
        Self { _op: PhantomData }
    }
}

impl<O> Default for StagedHandler<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<O: LoadStaged + 'static> OperationHandler for StagedHandler<O> {
    async fn run(&self, ctx: &Context, id: &str, state: OperationState) -> Result<()> {
        let mut op = O::load(id, state)?;
        run_staged(ctx, id, &mut op).await
    }
}
