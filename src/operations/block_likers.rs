//! Block or mute everyone who liked (or retweeted) a tweet
//!
//! Stages, in order:
//! 1. `follows`: accounts the user follows, when they are to be spared
//! 2. `followers`: the user's followers, when they are to be spared
//! 3. `likers`: accounts that liked the tweet
//! 4. `retweeters`: accounts that retweeted the tweet
//! 5. `schedule`: drop spared and already blocked/muted accounts and queue the rest
//!
//! The collection stages share one cursor; each runs to completion before the
//! next starts, so the cursor always belongs to the current stage.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::staged::{LoadStaged, StageResult, StagedOperation};
use super::{Context, OperationState, action_queue, add};
use crate::Result;
use crate::client::Request;
use crate::error::Error;
use crate::logging::OperationLogger;
use crate::pagination::{CollectLoopState, CollectStage};
use crate::types::{Action, Severity, UserHandle};

const STAGES: &[&str] = &["follows", "followers", "likers", "retweeters", "schedule"];

/// Parameters of a new block/mute likers job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockLikersRequest {
    /// Tweet whose audience is targeted
    pub tweet_id: String,
    /// Block or mute
    pub action: Action,
    /// Spare the user's followers
    #[serde(default)]
    pub exclude_followers: bool,
    /// Spare accounts the user follows
    #[serde(default)]
    pub exclude_follows: bool,
    /// Target accounts that liked the tweet
    #[serde(default)]
    pub include_likers: bool,
    /// Target accounts that retweeted the tweet
    #[serde(default)]
    pub include_retweeters: bool,
}

/// Persisted state of a block/mute likers job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockLikersState {
    /// Operation id
    pub id: String,
    /// Tweet whose audience is targeted
    pub tweet_id: String,
    /// Block or mute
    pub action: Action,
    /// Spare the user's followers
    #[serde(default)]
    pub exclude_followers: bool,
    /// Spare accounts the user follows
    #[serde(default)]
    pub exclude_follows: bool,
    /// Target accounts that liked the tweet (jobs from before the flag existed only did this)
    #[serde(default = "default_include_likers")]
    pub include_likers: bool,
    /// Target accounts that retweeted the tweet
    #[serde(default)]
    pub include_retweeters: bool,
    /// Current stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Cursor of the collection stage in progress
    #[serde(default)]
    pub collect_state: CollectLoopState,
    /// Target accounts collected so far, unique by id
    #[serde(default)]
    pub users: Vec<UserHandle>,
    /// Accounts the user follows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<Vec<UserHandle>>,
    /// The user's followers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<Vec<UserHandle>>,
    /// Likers stored by older versions; folded into `users` on load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likers: Option<Vec<UserHandle>>,
}

fn default_include_likers() -> bool {
    true
}

impl BlockLikersState {
    /// Fresh state for a new job
    pub fn new(id: impl Into<String>, request: BlockLikersRequest) -> Self {
        Self {
            id: id.into(),
            tweet_id: request.tweet_id,
            action: request.action,
            exclude_followers: request.exclude_followers,
            exclude_follows: request.exclude_follows,
            include_likers: request.include_likers,
            include_retweeters: request.include_retweeters,
            stage: None,
            collect_state: CollectLoopState::default(),
            users: Vec::new(),
            follows: None,
            followers: None,
            likers: None,
        }
    }

    fn merge_legacy_likers(&mut self) {
        if let Some(likers) = self.likers.take() {
            merge_unique(&mut self.users, likers);
        }
    }
}

fn merge_unique(users: &mut Vec<UserHandle>, items: Vec<UserHandle>) {
    let mut known: HashSet<String> = users.iter().map(|u| u.id.clone()).collect();
    users.extend(items.into_iter().filter(|u| known.insert(u.id.clone())));
}

static STATUS_PATH: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/[^/]+/status/([0-9]+)").ok());

/// Extract the tweet id from a `https://twitter.com/<user>/status/<id>` link
pub fn parse_tweet_id(link: &str) -> Option<String> {
    let url = url::Url::parse(link).ok()?;
    if url.host_str() != Some("twitter.com") {
        return None;
    }
    STATUS_PATH
        .as_ref()?
        .captures(url.path())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Validate and persist a new job; it starts after `new_operation_delay`
///
/// Returns the job's id.
pub async fn create(ctx: &Context, request: BlockLikersRequest) -> Result<String> {
    if !(request.include_likers || request.include_retweeters) {
        return Err(Error::InvalidRequest(
            "no users are selected to block/mute".into(),
        ));
    }
    if request.tweet_id.is_empty() || !request.tweet_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidRequest(format!(
            "\"{}\" is not a tweet id",
            request.tweet_id
        )));
    }

    let id = Uuid::new_v4().to_string();
    let state = BlockLikersState::new(id.clone(), request);
    add(&ctx.db, &id, &OperationState::BlockLikers(state.clone())).await?;
    ctx.schedule_in(&id, ctx.scheduling.new_operation_delay)
        .await?;
    info!(operation = %id, tweet = %state.tweet_id, action = ?state.action, "block likers job created");
    Ok(id)
}

/// The job as a [`StagedOperation`]
pub struct BlockLikers {
    state: BlockLikersState,
}

impl BlockLikers {
    async fn collect_follows(&mut self, ctx: &Context, log: &OperationLogger) -> Result<StageResult> {
        if !self.state.exclude_follows {
            return Ok(StageResult::StageDone);
        }
        let follows = self.state.follows.get_or_insert_with(Vec::new);
        let result = CollectStage::users(Request::get("/2/users/:id/following"))
            .run(&*ctx.api, &mut self.state.collect_state, |items| {
                follows.extend(items)
            })
            .await;
        let collected = follows.len();
        report(log, result, collected).await
    }

    async fn collect_followers(&mut self, ctx: &Context, log: &OperationLogger) -> Result<StageResult> {
        if !self.state.exclude_followers {
            return Ok(StageResult::StageDone);
        }
        let followers = self.state.followers.get_or_insert_with(Vec::new);
        let result = CollectStage::users(Request::get("/2/users/:id/followers"))
            .run(&*ctx.api, &mut self.state.collect_state, |items| {
                followers.extend(items)
            })
            .await;
        let collected = followers.len();
        report(log, result, collected).await
    }

    async fn collect_audience(
        &mut self,
        ctx: &Context,
        log: &OperationLogger,
        endpoint: String,
    ) -> Result<StageResult> {
        let users = &mut self.state.users;
        let result = CollectStage::users(Request::get(endpoint))
            .run(&*ctx.api, &mut self.state.collect_state, |items| {
                merge_unique(users, items)
            })
            .await;
        let collected = users.len();
        report(log, result, collected).await
    }

    async fn schedule_actions(&mut self, ctx: &Context, log: &OperationLogger) -> Result<StageResult> {
        let state = &self.state;
        let mut spared = HashSet::new();
        for (excluded, group, text) in [
            (
                state.exclude_follows,
                &state.follows,
                "Some of the people you follow have liked the tweet",
            ),
            (
                state.exclude_followers,
                &state.followers,
                "Some of your followers have liked the tweet",
            ),
        ] {
            if !excluded {
                continue;
            }
            let ids: HashSet<&str> = group
                .iter()
                .flatten()
                .map(|u| u.id.as_str())
                .collect();
            let overlap: Vec<&UserHandle> = state
                .users
                .iter()
                .filter(|u| ids.contains(u.id.as_str()))
                .collect();
            if !overlap.is_empty() {
                log.log_with(
                    Severity::Warn,
                    format!("{} {}:", text, state.tweet_id),
                    json!(overlap),
                )
                .await;
            }
            spared.extend(ids);
        }

        let list = state.action.queue().list();
        let mut targets = Vec::new();
        for user in &state.users {
            if spared.contains(user.id.as_str()) {
                continue;
            }
            if ctx.membership.is_member(list, &user.id).await? {
                continue;
            }
            targets.push(user.clone());
        }

        action_queue::append(&ctx.db, state.action.queue(), &targets).await?;
        let verb = match state.action {
            Action::Block => "blocking",
            Action::Mute => "muting",
        };
        log.info(format!("Queued {} users for {}", targets.len(), verb))
            .await;
        Ok(StageResult::StageDone)
    }
}

async fn report(
    log: &OperationLogger,
    result: Result<StageResult>,
    collected: usize,
) -> Result<StageResult> {
    match &result {
        Ok(StageResult::StageDone) => log.info(format!("Collected {} users.", collected)).await,
        Ok(StageResult::SleepUntil(at)) => {
            log.info(format!(
                "Hit rate limit, collected {} users so far. Sleeping until {}",
                collected,
                at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            ))
            .await
        }
        Err(_) => {}
    }
    result
}

#[async_trait]
impl StagedOperation for BlockLikers {
    fn stages(&self) -> &'static [&'static str] {
        STAGES
    }

    fn stage(&self) -> Option<&str> {
        self.state.stage.as_deref()
    }

    fn set_stage(&mut self, stage: &str) {
        self.state.stage = Some(stage.to_string());
    }

    fn to_state(&self) -> OperationState {
        OperationState::BlockLikers(self.state.clone())
    }

    async fn run_stage(
        &mut self,
        ctx: &Context,
        stage: &str,
        log: &OperationLogger,
    ) -> Result<StageResult> {
        match stage {
            "follows" => self.collect_follows(ctx, log).await,
            "followers" => self.collect_followers(ctx, log).await,
            "likers" if !self.state.include_likers => Ok(StageResult::StageDone),
            "likers" => {
                let endpoint = format!("/2/tweets/{}/liking_users", self.state.tweet_id);
                self.collect_audience(ctx, log, endpoint).await
            }
            "retweeters" if !self.state.include_retweeters => Ok(StageResult::StageDone),
            "retweeters" => {
                let endpoint = format!("/2/tweets/{}/retweeted_by", self.state.tweet_id);
                self.collect_audience(ctx, log, endpoint).await
            }
            "schedule" => self.schedule_actions(ctx, log).await,
            other => Err(Error::UnknownStage {
                operation: self.state.id.clone(),
                stage: other.to_string(),
            }),
        }
    }
}

impl LoadStaged for BlockLikers {
    fn load(id: &str, state: OperationState) -> Result<Self> {
        match state {
            OperationState::BlockLikers(mut state) => {
                state.merge_legacy_likers();
                Ok(Self { state })
            }
            other => Err(Error::Config {
                message: format!("operation {} holds a {} state", id, other.type_tag()),
                key: None,
            }),
        }
    }
}
