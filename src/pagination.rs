//! Paginated collection loop
//!
//! [`collect`] walks a cursor-based listing endpoint, accumulating mapped
//! items until the listing ends, the quota runs out, or a call fails. The
//! whole resumable position is a [`CollectLoopState`]: re-invoking with the
//! state returned by the previous pass fetches the next unseen page, so a walk
//! can be spread over any number of suspended invocations without skipping or
//! repeating a page.
//!
//! [`CollectStage`] packages a request and a response mapper so an operation
//! stage can run one collection pass and get a [`StageResult`] back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::{ApiRequester, ApiResponse, Request};
use crate::error::Error;
use crate::operations::StageResult;
use crate::retry::{FailureClass, RATE_LIMIT_RESET, classify, parse_reset, resume_time};
use crate::types::UserHandle;
use crate::Result;

/// Query parameter carrying the cursor
pub const PAGINATION_TOKEN_PARAM: &str = "pagination_token";

/// Resumable cursor of one pagination walk
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectLoopState {
    /// Cursor of the next page to fetch; `None` starts from the first page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_token: Option<String>,
}

/// How a collection or consumption pass ended
#[derive(Debug)]
pub enum LoopResult {
    /// Nothing left to do
    Done,
    /// Rate limited; nothing more can happen before this time
    ResumeAfter(DateTime<Utc>),
    /// The pass stopped on an error; re-invoke unchanged on the next wake
    Error(Error),
}

impl LoopResult {
    /// Whether the pass completed
    pub fn is_done(&self) -> bool {
        matches!(self, LoopResult::Done)
    }
}

/// Outcome of [`collect`]
#[derive(Debug)]
pub struct CollectResult<T> {
    /// Items mapped during this pass, in page order
    pub collected_items: Vec<T>,
    /// Cursor to resume from (reset to the start once the walk is done)
    pub state: CollectLoopState,
    /// How the pass ended
    pub result: LoopResult,
}

/// Walk a paginated listing from `state`
///
/// `map` is applied to every page reporting `meta.result_count > 0`. The loop
/// stops with [`LoopResult::ResumeAfter`] when a call is rate limited, or when
/// a successful page reports an exhausted quota (after the cursor has moved
/// past that page). Any other failure stops with [`LoopResult::Error`]; in
/// every case the items collected so far are returned.
pub async fn collect<T, A, F>(
    api: &A,
    request: &Request,
    mut state: CollectLoopState,
    map: F,
) -> CollectResult<T>
where
    A: ApiRequester + ?Sized,
    F: Fn(&ApiResponse) -> Result<Vec<T>> + Send + Sync,
    T: Send,
{
    let mut collected = Vec::new();

    loop {
        let mut page_request = request.clone();
        if let Some(token) = &state.pagination_token {
            page_request
                .params
                .insert(PAGINATION_TOKEN_PARAM.to_string(), token.clone());
        }

        let response = match api.request(&page_request).await {
            Ok(response) => response,
            Err(error) => {
                let result = match classify(&error) {
                    FailureClass::RateLimited => {
                        let reset = parse_reset(error.response().and_then(|f| f.header(RATE_LIMIT_RESET)));
                        LoopResult::ResumeAfter(resume_time(api.rate_limits(), reset, Utc::now()))
                    }
                    _ => LoopResult::Error(error),
                };
                return CollectResult {
                    collected_items: collected,
                    state,
                    result,
                };
            }
        };

        let (result_count, next_token) = match page_meta(&response.body) {
            Ok(meta) => meta,
            Err(error) => {
                return CollectResult {
                    collected_items: collected,
                    state,
                    result: LoopResult::Error(error),
                };
            }
        };

        if result_count > 0 {
            match map(&response) {
                Ok(items) => collected.extend(items),
                Err(error) => {
                    return CollectResult {
                        collected_items: collected,
                        state,
                        result: LoopResult::Error(error),
                    };
                }
            }
        }

        match next_token {
            Some(token) => state.pagination_token = Some(token),
            None => {
                debug!(endpoint = %request.endpoint, items = collected.len(), "listing complete");
                return CollectResult {
                    collected_items: collected,
                    state: CollectLoopState::default(),
                    result: LoopResult::Done,
                };
            }
        }

        if let Some(reset) = response.exhausted_quota() {
            let until = resume_time(api.rate_limits(), reset, Utc::now());
            debug!(endpoint = %request.endpoint, until = %until, "quota exhausted mid-listing");
            return CollectResult {
                collected_items: collected,
                state,
                result: LoopResult::ResumeAfter(until),
            };
        }
    }
}

fn page_meta(body: &Value) -> Result<(u64, Option<String>)> {
    let meta = body
        .get("meta")
        .ok_or_else(|| Error::Other("paginated response has no meta".into()))?;
    let result_count = meta.get("result_count").and_then(Value::as_u64).unwrap_or(0);
    let next_token = meta
        .get("next_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok((result_count, next_token))
}

/// Map a user listing page (`data: [{id, username, ...}]`) to handles
pub fn user_handles(response: &ApiResponse) -> Result<Vec<UserHandle>> {
    let data = response
        .body
        .get("data")
        .cloned()
        .ok_or_else(|| Error::Other("user listing page has no data".into()))?;
    Ok(serde_json::from_value(data)?)
}

/// A collection pass as a stage step: the listing request and its mapper
pub struct CollectStage<T> {
    request: Request,
    map: fn(&ApiResponse) -> Result<Vec<T>>,
}

impl CollectStage<UserHandle> {
    /// Collect users from a listing endpoint
    pub fn users(request: Request) -> Self {
        Self::new(request, user_handles)
    }
}

impl<T: Send> CollectStage<T> {
    /// Create a stage from a request and a mapper
    pub fn new(request: Request, map: fn(&ApiResponse) -> Result<Vec<T>>) -> Self {
        Self { request, map }
    }

    /// Run one pass from `cursor`
    ///
    /// Collected items are handed to `sink` and `cursor` is updated whatever
    /// the outcome. A done walk is [`StageResult::StageDone`] and a rate limit
    /// is [`StageResult::SleepUntil`]. Errors are returned as `Err`.
    pub async fn run<A, S>(&self, api: &A, cursor: &mut CollectLoopState, mut sink: S) -> Result<StageResult>
    where
        A: ApiRequester + ?Sized,
        S: FnMut(Vec<T>) + Send,
    {
        let result = collect(api, &self.request, cursor.clone(), self.map).await;
        *cursor = result.state;
        sink(result.collected_items);

        match result.result {
            LoopResult::Done => Ok(StageResult::StageDone),
            LoopResult::ResumeAfter(until) => Ok(StageResult::SleepUntil(until)),
            LoopResult::Error(error) => Err(error),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    /// Serve `source` in pages of `page_size`, cursor = index of the page's first item
    fn paged_source(source: Vec<UserHandle>, page_size: usize) -> impl Fn(&Request) -> ApiResponse {
        move |request| {
            let start: usize = request
                .params
                .get(PAGINATION_TOKEN_PARAM)
                .map(|t| t.parse().unwrap())
                .unwrap_or(0);
            let end = (start + page_size).min(source.len());
            let next = (end < source.len()).then(|| end.to_string());
            ok(user_page(&source[start..end], next.as_deref()))
        }
    }

    #[tokio::test]
    async fn test_collect_walks_all_pages() {
        let source = users(7);
        let page = paged_source(source.clone(), 3);
        let api = FakeApi::new(move |req, _| Ok(page(req)));

        let result = collect(&api, &Request::get("/2/tweets/1/liking_users"), CollectLoopState::default(), user_handles).await;

        assert!(result.result.is_done());
        assert_eq!(result.collected_items, source);
        assert_eq!(result.state, CollectLoopState::default());
        assert_eq!(api.calls().len(), 3);
        assert!(!api.calls()[0].params.contains_key(PAGINATION_TOKEN_PARAM));
        assert_eq!(api.calls()[1].params[PAGINATION_TOKEN_PARAM], "3");
    }

    #[tokio::test]
    async fn test_collect_skips_mapping_empty_pages() {
        let api = FakeApi::new(|_, _| Ok(ok(serde_json::json!({"meta": {"result_count": 0}}))));

        let result = collect(&api, &Request::get("/2/users/:id/muting"), CollectLoopState::default(), user_handles).await;

        assert!(result.result.is_done());
        assert!(result.collected_items.is_empty());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_resumes_at_next_page() {
        // Scenario: 5 items, one per page; the first page exhausts the quota
        let source = users(5);
        let page = paged_source(source.clone(), 1);
        let api = FakeApi::new(move |req, index| {
            let response = page(req);
            if index == 0 {
                Ok(ok_exhausted(response.body, 123))
            } else {
                Ok(response)
            }
        });
        let request = Request::get("/2/tweets/1/retweeted_by");

        let first = collect(&api, &request, CollectLoopState::default(), user_handles).await;
        let LoopResult::ResumeAfter(until) = first.result else {
            panic!("expected resume_after, got {:?}", first.result);
        };
        assert!(until > Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(first.collected_items, source[..1].to_vec());
        assert_eq!(first.state.pagination_token.as_deref(), Some("1"));

        let second = collect(&api, &request, first.state, user_handles).await;
        assert!(second.result.is_done());
        assert_eq!(second.collected_items, source[1..].to_vec());

        let mut all = first.collected_items;
        all.extend(second.collected_items);
        assert_eq!(all, source);
    }

    #[tokio::test]
    async fn test_suspend_resume_at_every_page_boundary_is_complete() {
        let source = users(11);
        for page_size in [1, 2, 4, 11, 20] {
            let page = paged_source(source.clone(), page_size);
            // Every page exhausts the quota, so each invocation fetches one page
            let api = FakeApi::new(move |req, _| Ok(ok_exhausted(page(req).body, 0)));
            let request = Request::get("/2/users/:id/followers");

            let mut state = CollectLoopState::default();
            let mut all = Vec::new();
            let mut invocations = 0;
            loop {
                invocations += 1;
                let result = collect(&api, &request, state, user_handles).await;
                all.extend(result.collected_items);
                state = result.state;
                match result.result {
                    LoopResult::Done => break,
                    LoopResult::ResumeAfter(_) => continue,
                    LoopResult::Error(e) => panic!("unexpected error: {}", e),
                }
            }

            assert_eq!(all, source, "page size {}", page_size);
            assert_eq!(invocations, source.len().div_ceil(page_size), "page size {}", page_size);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_partial_items_and_cursor() {
        let source = users(4);
        let page = paged_source(source.clone(), 2);
        let api = FakeApi::new(move |req, index| {
            if index == 1 {
                Err(rate_limited(4_000_000_000))
            } else {
                Ok(page(req))
            }
        });

        let result = collect(&api, &Request::get("/2/users/:id/following"), CollectLoopState::default(), user_handles).await;

        match result.result {
            LoopResult::ResumeAfter(until) => {
                assert_eq!(until, DateTime::from_timestamp(4_000_000_001, 0).unwrap());
            }
            other => panic!("expected resume_after, got {:?}", other),
        }
        assert_eq!(result.collected_items, source[..2].to_vec());
        assert_eq!(result.state.pagination_token.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_other_errors_stop_with_partial_items() {
        let source = users(4);
        let page = paged_source(source.clone(), 2);
        let api = FakeApi::new(move |req, index| match index {
            1 => Err(network_error()),
            2 => Err(api_error(503, serde_json::json!({"title": "Service Unavailable"}))),
            _ => Ok(page(req)),
        });
        let request = Request::get("/2/users/:id/following");

        let first = collect(&api, &request, CollectLoopState::default(), user_handles).await;
        assert!(matches!(first.result, LoopResult::Error(Error::Transport(_))));
        assert_eq!(first.collected_items.len(), 2);

        let second = collect(&api, &request, first.state.clone(), user_handles).await;
        assert!(matches!(second.result, LoopResult::Error(Error::Api(_))));
        assert!(second.collected_items.is_empty());
        assert_eq!(second.state, first.state);
    }

    #[tokio::test]
    async fn test_collect_stage_reports_stage_results() {
        let source = users(3);
        let page = paged_source(source.clone(), 2);
        let api = FakeApi::new(move |req, index| match index {
            0 => Ok(ok_exhausted(page(req).body, 0)),
            _ => Ok(page(req)),
        });
        let stage = CollectStage::users(Request::get("/2/users/:id/followers"));
        let mut cursor = CollectLoopState::default();
        let mut sink: Vec<UserHandle> = Vec::new();

        let first = stage.run(&api, &mut cursor, |items| sink.extend(items)).await.unwrap();
        assert!(matches!(first, StageResult::SleepUntil(_)));
        assert_eq!(cursor.pagination_token.as_deref(), Some("2"));

        let second = stage.run(&api, &mut cursor, |items| sink.extend(items)).await.unwrap();
        assert_eq!(second, StageResult::StageDone);
        assert_eq!(cursor, CollectLoopState::default());
        assert_eq!(sink, source);
    }
}
