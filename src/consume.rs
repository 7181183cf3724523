//! Queue consumption loop
//!
//! [`consume`] drains a work queue one API call per item. Every item ends up
//! in exactly one place: handed to [`ItemOutcome::succeeded`], handed to
//! [`ItemOutcome::failed`], or still in the queue for a later invocation.
//!
//! | call result | item | loop |
//! |---|---|---|
//! | success | `succeeded` | continue, or resume after reset if the quota is exhausted |
//! | 429 | requeued at the front | resume after reset |
//! | token rejected (400, token invalid) | requeued at the front | error |
//! | other API error | `failed` | continue |
//! | `failed` itself errors | requeued at the front | error |
//! | no response | requeued at the front | error |

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, warn};

use crate::client::{ApiRequester, ApiResponse, Request};
use crate::error::Error;
use crate::pagination::LoopResult;
use crate::retry::{FailureClass, RATE_LIMIT_RESET, classify, parse_reset, resume_time};
use crate::Result;

/// Per-item callbacks of [`consume`]
#[async_trait]
pub trait ItemOutcome<T: Sync>: Send {
    /// The item failed permanently; record it
    ///
    /// Returning an error puts the item back at the front of the queue and stops the loop.
    async fn failed(&mut self, item: &T, error: &Error) -> Result<()>;

    /// The item's call succeeded
    async fn succeeded(&mut self, _item: &T, _response: &ApiResponse) {}
}

/// Drain `items` from the front, one call per item
///
/// Returns [`LoopResult::Done`] only when the queue empties without an early stop.
pub async fn consume<T, A, R, O>(
    api: &A,
    items: &mut VecDeque<T>,
    mk_request: R,
    outcome: &mut O,
) -> LoopResult
where
    T: Send + Sync,
    A: ApiRequester + ?Sized,
    R: Fn(&T) -> Request + Send + Sync,
    O: ItemOutcome<T> + ?Sized,
{
    while let Some(item) = items.pop_front() {
        let request = mk_request(&item);
        let error = match api.request(&request).await {
            Ok(response) => {
                outcome.succeeded(&item, &response).await;
                if let Some(reset) = response.exhausted_quota() {
                    // The item succeeded, so it is not requeued
                    return LoopResult::ResumeAfter(resume_time(
                        api.rate_limits(),
                        reset,
                        Utc::now(),
                    ));
                }
                continue;
            }
            Err(error) => error,
        };

        match classify(&error) {
            FailureClass::RateLimited => {
                let reset = parse_reset(error.response().and_then(|f| f.header(RATE_LIMIT_RESET)));
                items.push_front(item);
                return LoopResult::ResumeAfter(resume_time(api.rate_limits(), reset, Utc::now()));
            }
            FailureClass::TokenDesync => {
                warn!(endpoint = %request.endpoint, "token rejected, waiting for a refreshed token");
                items.push_front(item);
                return LoopResult::Error(error);
            }
            FailureClass::Transient => {
                items.push_front(item);
                return LoopResult::Error(error);
            }
            FailureClass::Permanent => {
                if let Err(callback_error) = outcome.failed(&item, &error).await {
                    error!(
                        endpoint = %request.endpoint,
                        error = %callback_error,
                        original_error = %error,
                        "could not record failed item, requeueing"
                    );
                    items.push_front(item);
                    return LoopResult::Error(callback_error);
                }
            }
        }
    }

    LoopResult::Done
}
