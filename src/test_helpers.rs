//! Shared test helpers: a scripted API requester and temporary databases.

use crate::client::{ApiRequester, ApiResponse, Request};
use crate::config::RateLimitConfig;
use crate::db::Database;
use crate::error::ApiFailure;
use crate::types::UserHandle;
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

type Responder = Box<dyn Fn(&Request, usize) -> Result<ApiResponse> + Send + Sync>;

/// [`ApiRequester`] answering from a closure given the request and the call index
pub(crate) struct FakeApi {
    respond: Responder,
    calls: Mutex<Vec<Request>>,
    limits: RateLimitConfig,
}

impl FakeApi {
    pub(crate) fn new(
        respond: impl Fn(&Request, usize) -> Result<ApiResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
            limits: RateLimitConfig::default(),
        }
    }

    /// Every request received so far
    pub(crate) fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiRequester for FakeApi {
    async fn request(&self, request: &Request) -> Result<ApiResponse> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };
        (self.respond)(request, index)
    }

    fn rate_limits(&self) -> &RateLimitConfig {
        &self.limits
    }
}

/// A 200 response
pub(crate) fn ok(body: Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        headers: HashMap::new(),
        body,
    }
}

/// A 200 response reporting an exhausted quota
pub(crate) fn ok_exhausted(body: Value, reset: i64) -> ApiResponse {
    ApiResponse {
        status: 200,
        headers: HashMap::from([
            ("x-rate-limit-remaining".to_string(), "0".to_string()),
            ("x-rate-limit-reset".to_string(), reset.to_string()),
        ]),
        body,
    }
}

/// An API error with a response
pub(crate) fn api_error(status: u16, body: Value) -> Error {
    Error::Api(ApiFailure {
        status,
        headers: HashMap::new(),
        body,
    })
}

/// A 429 with a reset header
pub(crate) fn rate_limited(reset: i64) -> Error {
    Error::Api(ApiFailure {
        status: 429,
        headers: HashMap::from([("x-rate-limit-reset".to_string(), reset.to_string())]),
        body: json!({"title": "Too Many Requests"}),
    })
}

/// A failure without a response
pub(crate) fn network_error() -> Error {
    Error::Transport("connection reset by peer".into())
}

/// One page of a user listing
pub(crate) fn user_page(users: &[UserHandle], next_token: Option<&str>) -> Value {
    let mut meta = json!({"result_count": users.len()});
    if let Some(token) = next_token {
        meta["next_token"] = json!(token);
    }
    let mut body = json!({"meta": meta});
    if !users.is_empty() {
        body["data"] = json!(users);
    }
    body
}

/// `n` users with ids "1".."n"
pub(crate) fn users(n: usize) -> Vec<UserHandle> {
    (1..=n)
        .map(|i| UserHandle::new(i.to_string(), format!("user{}", i)))
        .collect()
}

/// A fresh database in a temp file (keep the file alive for the test)
pub(crate) async fn test_db() -> (Arc<Database>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (Arc::new(db), temp_file)
}
