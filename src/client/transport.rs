//! HTTP transport seam.
//!
//! [`ApiClient`](super::ApiClient) never talks to `reqwest` directly; it hands a
//! fully prepared [`HttpRequest`] to an [`HttpTransport`]. Transports return any
//! response they receive, whatever the status, and fail only when no response
//! was received.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ApiConfig;
use crate::retry::{RATE_LIMIT_REMAINING, RATE_LIMIT_RESET, parse_reset, quota_exhausted};
use crate::{Error, Result};

/// HTTP method of an API call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A fully resolved outbound call
#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Absolute URL including the query string
    pub url: String,
    /// Header names are lower-case; ordered so cache keys are stable
    pub headers: BTreeMap<String, String>,
    /// Encoded body
    pub body: Option<String>,
}

/// A response received from the API
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApiResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers, lower-cased names
    pub headers: HashMap<String, String>,
    /// Body parsed as JSON (`Value::Null` if empty, `Value::String` if not JSON)
    pub body: Value,
}

impl ApiResponse {
    /// Look up a header by (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The rate-limit reset time if this response exhausted the quota
    ///
    /// `Some(None)` means the quota is exhausted but the reset header could not be parsed.
    pub fn exhausted_quota(&self) -> Option<Option<chrono::DateTime<chrono::Utc>>> {
        let reset = self.header(RATE_LIMIT_RESET);
        quota_exhausted(self.header(RATE_LIMIT_REMAINING), reset).then(|| parse_reset(reset))
    }
}

/// Sends prepared requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one request; non-2xx statuses are returned, not raised
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse>;
}

/// [`HttpTransport`] backed by a shared `reqwest::Client`
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the configured timeout and user agent
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(non_zero(config.request_timeout))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn non_zero(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse> {
        let mut builder = self
            .client
            .request(request.method.into(), request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let bytes = response.bytes().await?;

        Ok(ApiResponse {
            status,
            headers,
            body: parse_body(&bytes),
        })
    }
}

/// Decode a response body: empty is `Null`, invalid JSON is kept as a string
pub(crate) fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(b"  \n"), Value::Null);
        assert_eq!(parse_body(br#"{"a": 1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_body(b"Bad Gateway"), Value::String("Bad Gateway".into()));
    }

    #[test]
    fn test_exhausted_quota() {
        let mut response = ApiResponse {
            status: 200,
            ..Default::default()
        };
        assert_eq!(response.exhausted_quota(), None);

        response
            .headers
            .insert("x-rate-limit-remaining".into(), "0".into());
        assert_eq!(response.exhausted_quota(), None);

        response
            .headers
            .insert("x-rate-limit-reset".into(), "1700000000".into());
        assert_eq!(
            response.exhausted_quota(),
            Some(chrono::DateTime::from_timestamp(1_700_000_000, 0))
        );
    }

    #[test]
    fn test_method_serializes_upper_case() {
        assert_eq!(serde_json::to_value(Method::Post).unwrap(), "POST");
        assert_eq!(Method::Delete.as_str(), "DELETE");
    }
}
