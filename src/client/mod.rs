//! Authenticated request layer.
//!
//! [`ApiClient`] issues single API calls:
//! - `/:id/` in an endpoint is replaced with the authenticated account's id
//! - relative endpoints are resolved against the configured base URL; absolute
//!   URLs keep their path but are sent to the base URL's host
//! - the stored bearer token is attached
//! - `cache: true` requests are served from and stored into the response cache
//! - a 401 triggers exactly one retry, after a token refresh unless another
//!   caller already refreshed the token
//!
//! The collection and consumption loops depend only on [`ApiRequester`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{Config, RateLimitConfig};
use crate::db::{CachedResponse, Database};
use crate::error::ApiFailure;
use crate::{Error, Result};

mod transport;

pub use transport::{ApiResponse, HttpRequest, HttpTransport, Method, ReqwestTransport};

/// Placeholder substituted with the authenticated account's id
pub const SELF_ID_PLACEHOLDER: &str = "/:id/";

/// Token exchange endpoint
pub const TOKEN_ENDPOINT: &str = "/2/oauth2/token";

/// One API call, before authentication and URL resolution
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Endpoint path (`/2/...`) or absolute URL; may contain `/:id/`
    pub endpoint: String,
    /// Query parameters
    pub params: BTreeMap<String, String>,
    /// JSON body
    pub data: Option<Value>,
    /// Serve from / store into the response cache
    pub cache: bool,
}

impl Request {
    /// A GET request
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// A POST request with a JSON body
    pub fn post(endpoint: impl Into<String>, data: Value) -> Self {
        Self {
            method: Method::Post,
            endpoint: endpoint.into(),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Add a query parameter
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Request response caching
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }
}

/// Issues authenticated API calls
///
/// Implemented by [`ApiClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait ApiRequester: Send + Sync {
    /// Issue one call; non-2xx responses are returned as [`Error::Api`]
    async fn request(&self, request: &Request) -> Result<ApiResponse>;

    /// Rate-limit policy applied by the loops driving this requester
    fn rate_limits(&self) -> &RateLimitConfig;
}

/// The API client
pub struct ApiClient {
    db: Arc<Database>,
    transport: Arc<dyn HttpTransport>,
    base_url: Url,
    client_id: String,
    rate_limits: RateLimitConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl ApiClient {
    /// Create a client sending through `reqwest`
    pub fn new(config: &Config, db: Arc<Database>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config.api)?);
        Self::with_transport(config, db, transport)
    }

    /// Create a client sending through a custom transport
    pub fn with_transport(
        config: &Config,
        db: Arc<Database>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let base_url = Url::parse(&config.api.base_url).map_err(|e| Error::Config {
            message: format!("invalid base URL {:?}: {}", config.api.base_url, e),
            key: Some("api.base_url".into()),
        })?;
        Ok(Self {
            db,
            transport,
            base_url,
            client_id: config.api.client_id.clone(),
            rate_limits: config.rate_limit.clone(),
        })
    }

    /// GET an endpoint
    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(&Request::get(endpoint)).await
    }

    /// POST a JSON body to an endpoint
    pub async fn post(&self, endpoint: &str, data: Value) -> Result<ApiResponse> {
        self.request(&Request::post(endpoint, data)).await
    }

    /// Exchange the stored refresh token for a new token set
    ///
    /// The new tokens are merged into the stored credentials. Returns the new
    /// access token. Failures are returned unchanged; a rejected exchange is an
    /// [`Error::Api`] carrying the token endpoint's response.
    pub async fn refresh_token(&self) -> Result<String> {
        let refresh_token = self
            .db
            .refresh_token()
            .await?
            .ok_or_else(|| Error::Auth("no refresh token stored".into()))?;

        let body = format!(
            "grant_type=refresh_token&client_id={}&refresh_token={}",
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&refresh_token)
        );
        let request = HttpRequest {
            method: Method::Post,
            url: self.resolve_url(TOKEN_ENDPOINT, &BTreeMap::new())?,
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )]),
            body: Some(body),
        };

        let response = self.send(request).await?;
        let tokens: TokenResponse = serde_json::from_value(response.body)?;
        self.db
            .update_token(&tokens.access_token, tokens.refresh_token.as_deref())
            .await?;

        info!("access token refreshed");
        Ok(tokens.access_token)
    }

    async fn prepare(&self, request: &Request) -> Result<Prepared> {
        let endpoint = if request.endpoint.contains(SELF_ID_PLACEHOLDER) {
            let me = self.db.self_user().await?.ok_or_else(|| {
                Error::Auth(format!(
                    "endpoint {} needs the authenticated account, but none is stored",
                    request.endpoint
                ))
            })?;
            request
                .endpoint
                .replacen(SELF_ID_PLACEHOLDER, &format!("/{}/", me.id), 1)
        } else {
            request.endpoint.clone()
        };

        let body = request.data.as_ref().map(serde_json::to_string).transpose()?;
        Ok(Prepared {
            method: request.method,
            url: self.resolve_url(&endpoint, &request.params)?,
            body,
            cache: request.cache,
        })
    }

    fn resolve_url(&self, endpoint: &str, params: &BTreeMap<String, String>) -> Result<String> {
        let mut url = if endpoint.starts_with('/') {
            Url::parse(&format!(
                "{}{}",
                self.base_url.as_str().trim_end_matches('/'),
                endpoint
            ))?
        } else {
            let mut url = Url::parse(endpoint)?;
            url.set_scheme(self.base_url.scheme())
                .map_err(|_| Error::InvalidRequest(format!("cannot proxy {}", endpoint)))?;
            url.set_host(self.base_url.host_str())?;
            url.set_port(self.base_url.port())
                .map_err(|_| Error::InvalidRequest(format!("cannot proxy {}", endpoint)))?;
            url
        };
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url.to_string())
    }

    /// Send with `token`, going through the response cache when requested
    async fn attempt(&self, prepared: &Prepared, token: &str) -> Result<ApiResponse> {
        let request = prepared.to_http(token);
        if !prepared.cache {
            return self.send(request).await;
        }

        let key = cache_key(&request);
        if let Some(cached) = self.db.cache_get(&key).await? {
            debug!(url = %request.url, "response cache hit");
            return Ok(ApiResponse {
                status: cached.status,
                body: cached.body,
                ..Default::default()
            });
        }

        let response = self.send(request).await?;
        self.db
            .cache_put(
                &key,
                &CachedResponse {
                    status: response.status,
                    body: response.body.clone(),
                },
            )
            .await?;
        Ok(response)
    }

    /// Send and turn non-2xx statuses into [`Error::Api`]
    async fn send(&self, request: HttpRequest) -> Result<ApiResponse> {
        let method = request.method;
        let url = request.url.clone();
        let response = self.transport.send(request).await?;
        if response.is_success() {
            return Ok(response);
        }
        debug!(method = method.as_str(), url = %url, status = response.status, "API call failed");
        Err(Error::Api(ApiFailure {
            status: response.status,
            headers: response.headers,
            body: response.body,
        }))
    }
}

#[async_trait]
impl ApiRequester for ApiClient {
    async fn request(&self, request: &Request) -> Result<ApiResponse> {
        let prepared = self.prepare(request).await?;
        let token = self
            .db
            .access_token()
            .await?
            .ok_or_else(|| Error::Auth("not authenticated".into()))?;

        match self.attempt(&prepared, &token).await {
            Err(Error::Api(failure)) if failure.status == 401 => {
                let fresh = match self.db.access_token().await? {
                    Some(current) if current != token => {
                        debug!("token was refreshed by another caller, retrying");
                        current
                    }
                    _ => {
                        warn!(url = %prepared.url, "access token rejected, refreshing");
                        self.refresh_token().await?
                    }
                };
                self.attempt(&prepared, &fresh).await
            }
            other => other,
        }
    }

    fn rate_limits(&self) -> &RateLimitConfig {
        &self.rate_limits
    }
}

/// A request with its URL resolved and body encoded, ready for a token
struct Prepared {
    method: Method,
    url: String,
    body: Option<String>,
    cache: bool,
}

impl Prepared {
    fn to_http(&self, token: &str) -> HttpRequest {
        let mut headers = BTreeMap::new();
        headers.insert("authorization".to_string(), format!("Bearer {}", token));
        if self.body.is_some() {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        HttpRequest {
            method: self.method,
            url: self.url.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

/// Cache key: SHA-256 over method, URL and headers
fn cache_key(request: &HttpRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str());
    hasher.update(b"\n");
    hasher.update(&request.url);
    for (name, value) in &request.headers {
        hasher.update(b"\n");
        hasher.update(name);
        hasher.update(b": ");
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
