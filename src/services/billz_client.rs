//! Authenticated HTTP client for the Billz inventory/billing API.
//!
//! The client owns an injectable [`TokenCache`] (one instance per external
//! system) and performs generic requests with:
//! - a cached bearer token refreshed under double-checked locking,
//! - `vN` version splicing between the configured base URL and request path,
//! - a single refresh-and-retry on 401 for cache-sourced tokens.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

/// Outbound HTTP timeout for every Billz call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// A token within this window of its expiry is treated as already expired.
const TOKEN_REFRESH_LEEWAY: Duration = Duration::from_secs(30);

/// Fallback token lifetime when the auth response omits `expires_in`.
const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum BillzError {
    #[error("BILLZ_API_SECRET_KEY is not configured")]
    MissingSecret,

    #[error("billz auth request failed: status {status}, body: {body}")]
    AuthFailed { status: StatusCode, body: String },

    #[error("billz auth response missing access_token")]
    MissingToken,

    #[error("invalid billz base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("request path is required")]
    EmptyPath,

    #[error("{action}: status {status} body {body}")]
    UnexpectedStatus {
        action: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("billz request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Connection settings for one Billz tenant.
#[derive(Debug, Clone)]
pub struct BillzConfig {
    pub auth_url: String,
    pub base_url: String,
    pub api_secret_key: String,
    pub shop_id: String,
    pub cashbox_id: String,
    pub payment_type_id: String,
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_LEEWAY < self.expires_at
    }
}

/// Bearer token cache guarded by a read/write lock.
///
/// Each external system owns its own instance; readers take the fast path
/// while the token is fresh, writers re-check under the lock before
/// refreshing so concurrent expiries trigger a single login call.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn fresh(&self) -> Option<String> {
        let slot = self.slot.read().await;
        slot.as_ref()
            .filter(|cached| cached.is_fresh())
            .map(|cached| cached.token.clone())
    }

    /// Run `fetch` under the write lock and store its token.
    ///
    /// Unless `force` is set, the cache is re-checked after the lock is
    /// acquired, so workers queued behind an in-flight refresh reuse its
    /// result instead of logging in again.
    pub(crate) async fn refresh_with<F, Fut, E>(&self, force: bool, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), E>>,
    {
        let mut slot = self.slot.write().await;

        if !force {
            if let Some(cached) = slot.as_ref().filter(|cached| cached.is_fresh()) {
                return Ok(cached.token.clone());
            }
        }

        let (token, ttl) = fetch().await?;
        *slot = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + ttl,
        });

        Ok(token)
    }
}

/// Inputs for a generic Billz API call.
#[derive(Debug)]
pub struct BillzRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Caller-supplied token bypassing the cache. A 401 with this token is
    /// not retried; the caller owns that credential's lifecycle.
    pub token: Option<String>,
}

impl BillzRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            token: None,
        }
    }
}

/// Raw HTTP outcome of a Billz call; callers interpret the status.
#[derive(Debug)]
pub struct BillzResponse {
    pub status: StatusCode,
    pub body: String,
}

impl BillzResponse {
    /// Surface a non-2xx response as an error carrying status and body.
    pub fn ensure_success(self, action: &'static str) -> Result<Self, BillzError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(BillzError::UnexpectedStatus {
                action,
                status: self.status,
                body: self.body,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    data: AuthData,
}

#[derive(Debug, Default, Deserialize)]
struct AuthData {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Clone)]
pub struct BillzClient {
    http: reqwest::Client,
    config: Arc<BillzConfig>,
    token_cache: Arc<TokenCache>,
}

impl BillzClient {
    pub fn new(config: BillzConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            config: Arc::new(config),
            token_cache: Arc::new(TokenCache::new()),
        }
    }

    pub fn config(&self) -> &BillzConfig {
        &self.config
    }

    /// Return a cached access token, fetching a new one if needed.
    async fn token(&self) -> Result<String, BillzError> {
        if let Some(token) = self.token_cache.fresh().await {
            return Ok(token);
        }
        self.fetch_token(false).await
    }

    /// Obtain a token from the login endpoint, updating the cache.
    async fn fetch_token(&self, force: bool) -> Result<String, BillzError> {
        self.token_cache
            .refresh_with(force, || self.login())
            .await
    }

    async fn login(&self) -> Result<(String, Duration), BillzError> {
        let secret = self.config.api_secret_key.trim();
        if secret.is_empty() {
            return Err(BillzError::MissingSecret);
        }

        let response = self
            .http
            .post(self.config.auth_url.trim_end_matches('/'))
            .timeout(HTTP_TIMEOUT)
            .json(&serde_json::json!({ "secret_token": secret }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BillzError::AuthFailed { status, body });
        }

        let auth: AuthResponse =
            serde_json::from_str(&body).map_err(|_| BillzError::MissingToken)?;
        if auth.data.access_token.is_empty() {
            return Err(BillzError::MissingToken);
        }

        let ttl = if auth.data.expires_in > 0 {
            Duration::from_secs(auth.data.expires_in as u64)
        } else {
            FALLBACK_TOKEN_TTL
        };

        Ok((auth.data.access_token, ttl))
    }

    /// Perform a generic Billz API request, retrying once on 401.
    ///
    /// The retry only applies when the token came from the cache: the stale
    /// token is refreshed under the write lock and the request is re-sent
    /// exactly once. Non-2xx responses are returned as-is for the caller to
    /// interpret.
    pub async fn request(&self, request: BillzRequest) -> Result<BillzResponse, BillzError> {
        if request.path.trim_matches('/').is_empty() {
            return Err(BillzError::EmptyPath);
        }

        let url = build_url(&self.config.base_url, &request.path, &request.query)?;

        let caller_token = request.token.clone();
        let token = match &caller_token {
            Some(token) => token.clone(),
            None => self.token().await?,
        };

        let response = self.send(&request, url.clone(), &token).await?;
        if response.status != StatusCode::UNAUTHORIZED || caller_token.is_some() {
            return Ok(response);
        }

        // Cached token likely expired between the freshness check and the
        // call; refresh once and retry.
        let token = self.fetch_token(true).await?;
        self.send(&request, url, &token).await
    }

    async fn send(
        &self,
        request: &BillzRequest,
        url: Url,
        token: &str,
    ) -> Result<BillzResponse, BillzError> {
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .timeout(HTTP_TIMEOUT)
            .bearer_auth(token);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        Ok(BillzResponse { status, body })
    }
}

/// Join the configured base URL and a request path, splicing the `vN`
/// version segment so it is never duplicated or dropped. A version in the
/// request path wins over one trailing the base path.
fn build_url(base_url: &str, path: &str, query: &[(String, String)]) -> Result<Url, BillzError> {
    let mut url = Url::parse(base_url.trim_end_matches('/'))?;

    let path = path.trim_start_matches('/');
    let mut segments: Vec<String> = split_path_segments(url.path());

    match split_version_segment(path) {
        Some((version, remainder)) => {
            if segments.last().is_some_and(|seg| is_version_segment(seg)) {
                segments.pop();
            }
            segments.push(version.to_string());
            segments.extend(split_path_segments(remainder));
        }
        None => segments.extend(split_path_segments(path)),
    }

    url.set_path(&format!("/{}", segments.join("/")));

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }

    Ok(url)
}

/// A version segment is `v` followed by one or more digits.
fn is_version_segment(segment: &str) -> bool {
    segment.len() >= 2
        && segment.starts_with('v')
        && segment[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Split a leading version segment off `path`, if present.
fn split_version_segment(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    let (head, tail) = match path.split_once('/') {
        Some((head, tail)) => (head, tail),
        None => (path, ""),
    };
    is_version_segment(head).then_some((head, tail))
}

fn split_path_segments(path: &str) -> Vec<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|seg| !seg.is_empty())
        .map(str::to_string)
        .collect()
}
