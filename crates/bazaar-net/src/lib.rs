//! # Bazaar Net
//!
//! Fetch model and HTTP transport for the Bazaar offline subsystem.
//!
//! ## Design Goals
//!
//! 1. **One request/response vocabulary** shared by the page context, the
//!    worker context, and the cache store
//! 2. **A swappable transport** behind the [`Fetch`] trait, so the worker's
//!    policy code never knows whether bytes came from the real network or a
//!    scripted test double
//! 3. **Synthesized responses**: the worker must be able to answer a request
//!    the network never saw (offline fallbacks, configuration errors)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

pub mod testing;

/// Errors that can occur in the transport layer.
///
/// Every variant counts as a *rejected* request for the worker's fallback
/// logic; the distinction only matters for diagnostics.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request, for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a request relates to the page that issued it.
///
/// The worker's policy only branches on [`RequestMode::Navigate`]; the
/// remaining variants exist so callers can state intent faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Subresource fetch without CORS.
    #[default]
    NoCors,
    /// Subresource fetch with CORS.
    Cors,
    /// Request restricted to the page's own origin.
    SameOrigin,
}

/// Transport-level cache directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Normal transport behavior.
    #[default]
    Default,
    /// Forbid any transport or intermediary cache from storing or serving
    /// this exchange.
    NoStore,
}

/// A request as seen by the worker's classifier.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET request for a subresource.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::NoCors,
            cache_mode: CacheMode::Default,
            body: None,
        }
    }

    /// Create a GET request for a top-level navigation.
    pub fn navigation(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            mode: RequestMode::Cors,
            cache_mode: CacheMode::Default,
            body: Some(body),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Disable transport caching for this request.
    pub fn no_store(mut self) -> Self {
        self.cache_mode = CacheMode::NoStore;
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the URL uses an HTTP(S) scheme.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// A captured response: status, headers and the full body.
///
/// Cloning is cheap (the body is reference-counted), which is what lets the
/// worker hand one copy to the cache and the other to the caller.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final URL (after transport-level redirects).
    pub url: Url,
}

impl Response {
    /// Build a response with the given status, content type and body.
    pub fn with_body(
        status: StatusCode,
        url: Url,
        content_type: &'static str,
        body: impl Into<Bytes>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        Self {
            status,
            headers,
            body: body.into(),
            url,
        }
    }

    /// Synthesize a JSON response.
    pub fn json_body(status: StatusCode, url: Url, body: &serde_json::Value) -> Self {
        Self::with_body(status, url, "application/json", body.to_string())
    }

    /// Synthesize a plain-text response.
    pub fn plain_text(status: StatusCode, url: Url, body: &str) -> Self {
        Self::with_body(status, url, "text/plain", body.to_string())
    }

    /// Check if the response is a success (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed content type, if present and well-formed.
    pub fn content_type(&self) -> Option<Mime> {
        self.header("content-type").and_then(|s| s.parse().ok())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Deserialize the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The transport seam.
///
/// Implemented by the real HTTP client, by the scripted test fetcher, and by
/// the page context itself (which routes through the controlling worker).
pub trait Fetch: Send + Sync {
    /// Perform the request, resolving with whatever the transport produced
    /// or rejecting when no response could be obtained at all.
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// User agent string.
    pub user_agent: String,
    /// Connect + response timeout.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Bazaar/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Real HTTP transport backed by reqwest.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Create a transport with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }

    async fn execute(&self, request: Request) -> Result<Response, NetError> {
        debug!(id = request.id.raw(), url = %request.url, method = %request.method, "transport fetch");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        // No-store requests must not be served or stored by any HTTP cache
        // between us and the origin.
        if request.cache_mode == CacheMode::NoStore {
            builder = builder
                .header(http::header::CACHE_CONTROL, "no-store")
                .header(http::header::PRAGMA, "no-cache");
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            id = request.id.raw(),
            url = %url,
            status = %status,
            body_len = body.len(),
            "transport response"
        );

        Ok(Response {
            status,
            headers,
            body,
            url,
        })
    }
}

impl Fetch for HttpClient {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.execute(request))
    }
}
