//! Scripted transport for tests and harnesses.
//!
//! [`FakeFetcher`] plays back per-URL scripts and records every request it
//! sees, so policy tests can assert not just what a caller received but
//! whether the network was touched at all. The real transport keeps wiremock
//! coverage; everything above the [`Fetch`](crate::Fetch) seam tests against
//! this double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::{CacheMode, Fetch, NetError, Request, RequestMode, Response};

/// One scripted behavior for a URL.
enum Script {
    Respond {
        status: StatusCode,
        content_type: String,
        body: Bytes,
    },
    Fail(String),
}

/// A request observed by the fake transport.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
}

/// Scripted [`Fetch`] implementation.
///
/// All mutators take `&self` so a test can hold the fetcher in an `Arc`,
/// hand clones to the subsystem under test, and still flip it offline or
/// re-script URLs mid-scenario.
#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, Script>>,
    offline: AtomicBool,
    log: Mutex<Vec<RequestRecord>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_key(url: &str) -> String {
        // Normalize through Url so "https://host" and "https://host/" meet.
        Url::parse(url)
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|_| url.to_string())
    }

    /// Script a response for a URL.
    pub fn respond(&self, url: &str, status: u16, content_type: &str, body: impl Into<Bytes>) {
        let script = Script::Respond {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
            content_type: content_type.to_string(),
            body: body.into(),
        };
        self.routes
            .lock()
            .expect("route table lock")
            .insert(Self::route_key(url), script);
    }

    /// Script a 200 text/html response.
    pub fn respond_html(&self, url: &str, body: &str) {
        self.respond(url, 200, "text/html", body.to_string());
    }

    /// Script a 200 application/json response.
    pub fn respond_json(&self, url: &str, body: &serde_json::Value) {
        self.respond(url, 200, "application/json", body.to_string());
    }

    /// Script a transport failure (rejection) for a URL.
    pub fn fail(&self, url: &str, reason: &str) {
        self.routes
            .lock()
            .expect("route table lock")
            .insert(Self::route_key(url), Script::Fail(reason.to_string()));
    }

    /// Drop any script for a URL; subsequent fetches resolve with 404.
    pub fn forget(&self, url: &str) {
        self.routes
            .lock()
            .expect("route table lock")
            .remove(&Self::route_key(url));
    }

    /// Reject every request while set, regardless of scripts.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of every request seen so far.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.log.lock().expect("request log lock").clone()
    }

    /// How many times a URL has been requested.
    pub fn hits(&self, url: &str) -> usize {
        let key = Self::route_key(url);
        self.log
            .lock()
            .expect("request log lock")
            .iter()
            .filter(|r| r.url.as_str() == key)
            .count()
    }

    fn serve(&self, request: Request) -> Result<Response, NetError> {
        self.log
            .lock()
            .expect("request log lock")
            .push(RequestRecord {
                url: request.url.clone(),
                method: request.method.clone(),
                mode: request.mode,
                cache_mode: request.cache_mode,
            });

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Unreachable("offline".to_string()));
        }

        let routes = self.routes.lock().expect("route table lock");
        match routes.get(request.url.as_str()) {
            Some(Script::Respond {
                status,
                content_type,
                body,
            }) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(content_type) {
                    headers.insert(http::header::CONTENT_TYPE, value);
                }
                Ok(Response {
                    status: *status,
                    headers,
                    body: body.clone(),
                    url: request.url,
                })
            }
            Some(Script::Fail(reason)) => Err(NetError::RequestFailed(reason.clone())),
            // Unknown URLs resolve (the server answered) rather than reject.
            None => Ok(Response::plain_text(
                StatusCode::NOT_FOUND,
                request.url,
                "not found",
            )),
        }
    }
}

impl Fetch for FakeFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        let result = self.serve(request);
        Box::pin(async move { result })
    }
}
