//! The worker execution context.
//!
//! One [`WorkerContext`] exists per registered script version. It owns
//! the version's policy table and runs the three lifecycle entry
//! points: install (precache population), activate (generation
//! eviction and client claim) and the fetch/message handlers that
//! service controlled pages.

use std::sync::Arc;

use http::{Method, StatusCode};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use bazaar_net::{Fetch, Request, Response};

use crate::cache::{request_key, CacheEntry, CacheStorage};
use crate::clients::Clients;
use crate::lifecycle::{ServiceWorker, WorkerMessage};
use crate::policy::{FetchPolicy, Strategy};
use crate::SwError;

/// Per-deployment script parameters.
///
/// Everything a deployed worker script would carry as constants: its
/// version label, the asset manifest, and the paths the policy table
/// is built from.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    /// Version label; doubles as the name of the cache generation this
    /// version owns. Changes on every deployment.
    pub version: String,
    /// Origin the storefront is served from.
    pub origin: Url,
    /// App-shell paths populated at install time.
    pub precache: Vec<String>,
    /// Path of the offline fallback document.
    pub offline_path: String,
    /// Path of the runtime configuration document.
    pub config_path: String,
    /// Path fragment identifying backend API calls.
    pub api_path_fragment: String,
    /// Host suffixes identifying backend API gateways.
    pub api_host_suffixes: Vec<String>,
}

impl WorkerScript {
    pub fn new(version: &str, origin: Url) -> Self {
        Self {
            version: version.to_string(),
            origin,
            precache: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/manifest.webmanifest".to_string(),
            ],
            offline_path: "/offline.html".to_string(),
            config_path: "/env.json".to_string(),
            api_path_fragment: "/api/".to_string(),
            api_host_suffixes: Vec::new(),
        }
    }

    /// Replace the precache manifest.
    pub fn with_precache(mut self, paths: &[&str]) -> Self {
        self.precache = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Add a backend API host suffix.
    pub fn with_api_host_suffix(mut self, suffix: &str) -> Self {
        self.api_host_suffixes.push(suffix.to_string());
        self
    }

    /// Policy table for this deployment.
    pub fn policy(&self) -> FetchPolicy {
        FetchPolicy::storefront(
            &self.config_path,
            &self.api_path_fragment,
            &self.api_host_suffixes,
        )
    }

    /// Resolves an app-shell path against the origin.
    pub fn asset_url(&self, path: &str) -> Result<Url, SwError> {
        self.origin
            .join(path)
            .map_err(|e| SwError::InvalidPath(format!("{path}: {e}")))
    }

    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    fn origin_usable(&self) -> bool {
        !self.origin.cannot_be_a_base() && matches!(self.origin.scheme(), "http" | "https")
    }
}

/// Outcome of routing one request through a worker.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker produced the response, whether from the network, the
    /// cache, or synthesis.
    Handled(Response),
    /// The worker declined; the caller talks to the network itself.
    Passthrough,
}

impl FetchOutcome {
    /// The response, if the worker handled the request.
    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Handled(response) => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }
}

/// A running worker instance.
pub struct WorkerContext {
    worker: Arc<ServiceWorker>,
    script: WorkerScript,
    policy: FetchPolicy,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetch>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker", &self.worker)
            .field("script", &self.script)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    pub(crate) fn new(
        script: WorkerScript,
        caches: Arc<RwLock<CacheStorage>>,
        clients: Arc<RwLock<Clients>>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        let policy = script.policy();
        Self {
            worker: Arc::new(ServiceWorker::new(&script.version)),
            script,
            policy,
            caches,
            clients,
            fetcher,
        }
    }

    pub fn worker(&self) -> &Arc<ServiceWorker> {
        &self.worker
    }

    pub fn script(&self) -> &WorkerScript {
        &self.script
    }

    pub fn version(&self) -> &str {
        &self.script.version
    }

    /// Install step: open this version's cache generation and populate
    /// it from the precache manifest.
    ///
    /// Population is best effort. An entry that cannot be fetched, or
    /// that answers with anything but a success status, is skipped with
    /// a warning and does not fail the install. The step itself fails
    /// only when the script's origin cannot serve worker traffic at
    /// all, in which case the host discards the version as redundant.
    pub async fn install(&self) -> Result<(), SwError> {
        if !self.script.origin_usable() {
            return Err(SwError::InstallFailed(format!(
                "origin {} cannot serve worker traffic",
                self.script.origin
            )));
        }

        info!(
            worker = %self.worker.id(),
            version = %self.script.version,
            assets = self.script.precache.len(),
            "installing"
        );

        // The generation must exist after install even if every
        // manifest entry fails.
        self.caches.write().await.open(&self.script.version);

        for path in &self.script.precache {
            let url = match self.script.asset_url(path) {
                Ok(url) => url,
                Err(err) => {
                    warn!(path = %path, error = %err, "precache entry skipped: bad path");
                    continue;
                }
            };

            let request = Request::get(url.clone());
            match self.fetcher.fetch(request.clone()).await {
                Ok(response) if response.ok() => {
                    let entry = CacheEntry::capture(&request, &response);
                    self.caches.write().await.open(&self.script.version).put(entry);
                }
                Ok(response) => {
                    warn!(
                        url = %url,
                        status = %response.status,
                        "precache entry skipped: unsuccessful response"
                    );
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "precache entry skipped: fetch failed");
                }
            }
        }

        Ok(())
    }

    /// Activation step: delete every cache generation that is not this
    /// version's, then claim all open pages.
    pub async fn activate(&self) -> Result<(), SwError> {
        let mut evicted = 0;
        {
            let mut store = self.caches.write().await;
            for name in store.generation_names() {
                if name != self.script.version && store.delete(&name) {
                    evicted += 1;
                }
            }
        }

        let claimed = self.clients.write().await.claim(self.worker.id());

        info!(
            worker = %self.worker.id(),
            version = %self.script.version,
            evicted,
            claimed,
            "activated"
        );
        Ok(())
    }

    /// Fetch entry point for controlled pages.
    ///
    /// Non-GET requests and non-HTTP(S) schemes are never intercepted;
    /// everything else is classified by the policy table.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        if request.method != Method::GET || !request.is_http() {
            return FetchOutcome::Passthrough;
        }

        match self.policy.strategy_for(&request) {
            Strategy::ConfigBypass => FetchOutcome::Handled(self.fetch_config(request).await),
            Strategy::Passthrough => FetchOutcome::Passthrough,
            Strategy::NetworkFirst => FetchOutcome::Handled(self.network_first(request).await),
        }
    }

    /// Message entry point for controlled pages.
    pub fn handle_message(&self, message: WorkerMessage) {
        match message {
            WorkerMessage::SkipWaiting => {
                info!(
                    worker = %self.worker.id(),
                    version = %self.script.version,
                    "skip waiting requested"
                );
                self.worker.request_skip();
            }
        }
    }

    /// Configuration document: always fresh, never stored.
    ///
    /// The request goes out with transport caches disabled and the
    /// response is returned unchanged, whatever its status. Only a
    /// transport rejection is replaced, by a synthesized JSON 503, so
    /// the page sees an explicit error instead of stale configuration.
    async fn fetch_config(&self, request: Request) -> Response {
        let url = request.url.clone();
        match self.fetcher.fetch(request.no_store()).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "configuration fetch failed, synthesizing 503");
                Response::json_body(
                    StatusCode::SERVICE_UNAVAILABLE,
                    url,
                    &json!({ "error": "Configuration unavailable" }),
                )
            }
        }
    }

    /// Network-first path for app-shell traffic.
    ///
    /// A resolved response is returned as received; when it is exactly
    /// 200 and same-origin, a snapshot lands in this version's cache
    /// generation first. On rejection the fallback chain runs: cached
    /// snapshot, then the offline document for navigations, then a
    /// synthesized 408.
    async fn network_first(&self, request: Request) -> Response {
        match self.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if response.status == StatusCode::OK && self.script.is_same_origin(&request.url) {
                    let entry = CacheEntry::capture(&request, &response);
                    self.caches
                        .write()
                        .await
                        .open(&self.script.version)
                        .put(entry);
                }
                response
            }
            Err(err) => {
                debug!(url = %request.url, error = %err, "network rejected, trying fallbacks");

                let key = request_key(&request.method, &request.url);
                let store = self.caches.read().await;

                if let Some(entry) = store.match_in(&self.script.version, &key) {
                    debug!(url = %request.url, "served from cache");
                    return entry.to_response();
                }

                if request.is_navigation() {
                    if let Ok(offline_url) = self.script.asset_url(&self.script.offline_path) {
                        let offline_key = request_key(&Method::GET, &offline_url);
                        if let Some(entry) = store.match_in(&self.script.version, &offline_key) {
                            info!(url = %request.url, "served offline document");
                            return entry.to_response();
                        }
                    }
                }

                Response::plain_text(StatusCode::REQUEST_TIMEOUT, request.url, "Network error")
            }
        }
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_net::testing::FakeFetcher;
    use bazaar_net::CacheMode;
    use bytes::Bytes;

    const ORIGIN: &str = "https://shop.example";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn context_with(script: WorkerScript) -> (WorkerContext, Arc<FakeFetcher>) {
        let fetcher = Arc::new(FakeFetcher::new());
        let ctx = WorkerContext::new(
            script,
            Arc::new(RwLock::new(CacheStorage::new())),
            Arc::new(RwLock::new(Clients::new())),
            fetcher.clone(),
        );
        (ctx, fetcher)
    }

    fn context() -> (WorkerContext, Arc<FakeFetcher>) {
        context_with(WorkerScript::new("bazaar-v1", url(ORIGIN)))
    }

    fn script_shell(fetcher: &FakeFetcher) {
        fetcher.respond_html("https://shop.example/", "<html>home</html>");
        fetcher.respond_html("https://shop.example/offline.html", "<html>offline</html>");
        fetcher.respond(
            "https://shop.example/manifest.webmanifest",
            200,
            "application/manifest+json",
            r#"{"name":"Bazaar"}"#,
        );
    }

    #[tokio::test]
    async fn test_install_populates_generation() {
        let (ctx, fetcher) = context();
        script_shell(&fetcher);

        ctx.install().await.unwrap();

        let store = ctx.caches.read().await;
        let generation = store.generation("bazaar-v1").unwrap();
        assert_eq!(generation.len(), 3);
        assert!(generation
            .match_key("GET https://shop.example/offline.html")
            .is_some());
    }

    #[tokio::test]
    async fn test_install_survives_failed_manifest_entries() {
        let (ctx, fetcher) = context();
        script_shell(&fetcher);
        fetcher.fail("https://shop.example/offline.html", "connection reset");

        ctx.install().await.unwrap();

        let store = ctx.caches.read().await;
        let generation = store.generation("bazaar-v1").unwrap();
        assert_eq!(generation.len(), 2);
        assert!(generation
            .match_key("GET https://shop.example/offline.html")
            .is_none());
    }

    #[tokio::test]
    async fn test_install_skips_unsuccessful_precache_responses() {
        let (ctx, fetcher) = context();
        script_shell(&fetcher);
        fetcher.respond("https://shop.example/manifest.webmanifest", 404, "text/plain", "gone");

        ctx.install().await.unwrap();

        let store = ctx.caches.read().await;
        assert_eq!(store.generation("bazaar-v1").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_install_creates_generation_even_when_everything_fails() {
        let (ctx, fetcher) = context();
        fetcher.set_offline(true);

        ctx.install().await.unwrap();

        let store = ctx.caches.read().await;
        let generation = store.generation("bazaar-v1").unwrap();
        assert!(generation.is_empty());
    }

    #[tokio::test]
    async fn test_install_rejects_unusable_origin() {
        let script = WorkerScript::new("bazaar-v1", url("mailto:shop@example.com"));
        let (ctx, _fetcher) = context_with(script);

        let err = ctx.install().await.unwrap_err();
        assert!(matches!(err, SwError::InstallFailed(_)));
    }

    #[tokio::test]
    async fn test_activate_evicts_foreign_generations() {
        let (ctx, fetcher) = context_with(WorkerScript::new("bazaar-v2", url(ORIGIN)));
        script_shell(&fetcher);

        {
            let mut store = ctx.caches.write().await;
            store.open("bazaar-v1");
            store.open("bazaar-v0");
        }
        ctx.install().await.unwrap();
        ctx.activate().await.unwrap();

        let store = ctx.caches.read().await;
        assert_eq!(store.generation_names(), vec!["bazaar-v2"]);
    }

    #[tokio::test]
    async fn test_activate_claims_open_pages() {
        let (ctx, _fetcher) = context();
        let page = ctx
            .clients
            .write()
            .await
            .add(url("https://shop.example/cart"), None);

        ctx.activate().await.unwrap();

        let clients = ctx.clients.read().await;
        assert_eq!(clients.controller_of(page), Some(ctx.worker().id()));
    }

    #[tokio::test]
    async fn test_non_get_requests_pass_through() {
        let (ctx, fetcher) = context();
        let request = Request::post(url("https://shop.example/page"), Bytes::from("x"));

        let outcome = ctx.handle_fetch(request).await;
        assert!(outcome.is_passthrough());
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_non_http_schemes_pass_through() {
        let (ctx, fetcher) = context();
        let request = Request::get(url("chrome-extension://abcdef/popup.html"));

        let outcome = ctx.handle_fetch(request).await;
        assert!(outcome.is_passthrough());
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_api_requests_pass_through() {
        let script = WorkerScript::new("bazaar-v1", url(ORIGIN))
            .with_api_host_suffix("backend.bazaar.example");
        let (ctx, fetcher) = context_with(script);

        for u in [
            "https://shop.example/api/v1/orders",
            "https://eu.backend.bazaar.example/catalog",
        ] {
            let outcome = ctx.handle_fetch(Request::get(url(u))).await;
            assert!(outcome.is_passthrough(), "{u}");
        }
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_config_fetch_bypasses_caches() {
        let (ctx, fetcher) = context();
        fetcher.respond_json(
            "https://shop.example/env.json",
            &json!({"backendHost": "https://backend.bazaar.example"}),
        );

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/env.json")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        // Transport caches were told to stand aside.
        assert_eq!(fetcher.requests()[0].cache_mode, CacheMode::NoStore);
        // And nothing was stored.
        let store = ctx.caches.read().await;
        assert!(store
            .match_in("bazaar-v1", "GET https://shop.example/env.json")
            .is_none());
    }

    #[tokio::test]
    async fn test_config_rejection_synthesizes_503() {
        let (ctx, fetcher) = context();
        fetcher.fail("https://shop.example/env.json", "dns failure");

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/env.json")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.header("content-type"), Some("application/json"));
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"], "Configuration unavailable");
    }

    #[tokio::test]
    async fn test_config_error_status_returned_unchanged() {
        let (ctx, fetcher) = context();
        fetcher.respond("https://shop.example/env.json", 500, "text/plain", "boom");

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/env.json")))
            .await
            .into_response()
            .unwrap();

        // A resolved error is the server speaking; only rejections are
        // replaced by the synthesized 503.
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text().unwrap(), "boom");
    }

    #[tokio::test]
    async fn test_network_first_caches_same_origin_200() {
        let (ctx, fetcher) = context();
        fetcher.respond_html("https://shop.example/products/42", "<html>product</html>");

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/products/42")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let store = ctx.caches.read().await;
        let hit = store
            .match_in("bazaar-v1", "GET https://shop.example/products/42")
            .unwrap();
        assert_eq!(hit.body, Bytes::from("<html>product</html>"));
    }

    #[tokio::test]
    async fn test_network_first_does_not_cache_cross_origin() {
        let (ctx, fetcher) = context();
        fetcher.respond("https://cdn.example/inter.woff2", 200, "font/woff2", "woff");

        let response = ctx
            .handle_fetch(Request::get(url("https://cdn.example/inter.woff2")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let store = ctx.caches.read().await;
        assert!(store
            .match_in("bazaar-v1", "GET https://cdn.example/inter.woff2")
            .is_none());
    }

    #[tokio::test]
    async fn test_network_first_does_not_cache_non_200() {
        let (ctx, fetcher) = context();
        fetcher.respond("https://shop.example/flaky", 404, "text/plain", "nope");

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/flaky")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let store = ctx.caches.read().await;
        assert!(store
            .match_in("bazaar-v1", "GET https://shop.example/flaky")
            .is_none());
    }

    #[tokio::test]
    async fn test_rejection_serves_cached_snapshot() {
        let (ctx, fetcher) = context();
        fetcher.respond_html("https://shop.example/cart", "<html>cart</html>");

        ctx.handle_fetch(Request::get(url("https://shop.example/cart")))
            .await;
        fetcher.set_offline(true);

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/cart")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "<html>cart</html>");
    }

    #[tokio::test]
    async fn test_offline_navigation_to_cold_page_serves_offline_document() {
        let (ctx, fetcher) = context();
        script_shell(&fetcher);
        ctx.install().await.unwrap();
        fetcher.set_offline(true);

        let response = ctx
            .handle_fetch(Request::navigation(url("https://shop.example/products/7")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "<html>offline</html>");
    }

    #[tokio::test]
    async fn test_offline_subresource_miss_synthesizes_408() {
        let (ctx, fetcher) = context();
        script_shell(&fetcher);
        ctx.install().await.unwrap();
        fetcher.set_offline(true);

        let response = ctx
            .handle_fetch(Request::get(url("https://shop.example/assets/logo.svg")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(response.text().unwrap(), "Network error");
    }

    #[tokio::test]
    async fn test_offline_navigation_without_offline_doc_synthesizes_408() {
        let script = WorkerScript::new("bazaar-v1", url(ORIGIN)).with_precache(&["/"]);
        let (ctx, fetcher) = context_with(script);
        fetcher.respond_html("https://shop.example/", "home");
        ctx.install().await.unwrap();
        fetcher.set_offline(true);

        let response = ctx
            .handle_fetch(Request::navigation(url("https://shop.example/products/7")))
            .await
            .into_response()
            .unwrap();

        assert_eq!(response.status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_skip_waiting_message_sets_flag() {
        let (ctx, _fetcher) = context();
        assert!(!ctx.worker().skip_requested());
        ctx.handle_message(WorkerMessage::SkipWaiting);
        assert!(ctx.worker().skip_requested());
    }
}
