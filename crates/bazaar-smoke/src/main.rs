//! Bazaar Smoke Harness
//!
//! Scripts the whole life of the offline layer against the scripted
//! transport: install a version, browse, lose the network and walk the
//! fallback tiers, ship a new version, walk the update handshake, and
//! verify the single-generation invariant at the end. Prints a JSON
//! verdict on stdout and exits non-zero if any step failed.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use serde_json::json;
use tracing::{error, info};
use url::Url;

use bazaar_common::logging::{init_logging, LogConfig};
use bazaar_config::{ConfigError, ConfigLoader};
use bazaar_net::testing::FakeFetcher;
use bazaar_net::{Fetch, Request};
use bazaar_pwa::{PageClient, PageEvent, UpdatePhase};
use bazaar_sw::{ServiceWorkerHost, WorkerScript};

const ORIGIN: &str = "https://shop.example";
const PRECACHE: &[&str] = &[
    "/",
    "/offline.html",
    "/manifest.webmanifest",
    "/icons/icon-192.png",
];

/// Parse command line arguments
struct Args {
    log_json: bool,
    log_filter: Option<String>,
    summary_output: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut log_json = false;
        let mut log_filter = None;
        let mut summary_output = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--log-json" => {
                    log_json = true;
                }
                "--log-filter" => {
                    log_filter = args.next();
                }
                "--summary-output" => {
                    summary_output = args.next();
                }
                _ => {}
            }
        }

        Self {
            log_json,
            log_filter,
            summary_output,
        }
    }
}

/// Pass/fail collector for the scripted steps.
struct Steps {
    results: Vec<serde_json::Value>,
    failed: u32,
}

impl Steps {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            failed: 0,
        }
    }

    fn check(&mut self, step: &'static str, pass: bool, note: impl Into<String>) {
        let note = note.into();
        if pass {
            info!(step, note = %note, "ok");
        } else {
            self.failed += 1;
            error!(step, note = %note, "FAILED");
        }
        self.results
            .push(json!({ "step": step, "pass": pass, "note": note }));
    }

    fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Scripts what the storefront's CDN would serve for one deployment.
fn deploy(fetcher: &FakeFetcher, version: &str) {
    fetcher.respond_html(
        "https://shop.example/",
        &format!("<html>home {version}</html>"),
    );
    fetcher.respond_html("https://shop.example/offline.html", "<html>offline</html>");
    fetcher.respond(
        "https://shop.example/manifest.webmanifest",
        200,
        "application/manifest+json",
        r#"{"name":"Bazaar Market"}"#,
    );
    fetcher.respond(
        "https://shop.example/icons/icon-192.png",
        200,
        "image/png",
        "png-bytes",
    );
    fetcher.respond_json(
        "https://shop.example/env.json",
        &json!({ "BACKEND_ID": "shop-backend-7", "NETWORK": "live" }),
    );
}

fn script(version: &str, origin: &Url) -> WorkerScript {
    WorkerScript::new(version, origin.clone()).with_precache(PRECACHE)
}

async fn run(steps: &mut Steps) {
    let origin = Url::parse(ORIGIN).expect("origin url");
    let product_url = origin.join("/products/7").expect("product url");

    let fetcher = Arc::new(FakeFetcher::new());
    deploy(&fetcher, "v1");
    fetcher.respond_html("https://shop.example/products/7", "<html>product 7</html>");

    let (host, events) = ServiceWorkerHost::new(fetcher.clone());
    let host = Arc::new(host);
    let page =
        Arc::new(PageClient::attach(host.clone(), fetcher.clone(), origin.clone()).await);

    // ---- Install v1 ----
    let (mut monitor, mut page_events) =
        match bazaar_pwa::register(host.clone(), events, script("bazaar-v1", &origin)).await {
            Ok(pair) => pair,
            Err(err) => {
                steps.check("install-v1", false, format!("register failed: {err}"));
                return;
            }
        };
    monitor.pump().await;

    let controller = host.controller().await.map(|c| c.version().to_string());
    steps.check(
        "install-v1",
        controller.as_deref() == Some("bazaar-v1"),
        format!("controller {controller:?}"),
    );
    steps.check(
        "first-install-stays-idle",
        monitor.phase() == &UpdatePhase::Idle,
        format!("phase {:?}", monitor.phase()),
    );

    // ---- Configuration through the controlled seam ----
    let config_url = origin.join("/env.json").expect("config url");
    let loader = ConfigLoader::new(page.clone() as Arc<dyn Fetch>, config_url);
    match loader.load().await {
        Ok(config) => steps.check(
            "config-load",
            config.backend_id == "shop-backend-7",
            format!("backend {}", config.backend_id),
        ),
        Err(err) => steps.check("config-load", false, err.to_string()),
    }

    // ---- Browse online ----
    match page.fetch(Request::get(product_url.clone())).await {
        Ok(response) => steps.check(
            "browse-online",
            response.status == StatusCode::OK,
            format!("status {}", response.status),
        ),
        Err(err) => steps.check("browse-online", false, err.to_string()),
    }

    // ---- Network gone: the three fallback tiers ----
    fetcher.set_offline(true);
    info!("network offline");

    match page.fetch(Request::navigation(product_url.clone())).await {
        Ok(response) => steps.check(
            "offline-cached-page",
            response.text().ok().as_deref() == Some("<html>product 7</html>"),
            format!("status {}", response.status),
        ),
        Err(err) => steps.check("offline-cached-page", false, err.to_string()),
    }

    let cold_nav = origin.join("/products/99").expect("cold url");
    match page.fetch(Request::navigation(cold_nav)).await {
        Ok(response) => steps.check(
            "offline-fallback-document",
            response.text().ok().as_deref() == Some("<html>offline</html>"),
            format!("status {}", response.status),
        ),
        Err(err) => steps.check("offline-fallback-document", false, err.to_string()),
    }

    let cold_asset = origin.join("/assets/logo.svg").expect("asset url");
    match page.fetch(Request::get(cold_asset)).await {
        Ok(response) => steps.check(
            "offline-synthesized-408",
            response.status == StatusCode::REQUEST_TIMEOUT
                && response.text().ok().as_deref() == Some("Network error"),
            format!("status {}", response.status),
        ),
        Err(err) => steps.check("offline-synthesized-408", false, err.to_string()),
    }

    loader.invalidate().await;
    let config_offline = loader.load().await;
    steps.check(
        "config-offline-explicit-error",
        matches!(config_offline, Err(ConfigError::Unreachable(_))),
        format!("{config_offline:?}"),
    );

    let api_url = origin.join("/api/v1/orders").expect("api url");
    let api_offline = page.fetch(Request::get(api_url)).await;
    steps.check(
        "api-error-reaches-caller",
        api_offline.is_err(),
        format!("{:?}", api_offline.map(|r| r.status)),
    );

    // ---- New deployment ships ----
    fetcher.set_offline(false);
    deploy(&fetcher, "v2");
    info!("deployment v2 live");

    if let Err(err) = host.register(script("bazaar-v2", &origin)).await {
        steps.check("install-v2", false, format!("register failed: {err}"));
        return;
    }
    monitor.pump().await;

    steps.check(
        "update-detected",
        matches!(monitor.phase(), UpdatePhase::UpdateDetected(_)),
        format!("phase {:?}", monitor.phase()),
    );

    let mut saw_update_ready = false;
    while let Ok(event) = page_events.try_recv() {
        if matches!(event, PageEvent::UpdateReady(_)) {
            saw_update_ready = true;
        }
    }
    steps.check(
        "update-ready-event",
        saw_update_ready,
        "UpdateReady surfaced to the UI",
    );

    let still_v1 = host.controller().await.map(|c| c.version().to_string());
    steps.check(
        "old-session-untouched",
        still_v1.as_deref() == Some("bazaar-v1"),
        format!("controller {still_v1:?}"),
    );

    // ---- The user accepts the update ----
    if let Err(err) = monitor.apply_update().await {
        steps.check("apply-update", false, err.to_string());
        return;
    }
    monitor.pump().await;
    steps.check(
        "update-activated",
        monitor.phase() == &UpdatePhase::Activated,
        format!("phase {:?}", monitor.phase()),
    );

    match page.reload().await {
        Ok(response) => steps.check(
            "reload-under-v2",
            response.text().ok().as_deref() == Some("<html>home v2</html>"),
            format!("status {}", response.status),
        ),
        Err(err) => steps.check("reload-under-v2", false, err.to_string()),
    }
    monitor.reset();

    // ---- Invariants after the upgrade ----
    let caches = host.caches();
    let names = caches.read().await.generation_names();
    steps.check(
        "single-generation",
        names == vec!["bazaar-v2".to_string()],
        format!("generations {names:?}"),
    );

    let before = host.controller().await.map(|c| c.worker().id());
    if let Err(err) = host.register(script("bazaar-v2", &origin)).await {
        steps.check("same-version-noop", false, format!("register failed: {err}"));
        return;
    }
    let after = host.controller().await.map(|c| c.worker().id());
    steps.check(
        "same-version-noop",
        before == after && before.is_some(),
        format!("controller {before:?} -> {after:?}"),
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut log_config = if args.log_json {
        LogConfig::production()
    } else {
        LogConfig::default()
    };
    if let Some(filter) = args.log_filter.clone() {
        log_config = log_config.with_filter(filter);
    }
    init_logging(log_config);

    info!("Starting Bazaar smoke harness");
    let start = Instant::now();

    let mut steps = Steps::new();
    run(&mut steps).await;

    let verdict = json!({
        "status": if steps.all_passed() { "pass" } else { "fail" },
        "failed": steps.failed,
        "elapsed_ms": start.elapsed().as_millis(),
        "steps": steps.results,
    });
    println!("{verdict}");

    if let Some(ref path) = args.summary_output {
        if let Err(err) = std::fs::write(path, verdict.to_string()) {
            error!(path = %path, error = %err, "failed to write summary");
        } else {
            info!(path = %path, "summary written");
        }
    }

    if steps.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
