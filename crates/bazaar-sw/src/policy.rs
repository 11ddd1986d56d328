//! Request classification.
//!
//! Routing decisions live in an ordered table of named rules; the first
//! rule whose matcher accepts the request decides the strategy. Keeping
//! the table declarative means each rule can be tested on its own and
//! new endpoint classes slot in without touching the fetch path.

use tracing::trace;
use url::Url;

use bazaar_net::Request;

/// How a classified request must be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network only, with transport caches disabled. Never stored; a
    /// network rejection synthesizes a JSON 503 so callers see a
    /// response, not stale configuration.
    ConfigBypass,
    /// Not intercepted. The caller performs its own network traffic and
    /// sees transport errors unchanged.
    Passthrough,
    /// Network first, then cache, then the offline document for
    /// navigations, then a synthesized 408.
    NetworkFirst,
}

/// Predicate half of a rule.
#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// URL path equals the given path exactly.
    PathEquals(String),
    /// Backend API traffic: the path contains the fragment, or the host
    /// ends with one of the suffixes.
    BackendApi {
        path_fragment: String,
        host_suffixes: Vec<String>,
    },
    /// Matches every request.
    Any,
}

impl RouteMatcher {
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            RouteMatcher::PathEquals(path) => url.path() == path,
            RouteMatcher::BackendApi {
                path_fragment,
                host_suffixes,
            } => {
                url.path().contains(path_fragment.as_str())
                    || url
                        .host_str()
                        .map_or(false, |host| {
                            host_suffixes.iter().any(|s| host.ends_with(s.as_str()))
                        })
            }
            RouteMatcher::Any => true,
        }
    }
}

/// A named matcher/strategy pair.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: &'static str,
    pub matcher: RouteMatcher,
    pub strategy: Strategy,
}

/// Ordered rule table; first match wins.
#[derive(Debug, Clone, Default)]
pub struct FetchPolicy {
    rules: Vec<PolicyRule>,
}

impl FetchPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Builds the storefront table:
    ///
    /// 1. the runtime configuration document always bypasses caches,
    /// 2. backend API traffic is never intercepted,
    /// 3. everything else is network-first.
    pub fn storefront(
        config_path: &str,
        api_path_fragment: &str,
        api_host_suffixes: &[String],
    ) -> Self {
        Self::new(vec![
            PolicyRule {
                name: "config-endpoint",
                matcher: RouteMatcher::PathEquals(config_path.to_string()),
                strategy: Strategy::ConfigBypass,
            },
            PolicyRule {
                name: "backend-api",
                matcher: RouteMatcher::BackendApi {
                    path_fragment: api_path_fragment.to_string(),
                    host_suffixes: api_host_suffixes.to_vec(),
                },
                strategy: Strategy::Passthrough,
            },
            PolicyRule {
                name: "app-shell",
                matcher: RouteMatcher::Any,
                strategy: Strategy::NetworkFirst,
            },
        ])
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Finds the first rule accepting the request.
    pub fn classify(&self, request: &Request) -> Option<&PolicyRule> {
        let rule = self.rules.iter().find(|r| r.matcher.matches(&request.url));
        if let Some(rule) = rule {
            trace!(url = %request.url, rule = rule.name, "request classified");
        }
        rule
    }

    /// Strategy for the request; an empty or non-exhaustive table
    /// degrades to passthrough, matching a worker with no fetch handler.
    pub fn strategy_for(&self, request: &Request) -> Strategy {
        self.classify(request)
            .map(|r| r.strategy)
            .unwrap_or(Strategy::Passthrough)
    }
}

// ==================== Tests ====================
