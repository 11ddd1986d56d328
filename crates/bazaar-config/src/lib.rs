//! # Bazaar Config
//!
//! Runtime configuration for the storefront.
//!
//! Deployments ship a static bundle plus one mutable document,
//! `/env.json`, which tells the page where its backend lives. The
//! document must always be read fresh (the worker's fetch policy
//! bypasses every cache for it); this crate owns the page-side half:
//! fetch through whatever [`Fetch`] the caller provides, parse,
//! validate, and memoize in an owned loader until invalidated.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use bazaar_net::{Fetch, Request};

/// Errors that can occur loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document could not be obtained at all. Covers transport
    /// rejections and the worker's synthesized 503.
    #[error("Configuration unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed configuration: {0}")]
    Malformed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Production gateway for backend traffic.
pub const LIVE_API_HOST: &str = "https://api.bazaar.example";
/// Gateway used by local development networks.
pub const LOCAL_API_HOST: &str = "http://localhost:8080";

/// The `/env.json` document.
///
/// Wire keys are the deployment tooling's upper-case names; lower-case
/// spellings are accepted for hand-written local files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Identifier of the backend service instance.
    #[serde(rename = "BACKEND_ID", alias = "backend_id")]
    pub backend_id: String,

    /// Deployment network name; `"live"` selects the production gateway.
    #[serde(rename = "NETWORK", alias = "network", default)]
    pub network: String,

    /// Origin login identities are derived from, when the deployment
    /// pins one.
    #[serde(
        rename = "IDENTITY_ORIGIN",
        alias = "identity_origin",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub identity_origin: Option<String>,
}

impl EnvConfig {
    /// Gateway the backend is reached through on this network.
    pub fn api_host(&self) -> &'static str {
        if self.network == "live" {
            LIVE_API_HOST
        } else {
            LOCAL_API_HOST
        }
    }

    /// Configuration for a local development network.
    pub fn local_fallback(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            network: "local".to_string(),
            identity_origin: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_id.trim().is_empty() {
            return Err(ConfigError::Invalid("empty backend id".to_string()));
        }
        Ok(())
    }
}

/// Fetches and memoizes the configuration document.
///
/// One loader per page context. `load` fetches at most once; the copy
/// is held until [`invalidate`](ConfigLoader::invalidate) drops it.
/// When the loader is given the page's controlled fetch seam, the
/// worker's no-store bypass applies to every fetch it makes.
pub struct ConfigLoader {
    fetcher: Arc<dyn Fetch>,
    config_url: Url,
    fallback: Option<EnvConfig>,
    cached: RwLock<Option<EnvConfig>>,
}

impl ConfigLoader {
    pub fn new(fetcher: Arc<dyn Fetch>, config_url: Url) -> Self {
        Self {
            fetcher,
            config_url,
            fallback: None,
            cached: RwLock::new(None),
        }
    }

    /// Use this configuration when the document cannot be loaded.
    /// Local development builds point it at their own backend.
    pub fn with_fallback(mut self, fallback: EnvConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns the configuration, fetching it on first use.
    pub async fn load(&self) -> Result<EnvConfig, ConfigError> {
        if let Some(config) = self.cached.read().await.clone() {
            debug!("configuration served from memory");
            return Ok(config);
        }

        let config = match self.fetch_fresh().await {
            Ok(config) => config,
            Err(err) => match &self.fallback {
                Some(fallback) => {
                    warn!(error = %err, "configuration fetch failed, using fallback");
                    fallback.clone()
                }
                None => return Err(err),
            },
        };

        *self.cached.write().await = Some(config.clone());
        Ok(config)
    }

    /// Drops the memoized copy; the next [`load`](ConfigLoader::load)
    /// fetches fresh.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn fetch_fresh(&self) -> Result<EnvConfig, ConfigError> {
        let request = Request::get(self.config_url.clone());
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| ConfigError::Unreachable(e.to_string()))?;

        if !response.ok() {
            return Err(ConfigError::Unreachable(format!(
                "status {}",
                response.status
            )));
        }

        let config: EnvConfig = serde_json::from_slice(&response.body)
            .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;

        info!(
            backend = %config.backend_id,
            network = %config.network,
            "configuration loaded"
        );
        Ok(config)
    }
}

/// Static storefront identity, fixed at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// URL-safe shop identifier.
    pub slug: String,
    pub name: String,
    pub tagline: String,
}

impl AppInfo {
    /// Builds an identity, rejecting malformed slugs. Slugs are 5 to 50
    /// characters of lower-case letters, digits and inner hyphens.
    pub fn new(slug: &str, name: &str, tagline: &str) -> Result<Self, ConfigError> {
        if !Self::valid_slug(slug) {
            return Err(ConfigError::Invalid(format!("bad slug: {slug:?}")));
        }
        Ok(Self {
            slug: slug.to_string(),
            name: name.to_string(),
            tagline: tagline.to_string(),
        })
    }

    /// The shipped storefront identity.
    pub fn storefront() -> Self {
        Self {
            slug: "bazaar-market".to_string(),
            name: "Bazaar Market".to_string(),
            tagline: "Shop smart, live better".to_string(),
        }
    }

    fn valid_slug(slug: &str) -> bool {
        (5..=50).contains(&slug.len())
            && !slug.starts_with('-')
            && !slug.ends_with('-')
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

// ==================== Tests ====================
