//! # Bazaar SW
//!
//! Service worker core for the Bazaar storefront: versioned cache
//! generations, the request classification policy, and the worker
//! upgrade lifecycle.
//!
//! ## Design Goals
//!
//! 1. **Offline continuity**: previously visited pages keep working
//!    with no network, everything else degrades to an explicit
//!    offline document or synthesized error
//! 2. **Fresh configuration**: the runtime config document is never
//!    served stale, from any cache layer
//! 3. **Atomic upgrades**: one cache generation per deployed version;
//!    activation of a version evicts every other generation
//! 4. **Observable lifecycle**: every transition surfaces on an event
//!    stream pages can drive update UI from
//!
//! ## Fetch Path
//!
//! ```text
//!  page request
//!       |
//!       v
//!  [filter: GET + http(s)?] --no--> passthrough
//!       |
//!       v
//!  [policy table, first match wins]
//!       |-- config endpoint --> network (no-store) --fail--> 503 JSON
//!       |-- backend API -----> passthrough
//!       `-- everything else -> network --200+same-origin--> cache put
//!                                 |
//!                               [fail]
//!                                 |
//!                                 v
//!                           cache match --miss--> offline doc (nav)
//!                                                    |
//!                                                  [miss]
//!                                                    v
//!                                                408 text/plain
//! ```

use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod host;
pub mod lifecycle;
pub mod policy;
pub mod worker;

pub use cache::{request_key, CacheEntry, CacheGeneration, CacheStorage};
pub use clients::{Client, ClientId, Clients};
pub use host::ServiceWorkerHost;
pub use lifecycle::{ServiceWorker, SwEvent, WorkerId, WorkerMessage, WorkerState};
pub use policy::{FetchPolicy, PolicyRule, RouteMatcher, Strategy};
pub use worker::{FetchOutcome, WorkerContext, WorkerScript};

/// Errors that can occur in the service worker core.
#[derive(Error, Debug, Clone)]
pub enum SwError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Invalid asset path: {0}")]
    InvalidPath(String),

    #[error("No such worker: {0}")]
    WorkerNotFound(WorkerId),
}
