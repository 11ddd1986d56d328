//! Worker lifecycle: states, identities, and cross-context signals.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one worker version instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl WorkerId {
    pub fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Lifecycle state of a worker version.
///
/// A version moves forward only: `Parsed` through `Activated`, or to
/// `Redundant` from any point once it fails installation or is
/// superseded by a newer version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Script accepted, nothing run yet.
    Parsed,
    /// Install step in progress (precache population).
    Installing,
    /// Install complete; waiting for activation.
    Installed,
    /// Activation step in progress (generation eviction, client claim).
    Activating,
    /// Controlling; fetch and message events are routed here.
    Activated,
    /// Discarded: install failed or a newer version took over.
    Redundant,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message sent from a page to a specific worker.
///
/// Serializes to the wire form pages post, e.g. `{"type":"SKIP_WAITING"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Ask an installed worker to activate without waiting for the last
    /// controlled page to close.
    SkipWaiting,
}

/// Event emitted by the registration host as versions move through
/// their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwEvent {
    /// A new version began installing.
    UpdateFound { worker: WorkerId, version: String },
    /// A version changed lifecycle state.
    StateChange {
        worker: WorkerId,
        version: String,
        state: WorkerState,
    },
    /// The controlling worker changed; open pages are now served by
    /// the named version.
    ControllerChange { worker: WorkerId, version: String },
}

/// Shared handle to one worker version.
///
/// The registration host drives state transitions; pages and the
/// update monitor read them. The skip flag records a `SkipWaiting`
/// request until the host honors it.
#[derive(Debug)]
pub struct ServiceWorker {
    id: WorkerId,
    version: String,
    state: RwLock<WorkerState>,
    skip_waiting: AtomicBool,
}

impl ServiceWorker {
    pub fn new(version: &str) -> Self {
        Self {
            id: WorkerId::next(),
            version: version.to_string(),
            state: RwLock::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Version label; doubles as the cache generation name.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn request_skip(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    /// Whether a page has asked this worker to skip the waiting phase.
    pub fn skip_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        let a = ServiceWorker::new("bazaar-v1");
        let b = ServiceWorker::new("bazaar-v1");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_new_worker_starts_parsed() {
        let worker = ServiceWorker::new("bazaar-v1");
        assert_eq!(worker.state(), WorkerState::Parsed);
        assert!(!worker.skip_requested());
    }

    #[test]
    fn test_state_transitions_visible_across_reads() {
        let worker = ServiceWorker::new("bazaar-v2");
        worker.set_state(WorkerState::Installing);
        assert_eq!(worker.state(), WorkerState::Installing);
        worker.set_state(WorkerState::Installed);
        assert_eq!(worker.state(), WorkerState::Installed);
    }

    #[test]
    fn test_skip_waiting_wire_format() {
        let json = serde_json::to_string(&WorkerMessage::SkipWaiting).unwrap();
        assert_eq!(json, r#"{"type":"SKIP_WAITING"}"#);

        let parsed: WorkerMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert_eq!(parsed, WorkerMessage::SkipWaiting);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WorkerState::Installed).unwrap(),
            r#""installed""#
        );
    }
}
