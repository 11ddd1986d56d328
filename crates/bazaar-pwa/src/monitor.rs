//! The page-side update state machine.
//!
//! Consumes the host's lifecycle events and distills them into the two
//! signals an update UI cares about: "a new version is ready" and "the
//! controller changed". The phase advances `Idle → UpdateDetected →
//! WaitingForActivation → Activated`; a first-ever install never leaves
//! `Idle`, because there is no running session to interrupt.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, trace};

use bazaar_sw::{ServiceWorkerHost, SwEvent, WorkerId, WorkerMessage, WorkerState};

use crate::PwaError;

/// A version installed and parked, awaiting consent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub worker: WorkerId,
    pub version: String,
}

/// Where the page stands in the upgrade handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePhase {
    /// No upgrade in sight.
    Idle,
    /// A new version finished installing behind the running one.
    UpdateDetected(PendingUpdate),
    /// The page told the new version to skip waiting; the controller
    /// swap has not been observed yet.
    WaitingForActivation(PendingUpdate),
    /// The new version controls the page. Reload to run under it.
    Activated,
}

/// Event surfaced to the page's UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    /// Show the "new version available" affordance.
    UpdateReady(PendingUpdate),
    /// The controlling worker changed; dismiss update UI.
    ControllerChanged,
}

/// Distills host lifecycle events into [`PageEvent`]s and a phase.
pub struct UpdateMonitor {
    host: Arc<ServiceWorkerHost>,
    events: mpsc::UnboundedReceiver<SwEvent>,
    page_tx: mpsc::UnboundedSender<PageEvent>,
    phase: UpdatePhase,
}

impl UpdateMonitor {
    /// Wires a monitor to the host's event stream. Returns the monitor
    /// and the page-event stream the UI consumes.
    pub fn new(
        host: Arc<ServiceWorkerHost>,
        events: mpsc::UnboundedReceiver<SwEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<PageEvent>) {
        let (page_tx, page_rx) = mpsc::unbounded_channel();
        (
            Self {
                host,
                events,
                page_tx,
                phase: UpdatePhase::Idle,
            },
            page_rx,
        )
    }

    pub fn phase(&self) -> &UpdatePhase {
        &self.phase
    }

    /// Drains every queued lifecycle event through the state machine.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.step(event).await;
        }
    }

    async fn step(&mut self, event: SwEvent) {
        match event {
            SwEvent::StateChange {
                worker,
                version,
                state: WorkerState::Installed,
            } => {
                // Installed behind a running controller means an
                // upgrade; installed with no controller (or as the
                // controller-to-be of a first visit) does not.
                let controller = self.host.controller().await.map(|c| c.worker().id());
                if controller.is_some() && controller != Some(worker) {
                    info!(version = %version, "update ready");
                    let pending = PendingUpdate { worker, version };
                    self.phase = UpdatePhase::UpdateDetected(pending.clone());
                    let _ = self.page_tx.send(PageEvent::UpdateReady(pending));
                }
            }
            SwEvent::ControllerChange { version, .. } => {
                if matches!(
                    self.phase,
                    UpdatePhase::UpdateDetected(_) | UpdatePhase::WaitingForActivation(_)
                ) {
                    info!(version = %version, "controller changed, update live");
                    self.phase = UpdatePhase::Activated;
                }
                let _ = self.page_tx.send(PageEvent::ControllerChanged);
            }
            event => trace!(event = ?event, "lifecycle event"),
        }
    }

    /// Accepts the pending update: sends the skip instruction to the
    /// waiting worker and advances to `WaitingForActivation`. The
    /// resulting controller change arrives on the next [`pump`].
    ///
    /// [`pump`]: UpdateMonitor::pump
    pub async fn apply_update(&mut self) -> Result<(), PwaError> {
        let pending = match &self.phase {
            UpdatePhase::UpdateDetected(pending) => pending.clone(),
            _ => return Err(PwaError::NoUpdatePending),
        };

        info!(version = %pending.version, "applying update");
        self.host
            .post_message(pending.worker, WorkerMessage::SkipWaiting)
            .await?;
        self.phase = UpdatePhase::WaitingForActivation(pending);
        Ok(())
    }

    /// Returns to `Idle`. Reloading a page effectively does this: the
    /// fresh session starts with no upgrade in sight.
    pub fn reset(&mut self) {
        self.phase = UpdatePhase::Idle;
    }
}

// ==================== Tests ====================
