//! # Bazaar PWA
//!
//! Page-side glue for the storefront's offline layer: worker
//! registration, the update state machine the "new version available"
//! UI hangs off, and the controlled fetch seam application code talks
//! through.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: pages, the config loader and application code
//!    issue requests the same way whether or not a worker controls the
//!    page yet
//! 2. **Explicit update consent**: a new version never takes over a
//!    running session until the page applies the update
//! 3. **UI-ready events**: update availability and controller swaps
//!    surface as typed events, not callbacks buried in the lifecycle

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use bazaar_sw::{ServiceWorkerHost, SwError, SwEvent, WorkerScript};

pub mod monitor;
pub mod page;

pub use monitor::{PageEvent, PendingUpdate, UpdateMonitor, UpdatePhase};
pub use page::PageClient;

/// Errors that can occur in the page-side glue.
#[derive(Error, Debug)]
pub enum PwaError {
    #[error("No update pending")]
    NoUpdatePending,

    #[error(transparent)]
    Worker(#[from] SwError),
}

/// Registers a script version and wires an update monitor to the
/// host's event stream.
///
/// The monitor is constructed before registration runs, so the events
/// of the very first install are observed too.
pub async fn register(
    host: Arc<ServiceWorkerHost>,
    events: mpsc::UnboundedReceiver<SwEvent>,
    script: WorkerScript,
) -> Result<(UpdateMonitor, mpsc::UnboundedReceiver<PageEvent>), PwaError> {
    let (monitor, page_events) = UpdateMonitor::new(host.clone(), events);
    host.register(script).await?;
    Ok((monitor, page_events))
}
