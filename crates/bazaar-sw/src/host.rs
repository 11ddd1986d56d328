//! Registration host.
//!
//! Owns the three registration slots (installing, waiting, active),
//! the shared cache store and client registry, and drives every
//! lifecycle transition. Pages never talk to a [`WorkerContext`]
//! directly for lifecycle concerns; they register scripts, post
//! messages, and observe the emitted [`SwEvent`] stream.
//!
//! Update model: registering a script whose version label matches the
//! active worker (with nothing newer pending) is a no-op. A different
//! label is a new version; it installs alongside the running one and
//! parks in the waiting slot until every controlled page is gone or a
//! page sends [`WorkerMessage::SkipWaiting`].

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use bazaar_net::Fetch;

use crate::cache::CacheStorage;
use crate::clients::{ClientId, Clients};
use crate::lifecycle::{SwEvent, WorkerId, WorkerMessage, WorkerState};
use crate::worker::{WorkerContext, WorkerScript};
use crate::SwError;

#[derive(Default)]
struct RegistrationSlots {
    installing: Option<Arc<WorkerContext>>,
    waiting: Option<Arc<WorkerContext>>,
    active: Option<Arc<WorkerContext>>,
}

/// The registration authority for one origin.
///
/// Exactly one host exists per worker registration; everything it owns
/// (slots, cache store, client registry, event stream) lives and dies
/// with it.
pub struct ServiceWorkerHost {
    slots: RwLock<RegistrationSlots>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    fetcher: Arc<dyn Fetch>,
    events: mpsc::UnboundedSender<SwEvent>,
}

impl ServiceWorkerHost {
    /// Creates a host and the event stream pages subscribe to.
    pub fn new(fetcher: Arc<dyn Fetch>) -> (Self, mpsc::UnboundedReceiver<SwEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let host = Self {
            slots: RwLock::new(RegistrationSlots::default()),
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            clients: Arc::new(RwLock::new(Clients::new())),
            fetcher,
            events,
        };
        (host, event_rx)
    }

    fn emit(&self, event: SwEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.events.send(event);
    }

    fn set_state(&self, ctx: &Arc<WorkerContext>, state: WorkerState) {
        ctx.worker().set_state(state);
        self.emit(SwEvent::StateChange {
            worker: ctx.worker().id(),
            version: ctx.version().to_string(),
            state,
        });
    }

    /// Registers a script version.
    ///
    /// An unchanged version label with nothing newer pending is a
    /// no-op returning the active worker, and re-registering the
    /// version already parked returns that one. A new label installs a
    /// new worker: the first version ever activates immediately, later
    /// versions park in the waiting slot. A failed install leaves the
    /// current controller untouched and the new worker redundant.
    pub async fn register(&self, script: WorkerScript) -> Result<Arc<WorkerContext>, SwError> {
        {
            let slots = self.slots.read().await;
            if let Some(active) = &slots.active {
                if active.version() == script.version
                    && slots.waiting.is_none()
                    && slots.installing.is_none()
                {
                    debug!(version = %script.version, "register: version unchanged");
                    return Ok(active.clone());
                }
            }
            // Same goes for a version already installed and parked.
            if let Some(waiting) = &slots.waiting {
                if waiting.version() == script.version {
                    debug!(version = %script.version, "register: version already waiting");
                    return Ok(waiting.clone());
                }
            }
        }

        info!(version = %script.version, "register: new version");
        let ctx = Arc::new(WorkerContext::new(
            script,
            self.caches.clone(),
            self.clients.clone(),
            self.fetcher.clone(),
        ));

        {
            let mut slots = self.slots.write().await;
            // A version still installing is superseded outright.
            if let Some(stale) = slots.installing.take() {
                self.set_state(&stale, WorkerState::Redundant);
            }
            slots.installing = Some(ctx.clone());
        }

        self.emit(SwEvent::UpdateFound {
            worker: ctx.worker().id(),
            version: ctx.version().to_string(),
        });
        self.set_state(&ctx, WorkerState::Installing);

        if let Err(err) = ctx.install().await {
            warn!(version = %ctx.version(), error = %err, "install failed, worker discarded");
            self.clear_installing(&ctx).await;
            self.set_state(&ctx, WorkerState::Redundant);
            return Err(err);
        }

        let first_install = {
            let mut slots = self.slots.write().await;
            if slots
                .installing
                .as_ref()
                .map(|c| c.worker().id() == ctx.worker().id())
                .unwrap_or(false)
            {
                slots.installing = None;
            }
            let first = slots.active.is_none();
            if !first {
                // Park as the waiting version. A version already parked
                // never got to activate; it is gone for good.
                if let Some(stale) = slots.waiting.replace(ctx.clone()) {
                    self.set_state(&stale, WorkerState::Redundant);
                }
            }
            first
        };

        self.set_state(&ctx, WorkerState::Installed);

        if first_install {
            // No controller exists, so there is nothing to wait for.
            self.promote(ctx.clone()).await?;
        }

        Ok(ctx)
    }

    async fn clear_installing(&self, ctx: &Arc<WorkerContext>) {
        let mut slots = self.slots.write().await;
        if slots
            .installing
            .as_ref()
            .map(|c| c.worker().id() == ctx.worker().id())
            .unwrap_or(false)
        {
            slots.installing = None;
        }
    }

    /// Runs a worker's activation and makes it the controller.
    async fn promote(&self, ctx: Arc<WorkerContext>) -> Result<(), SwError> {
        self.set_state(&ctx, WorkerState::Activating);

        if let Err(err) = ctx.activate().await {
            warn!(version = %ctx.version(), error = %err, "activation failed, worker discarded");
            self.set_state(&ctx, WorkerState::Redundant);
            return Err(err);
        }

        let previous = {
            let mut slots = self.slots.write().await;
            slots.active.replace(ctx.clone())
        };
        if let Some(old) = previous {
            self.set_state(&old, WorkerState::Redundant);
        }

        self.set_state(&ctx, WorkerState::Activated);
        self.emit(SwEvent::ControllerChange {
            worker: ctx.worker().id(),
            version: ctx.version().to_string(),
        });
        Ok(())
    }

    /// Delivers a page message to a specific worker.
    ///
    /// A waiting worker that acknowledges a skip request is promoted
    /// before this returns; its activation and claim of open pages
    /// complete here.
    pub async fn post_message(
        &self,
        target: WorkerId,
        message: WorkerMessage,
    ) -> Result<(), SwError> {
        let ctx = self
            .find(target)
            .await
            .ok_or(SwError::WorkerNotFound(target))?;
        ctx.handle_message(message);

        if ctx.worker().skip_requested() && ctx.worker().state() == WorkerState::Installed {
            let waiting = {
                let mut slots = self.slots.write().await;
                match &slots.waiting {
                    Some(w) if w.worker().id() == target => slots.waiting.take(),
                    _ => None,
                }
            };
            if let Some(parked) = waiting {
                self.promote(parked).await?;
            }
        }
        Ok(())
    }

    async fn find(&self, id: WorkerId) -> Option<Arc<WorkerContext>> {
        let slots = self.slots.read().await;
        // Bound to a local so the temporaries die before the guard does.
        let found = [&slots.installing, &slots.waiting, &slots.active]
            .into_iter()
            .flatten()
            .find(|c| c.worker().id() == id)
            .cloned();
        found
    }

    /// Worker currently controlling pages, if any.
    pub async fn controller(&self) -> Option<Arc<WorkerContext>> {
        self.slots.read().await.active.clone()
    }

    /// Worker installed and parked, if any.
    pub async fn waiting(&self) -> Option<Arc<WorkerContext>> {
        self.slots.read().await.waiting.clone()
    }

    /// Worker mid-install, if any.
    pub async fn installing(&self) -> Option<Arc<WorkerContext>> {
        self.slots.read().await.installing.clone()
    }

    /// Attaches an open page; it inherits the current controller.
    pub async fn add_client(&self, url: Url) -> ClientId {
        let controller = self.controller().await.map(|c| c.worker().id());
        self.clients.write().await.add(url, controller)
    }

    /// Detaches a page. When the last controlled page closes, a parked
    /// waiting version has nothing left to wait for and is promoted.
    pub async fn remove_client(&self, id: ClientId) {
        let none_left = {
            let mut clients = self.clients.write().await;
            clients.remove(id);
            clients.is_empty()
        };
        if !none_left {
            return;
        }

        let parked = { self.slots.write().await.waiting.take() };
        if let Some(parked) = parked {
            info!(version = %parked.version(), "last page closed, promoting waiting version");
            // No caller left to report to; promote logs a failed
            // activation and marks the worker redundant.
            let _ = self.promote(parked).await;
        }
    }

    pub async fn client_controller(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.controller_of(id)
    }

    /// Shared cache store, for inspection.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        self.caches.clone()
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_net::testing::FakeFetcher;

    fn origin() -> Url {
        Url::parse("https://shop.example").unwrap()
    }

    fn shop_online(fetcher: &FakeFetcher) {
        fetcher.respond_html("https://shop.example/", "<html>home</html>");
        fetcher.respond_html("https://shop.example/offline.html", "<html>offline</html>");
        fetcher.respond(
            "https://shop.example/manifest.webmanifest",
            200,
            "application/manifest+json",
            "{}",
        );
    }

    fn setup() -> (Arc<ServiceWorkerHost>, mpsc::UnboundedReceiver<SwEvent>, Arc<FakeFetcher>) {
        let fetcher = Arc::new(FakeFetcher::new());
        shop_online(&fetcher);
        let (host, events) = ServiceWorkerHost::new(fetcher.clone());
        (Arc::new(host), events, fetcher)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SwEvent>) -> Vec<SwEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[SwEvent]) -> Vec<WorkerState> {
        events
            .iter()
            .filter_map(|e| match e {
                SwEvent::StateChange { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_install_activates_immediately() {
        let (host, mut events, _fetcher) = setup();

        let ctx = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();

        assert_eq!(ctx.worker().state(), WorkerState::Activated);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(ctx.worker().id())
        );

        let seen = drain(&mut events);
        assert!(matches!(seen[0], SwEvent::UpdateFound { .. }));
        assert_eq!(
            states(&seen),
            vec![
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated,
            ]
        );
        assert!(matches!(
            seen.last(),
            Some(SwEvent::ControllerChange { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_same_version_is_noop() {
        let (host, mut events, _fetcher) = setup();

        let first = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        drain(&mut events);

        let second = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();

        assert_eq!(first.worker().id(), second.worker().id());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_register_waiting_version_again_is_noop() {
        let (host, mut events, _fetcher) = setup();

        host.register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let parked = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();
        drain(&mut events);

        let again = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();

        assert_eq!(parked.worker().id(), again.worker().id());
        assert_eq!(again.worker().state(), WorkerState::Installed);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_new_version_parks_in_waiting() {
        let (host, _events, _fetcher) = setup();

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let v2 = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();

        assert_eq!(v2.worker().state(), WorkerState::Installed);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v1.worker().id())
        );
        assert_eq!(
            host.waiting().await.map(|c| c.worker().id()),
            Some(v2.worker().id())
        );

        // Both generations exist during the waiting window.
        let caches = host.caches();
        let store = caches.read().await;
        let mut names = store.generation_names();
        names.sort();
        assert_eq!(names, vec!["bazaar-v1", "bazaar-v2"]);
    }

    #[tokio::test]
    async fn test_skip_waiting_promotes_parked_version() {
        let (host, _events, _fetcher) = setup();
        let page = host.add_client(Url::parse("https://shop.example/").unwrap()).await;

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let v2 = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();

        host.post_message(v2.worker().id(), WorkerMessage::SkipWaiting)
            .await
            .unwrap();

        assert_eq!(v2.worker().state(), WorkerState::Activated);
        assert_eq!(v1.worker().state(), WorkerState::Redundant);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v2.worker().id())
        );
        assert!(host.waiting().await.is_none());
        assert_eq!(host.client_controller(page).await, Some(v2.worker().id()));

        // The old generation went with its worker.
        let caches = host.caches();
        let store = caches.read().await;
        assert_eq!(store.generation_names(), vec!["bazaar-v2"]);
    }

    #[tokio::test]
    async fn test_last_page_closing_promotes_waiting_version() {
        let (host, _events, _fetcher) = setup();
        let page = host.add_client(Url::parse("https://shop.example/").unwrap()).await;

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let v2 = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();
        assert_eq!(v2.worker().state(), WorkerState::Installed);

        host.remove_client(page).await;

        // Nothing was left running under v1, so v2 took over without a
        // skip request.
        assert_eq!(v2.worker().state(), WorkerState::Activated);
        assert_eq!(v1.worker().state(), WorkerState::Redundant);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v2.worker().id())
        );
        assert!(host.waiting().await.is_none());

        let caches = host.caches();
        let store = caches.read().await;
        assert_eq!(store.generation_names(), vec!["bazaar-v2"]);
    }

    #[tokio::test]
    async fn test_waiting_version_stays_parked_while_pages_remain() {
        let (host, _events, _fetcher) = setup();
        let first = host.add_client(Url::parse("https://shop.example/").unwrap()).await;
        let _second = host
            .add_client(Url::parse("https://shop.example/cart").unwrap())
            .await;

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let v2 = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();

        host.remove_client(first).await;

        // One page still runs under the old version.
        assert_eq!(v2.worker().state(), WorkerState::Installed);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v1.worker().id())
        );
        assert_eq!(
            host.waiting().await.map(|c| c.worker().id()),
            Some(v2.worker().id())
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_current_controller() {
        let (host, mut events, _fetcher) = setup();

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        drain(&mut events);

        let bad = WorkerScript::new(
            "bazaar-v2",
            Url::parse("mailto:shop@example.com").unwrap(),
        );
        let err = host.register(bad).await.unwrap_err();
        assert!(matches!(err, SwError::InstallFailed(_)));

        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v1.worker().id())
        );
        assert!(host.waiting().await.is_none());

        let seen = drain(&mut events);
        assert_eq!(
            states(&seen),
            vec![WorkerState::Installing, WorkerState::Redundant]
        );
    }

    #[tokio::test]
    async fn test_superseded_waiting_version_goes_redundant() {
        let (host, _events, _fetcher) = setup();

        host.register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();
        let v2 = host
            .register(WorkerScript::new("bazaar-v2", origin()))
            .await
            .unwrap();
        let v3 = host
            .register(WorkerScript::new("bazaar-v3", origin()))
            .await
            .unwrap();

        assert_eq!(v2.worker().state(), WorkerState::Redundant);
        assert_eq!(
            host.waiting().await.map(|c| c.worker().id()),
            Some(v3.worker().id())
        );
    }

    #[tokio::test]
    async fn test_pages_inherit_controller_on_attach() {
        let (host, _events, _fetcher) = setup();

        let before = host.add_client(Url::parse("https://shop.example/").unwrap()).await;
        assert_eq!(host.client_controller(before).await, None);

        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();

        // Claimed during activation.
        assert_eq!(host.client_controller(before).await, Some(v1.worker().id()));

        let after = host
            .add_client(Url::parse("https://shop.example/cart").unwrap())
            .await;
        assert_eq!(host.client_controller(after).await, Some(v1.worker().id()));
    }

    #[tokio::test]
    async fn test_message_to_unknown_worker_fails() {
        let (host, _events, _fetcher) = setup();
        let err = host
            .post_message(WorkerId(999_999), WorkerMessage::SkipWaiting)
            .await
            .unwrap_err();
        assert!(matches!(err, SwError::WorkerNotFound(_)));
    }

    #[tokio::test]
    async fn test_message_to_active_worker_is_accepted() {
        let (host, _events, _fetcher) = setup();
        let v1 = host
            .register(WorkerScript::new("bazaar-v1", origin()))
            .await
            .unwrap();

        // Nothing is waiting, so the skip request changes nothing.
        host.post_message(v1.worker().id(), WorkerMessage::SkipWaiting)
            .await
            .unwrap();
        assert!(v1.worker().skip_requested());
        assert_eq!(v1.worker().state(), WorkerState::Activated);
        assert_eq!(
            host.controller().await.map(|c| c.worker().id()),
            Some(v1.worker().id())
        );
    }
}
