//! Open pages under the registration's scope.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::lifecycle::WorkerId;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// One open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    /// URL the page was opened at.
    pub url: Url,
    /// Worker currently controlling the page, if any.
    pub controller: Option<WorkerId>,
}

/// Registry of open pages.
///
/// A freshly added page is uncontrolled until a worker activates and
/// claims it; pages opened under an existing controller inherit it.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page, optionally already controlled.
    pub fn add(&mut self, url: Url, controller: Option<WorkerId>) -> ClientId {
        let id = ClientId::next();
        debug!(client = %id, url = %url, "client attached");
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller,
            },
        );
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// Controller of a page, if it has one.
    pub fn controller_of(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.get(&id).and_then(|c| c.controller)
    }

    /// Points every open page at the given worker. Returns how many
    /// pages changed controller.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        debug!(worker = %worker, claimed, "clients claimed");
        claimed
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }
}

// ==================== Tests ====================
