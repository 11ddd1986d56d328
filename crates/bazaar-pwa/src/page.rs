//! The page context and its controlled fetch seam.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;
use url::Url;

use bazaar_net::{Fetch, NetError, Request, Response};
use bazaar_sw::{ClientId, FetchOutcome, ServiceWorkerHost};

/// An open storefront page.
///
/// Every request goes through [`fetch`](PageClient::fetch): when a
/// worker controls the page and intercepts the request, its response is
/// what the page sees; otherwise the request rides the direct
/// transport. `PageClient` implements [`Fetch`] itself, so the config
/// loader and application code sit behind the same seam.
pub struct PageClient {
    host: Arc<ServiceWorkerHost>,
    transport: Arc<dyn Fetch>,
    client_id: ClientId,
    url: Url,
}

impl PageClient {
    /// Opens a page at the given URL and attaches it to the host. The
    /// page inherits the current controller, if any.
    pub async fn attach(host: Arc<ServiceWorkerHost>, transport: Arc<dyn Fetch>, url: Url) -> Self {
        let client_id = host.add_client(url.clone()).await;
        Self {
            host,
            transport,
            client_id,
            url,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// URL the page is open at.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Controlled fetch.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.route(request).await
    }

    async fn route(&self, request: Request) -> Result<Response, NetError> {
        if let Some(controller) = self.host.controller().await {
            match controller.handle_fetch(request.clone()).await {
                FetchOutcome::Handled(response) => return Ok(response),
                FetchOutcome::Passthrough => {
                    debug!(url = %request.url, "not intercepted, using direct transport");
                }
            }
        }
        self.transport.fetch(request).await
    }

    /// Re-navigates to the page's own URL. After an upgrade this runs
    /// under the new controller, so the page comes back from the new
    /// version's generation.
    pub async fn reload(&self) -> Result<Response, NetError> {
        self.route(Request::navigation(self.url.clone())).await
    }

    /// Detaches the page from the host. Closing the last open page
    /// frees a waiting version to activate.
    pub async fn close(self) {
        self.host.remove_client(self.client_id).await;
    }
}

impl Fetch for PageClient {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.route(request))
    }
}

// ==================== Tests ====================
