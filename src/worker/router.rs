//! Fetch interception: request classification and per-class strategies.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::lifecycle::WorkerState;
use super::ServiceWorker;
use crate::cache::{CacheKind, CacheStorage};
use crate::http::{Fetcher, Request, Response};

/// Request classes, in the order they are tested. First match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
  /// Payment provider traffic; never touched
  PaymentProvider,
  /// Anything but GET; never touched
  NonGet,
  /// Network only, with offline fallbacks
  Api,
  /// Full page load: network, then offline page
  Navigation,
  /// Manifest asset: cache first
  StaticAsset,
  /// Everything else: stale-while-revalidate
  Dynamic,
}

impl RouteClass {
  pub fn is_intercepted(&self) -> bool {
    !matches!(self, RouteClass::PaymentProvider | RouteClass::NonGet)
  }
}

/// What the worker did with an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
  /// Not intercepted; the request goes to the network unmodified
  Passthrough,
  Respond(Response),
  /// Intercepted, but neither network nor cache could answer
  Failed(String),
}

impl ServiceWorker {
  pub fn classify(&self, request: &Request) -> RouteClass {
    let settings = &self.settings;
    if settings.is_payment_host(&request.url) {
      RouteClass::PaymentProvider
    } else if !request.is_get() {
      RouteClass::NonGet
    } else if settings.is_api(&request.url) {
      RouteClass::Api
    } else if request.is_navigation() {
      RouteClass::Navigation
    } else if settings.is_static_asset(&request.url) {
      RouteClass::StaticAsset
    } else {
      RouteClass::Dynamic
    }
  }

  /// Fetch event handler. Only an activated worker intercepts.
  pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
    if self.state() != WorkerState::Activated {
      return FetchOutcome::Passthrough;
    }

    let class = self.classify(request);
    if !class.is_intercepted() {
      return FetchOutcome::Passthrough;
    }
    debug!(url = %request.url, ?class, "Intercepted fetch");

    match class {
      RouteClass::PaymentProvider | RouteClass::NonGet => FetchOutcome::Passthrough,
      RouteClass::Api => FetchOutcome::Respond(self.network_only(request).await),
      RouteClass::Navigation => FetchOutcome::Respond(self.network_or_offline_page(request).await),
      RouteClass::StaticAsset => self.cache_first(request).await,
      RouteClass::Dynamic => self.stale_while_revalidate(request).await,
    }
  }

  async fn network_only(&self, request: &Request) -> Response {
    match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "API request failed, answering offline");
        if self.settings.is_catalog(&request.url) {
          self.fallback.catalog()
        } else {
          self.fallback.api_unavailable()
        }
      }
    }
  }

  async fn network_or_offline_page(&self, request: &Request) -> Response {
    match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, error = %e, "Navigation failed, serving offline page");
        self.fallback.page()
      }
    }
  }

  async fn cache_first(&self, request: &Request) -> FetchOutcome {
    let key = request.cache_key();
    if let Some(cached) = self.lookup(&key) {
      return FetchOutcome::Respond(cached);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          let cache_name = self.generation.name(CacheKind::Static);
          if let Err(e) = self.caches.put(&cache_name, &key, &response) {
            warn!(url = %key, error = %e, "Failed to cache static asset");
          }
        }
        FetchOutcome::Respond(response)
      }
      Err(e) => FetchOutcome::Failed(e.to_string()),
    }
  }

  async fn stale_while_revalidate(&self, request: &Request) -> FetchOutcome {
    let cache_name = self.generation.name(CacheKind::Dynamic);

    if let Some(cached) = self.lookup(&request.cache_key()) {
      let network = Arc::clone(&self.network);
      let caches = Arc::clone(&self.caches);
      let request = request.clone();
      self.track(tokio::spawn(async move {
        if let Err(e) = revalidate(network.as_ref(), caches.as_ref(), &cache_name, &request).await {
          debug!(url = %request.url, error = %e, "Background refresh failed");
        }
      }));
      return FetchOutcome::Respond(cached);
    }

    match revalidate(
      self.network.as_ref(),
      self.caches.as_ref(),
      &cache_name,
      request,
    )
    .await
    {
      Ok(response) => FetchOutcome::Respond(response),
      Err(_) if is_image(request) => FetchOutcome::Respond(self.fallback.image()),
      Err(e) => FetchOutcome::Failed(e.to_string()),
    }
  }

  /// First match across all caches. Read errors count as a miss.
  fn lookup(&self, key: &str) -> Option<Response> {
    match self.caches.match_any(key) {
      Ok(hit) => hit.map(|c| c.response),
      Err(e) => {
        warn!(url = %key, error = %e, "Cache lookup failed");
        None
      }
    }
  }
}

/// Fetch from the network and keep a copy of 200 responses for next time.
async fn revalidate(
  network: &dyn Fetcher,
  caches: &dyn CacheStorage,
  cache_name: &str,
  request: &Request,
) -> Result<Response> {
  let response = network.fetch(request).await?;
  if response.status == 200 {
    if let Err(e) = caches.put(cache_name, &request.cache_key(), &response) {
      warn!(url = %request.url, error = %e, "Failed to update dynamic cache");
    }
  }
  Ok(response)
}

fn is_image(request: &Request) -> bool {
  let path = request.path().to_lowercase();
  [".jpg", ".jpeg", ".png", ".gif", ".svg"]
    .iter()
    .any(|ext| path.ends_with(ext))
}
