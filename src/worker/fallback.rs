//! Substitute responses for requests the network could not answer.
//!
//! Every substitute carries the offline marker header so the client can
//! tell it apart from an answer of the origin.

use std::sync::Arc;
use tracing::{info, warn};

use super::WorkerSettings;
use crate::cache::CacheStorage;
use crate::http::{cache_key, Response, CONTENT_TYPE, JSON};

const OFFLINE_MESSAGE: &str = "You are offline. This request needs a network connection.";

const OFFLINE_HTML: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>";

const PLACEHOLDER_SVG: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\" viewBox=\"0 0 200 200\">\
<rect width=\"200\" height=\"200\" fill=\"#e5e7eb\"/>\
<path d=\"M60 140l30-40 25 30 15-20 30 30z\" fill=\"#9ca3af\"/></svg>";

/// Resolves offline substitutes from the cache store, falling back to
/// built-in bodies when nothing suitable is cached.
pub struct OfflineFallback {
  caches: Arc<dyn CacheStorage>,
  catalog: String,
  offline_page: String,
  root_page: String,
  image_placeholder: String,
}

impl OfflineFallback {
  pub fn new(settings: &WorkerSettings, caches: Arc<dyn CacheStorage>) -> Self {
    let catalog = settings
      .resolve(&settings.catalog_path)
      .map(|u| cache_key(&u))
      .unwrap_or_else(|_| settings.catalog_path.clone());

    Self {
      caches,
      catalog,
      offline_page: cache_key(&settings.offline_page),
      root_page: cache_key(&settings.root_page),
      image_placeholder: cache_key(&settings.image_placeholder),
    }
  }

  /// Last cached catalog, or an empty product list.
  pub fn catalog(&self) -> Response {
    self
      .cached(&self.catalog)
      .unwrap_or_else(|| Response::new(200, "[]").with_header(CONTENT_TYPE, JSON))
      .offline()
  }

  /// 503 with `{ error: "offline", message }`.
  pub fn api_unavailable(&self) -> Response {
    let body = serde_json::json!({
      "error": "offline",
      "message": OFFLINE_MESSAGE,
    });
    Response::json(503, &body)
      .unwrap_or_else(|_| Response::new(503, "offline"))
      .offline()
  }

  /// Cached offline page, then cached root page, then a built-in page.
  pub fn page(&self) -> Response {
    if let Some(page) = self.cached(&self.offline_page) {
      info!("Serving offline page");
      return page.offline();
    }
    if let Some(root) = self.cached(&self.root_page) {
      info!("Serving cached root page");
      return root.offline();
    }
    Response::new(503, OFFLINE_HTML)
      .with_header(CONTENT_TYPE, "text/html; charset=utf-8")
      .offline()
  }

  pub fn image(&self) -> Response {
    self
      .cached(&self.image_placeholder)
      .unwrap_or_else(|| Response::new(200, PLACEHOLDER_SVG).with_header(CONTENT_TYPE, "image/svg+xml"))
      .offline()
  }

  fn cached(&self, key: &str) -> Option<Response> {
    match self.caches.match_any(key) {
      Ok(hit) => hit.map(|c| c.response),
      Err(e) => {
        warn!(url = %key, error = %e, "Cache lookup failed");
        None
      }
    }
  }
}
