//! Background worker context.
//!
//! Owns the cache generation for one deployed version and answers three kinds
//! of events: lifecycle (install/activate), intercepted fetches, and messages
//! from foreground clients.

mod bridge;
mod clients;
mod fallback;
mod lifecycle;
mod messages;
mod operations;
mod router;

pub use bridge::{spawn_bridge, BridgeHandle, Inbound, WorkerClient};
pub use clients::{ClientId, Clients};
pub use fallback::OfflineFallback;
pub use lifecycle::{Registration, WorkerState};
pub use messages::{
  CacheInfo, CacheUrlsReport, ResourceCheck, UrlOutcome, WireMessage, WorkerReply, WorkerRequest,
};
pub use router::{FetchOutcome, RouteClass};

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::{CacheGeneration, CacheStorage};
use crate::config::WorkerConfig;
use crate::http::{resolve, Fetcher};

/// Worker configuration with every path resolved against the origin.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub origin: Url,
  pub version: String,
  pub cache_prefix: String,
  pub static_assets: Vec<Url>,
  static_paths: HashSet<String>,
  pub api_prefix: String,
  pub catalog_path: String,
  pub offline_page: Url,
  pub root_page: Url,
  pub image_placeholder: Url,
  pub payment_domains: Vec<String>,
  pub skip_waiting: bool,
}

impl WorkerSettings {
  pub fn from_config(origin: &Url, config: &WorkerConfig) -> Result<Self> {
    let static_assets = config
      .static_assets
      .iter()
      .map(|path| resolve(origin, path))
      .collect::<Result<Vec<_>>>()?;
    let static_paths = static_assets.iter().map(|u| u.path().to_string()).collect();

    Ok(Self {
      origin: origin.clone(),
      version: config.version.clone(),
      cache_prefix: config.cache_prefix.clone(),
      static_assets,
      static_paths,
      api_prefix: config.api_prefix.clone(),
      catalog_path: config.catalog_path.clone(),
      offline_page: resolve(origin, &config.offline_page)?,
      root_page: resolve(origin, &config.root_page)?,
      image_placeholder: resolve(origin, &config.image_placeholder)?,
      payment_domains: config
        .payment_domains
        .iter()
        .map(|d| d.to_lowercase())
        .collect(),
      skip_waiting: config.skip_waiting,
    })
  }

  pub fn generation(&self) -> CacheGeneration {
    CacheGeneration::new(&self.cache_prefix, &self.version)
  }

  /// Payment provider host or any of its subdomains.
  pub fn is_payment_host(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_lowercase();
    self
      .payment_domains
      .iter()
      .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
  }

  pub fn is_api(&self, url: &Url) -> bool {
    url.path().starts_with(&self.api_prefix)
  }

  pub fn is_catalog(&self, url: &Url) -> bool {
    url.path().starts_with(&self.catalog_path)
  }

  pub fn is_static_asset(&self, url: &Url) -> bool {
    self.static_paths.contains(url.path())
  }

  pub fn resolve(&self, url: &str) -> Result<Url> {
    resolve(&self.origin, url)
  }
}

/// One worker version: its settings, caches and network access.
pub struct ServiceWorker {
  settings: Arc<WorkerSettings>,
  generation: CacheGeneration,
  caches: Arc<dyn CacheStorage>,
  network: Arc<dyn Fetcher>,
  fallback: OfflineFallback,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  /// Background cache refreshes started by stale-while-revalidate
  background: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceWorker {
  pub fn new(
    settings: WorkerSettings,
    caches: Arc<dyn CacheStorage>,
    network: Arc<dyn Fetcher>,
  ) -> Self {
    let generation = settings.generation();
    let fallback = OfflineFallback::new(&settings, Arc::clone(&caches));

    Self {
      settings: Arc::new(settings),
      generation,
      caches,
      network,
      fallback,
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      background: Mutex::new(Vec::new()),
    }
  }

  pub fn version(&self) -> &str {
    self.generation.version()
  }

  pub fn generation(&self) -> &CacheGeneration {
    &self.generation
  }

  pub fn settings(&self) -> &WorkerSettings {
    &self.settings
  }

  pub fn caches(&self) -> &Arc<dyn CacheStorage> {
    &self.caches
  }

  /// Wait for every background cache refresh started so far.
  pub async fn settle(&self) {
    let handles = match self.background.lock() {
      Ok(mut background) => std::mem::take(&mut *background),
      Err(_) => return,
    };
    for handle in handles {
      let _ = handle.await;
    }
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut background) = self.background.lock() {
      background.retain(|h| !h.is_finished());
      background.push(handle);
    }
  }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
  mutex.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::WorkerConfig;
  use crate::http::testing::{url, StubFetcher, ORIGIN};
  use crate::http::Response;

  pub const ASSETS: [&str; 4] = ["/", "/offline.html", "/app.js", "/icons/logo.png"];

  pub fn settings(version: &str) -> WorkerSettings {
    let config = WorkerConfig {
      version: version.to_string(),
      static_assets: ASSETS.iter().map(|s| s.to_string()).collect(),
      ..WorkerConfig::default()
    };
    WorkerSettings::from_config(&Url::parse(ORIGIN).unwrap(), &config).unwrap()
  }

  /// Network that serves every manifest asset.
  pub fn network() -> Arc<StubFetcher> {
    let network = Arc::new(StubFetcher::new());
    for asset in ASSETS {
      network.respond(asset, Response::new(200, format!("asset {}", asset)));
    }
    network
  }

  pub fn worker(
    version: &str,
    caches: &Arc<MemoryStorage>,
    network: &Arc<StubFetcher>,
  ) -> Arc<ServiceWorker> {
    Arc::new(ServiceWorker::new(
      settings(version),
      caches.clone(),
      network.clone(),
    ))
  }

  pub fn key(path: &str) -> String {
    url(path).to_string()
  }
}
