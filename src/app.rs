use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheKind, CacheStorage, SqliteStorage};
use crate::client::{
  spawn_refresher, ApiInterceptor, KeyValueStore, NavigationDecision, NavigationGuard,
  NetworkStatus, NetworkSubscription, OfflineStore, RouteResolver, SqliteKeyValueStore,
};
use crate::config::Config;
use crate::db::Database;
use crate::http::{resolve, Fetcher, HttpFetcher, Request, Response};
use crate::worker::{
  spawn_bridge, BridgeHandle, Clients, Registration, ServiceWorker, WorkerClient, WorkerSettings,
};

/// Durable storage key holding the version of the installed worker
const VERSION_KEY: &str = "sw-version";

/// Whether this process can serve the storefront offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineSupport {
  pub worker_active: bool,
  pub worker_state: Option<String>,
  /// Installed version waiting for skip-waiting
  pub waiting_version: Option<String>,
  /// Version recorded by the last successful registration
  pub stored_version: Option<String>,
  pub controller: Option<String>,
  pub can_work: bool,
}

/// Every long-lived component, constructed once and wired together.
pub struct App {
  origin: Url,
  registration: Arc<Registration>,
  bridge: BridgeHandle,
  client: WorkerClient,
  network: Arc<NetworkStatus>,
  storage: Arc<dyn KeyValueStore>,
  offline: Arc<OfflineStore>,
  api: ApiInterceptor,
  navigation: NavigationGuard,
  refresher: JoinHandle<()>,
  relay: JoinHandle<()>,
}

impl App {
  /// Open the on-disk stores and bring the worker up.
  pub async fn new(config: Config, online: bool) -> Result<Self> {
    let db = Database::open(config.storage.path.as_deref())?;
    let caches: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::new(&db));
    let storage: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::new(&db));
    let network: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.worker.fetch_timeout())?);

    Self::with_stores(config, caches, storage, network, online).await
  }

  pub async fn with_stores(
    config: Config,
    caches: Arc<dyn CacheStorage>,
    storage: Arc<dyn KeyValueStore>,
    network: Arc<dyn Fetcher>,
    online: bool,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let settings = WorkerSettings::from_config(&origin, &config.worker)?;

    let registration = Arc::new(Registration::new(
      Arc::new(Clients::default()),
      Arc::clone(&network),
    ));
    let worker = Arc::new(ServiceWorker::new(
      settings,
      Arc::clone(&caches),
      Arc::clone(&network),
    ));
    start_worker(&registration, worker, caches.as_ref(), storage.as_ref()).await;

    let bridge = spawn_bridge(Arc::clone(&registration));
    let status = Arc::new(NetworkStatus::new(online));
    let client = bridge.connect(config.client.message_timeout(), Some(Arc::clone(&status)))?;

    let relay = spawn_connectivity_relay(status.subscribe(), Arc::clone(&registration));

    let offline = Arc::new(OfflineStore::new(Arc::clone(&storage)));
    offline.load();

    let (events, refresher) = spawn_refresher(Arc::clone(&offline));
    let page_fetch: Arc<dyn Fetcher> = registration.clone();
    let api = ApiInterceptor::new(
      page_fetch,
      Arc::clone(&status),
      Arc::clone(&offline),
      &config.worker.api_prefix,
      &config.client,
    )
    .with_events(events);

    let navigation = NavigationGuard::new(
      RouteResolver::new(&config.client, Arc::clone(&offline)),
      Arc::clone(&status),
      config.client.offline_route.clone(),
      config.worker.offline_page.clone(),
    );

    Ok(Self {
      origin,
      registration,
      bridge,
      client,
      network: status,
      storage,
      offline,
      api,
      navigation,
      refresher,
      relay,
    })
  }

  pub fn registration(&self) -> &Arc<Registration> {
    &self.registration
  }

  /// This process's connection to the worker.
  pub fn client(&self) -> &WorkerClient {
    &self.client
  }

  pub fn offline(&self) -> &Arc<OfflineStore> {
    &self.offline
  }

  /// Connectivity event. The worker hears about it through the relay.
  pub fn set_online(&self, online: bool) {
    self.network.set_online(online);
  }

  /// Activate a waiting version now and record it as installed.
  pub async fn skip_waiting(&self) -> Result<bool> {
    if !self.registration.skip_waiting().await? {
      return Ok(false);
    }
    if let Some(worker) = self.registration.active() {
      self.storage.set(VERSION_KEY, worker.version())?;
    }
    Ok(true)
  }

  /// Drop the worker registration and forget its recorded version, so the
  /// next start installs from scratch.
  pub fn unregister(&self) -> Result<bool> {
    let registered = self.registration.unregister()?;
    self.storage.remove(VERSION_KEY)?;
    Ok(registered)
  }

  pub fn offline_support(&self) -> Result<OfflineSupport> {
    let active = self.registration.active();
    let controller = self.client.controller()?;
    let worker_active = active.is_some() && controller.is_some();
    Ok(OfflineSupport {
      worker_active,
      worker_state: active.map(|w| w.state().to_string()),
      waiting_version: self
        .registration
        .waiting()
        .map(|w| w.version().to_string()),
      stored_version: self.storage.get(VERSION_KEY)?,
      controller,
      can_work: worker_active,
    })
  }

  /// Clear the worker caches and every piece of client storage.
  pub fn reset(&self) -> Result<usize> {
    let removed = self.clear_caches()?;
    self.offline.clear()?;
    self.storage.remove(VERSION_KEY)?;
    info!(removed, "Application cache reset");
    Ok(removed)
  }

  /// Page load through the worker.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    self.registration.dispatch(request).await
  }

  /// Navigate to `path`: redirect when it cannot render offline, then
  /// load the resulting page.
  pub async fn navigate(&self, path: &str) -> Result<(NavigationDecision, Response)> {
    let decision = self.navigation.decide(path);
    let target = match &decision {
      NavigationDecision::Proceed => path,
      NavigationDecision::RedirectOffline(offline) => offline.as_str(),
    };
    let response = self
      .fetch(&Request::navigate(resolve(&self.origin, target)?))
      .await?;
    Ok((decision, response))
  }

  pub fn is_available_offline(&self, path: &str) -> bool {
    self.navigation.resolver().is_available_offline(path)
  }

  /// API call as the storefront makes it: through the interceptor.
  pub async fn api(&self, request: &Request) -> Result<Response> {
    self.api.fetch(request).await
  }

  pub fn resolve(&self, path: &str) -> Result<Url> {
    resolve(&self.origin, path)
  }

  /// Delete the current generation's caches.
  pub fn clear_caches(&self) -> Result<usize> {
    match self.registration.active() {
      Some(worker) => worker.clear_caches(),
      None => Ok(0),
    }
  }

  /// Let background work finish: cache refreshes and pending offline
  /// data updates.
  pub async fn shutdown(self) {
    let App {
      registration,
      api,
      refresher,
      relay,
      client,
      bridge,
      ..
    } = self;

    relay.abort();
    if let Some(worker) = registration.active() {
      worker.settle().await;
    }
    drop(api);
    if let Err(e) = refresher.await {
      warn!(error = %e, "Offline data refresher ended abnormally");
    }
    drop(client);
    drop(bridge);
  }
}

/// Forward connectivity changes to the worker, which tells every client.
fn spawn_connectivity_relay(
  mut subscription: NetworkSubscription,
  registration: Arc<Registration>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Ok(online) = subscription.changed().await {
      if let Err(e) = registration.notify_connectivity(online) {
        warn!(error = %e, "Failed to broadcast connectivity");
      }
    }
  })
}

/// Reinstate the worker from an earlier run when its version and static
/// cache are still present, otherwise install it. An install failure is
/// logged; pages then go straight to the network.
async fn start_worker(
  registration: &Registration,
  worker: Arc<ServiceWorker>,
  caches: &dyn CacheStorage,
  storage: &dyn KeyValueStore,
) {
  let version = worker.version().to_string();
  let static_cache = worker.generation().name(CacheKind::Static);

  let installed = storage.get(VERSION_KEY).ok().flatten();
  let cached = caches.has(&static_cache).unwrap_or(false);
  if installed.as_deref() == Some(version.as_str()) && cached {
    if let Err(e) = registration.restore(worker) {
      error!(error = %e, "Failed to restore worker");
    }
    return;
  }

  match registration.register(worker).await {
    Ok(()) => {
      info!(version = %version, "Worker registered");
      if let Err(e) = storage.set(VERSION_KEY, &version) {
        warn!(error = %e, "Failed to record worker version");
      }
    }
    Err(e) => error!(version = %version, error = %e, "Worker registration failed"),
  }
}
