//! Install/activate lifecycle and the registration that owns active workers.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use super::clients::Clients;
use super::messages::WorkerReply;
use super::router::FetchOutcome;
use super::{lock, ServiceWorker};
use crate::cache::CacheKind;
use crate::http::{FetchFuture, Fetcher, Request, Response};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, not yet installed
  Parsed,
  Installing,
  /// Precache complete, waiting to activate
  Installed,
  Activating,
  /// Controlling clients and intercepting fetches
  Activated,
  /// Failed to install or replaced by a newer worker
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

impl ServiceWorker {
  pub fn state(&self) -> WorkerState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(WorkerState::Redundant)
  }

  pub(crate) fn set_state(&self, state: WorkerState) {
    if let Ok(mut current) = self.state.lock() {
      *current = state;
    }
  }

  /// Ask to be activated as soon as installation finishes.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Precache the shell manifest. Any failed asset fails the whole install
  /// and leaves the worker redundant.
  pub async fn install(&self) -> Result<()> {
    info!(version = self.version(), "Installing worker");
    self.set_state(WorkerState::Installing);

    match self.precache().await {
      Ok(count) => {
        info!(count, "Cached app shell and static assets");
        self.set_state(WorkerState::Installed);
        if self.settings.skip_waiting {
          self.skip_waiting();
        }
        Ok(())
      }
      Err(e) => {
        error!(version = self.version(), error = %e, "Installation failed");
        self.set_state(WorkerState::Redundant);
        Err(e)
      }
    }
  }

  /// Fetch every manifest asset, then write them all into the static cache.
  /// Nothing is written unless every fetch succeeded.
  pub(crate) async fn precache(&self) -> Result<usize> {
    let cache_name = self.generation.name(CacheKind::Static);
    self.caches.open(&cache_name)?;

    let requests: Vec<Request> = self
      .settings
      .static_assets
      .iter()
      .map(|url| Request::get(url.clone()))
      .collect();

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      Ok::<(String, Response), color_eyre::Report>((request.cache_key(), response))
    }))
    .await?;

    for (key, response) in &responses {
      self.caches.put(&cache_name, key, response)?;
    }

    Ok(responses.len())
  }

  /// Delete every cache outside this generation, then take control of all
  /// open clients. One failed deletion does not stop the others.
  pub async fn activate(&self, clients: &Clients) -> Result<()> {
    info!(version = self.version(), "Activating worker");
    self.set_state(WorkerState::Activating);

    let stale: Vec<String> = self
      .caches
      .keys()?
      .into_iter()
      .filter(|name| !self.generation.is_current(name))
      .collect();

    for cache_name in stale {
      match self.caches.delete(&cache_name) {
        Ok(_) => info!(cache = %cache_name, "Removed old cache"),
        Err(e) => warn!(cache = %cache_name, error = %e, "Failed to remove old cache"),
      }
    }

    let claimed = clients.claim(self.version())?;
    info!(claimed, "Claimed clients");
    self.set_state(WorkerState::Activated);

    Ok(())
  }
}

/// Tracks the active and waiting workers for one scope.
pub struct Registration {
  active: Mutex<Option<Arc<ServiceWorker>>>,
  waiting: Mutex<Option<Arc<ServiceWorker>>>,
  clients: Arc<Clients>,
  /// Used for requests no active worker intercepts
  network: Arc<dyn Fetcher>,
}

impl Registration {
  pub fn new(clients: Arc<Clients>, network: Arc<dyn Fetcher>) -> Self {
    Self {
      active: Mutex::new(None),
      waiting: Mutex::new(None),
      clients,
      network,
    }
  }

  pub fn clients(&self) -> &Arc<Clients> {
    &self.clients
  }

  pub fn active(&self) -> Option<Arc<ServiceWorker>> {
    self.active.lock().ok().and_then(|a| a.clone())
  }

  pub fn waiting(&self) -> Option<Arc<ServiceWorker>> {
    self.waiting.lock().ok().and_then(|w| w.clone())
  }

  /// Install `worker`; activate it right away if it asked to skip waiting
  /// or nothing is active yet, otherwise park it as the waiting worker.
  ///
  /// On install failure the previous active worker keeps serving.
  pub async fn register(&self, worker: Arc<ServiceWorker>) -> Result<()> {
    worker.install().await?;

    if worker.skip_waiting_requested() || self.active().is_none() {
      return self.promote(worker).await;
    }

    info!(version = worker.version(), "Worker installed, waiting to activate");
    if let Some(previous) = lock(&self.waiting)?.replace(worker) {
      previous.set_state(WorkerState::Redundant);
    }
    Ok(())
  }

  /// Activate the waiting worker now. Returns false if nothing was waiting.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let waiting = lock(&self.waiting)?.take();
    match waiting {
      Some(worker) => {
        worker.skip_waiting();
        self.promote(worker).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Reinstate a worker installed by an earlier run without precaching again.
  pub fn restore(&self, worker: Arc<ServiceWorker>) -> Result<()> {
    info!(version = worker.version(), "Restoring active worker");
    worker.set_state(WorkerState::Activated);
    self.clients.claim(worker.version())?;
    *lock(&self.active)? = Some(worker);
    Ok(())
  }

  /// Drop the active and waiting workers and release every client.
  /// Returns false if nothing was registered.
  pub fn unregister(&self) -> Result<bool> {
    let active = lock(&self.active)?.take();
    let waiting = lock(&self.waiting)?.take();
    let registered = active.is_some() || waiting.is_some();

    for worker in active.iter().chain(waiting.iter()) {
      worker.set_state(WorkerState::Redundant);
    }
    self.clients.release()?;

    if registered {
      info!("Worker unregistered");
    }
    Ok(registered)
  }

  async fn promote(&self, worker: Arc<ServiceWorker>) -> Result<()> {
    worker.activate(&self.clients).await?;
    if let Some(previous) = lock(&self.active)?.replace(worker) {
      previous.set_state(WorkerState::Redundant);
    }
    Ok(())
  }

  /// Route a page request through the active worker, or straight to the
  /// network when no worker intercepts it.
  pub async fn dispatch(&self, request: &Request) -> Result<Response> {
    let outcome = match self.active() {
      Some(worker) => worker.handle_fetch(request).await,
      None => FetchOutcome::Passthrough,
    };

    match outcome {
      FetchOutcome::Passthrough => self.network.fetch(request).await,
      FetchOutcome::Respond(response) => Ok(response),
      FetchOutcome::Failed(reason) => Err(eyre!(reason)),
    }
  }

  /// Tell every client that connectivity changed.
  pub fn notify_connectivity(&self, online: bool) -> Result<usize> {
    info!(online, "Connectivity changed");
    let message = WorkerReply::online_status(online).into_wire(None);
    self.clients.broadcast(message)
  }
}

/// Page-side fetch: everything a page loads goes through the registration.
impl Fetcher for Registration {
  fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
    Box::pin(self.dispatch(request))
  }
}

#[cfg(test)]
mod tests {
  use super::super::testing::{key, network, worker};
  use super::*;
  use crate::cache::{CacheStorage, CachedResponse, MemoryStorage};
  use crate::http::Response;

  /// Cache store that refuses to delete one cache.
  struct StuckCache {
    inner: MemoryStorage,
    stuck: &'static str,
  }

  impl CacheStorage for StuckCache {
    fn open(&self, cache_name: &str) -> Result<()> {
      self.inner.open(cache_name)
    }

    fn has(&self, cache_name: &str) -> Result<bool> {
      self.inner.has(cache_name)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }

    fn delete(&self, cache_name: &str) -> Result<bool> {
      if cache_name == self.stuck {
        return Err(eyre!("cache {} is locked", cache_name));
      }
      self.inner.delete(cache_name)
    }

    fn put(&self, cache_name: &str, url: &str, response: &Response) -> Result<()> {
      self.inner.put(cache_name, url, response)
    }

    fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
      self.inner.get(cache_name, url)
    }

    fn remove(&self, cache_name: &str, url: &str) -> Result<bool> {
      self.inner.remove(cache_name, url)
    }

    fn entry_urls(&self, cache_name: &str) -> Result<Vec<String>> {
      self.inner.entry_urls(cache_name)
    }
  }

  fn registration(network: &Arc<crate::http::testing::StubFetcher>) -> Registration {
    Registration::new(Arc::new(Clients::default()), network.clone())
  }

  #[tokio::test]
  async fn install_populates_static_cache() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let worker = worker("1", &caches, &network);

    worker.install().await.unwrap();

    assert_eq!(worker.state(), WorkerState::Installed);
    assert!(worker.skip_waiting_requested());
    assert_eq!(caches.entry_count("ai-store-static-v1").unwrap(), 4);
    let offline = caches
      .get("ai-store-static-v1", &key("/offline.html"))
      .unwrap()
      .unwrap();
    assert_eq!(offline.response.text(), "asset /offline.html");
  }

  #[tokio::test]
  async fn failed_asset_fails_install_closed() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    network.fail("/app.js");
    let worker = worker("1", &caches, &network);

    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert_eq!(caches.entry_count("ai-store-static-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn failed_install_keeps_previous_worker() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);
    registration
      .register(worker("1", &caches, &network))
      .await
      .unwrap();

    network.respond("/app.js", Response::new(500, "boom"));
    assert!(registration
      .register(worker("2", &caches, &network))
      .await
      .is_err());

    assert_eq!(registration.active().unwrap().version(), "1");
  }

  #[tokio::test]
  async fn activation_leaves_only_current_generation() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);

    for version in ["1", "2", "3"] {
      let worker = worker(version, &caches, &network);
      registration.register(worker.clone()).await.unwrap();
      // Runtime writes create the other two caches lazily
      caches
        .put(&format!("ai-store-dynamic-v{}", version), &key("/x"), &Response::new(200, "x"))
        .unwrap();
      caches
        .put(&format!("ai-store-offline-v{}", version), &key("/y"), &Response::new(200, "y"))
        .unwrap();
    }
    caches.open("someone-elses-cache").unwrap();
    registration
      .register(worker("4", &caches, &network))
      .await
      .unwrap();

    let mut names = caches.keys().unwrap();
    names.sort();
    assert_eq!(names, vec!["ai-store-static-v4"]);
    let active = registration.active().unwrap();
    assert_eq!(active.version(), "4");
    assert_eq!(active.state(), WorkerState::Activated);
    for name in caches.keys().unwrap() {
      assert!(active.generation().is_current(&name));
    }
  }

  #[tokio::test]
  async fn failed_deletion_does_not_block_other_stale_caches() {
    let caches = Arc::new(StuckCache {
      inner: MemoryStorage::new(),
      stuck: "ai-store-dynamic-v0",
    });
    for name in ["ai-store-static-v0", "ai-store-dynamic-v0", "ai-store-offline-v0"] {
      caches.put(name, &key("/x"), &Response::new(200, "x")).unwrap();
    }
    let network = network();
    let clients = Clients::default();
    let (client, _rx) = clients.connect(None).unwrap();
    let worker = Arc::new(ServiceWorker::new(
      super::super::testing::settings("1"),
      caches.clone(),
      network.clone(),
    ));
    worker.install().await.unwrap();

    worker.activate(&clients).await.unwrap();

    let mut names = caches.keys().unwrap();
    names.sort();
    assert_eq!(names, vec!["ai-store-dynamic-v0", "ai-store-static-v1"]);
    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(clients.controller(client).unwrap().as_deref(), Some("1"));
  }

  #[tokio::test]
  async fn unregister_drops_workers_and_releases_clients() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);
    let (client, _rx) = registration.clients().connect(None).unwrap();
    let worker = worker("1", &caches, &network);
    registration.register(worker.clone()).await.unwrap();

    assert!(registration.unregister().unwrap());

    assert!(registration.active().is_none());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert_eq!(registration.clients().controller(client).unwrap(), None);
    assert!(!registration.unregister().unwrap());
    let response = registration
      .dispatch(&Request::get(crate::http::testing::url("/app.js")))
      .await
      .unwrap();
    assert_eq!(response.text(), "asset /app.js");
    assert_eq!(network.call_count("/app.js"), 2);
  }

  #[tokio::test]
  async fn activation_claims_open_clients() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);
    let (client, _rx) = registration.clients().connect(None).unwrap();

    registration
      .register(worker("1", &caches, &network))
      .await
      .unwrap();

    assert_eq!(
      registration.clients().controller(client).unwrap(),
      Some("1".to_string())
    );
  }

  #[tokio::test]
  async fn worker_without_skip_waiting_waits_for_message() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);
    let first = worker("1", &caches, &network);
    registration.register(first.clone()).await.unwrap();

    let mut settings = super::super::testing::settings("2");
    settings.skip_waiting = false;
    let second = Arc::new(ServiceWorker::new(settings, caches.clone(), network.clone()));
    registration.register(second.clone()).await.unwrap();

    assert_eq!(second.state(), WorkerState::Installed);
    assert_eq!(registration.active().unwrap().version(), "1");

    assert!(registration.skip_waiting().await.unwrap());
    assert_eq!(registration.active().unwrap().version(), "2");
    assert_eq!(first.state(), WorkerState::Redundant);
    assert!(registration.waiting().is_none());
    assert!(!registration.skip_waiting().await.unwrap());
  }

  #[tokio::test]
  async fn dispatch_without_active_worker_goes_to_network() {
    let network = network();
    let registration = registration(&network);

    let response = registration
      .dispatch(&Request::get(crate::http::testing::url("/app.js")))
      .await
      .unwrap();

    assert_eq!(response.text(), "asset /app.js");
    assert_eq!(network.call_count("/app.js"), 1);
  }

  #[tokio::test]
  async fn bypassed_requests_reach_network_unmodified() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = registration(&network);
    registration
      .register(worker("1", &caches, &network))
      .await
      .unwrap();

    let post = Request::get(crate::http::testing::url("/api/orders"))
      .with_method(reqwest::Method::POST)
      .with_header("Authorization", "Bearer t")
      .with_body(r#"{"qty":1}"#);
    let payment = Request::get(url::Url::parse("https://api.stripe.com/v1/payment_intents").unwrap())
      .with_header("X-Session", "s1");
    registration.dispatch(&post).await.unwrap();
    let _ = registration.dispatch(&payment).await;

    let calls = network.calls();
    let sent_post = calls.iter().find(|r| r.url == post.url).unwrap();
    assert_eq!(sent_post.method, reqwest::Method::POST);
    assert_eq!(sent_post.body, post.body);
    assert_eq!(sent_post.headers, post.headers);
    let sent_payment = calls.iter().find(|r| r.url == payment.url).unwrap();
    assert_eq!(sent_payment.headers, payment.headers);
    assert_eq!(calls.iter().filter(|r| r.url == payment.url).count(), 1);
    assert!(caches.match_any(&post.cache_key()).unwrap().is_none());
  }
}
