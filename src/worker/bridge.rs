//! Message channel between foreground clients and the worker.
//!
//! Clients post [`WireMessage`]s into a single inbox; each message is handled
//! on its own task and the reply is posted back to the sending client with
//! the same `messageId`. On the client side [`WorkerClient`] keeps a map of
//! pending calls keyed by that id and rejects calls that are not answered
//! within its timeout.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::clients::{ClientId, Clients};
use super::lifecycle::Registration;
use super::lock;
use super::messages::{
  CacheInfo, CacheUrlsReport, ResourceCheck, WireMessage, WorkerReply, WorkerRequest,
};
use crate::client::NetworkStatus;

/// A message posted by a client.
#[derive(Debug, Clone)]
pub struct Inbound {
  pub client: ClientId,
  pub message: WireMessage,
}

/// Start the worker's message loop.
pub fn spawn_bridge(registration: Arc<Registration>) -> BridgeHandle {
  let (inbox, mut rx) = mpsc::unbounded_channel::<Inbound>();

  let looped = Arc::clone(&registration);
  let task = tokio::spawn(async move {
    while let Some(inbound) = rx.recv().await {
      let registration = Arc::clone(&looped);
      tokio::spawn(async move { handle_inbound(&registration, inbound).await });
    }
    debug!("Worker inbox closed");
  });

  BridgeHandle {
    registration,
    inbox,
    task,
  }
}

async fn handle_inbound(registration: &Registration, inbound: Inbound) {
  let Inbound { client, message } = inbound;
  debug!(client, kind = %message.kind, "Received message");
  let request = WorkerRequest::from_wire(&message);

  if request.as_ref().is_ok_and(|r| !r.expects_reply()) {
    match registration.skip_waiting().await {
      Ok(true) => info!(client, "Activated waiting worker on request"),
      Ok(false) => debug!(client, "Skip waiting requested with no waiting worker"),
      Err(e) => error!(client, error = %e, "Failed to activate waiting worker"),
    }
    return;
  }

  let Some(message_id) = message.message_id.clone() else {
    debug!(client, kind = %message.kind, "Ignoring message without messageId");
    return;
  };

  let reply = match request {
    Ok(request) => match registration.active() {
      Some(worker) => {
        let kind = request.kind();
        worker.respond(request).await.unwrap_or_else(|e| {
          warn!(client, kind, error = %e, "Message operation failed");
          WorkerReply::error(e)
        })
      }
      None => WorkerReply::error("No active worker"),
    },
    Err(e) => {
      warn!(client, kind = %message.kind, error = %e, "Rejected message");
      WorkerReply::error(e)
    }
  };

  match registration.clients().post(client, reply.into_wire(Some(message_id))) {
    Ok(true) => {}
    Ok(false) => debug!(client, "Client gone before reply"),
    Err(e) => error!(client, error = %e, "Failed to post reply"),
  }
}

/// Owner of the running message loop.
pub struct BridgeHandle {
  registration: Arc<Registration>,
  inbox: mpsc::UnboundedSender<Inbound>,
  task: JoinHandle<()>,
}

impl BridgeHandle {
  #[cfg(test)]
  pub fn registration(&self) -> &Arc<Registration> {
    &self.registration
  }

  /// Post a raw message on behalf of `inbound.client`.
  #[cfg(test)]
  pub fn send(&self, inbound: Inbound) -> Result<()> {
    self
      .inbox
      .send(inbound)
      .map_err(|_| eyre!("Worker inbox closed"))
  }

  /// Open a client. Replies are matched to pending calls; connectivity
  /// broadcasts update `network` when given.
  pub fn connect(
    &self,
    timeout: Duration,
    network: Option<Arc<NetworkStatus>>,
  ) -> Result<WorkerClient> {
    let controller = self
      .registration
      .active()
      .map(|worker| worker.version().to_string());
    let clients = Arc::clone(self.registration.clients());
    let (id, replies) = clients.connect(controller)?;

    let pending: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>> =
      Arc::new(Mutex::new(HashMap::new()));
    let dispatcher = tokio::spawn(dispatch_replies(replies, Arc::clone(&pending), network));

    Ok(WorkerClient {
      id,
      inbox: self.inbox.clone(),
      clients,
      pending,
      counter: AtomicU64::new(0),
      timeout,
      dispatcher,
    })
  }
}

impl Drop for BridgeHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn dispatch_replies(
  mut replies: mpsc::UnboundedReceiver<WireMessage>,
  pending: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>,
  network: Option<Arc<NetworkStatus>>,
) {
  while let Some(message) = replies.recv().await {
    match message.message_id.clone() {
      Some(id) => {
        let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
        match waiter {
          Some(waiter) => {
            let _ = waiter.send(message);
          }
          None => debug!(message_id = %id, "Dropping unmatched reply"),
        }
      }
      None => match (WorkerReply::from_wire(&message), &network) {
        (Ok(WorkerReply::OnlineStatus(status)), Some(network)) => network.set_online(status.online),
        (Ok(_), _) => {}
        (Err(e), _) => debug!(error = %e, "Dropping unknown broadcast"),
      },
    }
  }
}

/// Foreground side of the channel.
pub struct WorkerClient {
  id: ClientId,
  inbox: mpsc::UnboundedSender<Inbound>,
  clients: Arc<Clients>,
  pending: Arc<Mutex<HashMap<String, oneshot::Sender<WireMessage>>>>,
  counter: AtomicU64,
  timeout: Duration,
  dispatcher: JoinHandle<()>,
}

impl WorkerClient {
  #[cfg(test)]
  pub fn id(&self) -> ClientId {
    self.id
  }

  pub fn controller(&self) -> Result<Option<String>> {
    self.clients.controller(self.id)
  }

  /// Calls still waiting for a reply.
  #[cfg(test)]
  pub fn pending_count(&self) -> usize {
    self.pending.lock().map(|p| p.len()).unwrap_or(0)
  }

  /// Post without waiting for a reply.
  pub fn post(&self, message: WireMessage) -> Result<()> {
    self
      .inbox
      .send(Inbound {
        client: self.id,
        message,
      })
      .map_err(|_| eyre!("Worker inbox closed"))
  }

  #[cfg(test)]
  pub fn skip_waiting(&self) -> Result<()> {
    self.post(WorkerRequest::SkipWaiting.into_wire(None))
  }

  pub async fn version(&self) -> Result<String> {
    match self.request(WorkerRequest::GetVersion).await? {
      WorkerReply::VersionInfo(info) => Ok(info.version),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn cache_info(&self) -> Result<CacheInfo> {
    match self.request(WorkerRequest::GetCacheInfo).await? {
      WorkerReply::CacheInfo(info) => Ok(info),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn cache_urls(&self, urls: Vec<String>) -> Result<CacheUrlsReport> {
    match self.request(WorkerRequest::CacheUrls { urls }).await? {
      WorkerReply::CacheResult(report) => Ok(report),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn check_resource(&self, url: &str) -> Result<ResourceCheck> {
    let request = WorkerRequest::CheckResource {
      url: url.to_string(),
    };
    match self.request(request).await? {
      WorkerReply::ResourceCheck(check) => Ok(check),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn update_cache(&self) -> Result<bool> {
    match self.request(WorkerRequest::UpdateCache).await? {
      WorkerReply::CacheUpdated(updated) => Ok(updated.success),
      other => Err(unexpected(&other)),
    }
  }

  /// Send a request and wait for its correlated reply. `ERROR` replies and
  /// timeouts are returned as errors.
  pub async fn request(&self, request: WorkerRequest) -> Result<WorkerReply> {
    let kind = request.kind();
    let message_id = self.next_message_id();
    let (tx, rx) = oneshot::channel();
    lock(&self.pending)?.insert(message_id.clone(), tx);

    if let Err(e) = self.post(request.into_wire(Some(message_id.clone()))) {
      self.forget(&message_id);
      return Err(e);
    }

    let message = match tokio::time::timeout(self.timeout, rx).await {
      Ok(Ok(message)) => message,
      Ok(Err(_)) => {
        self.forget(&message_id);
        return Err(eyre!("Reply channel closed for {}", kind));
      }
      Err(_) => {
        self.forget(&message_id);
        return Err(eyre!(
          "No reply to {} within {}ms",
          kind,
          self.timeout.as_millis()
        ));
      }
    };

    match WorkerReply::from_wire(&message)? {
      WorkerReply::Error(payload) => Err(eyre!("Worker error: {}", payload.error)),
      reply => Ok(reply),
    }
  }

  fn forget(&self, message_id: &str) {
    if let Ok(mut pending) = self.pending.lock() {
      pending.remove(message_id);
    }
  }

  fn next_message_id(&self) -> String {
    let n = self.counter.fetch_add(1, Ordering::SeqCst);
    format!(
      "{}-{}-{}",
      self.id,
      chrono::Utc::now().timestamp_millis(),
      n
    )
  }
}

impl Drop for WorkerClient {
  fn drop(&mut self) {
    self.clients.disconnect(self.id);
    self.dispatcher.abort();
  }
}

fn unexpected(reply: &WorkerReply) -> color_eyre::Report {
  eyre!("Unexpected reply: {}", reply.kind())
}

#[cfg(test)]
mod tests {
  use super::super::testing::{network, settings, worker};
  use super::super::ServiceWorker;
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::http::{FetchFuture, Fetcher, Request};

  const TIMEOUT: Duration = Duration::from_secs(2);

  async fn bridge_with_active(version: &str) -> (BridgeHandle, Arc<MemoryStorage>) {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = Arc::new(Registration::new(
      Arc::new(Clients::default()),
      network.clone(),
    ));
    registration
      .register(worker(version, &caches, &network))
      .await
      .unwrap();
    (spawn_bridge(registration), caches)
  }

  #[tokio::test]
  async fn reply_carries_request_id_to_sender_only() {
    let (bridge, _caches) = bridge_with_active("1").await;
    let clients = Arc::clone(bridge.registration().clients());
    let (asker, mut asker_rx) = clients.connect(None).unwrap();
    let (_other, mut other_rx) = clients.connect(None).unwrap();

    bridge
      .send(Inbound {
        client: asker,
        message: WorkerRequest::GetVersion.into_wire(Some("abc".to_string())),
      })
      .unwrap();

    let reply = tokio::time::timeout(TIMEOUT, asker_rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reply.message_id.as_deref(), Some("abc"));
    assert_eq!(reply.kind, "VERSION_INFO");
    assert_eq!(reply.payload.unwrap()["version"], "1");

    let extra = tokio::time::timeout(Duration::from_millis(100), asker_rx.recv()).await;
    assert!(extra.is_err());
    assert!(other_rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn concurrent_calls_resolve_independently() {
    let (bridge, _caches) = bridge_with_active("7").await;
    let client = bridge.connect(TIMEOUT, None).unwrap();

    let (version, info) = tokio::join!(client.version(), client.cache_info());

    assert_eq!(version.unwrap(), "7");
    assert_eq!(info.unwrap().static_entries, 4);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.controller().unwrap().as_deref(), Some("7"));
  }

  #[tokio::test]
  async fn malformed_request_with_id_gets_error_reply() {
    let (bridge, _caches) = bridge_with_active("1").await;
    let clients = Arc::clone(bridge.registration().clients());
    let (id, mut rx) = clients.connect(None).unwrap();

    let message = WireMessage::parse(r#"{"type":"CACHE_URLS","messageId":"m1"}"#).unwrap();
    bridge.send(Inbound { client: id, message }).unwrap();
    let untagged = WireMessage::parse(r#"{"type":"GET_VERSION"}"#).unwrap();
    bridge
      .send(Inbound {
        client: id,
        message: untagged,
      })
      .unwrap();

    let reply = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply.kind, "ERROR");
    assert_eq!(reply.message_id.as_deref(), Some("m1"));
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
      .await
      .is_err());
  }

  #[tokio::test]
  async fn failed_operation_rejects_the_call() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = Arc::new(Registration::new(
      Arc::new(Clients::default()),
      network.clone(),
    ));
    registration
      .register(worker("1", &caches, &network))
      .await
      .unwrap();
    let bridge = spawn_bridge(registration);
    let client = bridge.connect(TIMEOUT, None).unwrap();

    network.set_offline(true);
    let err = client.update_cache().await.unwrap_err();

    assert!(err.to_string().starts_with("Worker error"));
    assert_eq!(client.pending_count(), 0);
  }

  struct HangingFetcher;

  impl Fetcher for HangingFetcher {
    fn fetch<'a>(&'a self, _request: &'a Request) -> FetchFuture<'a> {
      Box::pin(futures::future::pending())
    }
  }

  #[tokio::test]
  async fn unanswered_call_times_out() {
    let caches = Arc::new(MemoryStorage::new());
    let hanging: Arc<dyn Fetcher> = Arc::new(HangingFetcher);
    let registration = Arc::new(Registration::new(
      Arc::new(Clients::default()),
      Arc::clone(&hanging),
    ));
    registration
      .restore(Arc::new(ServiceWorker::new(settings("1"), caches, hanging)))
      .unwrap();
    let bridge = spawn_bridge(registration);
    let client = bridge.connect(Duration::from_millis(50), None).unwrap();

    let err = client.cache_urls(vec!["/a".to_string()]).await.unwrap_err();

    assert!(err.to_string().contains("No reply to CACHE_URLS"));
    assert_eq!(client.pending_count(), 0);
  }

  #[tokio::test]
  async fn skip_waiting_message_activates_waiting_worker() {
    let caches = Arc::new(MemoryStorage::new());
    let network = network();
    let registration = Arc::new(Registration::new(
      Arc::new(Clients::default()),
      network.clone(),
    ));
    registration
      .register(worker("1", &caches, &network))
      .await
      .unwrap();
    let mut waiting = settings("2");
    waiting.skip_waiting = false;
    registration
      .register(Arc::new(ServiceWorker::new(waiting, caches.clone(), network.clone())))
      .await
      .unwrap();

    let bridge = spawn_bridge(Arc::clone(&registration));
    let client = bridge.connect(TIMEOUT, None).unwrap();
    client.skip_waiting().unwrap();

    for _ in 0..100 {
      if registration.active().map(|w| w.version().to_string()) == Some("2".to_string()) {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.version().await.unwrap(), "2");
    assert_eq!(client.controller().unwrap().as_deref(), Some("2"));
  }

  #[tokio::test]
  async fn connectivity_broadcast_updates_network_status() {
    let (bridge, _caches) = bridge_with_active("1").await;
    let status = Arc::new(NetworkStatus::new(true));
    let mut subscription = status.subscribe();
    let _client = bridge.connect(TIMEOUT, Some(Arc::clone(&status))).unwrap();

    bridge.registration().notify_connectivity(false).unwrap();

    let online = tokio::time::timeout(TIMEOUT, subscription.changed())
      .await
      .unwrap()
      .unwrap();
    assert!(!online);
    assert!(!status.is_online());
  }
}
