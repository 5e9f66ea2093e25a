//! Foreground clients connected to the worker.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::lock;
use super::messages::WireMessage;

pub type ClientId = u64;

struct ClientSlot {
  /// Version of the worker controlling this client
  controller: Option<String>,
  outbox: mpsc::UnboundedSender<WireMessage>,
}

/// Registry of open clients and the worker -> client direction of the
/// message channel.
#[derive(Default)]
pub struct Clients {
  slots: Mutex<BTreeMap<ClientId, ClientSlot>>,
  next_id: AtomicU64,
}

impl Clients {
  /// Open a client. `controller` is the worker version already controlling
  /// it, if any.
  pub fn connect(
    &self,
    controller: Option<String>,
  ) -> Result<(ClientId, mpsc::UnboundedReceiver<WireMessage>)> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let (outbox, inbox) = mpsc::unbounded_channel();
    lock(&self.slots)?.insert(id, ClientSlot { controller, outbox });
    debug!(client = id, "Client connected");
    Ok((id, inbox))
  }

  pub fn disconnect(&self, id: ClientId) {
    if let Ok(mut slots) = self.slots.lock() {
      if slots.remove(&id).is_some() {
        debug!(client = id, "Client disconnected");
      }
    }
  }

  /// Make `version` the controller of every open client.
  pub fn claim(&self, version: &str) -> Result<usize> {
    let mut slots = lock(&self.slots)?;
    for slot in slots.values_mut() {
      slot.controller = Some(version.to_string());
    }
    Ok(slots.len())
  }

  /// Leave every open client uncontrolled.
  pub fn release(&self) -> Result<usize> {
    let mut slots = lock(&self.slots)?;
    for slot in slots.values_mut() {
      slot.controller = None;
    }
    Ok(slots.len())
  }

  pub fn controller(&self, id: ClientId) -> Result<Option<String>> {
    Ok(lock(&self.slots)?.get(&id).and_then(|s| s.controller.clone()))
  }

  /// Deliver to one client. Returns false if it is gone.
  pub fn post(&self, id: ClientId, message: WireMessage) -> Result<bool> {
    let mut slots = lock(&self.slots)?;
    let Some(slot) = slots.get(&id) else {
      return Ok(false);
    };
    if slot.outbox.send(message).is_err() {
      slots.remove(&id);
      return Ok(false);
    }
    Ok(true)
  }

  /// Deliver to every client, dropping the ones whose receiver is gone.
  pub fn broadcast(&self, message: WireMessage) -> Result<usize> {
    let mut slots = lock(&self.slots)?;
    slots.retain(|_, slot| slot.outbox.send(message.clone()).is_ok());
    Ok(slots.len())
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.slots.lock().map(|s| s.len()).unwrap_or(0)
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
