//! Connectivity flag for the foreground context.

use color_eyre::{eyre::eyre, Result};
use tokio::sync::watch;
use tracing::info;

/// Single observable online/offline flag. Updated from connectivity
/// events only; it never probes the network.
pub struct NetworkStatus {
  tx: watch::Sender<bool>,
}

impl NetworkStatus {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record a connectivity event. Subscribers are only woken on an
  /// actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      if online {
        info!("Connection restored");
      } else {
        info!("Connection lost, working offline");
      }
    }
  }

  /// Subscription lasts until the returned value is dropped.
  pub fn subscribe(&self) -> NetworkSubscription {
    NetworkSubscription {
      rx: self.tx.subscribe(),
    }
  }

  #[cfg(test)]
  pub fn subscriber_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

impl Default for NetworkStatus {
  fn default() -> Self {
    Self::new(true)
  }
}

pub struct NetworkSubscription {
  rx: watch::Receiver<bool>,
}

impl NetworkSubscription {
  #[cfg(test)]
  pub fn is_online(&self) -> bool {
    *self.rx.borrow()
  }

  /// Wait for the next change and return the new value.
  pub async fn changed(&mut self) -> Result<bool> {
    self
      .rx
      .changed()
      .await
      .map_err(|e| eyre!("Network status closed: {}", e))?;
    Ok(*self.rx.borrow_and_update())
  }
}
