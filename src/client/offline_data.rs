//! Local mirror of the product list and the signed-in user.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::persist::KeyValueStore;

const PRODUCTS_KEY: &str = "offline_products";
const USER_KEY: &str = "offline_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
  Products,
  User,
}

impl fmt::Display for DataKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DataKind::Products => f.write_str("products"),
      DataKind::User => f.write_str("user"),
    }
  }
}

/// Last known products and user. Empty until loaded or populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot {
  pub products: Vec<Value>,
  pub user: Option<Value>,
}

impl OfflineSnapshot {
  /// Whether a product whose id renders as `id` is present. Numeric and
  /// string ids compare by their text.
  pub fn has_product(&self, id: &str) -> bool {
    self
      .products
      .iter()
      .filter_map(|p| p.get("id"))
      .any(|pid| id_text(pid).as_deref() == Some(id))
  }
}

/// A user is an object with a non-null `id`.
fn is_user(value: &Value) -> bool {
  value.is_object() && value.get("id").is_some_and(|id| !id.is_null())
}

fn username(user: &Value) -> &str {
  user
    .get("username")
    .and_then(serde_json::Value::as_str)
    .unwrap_or("unknown")
}

fn id_text(id: &Value) -> Option<String> {
  match id {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Explicitly constructed holder of the snapshot, persisting every change.
pub struct OfflineStore {
  snapshot: Mutex<OfflineSnapshot>,
  storage: Arc<dyn KeyValueStore>,
}

impl OfflineStore {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self {
      snapshot: Mutex::new(OfflineSnapshot::default()),
      storage,
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, OfflineSnapshot>> {
    self
      .snapshot
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn snapshot(&self) -> OfflineSnapshot {
    self.lock().map(|s| s.clone()).unwrap_or_default()
  }

  pub fn has_product(&self, id: &str) -> bool {
    self.lock().map(|s| s.has_product(id)).unwrap_or(false)
  }

  /// Accept `data` if it has the right shape: an array for products, an
  /// object with an `id` for the user. Anything else is ignored and
  /// leaves the snapshot untouched. Returns whether it was accepted.
  pub fn cache_data(&self, kind: DataKind, data: Value) -> bool {
    let accepted = match (kind, data) {
      (DataKind::Products, Value::Array(products)) => {
        info!(count = products.len(), "Cached products for offline use");
        self.replace(|s| s.products = products)
      }
      (DataKind::User, user) if is_user(&user) => {
        info!(username = username(&user), "Cached user for offline use");
        self.replace(|s| s.user = Some(user))
      }
      (kind, _) => {
        debug!(%kind, "Rejected offline data with unexpected shape");
        false
      }
    };

    if accepted {
      if let Err(e) = self.save() {
        error!(error = %e, "Failed to persist offline data");
      }
    }
    accepted
  }

  fn replace(&self, f: impl FnOnce(&mut OfflineSnapshot)) -> bool {
    match self.lock() {
      Ok(mut snapshot) => {
        f(&mut snapshot);
        true
      }
      Err(e) => {
        error!(error = %e, "Offline snapshot unavailable");
        false
      }
    }
  }

  fn save(&self) -> Result<()> {
    let snapshot = self.snapshot();
    let products = serde_json::to_string(&snapshot.products)
      .map_err(|e| eyre!("Failed to serialize products: {}", e))?;
    self.storage.set(PRODUCTS_KEY, &products)?;

    if let Some(user) = &snapshot.user {
      let user = serde_json::to_string(user).map_err(|e| eyre!("Failed to serialize user: {}", e))?;
      self.storage.set(USER_KEY, &user)?;
    }
    Ok(())
  }

  /// Repopulate the snapshot from storage. Missing or corrupt entries
  /// leave the corresponding field empty.
  pub fn load(&self) -> OfflineSnapshot {
    let products = match self.read(PRODUCTS_KEY) {
      Some(Value::Array(products)) => {
        info!(count = products.len(), "Loaded products from offline storage");
        products
      }
      Some(_) => {
        warn!("Stored products are not a list, ignoring");
        Vec::new()
      }
      None => Vec::new(),
    };

    let user = match self.read(USER_KEY) {
      Some(user) if is_user(&user) => {
        info!(username = username(&user), "Loaded user from offline storage");
        Some(user)
      }
      Some(_) => {
        warn!("Stored user has no identity, ignoring");
        None
      }
      None => None,
    };

    let loaded = OfflineSnapshot { products, user };
    self.replace(|s| *s = loaded.clone());
    loaded
  }

  fn read(&self, key: &str) -> Option<Value> {
    let raw = match self.storage.get(key) {
      Ok(raw) => raw?,
      Err(e) => {
        error!(key, error = %e, "Failed to read offline storage");
        return None;
      }
    };
    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        error!(key, error = %e, "Corrupt offline storage entry");
        None
      }
    }
  }

  /// Empty the snapshot and remove the persisted entries.
  pub fn clear(&self) -> Result<()> {
    self.replace(|s| *s = OfflineSnapshot::default());
    self.storage.remove(PRODUCTS_KEY)?;
    self.storage.remove(USER_KEY)?;
    info!("Offline data cleared");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::persist::MemoryKeyValueStore;
  use serde_json::json;

  fn store() -> (OfflineStore, Arc<MemoryKeyValueStore>) {
    let storage = Arc::new(MemoryKeyValueStore::new());
    (OfflineStore::new(storage.clone()), storage)
  }

  #[test]
  fn products_survive_reload() {
    let (store, storage) = store();
    let products = json!([{"id": 42, "name": "Widget"}, {"id": "a7", "name": "Gadget"}]);
    assert!(store.cache_data(DataKind::Products, products.clone()));

    let reloaded = OfflineStore::new(storage);
    let snapshot = reloaded.load();
    assert_eq!(Value::Array(snapshot.products), products);
    assert!(reloaded.has_product("42"));
    assert!(reloaded.has_product("a7"));
  }

  #[test]
  fn wrong_shapes_are_rejected() {
    let (store, storage) = store();
    store.cache_data(DataKind::Products, json!([{"id": 1}]));

    assert!(!store.cache_data(DataKind::Products, json!({"not": "an array"})));
    assert!(!store.cache_data(DataKind::User, Value::Null));
    assert!(!store.cache_data(DataKind::User, json!({"username": "no-id"})));
    assert!(!store.cache_data(DataKind::User, json!([1, 2])));

    assert_eq!(store.snapshot().products, vec![json!({"id": 1})]);
    assert_eq!(store.snapshot().user, None);
    assert_eq!(storage.get(USER_KEY).unwrap(), None);
  }

  #[test]
  fn user_with_id_is_accepted() {
    let (store, storage) = store();
    let user = json!({"id": 5, "username": "maria"});
    assert!(store.cache_data(DataKind::User, user.clone()));
    assert_eq!(store.snapshot().user, Some(user));
    assert!(storage.get(USER_KEY).unwrap().is_some());
  }

  #[test]
  fn corrupt_entries_load_as_empty() {
    let storage = Arc::new(MemoryKeyValueStore::new());
    storage.set(PRODUCTS_KEY, "{broken").unwrap();
    storage.set(USER_KEY, r#"{"id": 1, "username": "kim"}"#).unwrap();

    let store = OfflineStore::new(storage);
    let snapshot = store.load();

    assert!(snapshot.products.is_empty());
    assert_eq!(snapshot.user.unwrap()["username"], "kim");
  }

  #[test]
  fn stored_user_without_id_is_ignored() {
    let storage = Arc::new(MemoryKeyValueStore::new());
    storage.set(USER_KEY, r#"{"username": "x"}"#).unwrap();
    assert_eq!(OfflineStore::new(storage.clone()).load().user, None);

    storage.set(USER_KEY, r#"{"id": null, "username": "x"}"#).unwrap();
    assert_eq!(OfflineStore::new(storage).load().user, None);
  }

  #[test]
  fn clear_removes_everything() {
    let (store, storage) = store();
    store.cache_data(DataKind::Products, json!([{"id": 1}]));
    store.cache_data(DataKind::User, json!({"id": 1}));

    store.clear().unwrap();

    assert_eq!(store.snapshot(), OfflineSnapshot::default());
    assert_eq!(storage.get(PRODUCTS_KEY).unwrap(), None);
    assert_eq!(storage.get(USER_KEY).unwrap(), None);
    assert_eq!(OfflineStore::new(storage).load(), OfflineSnapshot::default());
  }
}
