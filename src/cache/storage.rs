//! Cache storage trait and its in-memory and SQLite implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::http::Response;

/// A stored response and when it was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Named, persistent URL -> response stores.
///
/// Writes to the same key are last-write-wins; implementations only need to
/// make each individual call atomic.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open(&self, cache_name: &str) -> Result<()>;

  fn has(&self, cache_name: &str) -> Result<bool>;

  /// All cache names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a cache and every entry in it. Returns false if it did not exist.
  fn delete(&self, cache_name: &str) -> Result<bool>;

  /// Store a response, creating the cache on first write.
  fn put(&self, cache_name: &str, url: &str, response: &Response) -> Result<()>;

  fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Evict a single entry.
  fn remove(&self, cache_name: &str, url: &str) -> Result<bool>;

  /// URLs stored in a cache; empty for a missing cache.
  fn entry_urls(&self, cache_name: &str) -> Result<Vec<String>>;

  fn entry_count(&self, cache_name: &str) -> Result<usize> {
    Ok(self.entry_urls(cache_name)?.len())
  }

  /// Search every cache in creation order and return the first hit.
  fn match_any(&self, url: &str) -> Result<Option<CachedResponse>> {
    for cache_name in self.keys()? {
      if let Some(hit) = self.get(&cache_name, url)? {
        return Ok(Some(hit));
      }
    }
    Ok(None)
  }
}

/// Cache store held entirely in memory. Used in tests and when
/// persistence is unavailable.
#[derive(Default)]
pub struct MemoryStorage {
  caches: Mutex<Vec<(String, BTreeMap<String, CachedResponse>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_caches<T>(
    &self,
    f: impl FnOnce(&mut Vec<(String, BTreeMap<String, CachedResponse>)>) -> T,
  ) -> Result<T> {
    let mut caches = self
      .caches
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut caches))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    self.with_caches(|caches| {
      if !caches.iter().any(|(name, _)| name == cache_name) {
        caches.push((cache_name.to_string(), BTreeMap::new()));
      }
    })
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    self.with_caches(|caches| caches.iter().any(|(name, _)| name == cache_name))
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_caches(|caches| caches.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    self.with_caches(|caches| {
      let before = caches.len();
      caches.retain(|(name, _)| name != cache_name);
      caches.len() != before
    })
  }

  fn put(&self, cache_name: &str, url: &str, response: &Response) -> Result<()> {
    self.with_caches(|caches| {
      let entry = CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      };
      match caches.iter_mut().find(|(name, _)| name == cache_name) {
        Some((_, entries)) => {
          entries.insert(url.to_string(), entry);
        }
        None => {
          let mut entries = BTreeMap::new();
          entries.insert(url.to_string(), entry);
          caches.push((cache_name.to_string(), entries));
        }
      }
    })
  }

  fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    self.with_caches(|caches| {
      caches
        .iter()
        .find(|(name, _)| name == cache_name)
        .and_then(|(_, entries)| entries.get(url).cloned())
    })
  }

  fn remove(&self, cache_name: &str, url: &str) -> Result<bool> {
    self.with_caches(|caches| {
      caches
        .iter_mut()
        .find(|(name, _)| name == cache_name)
        .map(|(_, entries)| entries.remove(url).is_some())
        .unwrap_or(false)
    })
  }

  fn entry_urls(&self, cache_name: &str) -> Result<Vec<String>> {
    self.with_caches(|caches| {
      caches
        .iter()
        .find(|(name, _)| name == cache_name)
        .map(|(_, entries)| entries.keys().cloned().collect())
        .unwrap_or_default()
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
  pub fn new(db: &Database) -> Self {
    Self { conn: db.conn() }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// SHA256 of the URL for stable, fixed-length keys
fn url_hash(url: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  hex::encode(hasher.finalize())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;
    Ok(())
  }

  fn has(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache_name, e))?;
    Ok(found.is_some())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, cache_name: &str) -> Result<bool> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let result = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )
      .and_then(|_| conn.execute("DELETE FROM caches WHERE name = ?", params![cache_name]));

    match result {
      Ok(removed) => {
        conn
          .execute("COMMIT", [])
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(removed > 0)
      }
      Err(e) => {
        let _ = conn.execute("ROLLBACK", []);
        Err(eyre!("Failed to delete cache {}: {}", cache_name, e))
      }
    }
  }

  fn put(&self, cache_name: &str, url: &str, response: &Response) -> Result<()> {
    let conn = self.lock()?;
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO caches (name) VALUES (?)",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_name, url_hash, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          cache_name,
          url_hash(url),
          url,
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", url, cache_name, e))?;

    Ok(())
  }

  fn get(&self, cache_name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND url_hash = ?",
        params![cache_name, url_hash(url)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", url, cache_name, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn remove(&self, cache_name: &str, url: &str) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ? AND url_hash = ?",
        params![cache_name, url_hash(url)],
      )
      .map_err(|e| eyre!("Failed to evict {} from {}: {}", url, cache_name, e))?;
    Ok(removed > 0)
  }

  fn entry_urls(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY url")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", cache_name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry URL: {}", e))?;

    Ok(urls)
  }

  fn entry_count(&self, cache_name: &str) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", cache_name, e))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
