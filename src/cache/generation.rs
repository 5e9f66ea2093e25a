//! Cache generations: the named caches that belong to one deployed version.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three caches every generation owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
  /// Shell assets written at install time
  Static,
  /// Pages and data kept explicitly for offline use
  Offline,
  /// Opportunistic copies of successful runtime fetches
  Dynamic,
}

impl CacheKind {
  /// Lookup order used when searching across a generation.
  pub const ALL: [CacheKind; 3] = [CacheKind::Static, CacheKind::Offline, CacheKind::Dynamic];

  pub fn as_str(&self) -> &'static str {
    match self {
      CacheKind::Static => "static",
      CacheKind::Offline => "offline",
      CacheKind::Dynamic => "dynamic",
    }
  }
}

impl fmt::Display for CacheKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Version string plus the prefix its cache names are built from.
///
/// Names look like `ai-store-static-v3.0.1`. Anything in the cache store that is
/// not one of [`CacheGeneration::names`] belongs to an older generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
  prefix: String,
  version: String,
}

impl CacheGeneration {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn name(&self, kind: CacheKind) -> String {
    format!("{}-{}-v{}", self.prefix, kind, self.version)
  }

  pub fn names(&self) -> Vec<String> {
    CacheKind::ALL.iter().map(|k| self.name(*k)).collect()
  }

  pub fn is_current(&self, cache_name: &str) -> bool {
    self.kind_of(cache_name).is_some()
  }

  pub fn kind_of(&self, cache_name: &str) -> Option<CacheKind> {
    CacheKind::ALL
      .into_iter()
      .find(|k| self.name(*k) == cache_name)
  }
}
