use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Storefront origin that manifest paths and cache keys resolve against
  pub origin: String,
  pub worker: WorkerConfig,
  pub client: ClientConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5000".to_string(),
      worker: WorkerConfig::default(),
      client: ClientConfig::default(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Running version; also the suffix of every cache name
  pub version: String,
  pub cache_prefix: String,
  /// Shell assets precached at install time
  pub static_assets: Vec<String>,
  pub api_prefix: String,
  /// Catalog endpoint that degrades to an empty list when offline
  pub catalog_path: String,
  pub offline_page: String,
  pub root_page: String,
  pub image_placeholder: String,
  /// Hosts (and their subdomains) that are never intercepted
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub payment_domains: Vec<String>,
  /// Activate right after install instead of waiting for SKIP_WAITING
  pub skip_waiting: bool,
  pub fetch_timeout_secs: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      version: "3.0.1".to_string(),
      cache_prefix: "ai-store".to_string(),
      static_assets: [
        "/",
        "/index.html",
        "/manifest.json",
        "/offline.html",
        "/icons/icon-72x72.png",
        "/icons/icon-96x96.png",
        "/icons/icon-128x128.png",
        "/icons/icon-144x144.png",
        "/icons/icon-152x152.png",
        "/icons/icon-192x192.png",
        "/icons/icon-384x384.png",
        "/icons/icon-512x512.png",
        "/images/ai-store-icon.png",
        "/images/ai-store-icon-small.png",
        "/images/app-screenshot.jpg",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      api_prefix: "/api/".to_string(),
      catalog_path: "/api/products".to_string(),
      offline_page: "/offline.html".to_string(),
      root_page: "/".to_string(),
      image_placeholder: "/icons/image-placeholder.svg".to_string(),
      payment_domains: vec!["stripe.com".to_string()],
      skip_waiting: true,
      fetch_timeout_secs: 30,
    }
  }
}

impl WorkerConfig {
  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  pub products_endpoint: String,
  pub current_user_endpoint: String,
  /// Paths that render without network access. Entries containing `:` match
  /// every path sharing the part before the first `:`.
  pub offline_routes: Vec<String>,
  pub product_route_prefix: String,
  /// Client-side route shown when navigation is impossible offline
  pub offline_route: String,
  pub message_timeout_ms: u64,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      products_endpoint: "/api/products".to_string(),
      current_user_endpoint: "/api/users/me".to_string(),
      offline_routes: ["/", "/account", "/offline-test", "/offline-enhanced", "/offline"]
        .into_iter()
        .map(String::from)
        .collect(),
      product_route_prefix: "/product/".to_string(),
      offline_route: "/offline".to_string(),
      message_timeout_ms: 3000,
    }
  }
}

impl ClientConfig {
  pub fn message_timeout(&self) -> Duration {
    Duration::from_millis(self.message_timeout_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database (defaults to the user data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Directory for rolling log files (defaults to the user data directory)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront-offline/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("storefront-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_file_keeps_defaults() {
    let config = Config::parse(
      r#"
origin: "https://shop.example"
worker:
  version: "4.0.0"
  payment_domains: ["Stripe.com", "PayPal.com"]
"#,
    )
    .unwrap();

    assert_eq!(config.origin_url().unwrap().as_str(), "https://shop.example/");
    assert_eq!(config.worker.version, "4.0.0");
    assert_eq!(config.worker.payment_domains, vec!["stripe.com", "paypal.com"]);
    assert_eq!(config.worker.cache_prefix, "ai-store");
    assert!(config.worker.static_assets.contains(&"/offline.html".to_string()));
    assert_eq!(config.client.message_timeout(), Duration::from_secs(3));
  }

  #[test]
  fn empty_document_is_default() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.origin, "http://localhost:5000");
    assert_eq!(config.client.current_user_endpoint, "/api/users/me");
  }

  #[test]
  fn missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/offline.yaml"))).is_err());
  }
}
