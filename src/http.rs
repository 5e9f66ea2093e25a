//! Request/response snapshots and the network fetch seam.
//!
//! Both the worker and the client talk to the network only through [`Fetcher`],
//! so strategies and fallbacks can be exercised without a live origin.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

pub const CONTENT_TYPE: &str = "content-type";
pub const JSON: &str = "application/json";
/// Set on every response synthesized because the network was unreachable.
pub const OFFLINE_HEADER: &str = "x-offline-mode";

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Full page load
  Navigate,
  /// Anything loaded by a page (scripts, images, API calls)
  Subresource,
}

/// An outgoing request as seen by the worker or the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub mode: RequestMode,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      mode: RequestMode::Subresource,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Key under which the response is stored: the full URL without fragment.
  pub fn cache_key(&self) -> String {
    cache_key(&self.url)
  }
}

/// Strip the fragment so `/a#x` and `/a` share a cache entry.
pub fn cache_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// Resolve a manifest path or absolute URL against the storefront origin.
pub fn resolve(origin: &Url, path: &str) -> Result<Url> {
  origin
    .join(path)
    .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
}

/// A fully buffered response. Cached entries store exactly this snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  /// Serialize `value` as the body with a JSON content type.
  pub fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize response body: {}", e))?;
    Ok(Self::new(status, body).with_header(CONTENT_TYPE, JSON))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_lowercase())
      .map(String::as_str)
  }

  /// Tag as an offline substitute rather than an origin answer.
  pub fn offline(self) -> Self {
    self.with_header(OFFLINE_HEADER, "true")
  }

  pub fn is_offline(&self) -> bool {
    self.header(OFFLINE_HEADER) == Some("true")
  }

  /// 2xx status
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse JSON body: {}", e))
  }
}

/// Boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// The network. An `Err` means the request never produced a response
/// (DNS failure, refused connection, timeout); HTTP error statuses are `Ok`.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a>;
}

/// Fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network double shared by the module tests.

  use super::*;
  use std::collections::{HashMap, HashSet};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  pub const ORIGIN: &str = "http://shop.test";

  pub fn url(path: &str) -> Url {
    resolve(&Url::parse(ORIGIN).unwrap(), path).unwrap()
  }

  /// Answers from a per-URL table, 404 for unknown URLs, and fails
  /// every request while offline or for URLs marked as failing.
  #[derive(Default)]
  pub struct StubFetcher {
    routes: Mutex<HashMap<String, Response>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: Mutex<Vec<Request>>,
  }

  impl StubFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(&self, path: &str, response: Response) {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url(path).to_string(), response);
    }

    pub fn fail(&self, path: &str) {
      self.failing.lock().unwrap().insert(url(path).to_string());
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, path: &str) -> usize {
      let target = url(path);
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url == target)
        .count()
    }
  }

  impl Fetcher for StubFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
      Box::pin(async move {
        self.calls.lock().unwrap().push(request.clone());
        let key = request.cache_key();
        if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
          return Err(eyre!("network unreachable: {}", key));
        }
        Ok(
          self
            .routes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Response::new(404, "not found")),
        )
      })
    }
  }
}
