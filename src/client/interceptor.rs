//! Fetch wrapper for the client's own API calls.
//!
//! While offline, recognized read endpoints are answered from the offline
//! snapshot and every other API call gets a 503 marked as offline. While
//! online, successful reads are published so the snapshot can be refreshed
//! without holding up the caller.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::network::NetworkStatus;
use super::offline_data::{DataKind, OfflineStore};
use crate::config::ClientConfig;
use crate::http::{FetchFuture, Fetcher, Request, Response, CONTENT_TYPE, JSON};

pub const REQUESTED_URL_HEADER: &str = "x-requested-url";

const OFFLINE_MESSAGE: &str = "This request is not available in offline mode";
const NETWORK_ERROR_MESSAGE: &str = "Network error. Check your internet connection.";

/// A successful read from a recognized endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSuccess {
  pub endpoint: String,
  pub kind: DataKind,
  pub data: Value,
}

pub struct ApiInterceptor {
  inner: Arc<dyn Fetcher>,
  network: Arc<NetworkStatus>,
  data: Arc<OfflineStore>,
  api_prefix: String,
  /// Endpoints answerable from the snapshot, tried in order
  endpoints: Vec<(String, DataKind)>,
  events: Option<mpsc::UnboundedSender<ApiSuccess>>,
}

impl ApiInterceptor {
  pub fn new(
    inner: Arc<dyn Fetcher>,
    network: Arc<NetworkStatus>,
    data: Arc<OfflineStore>,
    api_prefix: &str,
    config: &ClientConfig,
  ) -> Self {
    Self {
      inner,
      network,
      data,
      api_prefix: api_prefix.to_string(),
      endpoints: vec![
        (config.products_endpoint.clone(), DataKind::Products),
        (config.current_user_endpoint.clone(), DataKind::User),
      ],
      events: None,
    }
  }

  pub fn with_events(mut self, events: mpsc::UnboundedSender<ApiSuccess>) -> Self {
    self.events = Some(events);
    self
  }

  fn endpoint_kind(&self, request: &Request) -> Option<DataKind> {
    self
      .endpoints
      .iter()
      .find(|(path, _)| request.path() == path)
      .map(|(_, kind)| *kind)
  }

  /// Snapshot data for a recognized endpoint, else the offline error.
  fn offline_response(&self, request: &Request, message: &str) -> Response {
    let url = request.url.to_string();
    let snapshot = self.data.snapshot();

    let (status, body) = match self.endpoint_kind(request) {
      Some(DataKind::Products) => (200, Value::Array(snapshot.products)),
      Some(DataKind::User) => (200, snapshot.user.unwrap_or(Value::Null)),
      None => (
        503,
        serde_json::json!({
          "error": true,
          "message": message,
          "offline": true,
          "url": url,
        }),
      ),
    };

    Response::json(status, &body)
      .unwrap_or_else(|_| Response::new(status, "").with_header(CONTENT_TYPE, JSON))
      .offline()
      .with_header(REQUESTED_URL_HEADER, &url)
  }

  fn publish(&self, request: &Request, response: &Response) {
    let (Some(events), Some(kind)) = (&self.events, self.endpoint_kind(request)) else {
      return;
    };
    match response.json_body::<Value>() {
      Ok(data) => {
        let event = ApiSuccess {
          endpoint: request.url.to_string(),
          kind,
          data,
        };
        if events.send(event).is_err() {
          debug!("No listener for API results");
        }
      }
      Err(e) => debug!(url = %request.url, error = %e, "API response is not JSON"),
    }
  }
}

impl Fetcher for ApiInterceptor {
  fn fetch<'a>(&'a self, request: &'a Request) -> FetchFuture<'a> {
    Box::pin(async move {
      let is_api = request.path().starts_with(&self.api_prefix);

      if is_api && !self.network.is_online() {
        debug!(url = %request.url, "Answering API call offline");
        return Ok(self.offline_response(request, OFFLINE_MESSAGE));
      }

      match self.inner.fetch(request).await {
        Ok(response) => {
          // Worker substitutes must never overwrite the snapshot
          if is_api && request.is_get() && response.is_ok() && !response.is_offline() {
            self.publish(request, &response);
          }
          Ok(response)
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "Request failed, using offline data");
          Ok(self.offline_response(request, NETWORK_ERROR_MESSAGE))
        }
      }
    })
  }
}

/// Feed published API results into the offline snapshot.
pub fn spawn_refresher(
  data: Arc<OfflineStore>,
) -> (mpsc::UnboundedSender<ApiSuccess>, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::unbounded_channel::<ApiSuccess>();
  let task = tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      if !data.cache_data(event.kind, event.data) {
        debug!(endpoint = %event.endpoint, "API result not cached");
      }
    }
    info!("Offline data refresher stopped");
  });
  (tx, task)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::client::persist::MemoryKeyValueStore;
  use crate::http::testing::{url, StubFetcher};
  use reqwest::Method;
  use serde_json::json;
  use std::time::Duration;

  struct Fixture {
    network: Arc<StubFetcher>,
    status: Arc<NetworkStatus>,
    data: Arc<OfflineStore>,
  }

  fn fixture() -> Fixture {
    let data = Arc::new(OfflineStore::new(Arc::new(MemoryKeyValueStore::new())));
    data.cache_data(DataKind::Products, json!([{"id": 1, "name": "Lamp"}]));
    Fixture {
      network: Arc::new(StubFetcher::new()),
      status: Arc::new(NetworkStatus::new(true)),
      data,
    }
  }

  fn interceptor(f: &Fixture) -> ApiInterceptor {
    ApiInterceptor::new(
      f.network.clone(),
      f.status.clone(),
      f.data.clone(),
      "/api/",
      &ClientConfig::default(),
    )
  }

  #[tokio::test]
  async fn offline_catalog_comes_from_snapshot() {
    let f = fixture();
    f.status.set_online(false);

    let response = interceptor(&f)
      .fetch(&Request::get(url("/api/products")))
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.json_body::<Value>().unwrap(), json!([{"id": 1, "name": "Lamp"}]));
    assert_eq!(response.header("X-Offline-Mode"), Some("true"));
    assert_eq!(
      response.header("X-Requested-URL"),
      Some("http://shop.test/api/products")
    );
    assert!(f.network.calls().is_empty());
  }

  #[tokio::test]
  async fn offline_unknown_endpoint_is_marked_error() {
    let f = fixture();
    f.status.set_online(false);

    let response = interceptor(&f)
      .fetch(&Request::get(url("/api/orders")))
      .await
      .unwrap();

    assert_eq!(response.status, 503);
    let body: Value = response.json_body().unwrap();
    assert_eq!(body["error"], true);
    assert_eq!(body["offline"], true);
    assert_eq!(body["url"], "http://shop.test/api/orders");
    assert!(f.network.calls().is_empty());
  }

  #[tokio::test]
  async fn offline_non_api_request_still_goes_out() {
    let f = fixture();
    f.status.set_online(false);
    f.network.respond("/about", Response::new(200, "about"));

    let response = interceptor(&f)
      .fetch(&Request::get(url("/about")))
      .await
      .unwrap();

    assert_eq!(response.text(), "about");
  }

  #[tokio::test]
  async fn failed_call_while_online_falls_back() {
    let f = fixture();
    f.data.cache_data(DataKind::User, json!({"id": 3, "username": "ana"}));
    f.network.fail("/api/users/me");
    f.network.fail("/api/cart");
    let interceptor = interceptor(&f);

    let user = interceptor
      .fetch(&Request::get(url("/api/users/me")))
      .await
      .unwrap();
    assert_eq!(user.status, 200);
    assert_eq!(user.json_body::<Value>().unwrap()["username"], "ana");

    let cart = interceptor.fetch(&Request::get(url("/api/cart"))).await.unwrap();
    assert_eq!(cart.status, 503);
    assert!(cart.is_offline());
  }

  #[tokio::test]
  async fn successful_reads_are_published() {
    let f = fixture();
    f.network
      .respond("/api/products", Response::json(200, &json!([{"id": 9}])).unwrap());
    f.network
      .respond("/api/orders", Response::json(200, &json!([{"id": 1}])).unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let interceptor = interceptor(&f).with_events(tx);

    interceptor
      .fetch(&Request::get(url("/api/orders")))
      .await
      .unwrap();
    interceptor
      .fetch(&Request::get(url("/api/products")).with_method(Method::POST))
      .await
      .unwrap();
    interceptor
      .fetch(&Request::get(url("/api/products")))
      .await
      .unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, DataKind::Products);
    assert_eq!(event.data, json!([{"id": 9}]));
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn offline_substitutes_are_not_published() {
    let f = fixture();
    f.network.respond(
      "/api/products",
      Response::new(200, "[]").with_header(CONTENT_TYPE, JSON).offline(),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let interceptor = interceptor(&f).with_events(tx);

    let response = interceptor
      .fetch(&Request::get(url("/api/products")))
      .await
      .unwrap();

    assert_eq!(response.text(), "[]");
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn refresher_updates_snapshot() {
    let f = fixture();
    f.network
      .respond("/api/products", Response::json(200, &json!([{"id": 77}])).unwrap());
    let (tx, _task) = spawn_refresher(f.data.clone());
    let interceptor = interceptor(&f).with_events(tx);

    interceptor
      .fetch(&Request::get(url("/api/products")))
      .await
      .unwrap();

    for _ in 0..100 {
      if f.data.has_product("77") {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(f.data.has_product("77"));
    assert!(!f.data.has_product("1"));
  }
}
