//! Which pages can render without a network connection.

use std::sync::Arc;
use tracing::info;

use super::network::NetworkStatus;
use super::offline_data::OfflineStore;
use crate::config::ClientConfig;

/// Decides offline availability from the allow-list and the offline
/// product snapshot.
pub struct RouteResolver {
  routes: Vec<String>,
  product_prefix: String,
  data: Arc<OfflineStore>,
}

impl RouteResolver {
  pub fn new(config: &ClientConfig, data: Arc<OfflineStore>) -> Self {
    Self {
      routes: config.offline_routes.clone(),
      product_prefix: config.product_route_prefix.clone(),
      data,
    }
  }

  pub fn is_available_offline(&self, path: &str) -> bool {
    let path = strip_query(path);

    if self.routes.iter().any(|route| route == path) {
      return true;
    }

    // Parameterized entries such as "/orders/:id" match on the part before ':'
    let parameterized = self.routes.iter().any(|route| {
      route
        .split_once(':')
        .is_some_and(|(prefix, _)| path.starts_with(prefix))
    });
    if parameterized {
      return true;
    }

    match path.strip_prefix(&self.product_prefix) {
      Some(rest) => {
        let id = rest.rsplit('/').next().unwrap_or_default();
        !id.is_empty() && self.data.has_product(id)
      }
      None => false,
    }
  }
}

fn strip_query(path: &str) -> &str {
  let end = path.find(['?', '#']).unwrap_or(path.len());
  &path[..end]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationDecision {
  Proceed,
  /// Go to the offline page instead
  RedirectOffline(String),
}

/// Redirects navigations that cannot render while offline.
pub struct NavigationGuard {
  resolver: RouteResolver,
  network: Arc<NetworkStatus>,
  offline_route: String,
  offline_page: String,
}

impl NavigationGuard {
  pub fn new(
    resolver: RouteResolver,
    network: Arc<NetworkStatus>,
    offline_route: impl Into<String>,
    offline_page: impl Into<String>,
  ) -> Self {
    Self {
      resolver,
      network,
      offline_route: offline_route.into(),
      offline_page: offline_page.into(),
    }
  }

  pub fn resolver(&self) -> &RouteResolver {
    &self.resolver
  }

  pub fn decide(&self, path: &str) -> NavigationDecision {
    if self.network.is_online() {
      return NavigationDecision::Proceed;
    }

    let target = strip_query(path);
    if target == self.offline_route || target == self.offline_page {
      return NavigationDecision::Proceed;
    }

    if self.resolver.is_available_offline(path) {
      NavigationDecision::Proceed
    } else {
      info!(path, "Route unavailable offline, redirecting");
      NavigationDecision::RedirectOffline(self.offline_route.clone())
    }
  }
}
