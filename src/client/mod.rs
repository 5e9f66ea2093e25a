//! Foreground (document) context: connectivity, offline data, route
//! availability and the API fetch wrapper.

mod interceptor;
mod network;
mod offline_data;
mod persist;
mod routes;

pub use interceptor::{spawn_refresher, ApiInterceptor};
pub use network::{NetworkStatus, NetworkSubscription};
pub use offline_data::{DataKind, OfflineSnapshot, OfflineStore};
pub use persist::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use routes::{NavigationDecision, NavigationGuard, RouteResolver};
