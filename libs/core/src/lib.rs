//! Hookgram core contracts: the subscription model, store abstractions, service
//! descriptors and the routing pieces shared by the gateway and service plugins.
pub mod context;
pub mod events;
pub mod model;
pub mod oauth;
pub mod query;
pub mod registry;
pub mod scope;
pub mod service;
pub mod store;

pub use context::DispatchContext;
pub use events::{ConfigurationError, EventDispatcher, EventReport, trigger_event};
pub use model::*;
pub use query::{Condition, Query};
pub use registry::{RegistryError, ServiceRegistry, ServiceRegistryBuilder};
pub use scope::scope_to_hook;
pub use service::*;
pub use store::{InMemoryStore, StoreError, StoreHandle, StorePool, SubscriptionStore};
#[cfg(feature = "store_sqlite")]
pub use store::SqliteStore;

/// Returns the semantic version advertised by this crate.
///
/// ```
/// assert_eq!(hookgram_core::version(), "0.1.0");
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
