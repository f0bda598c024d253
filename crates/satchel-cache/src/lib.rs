//! Satchel: an offline request cache.
//!
//! Classifies intercepted requests and runs each through a per-class
//! caching strategy — cache-first with dynamic capture for immutable
//! documents, network-first for API data, cache-first with an app-shell
//! fallback for everything else — against two versioned persistent stores.
//! Reads keep working with no network; writes degrade gracefully; every
//! request gets a response, synthesized if need be.
//!
//! Generations are installed from a manifest ([`LifecycleController`]),
//! and superseded generations are evicted wholesale at activation. The
//! host platform (an HTTP gateway, a test harness) supplies the network
//! via [`Fetch`] and drives [`OfflineEngine::handle`] per request.

pub mod classify;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod record;
pub mod sqlite;
pub mod store;

pub use classify::{Classifier, PolicyDecision};
pub use engine::{
    Fetch, OfflineEngine, ServeSource, ServedResponse, StatsSnapshot, DOCUMENT_OFFLINE_BODY,
    SERVICE_OFFLINE_BODY,
};
pub use error::{InstallError, NetworkError, StorageError};
pub use lifecycle::{ActivateReport, InstallReport, LifecycleController, Manifest};
pub use record::{Destination, RequestKey, RequestRecord};
pub use sqlite::SqliteBackend;
pub use store::{
    dynamic_store_name, static_store_name, CachedResponse, MemoryBackend, StoreBackend,
    StoreManager,
};
