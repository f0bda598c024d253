use thiserror::Error;

/// A store open/read/write failed (quota, corruption, unavailable storage).
///
/// Never fatal on the request path: reads that fail are treated as cache
/// misses, writes that fail are logged and dropped, and the live network
/// response is still returned.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("cache storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// An upstream fetch failed (offline, DNS, connection reset, timeout).
///
/// Deliberately uniform — every flavor of network failure triggers the
/// same per-policy fallback, so there is nothing to branch on.
#[derive(Debug, Error)]
#[error("upstream fetch failed: {reason}")]
pub struct NetworkError {
    reason: String,
}

impl NetworkError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Installation of a cache generation failed.
///
/// Propagated to the host, which decides whether to retry or keep serving
/// the previous generation. A failed install never writes anything.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("manifest fetch for {path} failed: {source}")]
    ManifestFetch {
        path: String,
        #[source]
        source: NetworkError,
    },

    #[error("manifest entry {path} answered status {status}")]
    ManifestStatus { path: String, status: u16 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
