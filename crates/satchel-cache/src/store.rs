use crate::error::StorageError;
use crate::record::RequestKey;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A response as held in a cache store: status line, headers, body bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Plain-text response, used for manifest shells in tests and for
    /// synthesized offline bodies.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Persistence seam: a set of named stores, each a mapping from
/// [`RequestKey`] to [`CachedResponse`].
///
/// Single-entry writes are atomic; concurrent writes to the same key are
/// last-write-wins. Implementations must tolerate operations on stores
/// that were never opened (reads miss, `len` is zero).
pub trait StoreBackend: Send + Sync {
    /// Idempotently create a store.
    fn open(&self, store: &str) -> Result<(), StorageError>;

    /// Insert or overwrite one entry. Overwriting makes the entry the
    /// newest for trim ordering.
    fn put(&self, store: &str, key: &RequestKey, response: &CachedResponse)
        -> Result<(), StorageError>;

    fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError>;

    /// Every store ever opened (or written to) and not yet deleted.
    fn list_stores(&self) -> Result<Vec<String>, StorageError>;

    /// Irreversibly remove a store and all its entries.
    fn delete_store(&self, store: &str) -> Result<(), StorageError>;

    fn len(&self, store: &str) -> Result<usize, StorageError>;

    /// Drop oldest entries until at most `max_entries` remain. Returns how
    /// many were removed.
    fn trim(&self, store: &str, max_entries: usize) -> Result<usize, StorageError>;
}

pub fn static_store_name(app: &str, version: &str) -> String {
    format!("{app}-static-{version}")
}

pub fn dynamic_store_name(app: &str, version: &str) -> String {
    format!("{app}-dynamic-{version}")
}

/// In-memory backend. The default for tests; also usable for a gateway
/// that accepts losing its cache on restart.
#[derive(Default)]
pub struct MemoryBackend {
    stores: Mutex<HashMap<String, MemStore>>,
}

#[derive(Default)]
struct MemStore {
    entries: HashMap<RequestKey, (u64, CachedResponse)>,
    next_seq: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, store: &str) -> Result<(), StorageError> {
        self.stores.lock().entry(store.to_string()).or_default();
        Ok(())
    }

    fn put(
        &self,
        store: &str,
        key: &RequestKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        let mut stores = self.stores.lock();
        let st = stores.entry(store.to_string()).or_default();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.entries.insert(key.clone(), (seq, response.clone()));
        Ok(())
    }

    fn get(&self, store: &str, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
        let stores = self.stores.lock();
        Ok(stores
            .get(store)
            .and_then(|st| st.entries.get(key))
            .map(|(_, resp)| resp.clone()))
    }

    fn list_stores(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete_store(&self, store: &str) -> Result<(), StorageError> {
        self.stores.lock().remove(store);
        Ok(())
    }

    fn len(&self, store: &str) -> Result<usize, StorageError> {
        Ok(self
            .stores
            .lock()
            .get(store)
            .map(|st| st.entries.len())
            .unwrap_or(0))
    }

    fn trim(&self, store: &str, max_entries: usize) -> Result<usize, StorageError> {
        let mut stores = self.stores.lock();
        let Some(st) = stores.get_mut(store) else {
            return Ok(0);
        };
        let mut removed = 0;
        while st.entries.len() > max_entries {
            let oldest = st
                .entries
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    st.entries.remove(&key);
                    removed += 1;
                }
                None => break,
            }
        }
        Ok(removed)
    }
}

/// Role-aware view over one backend: the static and dynamic stores of the
/// current generation.
///
/// Constructed once at startup and cloned into whoever needs it — there is
/// no ambient global cache handle. Clones share the backend.
pub struct StoreManager<B> {
    backend: Arc<B>,
    static_store: String,
    dynamic_store: String,
    /// Entry cap for the dynamic store. `None` (the default) means no
    /// per-entry eviction at all — captured entries live until the whole
    /// generation is deleted. Setting a cap is an explicit opt-in.
    dynamic_capacity: Option<usize>,
}

impl<B> Clone for StoreManager<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            static_store: self.static_store.clone(),
            dynamic_store: self.dynamic_store.clone(),
            dynamic_capacity: self.dynamic_capacity,
        }
    }
}

impl<B: StoreBackend> StoreManager<B> {
    pub fn new(backend: Arc<B>, app: &str, version: &str) -> Self {
        Self {
            backend,
            static_store: static_store_name(app, version),
            dynamic_store: dynamic_store_name(app, version),
            dynamic_capacity: None,
        }
    }

    pub fn with_dynamic_capacity(mut self, capacity: Option<usize>) -> Self {
        self.dynamic_capacity = capacity;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn static_store(&self) -> &str {
        &self.static_store
    }

    pub fn dynamic_store(&self) -> &str {
        &self.dynamic_store
    }

    /// Make sure both current-generation stores exist.
    pub fn open_current(&self) -> Result<(), StorageError> {
        self.backend.open(&self.static_store)?;
        self.backend.open(&self.dynamic_store)
    }

    /// Look a key up in the static store first, then the dynamic store.
    /// Install-time assets win over opportunistic captures.
    pub fn match_either(&self, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
        if let Some(found) = self.backend.get(&self.static_store, key)? {
            return Ok(Some(found));
        }
        self.backend.get(&self.dynamic_store, key)
    }

    pub fn match_static(&self, key: &RequestKey) -> Result<Option<CachedResponse>, StorageError> {
        self.backend.get(&self.static_store, key)
    }

    pub fn put_static(
        &self,
        key: &RequestKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        self.backend.put(&self.static_store, key, response)
    }

    pub fn put_dynamic(
        &self,
        key: &RequestKey,
        response: &CachedResponse,
    ) -> Result<(), StorageError> {
        self.backend.put(&self.dynamic_store, key, response)?;
        if let Some(capacity) = self.dynamic_capacity {
            let trimmed = self.backend.trim(&self.dynamic_store, capacity)?;
            if trimmed > 0 {
                tracing::debug!(store = %self.dynamic_store, trimmed, "dynamic store trimmed");
            }
        }
        Ok(())
    }

    /// Sizes of the (static, dynamic) stores, for stats reporting.
    pub fn sizes(&self) -> Result<(usize, usize), StorageError> {
        Ok((
            self.backend.len(&self.static_store)?,
            self.backend.len(&self.dynamic_store)?,
        ))
    }
}
