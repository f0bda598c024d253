//! Install and activate: bringing a cache generation up, tearing stale
//! ones down. Inert during request handling.

use crate::engine::Fetch;
use crate::error::{InstallError, StorageError};
use crate::record::RequestRecord;
use crate::store::{dynamic_store_name, static_store_name, StoreBackend};
use std::sync::Arc;

/// Ordered list of paths that must be present in the static store after a
/// successful install. Supplied by the build/deploy step; consumed as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    paths: Vec<String>,
}

impl Manifest {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ActivateReport {
    /// Stores belonging to superseded generations, now gone.
    pub deleted: Vec<String>,
}

/// Drives the lifecycle of one cache generation: install populates the
/// versioned static store from the manifest, activate deletes every store
/// of every other generation and makes this one authoritative.
pub struct LifecycleController<B> {
    backend: Arc<B>,
    app: String,
    version: String,
    manifest: Manifest,
}

impl<B: StoreBackend> LifecycleController<B> {
    pub fn new(
        backend: Arc<B>,
        app: impl Into<String>,
        version: impl Into<String>,
        manifest: Manifest,
    ) -> Self {
        Self {
            backend,
            app: app.into(),
            version: version.into(),
            manifest,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn static_store(&self) -> String {
        static_store_name(&self.app, &self.version)
    }

    pub fn dynamic_store(&self) -> String {
        dynamic_store_name(&self.app, &self.version)
    }

    /// Fetch every manifest entry, then write them all into this
    /// generation's static store.
    ///
    /// All-or-nothing from the caller's perspective: every fetch must
    /// answer 200 before the first write happens, so a failed install
    /// leaves the store untouched and the previous generation stays
    /// authoritative. Re-running with an unchanged manifest overwrites in
    /// place — no duplicates, no missing entries.
    pub async fn install<F: Fetch>(&self, fetch: &F) -> Result<InstallReport, InstallError> {
        let mut fetched = Vec::with_capacity(self.manifest.len());
        for path in self.manifest.paths() {
            let req = RequestRecord::get(path);
            let response =
                fetch
                    .fetch(&req)
                    .await
                    .map_err(|source| InstallError::ManifestFetch {
                        path: path.clone(),
                        source,
                    })?;
            if response.status != 200 {
                return Err(InstallError::ManifestStatus {
                    path: path.clone(),
                    status: response.status,
                });
            }
            fetched.push((req.key(), response));
        }

        let store = self.static_store();
        self.backend.open(&store)?;
        let mut bytes = 0;
        for (key, response) in &fetched {
            bytes += response.body.len();
            self.backend.put(&store, key, response)?;
        }

        tracing::info!(
            store = %store,
            entries = fetched.len(),
            bytes,
            "static store installed"
        );
        Ok(InstallReport {
            entries: fetched.len(),
            bytes,
        })
    }

    /// Delete every store not belonging to this generation, then make sure
    /// both of its stores exist.
    ///
    /// After this returns, the caller should serve from this generation
    /// immediately — takeover does not wait for in-flight work against the
    /// old one.
    pub fn activate(&self) -> Result<ActivateReport, StorageError> {
        let keep_static = self.static_store();
        let keep_dynamic = self.dynamic_store();

        let mut deleted = Vec::new();
        for name in self.backend.list_stores()? {
            if name != keep_static && name != keep_dynamic {
                self.backend.delete_store(&name)?;
                tracing::info!(store = %name, "deleted stale store");
                deleted.push(name);
            }
        }

        self.backend.open(&keep_static)?;
        self.backend.open(&keep_dynamic)?;

        tracing::info!(version = %self.version, deleted = deleted.len(), "generation activated");
        Ok(ActivateReport { deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::record::RequestKey;
    use crate::store::{CachedResponse, MemoryBackend, StoreManager};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::future::Future;

    /// Minimal scripted fetcher for manifest prefetches.
    #[derive(Default)]
    struct ManifestUpstream {
        routes: Mutex<HashMap<String, CachedResponse>>,
    }

    impl ManifestUpstream {
        fn route(&self, path: &str, response: CachedResponse) {
            self.routes.lock().insert(path.to_string(), response);
        }
    }

    impl Fetch for ManifestUpstream {
        fn fetch(
            &self,
            req: &RequestRecord,
        ) -> impl Future<Output = Result<CachedResponse, NetworkError>> + Send {
            let result = match self.routes.lock().get(&req.path) {
                Some(response) => Ok(response.clone()),
                None => Err(NetworkError::new("no route to host")),
            };
            async move { result }
        }
    }

    fn ok(body: &str) -> CachedResponse {
        CachedResponse::text(200, body)
    }

    fn controller(
        backend: &Arc<MemoryBackend>,
        version: &str,
        paths: &[&str],
    ) -> LifecycleController<MemoryBackend> {
        LifecycleController::new(
            Arc::clone(backend),
            "satchel",
            version,
            Manifest::new(paths.iter().map(|p| p.to_string()).collect()),
        )
    }

    #[tokio::test]
    async fn install_populates_static_store() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("shell"));
        upstream.route("/books/a.pdf", ok("pdf bytes"));

        let lifecycle = controller(&backend, "v1", &["/", "/books/a.pdf"]);
        let report = lifecycle.install(&upstream).await.unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.bytes, "shell".len() + "pdf bytes".len());

        // Installed documents are served from the store, no network needed.
        let stores = StoreManager::new(backend, "satchel", "v1");
        let found = stores
            .match_static(&RequestKey::new("GET", "/books/a.pdf"))
            .unwrap()
            .unwrap();
        assert_eq!(found.body, Bytes::from_static(b"pdf bytes"));
    }

    #[tokio::test]
    async fn install_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("shell"));
        upstream.route("/a.pdf", ok("a"));

        let lifecycle = controller(&backend, "v1", &["/", "/a.pdf"]);
        lifecycle.install(&upstream).await.unwrap();
        lifecycle.install(&upstream).await.unwrap();

        assert_eq!(backend.len(&lifecycle.static_store()).unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_aborts_install_without_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("shell"));
        // "/broken.pdf" has no route: the fetch fails.

        let lifecycle = controller(&backend, "v1", &["/", "/broken.pdf"]);
        let err = lifecycle.install(&upstream).await.unwrap_err();

        assert!(matches!(err, InstallError::ManifestFetch { ref path, .. } if path == "/broken.pdf"));
        assert_eq!(backend.len(&lifecycle.static_store()).unwrap(), 0);
        assert!(backend.list_stores().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_200_manifest_entry_aborts_install() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("shell"));
        upstream.route("/gone.pdf", CachedResponse::text(404, "not here"));

        let lifecycle = controller(&backend, "v1", &["/", "/gone.pdf"]);
        let err = lifecycle.install(&upstream).await.unwrap_err();

        assert!(
            matches!(err, InstallError::ManifestStatus { status: 404, ref path } if path == "/gone.pdf")
        );
        assert_eq!(backend.len(&lifecycle.static_store()).unwrap(), 0);
    }

    #[tokio::test]
    async fn activate_deletes_every_other_generation() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("v1 shell"));

        let v1 = controller(&backend, "v1", &["/"]);
        v1.install(&upstream).await.unwrap();
        v1.activate().unwrap();

        upstream.route("/", ok("v2 shell"));
        let v2 = controller(&backend, "v2", &["/"]);
        v2.install(&upstream).await.unwrap();
        let report = v2.activate().unwrap();

        let mut deleted = report.deleted.clone();
        deleted.sort();
        assert_eq!(deleted, vec!["satchel-dynamic-v1", "satchel-static-v1"]);

        let names = backend.list_stores().unwrap();
        assert_eq!(names, vec!["satchel-dynamic-v2", "satchel-static-v2"]);
    }

    #[tokio::test]
    async fn activate_keeps_current_generation_contents() {
        let backend = Arc::new(MemoryBackend::new());
        let upstream = ManifestUpstream::default();
        upstream.route("/", ok("shell"));

        let lifecycle = controller(&backend, "v1", &["/"]);
        lifecycle.install(&upstream).await.unwrap();
        lifecycle.activate().unwrap();

        let stores = StoreManager::new(backend, "satchel", "v1");
        let found = stores.match_static(&RequestKey::new("GET", "/")).unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn activate_creates_missing_stores() {
        let backend = Arc::new(MemoryBackend::new());
        let lifecycle = controller(&backend, "v1", &[]);

        lifecycle.activate().unwrap();

        let names = backend.list_stores().unwrap();
        assert_eq!(names, vec!["satchel-dynamic-v1", "satchel-static-v1"]);
    }
}
