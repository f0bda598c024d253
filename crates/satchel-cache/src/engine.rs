//! The per-request policy engine.
//!
//! Every intercepted request is classified and run through one of three
//! strategies against the store manager. `handle` is total: the caller
//! always gets a response back, synthesized if both cache and network come
//! up empty.

use crate::classify::{Classifier, PolicyDecision};
use crate::error::NetworkError;
use crate::record::{Destination, RequestKey, RequestRecord};
use crate::store::{CachedResponse, StoreBackend, StoreManager};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed body for a synthesized "this document isn't available offline"
/// response. Distinct from [`SERVICE_OFFLINE_BODY`] so the presentation
/// layer can tell the two apart.
pub const DOCUMENT_OFFLINE_BODY: &str = "document not available offline";

/// Fixed body for a synthesized "this service isn't available offline"
/// response.
pub const SERVICE_OFFLINE_BODY: &str = "service not available offline";

/// The network seam. The gateway implements this with a real HTTP client;
/// tests script it.
///
/// Implementations map every failure mode (refused, DNS, timeout) to
/// [`NetworkError`] — the engine treats them all the same.
pub trait Fetch: Send + Sync {
    fn fetch(
        &self,
        req: &RequestRecord,
    ) -> impl Future<Output = Result<CachedResponse, NetworkError>> + Send;
}

impl<F: Fetch> Fetch for Arc<F> {
    fn fetch(
        &self,
        req: &RequestRecord,
    ) -> impl Future<Output = Result<CachedResponse, NetworkError>> + Send {
        (**self).fetch(req)
    }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
    /// Found in the static or dynamic store; no network call was made.
    CacheHit,
    /// Live upstream response.
    Network,
    /// Upstream unreachable; a previously captured response was served.
    Stale,
    /// Navigation with nothing cached for its URL; the app shell was
    /// served instead.
    OfflineFallback,
    /// Fabricated: nothing in cache, nothing from the network.
    Synthesized,
}

impl ServeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServeSource::CacheHit => "hit",
            ServeSource::Network => "network",
            ServeSource::Stale => "stale",
            ServeSource::OfflineFallback => "fallback",
            ServeSource::Synthesized => "synthesized",
        }
    }
}

/// Outcome of handling one request.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: CachedResponse,
    pub source: ServeSource,
    pub decision: PolicyDecision,
}

/// Counters for one engine instance. All relaxed; read via `snapshot`.
#[derive(Debug, Default)]
struct EngineStats {
    hits: AtomicU64,
    misses: AtomicU64,
    network_fetches: AtomicU64,
    stale_served: AtomicU64,
    offline_fallbacks: AtomicU64,
    synthesized: AtomicU64,
    capture_failures: AtomicU64,
}

/// Serializable point-in-time view of the engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub network_fetches: u64,
    pub stale_served: u64,
    pub offline_fallbacks: u64,
    pub synthesized: u64,
    pub capture_failures: u64,
}

impl EngineStats {
    fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        StatsSnapshot {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            offline_fallbacks: self.offline_fallbacks.load(Ordering::Relaxed),
            synthesized: self.synthesized.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
        }
    }
}

/// Executes the per-class caching strategies against the store manager.
pub struct OfflineEngine<B, F> {
    stores: StoreManager<B>,
    classifier: Classifier,
    fetch: F,
    /// Served to failed navigations; must be in the manifest for the
    /// offline shell guarantee to hold.
    fallback_path: String,
    stats: Arc<EngineStats>,
}

impl<B, F> OfflineEngine<B, F>
where
    B: StoreBackend + 'static,
    F: Fetch,
{
    pub fn new(stores: StoreManager<B>, classifier: Classifier, fetch: F) -> Self {
        Self {
            stores,
            classifier,
            fetch,
            fallback_path: "/".to_string(),
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn with_fallback_path(mut self, path: impl Into<String>) -> Self {
        self.fallback_path = path.into();
        self
    }

    pub fn stores(&self) -> &StoreManager<B> {
        &self.stores
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Handle one intercepted request. Always resolves to a response —
    /// storage and network failures are converted, never propagated.
    pub async fn handle(&self, req: &RequestRecord) -> ServedResponse {
        let decision = self.classifier.classify(req);

        let (response, source) = match decision {
            PolicyDecision::ImmutableAsset => self.cache_first(req).await,
            PolicyDecision::ApiPassthrough => self.network_first(req).await,
            PolicyDecision::GenericStatic => self.cache_first_generic(req).await,
            PolicyDecision::Bypass => self.passthrough(req).await,
        };

        self.record(decision, source);
        tracing::debug!(
            key = %req.key(),
            decision = decision.as_str(),
            source = source.as_str(),
            status = response.status,
            "request served"
        );

        ServedResponse {
            response,
            source,
            decision,
        }
    }

    /// Cache-first with dynamic capture: both stores, then the network,
    /// then a synthesized 404.
    async fn cache_first(&self, req: &RequestRecord) -> (CachedResponse, ServeSource) {
        let key = req.key();
        if let Some(found) = self.lookup(&key) {
            return (found, ServeSource::CacheHit);
        }

        match self.fetch.fetch(req).await {
            Ok(response) => {
                self.capture(req, &key, &response);
                (response, ServeSource::Network)
            }
            Err(error) => {
                tracing::debug!(key = %key, %error, "document unreachable and uncached");
                (synthesize_document_offline(), ServeSource::Synthesized)
            }
        }
    }

    /// Network-first: freshness wins, the cache is the fallback, and a
    /// synthesized 503 is the fallback's fallback.
    async fn network_first(&self, req: &RequestRecord) -> (CachedResponse, ServeSource) {
        let key = req.key();
        match self.fetch.fetch(req).await {
            Ok(response) => {
                self.capture(req, &key, &response);
                (response, ServeSource::Network)
            }
            Err(error) => {
                if let Some(found) = self.lookup(&key) {
                    tracing::debug!(key = %key, %error, "network failed, serving stale");
                    return (found, ServeSource::Stale);
                }
                tracing::debug!(key = %key, %error, "service unreachable and uncached");
                (synthesize_service_offline(), ServeSource::Synthesized)
            }
        }
    }

    /// Cache-first for everything else. A failed navigation falls back to
    /// the cached app shell so the application still loads offline.
    async fn cache_first_generic(&self, req: &RequestRecord) -> (CachedResponse, ServeSource) {
        let key = req.key();
        if let Some(found) = self.lookup(&key) {
            return (found, ServeSource::CacheHit);
        }

        match self.fetch.fetch(req).await {
            Ok(response) => {
                self.capture(req, &key, &response);
                (response, ServeSource::Network)
            }
            Err(error) => {
                if req.destination == Destination::Document {
                    let shell_key = RequestKey::new("GET", &self.fallback_path);
                    if let Some(shell) = self.lookup(&shell_key) {
                        tracing::debug!(key = %key, %error, "navigation offline, serving app shell");
                        return (shell, ServeSource::OfflineFallback);
                    }
                }
                tracing::debug!(key = %key, %error, "resource unreachable and uncached");
                (synthesize_document_offline(), ServeSource::Synthesized)
            }
        }
    }

    /// No store interaction at all; the response still must exist, so a
    /// dead network synthesizes a 503.
    async fn passthrough(&self, req: &RequestRecord) -> (CachedResponse, ServeSource) {
        match self.fetch.fetch(req).await {
            Ok(response) => (response, ServeSource::Network),
            Err(error) => {
                tracing::debug!(key = %req.key(), %error, "passthrough failed");
                (synthesize_service_offline(), ServeSource::Synthesized)
            }
        }
    }

    /// Storage read errors degrade to a miss — the request proceeds to the
    /// network as if nothing were cached.
    fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
        match self.stores.match_either(key) {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(key = %key, %error, "store lookup failed, treating as miss");
                None
            }
        }
    }

    /// Persist a successful response into the dynamic store without holding
    /// up the caller: the response has already been handed back when the
    /// write runs, and a failed write is only counted and logged.
    fn capture(&self, req: &RequestRecord, key: &RequestKey, response: &CachedResponse) {
        if response.status != 200 || !req.is_get() {
            return;
        }
        let stores = self.stores.clone();
        let stats = Arc::clone(&self.stats);
        let key = key.clone();
        let response = response.clone();
        tokio::spawn(async move {
            if let Err(error) = stores.put_dynamic(&key, &response) {
                stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, %error, "dynamic capture failed");
            }
        });
    }

    fn record(&self, decision: PolicyDecision, source: ServeSource) {
        let stats = &self.stats;
        match source {
            ServeSource::CacheHit => {
                stats.hits.fetch_add(1, Ordering::Relaxed);
            }
            ServeSource::Network => {
                if decision != PolicyDecision::Bypass {
                    stats.misses.fetch_add(1, Ordering::Relaxed);
                }
                stats.network_fetches.fetch_add(1, Ordering::Relaxed);
            }
            ServeSource::Stale => {
                stats.misses.fetch_add(1, Ordering::Relaxed);
                stats.stale_served.fetch_add(1, Ordering::Relaxed);
            }
            ServeSource::OfflineFallback => {
                stats.misses.fetch_add(1, Ordering::Relaxed);
                stats.offline_fallbacks.fetch_add(1, Ordering::Relaxed);
            }
            ServeSource::Synthesized => {
                if decision != PolicyDecision::Bypass {
                    stats.misses.fetch_add(1, Ordering::Relaxed);
                }
                stats.synthesized.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn synthesize_document_offline() -> CachedResponse {
    CachedResponse::text(404, DOCUMENT_OFFLINE_BODY)
}

fn synthesize_service_offline() -> CachedResponse {
    CachedResponse::text(503, SERVICE_OFFLINE_BODY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Scripted upstream: routes keyed `"METHOD:/path"`, a kill switch,
    /// and a call counter.
    #[derive(Default)]
    struct FakeUpstream {
        routes: Mutex<HashMap<String, CachedResponse>>,
        offline: AtomicBool,
        calls: AtomicU64,
    }

    impl FakeUpstream {
        fn route(&self, method: &str, path: &str, response: CachedResponse) {
            self.routes
                .lock()
                .insert(format!("{method}:{path}"), response);
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::Relaxed);
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    impl Fetch for FakeUpstream {
        fn fetch(
            &self,
            req: &RequestRecord,
        ) -> impl Future<Output = Result<CachedResponse, NetworkError>> + Send {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let result = if self.offline.load(Ordering::Relaxed) {
                Err(NetworkError::new("connection refused"))
            } else {
                match self.routes.lock().get(&format!("{}:{}", req.method, req.path)) {
                    Some(response) => Ok(response.clone()),
                    None => Err(NetworkError::new("no route to host")),
                }
            };
            async move { result }
        }
    }

    type TestEngine = OfflineEngine<MemoryBackend, Arc<FakeUpstream>>;

    fn engine() -> (TestEngine, Arc<FakeUpstream>) {
        let upstream = Arc::new(FakeUpstream::default());
        let stores = StoreManager::new(Arc::new(MemoryBackend::new()), "satchel", "v1");
        let engine = OfflineEngine::new(stores, Classifier::default(), Arc::clone(&upstream));
        (engine, upstream)
    }

    fn ok(body: &str) -> CachedResponse {
        CachedResponse::text(200, body)
    }

    /// Let detached capture tasks run (current-thread runtime: a sleep
    /// yields to every ready task).
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    #[tokio::test]
    async fn cached_document_served_without_network() {
        let (engine, upstream) = engine();
        let key = RequestKey::new("GET", "/books/a.pdf");
        engine.stores().put_static(&key, &ok("pdf bytes")).unwrap();

        let served = engine.handle(&RequestRecord::get("/books/a.pdf")).await;

        assert_eq!(served.source, ServeSource::CacheHit);
        assert_eq!(served.response.body, Bytes::from_static(b"pdf bytes"));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn dynamic_hit_also_skips_network() {
        let (engine, upstream) = engine();
        let key = RequestKey::new("GET", "/books/b.pdf");
        engine.stores().put_dynamic(&key, &ok("captured")).unwrap();

        let served = engine.handle(&RequestRecord::get("/books/b.pdf")).await;

        assert_eq!(served.source, ServeSource::CacheHit);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn document_miss_fetches_and_captures() {
        let (engine, upstream) = engine();
        upstream.route("GET", "/books/c.pdf", ok("fresh pdf"));

        let served = engine.handle(&RequestRecord::get("/books/c.pdf")).await;
        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.response.body, Bytes::from_static(b"fresh pdf"));

        settle().await;
        upstream.set_offline(true);

        let served = engine.handle(&RequestRecord::get("/books/c.pdf")).await;
        assert_eq!(served.source, ServeSource::CacheHit);
        assert_eq!(served.response.body, Bytes::from_static(b"fresh pdf"));
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn missing_document_offline_synthesizes_404() {
        let (engine, upstream) = engine();
        upstream.set_offline(true);

        let served = engine.handle(&RequestRecord::get("/missing.pdf")).await;

        assert_eq!(served.source, ServeSource::Synthesized);
        assert_eq!(served.response.status, 404);
        assert!(!served.response.body.is_empty());
        assert_eq!(served.response.body, Bytes::from(DOCUMENT_OFFLINE_BODY));
    }

    #[tokio::test]
    async fn api_prefers_network_over_cache() {
        let (engine, upstream) = engine();
        let key = RequestKey::new("GET", "/api/chapters/math");
        engine.stores().put_dynamic(&key, &ok("stale chapters")).unwrap();
        upstream.route("GET", "/api/chapters/math", ok("fresh chapters"));

        let served = engine.handle(&RequestRecord::get("/api/chapters/math")).await;

        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.response.body, Bytes::from_static(b"fresh chapters"));

        // The dynamic store now matches the network.
        settle().await;
        let stored = engine.stores().match_either(&key).unwrap().unwrap();
        assert_eq!(stored.body, Bytes::from_static(b"fresh chapters"));
    }

    #[tokio::test]
    async fn api_falls_back_to_stale_cache() {
        let (engine, upstream) = engine();
        upstream.route("GET", "/api/chapters/math", ok("chapters"));
        engine.handle(&RequestRecord::get("/api/chapters/math")).await;
        settle().await;

        upstream.set_offline(true);
        let served = engine.handle(&RequestRecord::get("/api/chapters/math")).await;

        assert_eq!(served.source, ServeSource::Stale);
        assert_eq!(served.response.body, Bytes::from_static(b"chapters"));
    }

    #[tokio::test]
    async fn api_offline_and_uncached_synthesizes_503() {
        let (engine, upstream) = engine();
        upstream.set_offline(true);

        let served = engine.handle(&RequestRecord::get("/api/chapters/math")).await;

        assert_eq!(served.source, ServeSource::Synthesized);
        assert_eq!(served.response.status, 503);
        assert_eq!(served.response.body, Bytes::from(SERVICE_OFFLINE_BODY));
    }

    #[tokio::test]
    async fn offline_navigation_serves_app_shell() {
        let (engine, upstream) = engine();
        let shell_key = RequestKey::new("GET", "/");
        engine.stores().put_static(&shell_key, &ok("<html>shell</html>")).unwrap();
        upstream.set_offline(true);

        let req = RequestRecord::get("/lessons/5").with_destination(Destination::Document);
        let served = engine.handle(&req).await;

        assert_eq!(served.source, ServeSource::OfflineFallback);
        assert_eq!(served.response.body, Bytes::from_static(b"<html>shell</html>"));
    }

    #[tokio::test]
    async fn offline_non_navigation_synthesizes_404() {
        let (engine, upstream) = engine();
        let shell_key = RequestKey::new("GET", "/");
        engine.stores().put_static(&shell_key, &ok("shell")).unwrap();
        upstream.set_offline(true);

        // Same URL shape, but not a navigation: no shell fallback.
        let served = engine.handle(&RequestRecord::get("/styles/app.css")).await;

        assert_eq!(served.source, ServeSource::Synthesized);
        assert_eq!(served.response.status, 404);
    }

    #[tokio::test]
    async fn offline_navigation_without_shell_synthesizes_404() {
        let (engine, upstream) = engine();
        upstream.set_offline(true);

        let req = RequestRecord::get("/lessons/5").with_destination(Destination::Document);
        let served = engine.handle(&req).await;

        assert_eq!(served.source, ServeSource::Synthesized);
        assert_eq!(served.response.status, 404);
    }

    #[tokio::test]
    async fn bypass_never_touches_stores() {
        let (engine, upstream) = engine();
        upstream.route("POST", "/upload", ok("accepted"));

        let mut req = RequestRecord::new("POST", "/upload");
        req.body = Bytes::from_static(b"payload");
        let served = engine.handle(&req).await;
        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.decision, PolicyDecision::Bypass);

        settle().await;
        let (static_len, dynamic_len) = engine.stores().sizes().unwrap();
        assert_eq!((static_len, dynamic_len), (0, 0));
    }

    #[tokio::test]
    async fn bypass_offline_still_answers() {
        let (engine, upstream) = engine();
        upstream.set_offline(true);

        let served = engine.handle(&RequestRecord::new("POST", "/upload")).await;

        assert_eq!(served.source, ServeSource::Synthesized);
        assert_eq!(served.response.status, 503);
        assert!(!served.response.body.is_empty());
    }

    #[tokio::test]
    async fn non_200_responses_are_not_captured() {
        let (engine, upstream) = engine();
        upstream.route("GET", "/api/chapters/gone", CachedResponse::text(410, "gone"));

        let served = engine.handle(&RequestRecord::get("/api/chapters/gone")).await;
        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.response.status, 410);

        settle().await;
        let (_, dynamic_len) = engine.stores().sizes().unwrap();
        assert_eq!(dynamic_len, 0);
    }

    #[tokio::test]
    async fn post_to_api_is_never_captured() {
        let (engine, upstream) = engine();
        upstream.route("POST", "/api/assistant", ok("reply"));

        let served = engine
            .handle(&RequestRecord::new("POST", "/api/assistant"))
            .await;
        assert_eq!(served.decision, PolicyDecision::ApiPassthrough);
        assert_eq!(served.source, ServeSource::Network);

        settle().await;
        let (_, dynamic_len) = engine.stores().sizes().unwrap();
        assert_eq!(dynamic_len, 0);
    }

    #[tokio::test]
    async fn every_class_answers_with_empty_stores_and_dead_network() {
        let (engine, upstream) = engine();
        upstream.set_offline(true);

        let requests = [
            RequestRecord::get("/books/a.pdf"),
            RequestRecord::get("/api/chapters/math"),
            RequestRecord::get("/lessons/5").with_destination(Destination::Document),
            RequestRecord::new("DELETE", "/session"),
        ];

        for req in requests {
            let served = engine.handle(&req).await;
            assert!(
                served.response.status == 404 || served.response.status == 503,
                "unexpected status {} for {}",
                served.response.status,
                req.path
            );
            assert!(!served.response.body.is_empty());
        }
    }

    #[tokio::test]
    async fn stats_reflect_traffic() {
        let (engine, upstream) = engine();
        upstream.route("GET", "/books/a.pdf", ok("pdf"));

        engine.handle(&RequestRecord::get("/books/a.pdf")).await; // miss + network
        settle().await;
        engine.handle(&RequestRecord::get("/books/a.pdf")).await; // hit
        upstream.set_offline(true);
        engine.handle(&RequestRecord::get("/api/x")).await; // miss + synthesized

        let stats = engine.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.network_fetches, 1);
        assert_eq!(stats.synthesized, 1);
        assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    /// Backend whose every operation fails, to prove storage trouble never
    /// reaches the caller.
    struct BrokenBackend;

    impl StoreBackend for BrokenBackend {
        fn open(&self, _: &str) -> Result<(), crate::error::StorageError> {
            Err(broken())
        }
        fn put(
            &self,
            _: &str,
            _: &RequestKey,
            _: &CachedResponse,
        ) -> Result<(), crate::error::StorageError> {
            Err(broken())
        }
        fn get(
            &self,
            _: &str,
            _: &RequestKey,
        ) -> Result<Option<CachedResponse>, crate::error::StorageError> {
            Err(broken())
        }
        fn list_stores(&self) -> Result<Vec<String>, crate::error::StorageError> {
            Err(broken())
        }
        fn delete_store(&self, _: &str) -> Result<(), crate::error::StorageError> {
            Err(broken())
        }
        fn len(&self, _: &str) -> Result<usize, crate::error::StorageError> {
            Err(broken())
        }
        fn trim(&self, _: &str, _: usize) -> Result<usize, crate::error::StorageError> {
            Err(broken())
        }
    }

    fn broken() -> crate::error::StorageError {
        crate::error::StorageError::Corrupt {
            key: "*".into(),
            reason: "storage unavailable".into(),
        }
    }

    #[tokio::test]
    async fn storage_failure_degrades_to_network_only() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.route("GET", "/books/a.pdf", ok("live pdf"));
        let stores = StoreManager::new(Arc::new(BrokenBackend), "satchel", "v1");
        let engine = OfflineEngine::new(stores, Classifier::default(), Arc::clone(&upstream));

        let served = engine.handle(&RequestRecord::get("/books/a.pdf")).await;

        // Lookup failed silently, the live response still made it through.
        assert_eq!(served.source, ServeSource::Network);
        assert_eq!(served.response.body, Bytes::from_static(b"live pdf"));

        settle().await;
        assert_eq!(engine.stats().capture_failures, 1);
    }
}
