mod admin;
mod config;
mod handler;
mod upstream;

use admin::{lifecycle_handler, stats_handler};
use arc_swap::ArcSwap;
use axum::routing::{any, get, post};
use axum::Router;
use config::Config;
use handler::{gateway_handler, AppState, Engine, ReloadRequest};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use satchel_cache::{
    Classifier, LifecycleController, Manifest, OfflineEngine, SqliteBackend, StoreBackend,
    StoreManager,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use upstream::HttpUpstream;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load config
    let config = if Path::new("config.toml").exists() {
        match Config::load(Path::new("config.toml")) {
            Ok(c) => {
                tracing::info!("loaded config from config.toml");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load config.toml, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!("no config.toml found, using defaults");
        Config::default_config()
    };

    // Install Prometheus metrics recorder
    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    // Open the persistent cache database
    let backend = Arc::new(
        SqliteBackend::open_file(Path::new(&config.cache.db_path))
            .unwrap_or_else(|e| panic!("failed to open cache db {}: {e}", config.cache.db_path)),
    );

    // Bring up the configured generation: install the manifest, prune the
    // rest. A failed install falls back to whatever is already on disk.
    let active_version = bring_up(&backend, &config).await;
    let engine = build_engine(&backend, &config, &active_version);

    let (reload_tx, reload_rx) = mpsc::unbounded_channel::<ReloadRequest>();

    let state = Arc::new(AppState {
        engine: ArcSwap::from_pointee(engine),
        reload_tx,
    });

    // Shutdown token for graceful shutdown
    let shutdown = CancellationToken::new();

    // Reload task: applies config changes and admin-forced reinstalls
    tokio::spawn(reload_task(
        reload_rx,
        Arc::clone(&state),
        Arc::clone(&backend),
        config.clone(),
        active_version,
    ));

    // Config file watcher feeds the reload task
    spawn_config_watcher(PathBuf::from("config.toml"), Arc::clone(&state));

    // Build admin router (separate port)
    let admin_router = Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/lifecycle", post(lifecycle_handler))
        .route(
            "/metrics",
            get(move || {
                let h = prom_handle.clone();
                async move { h.render() }
            }),
        )
        .with_state(Arc::clone(&state));

    // Build gateway router (main port)
    let gateway_router = Router::new()
        .route("/{*path}", any(gateway_handler))
        .route("/", any(gateway_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let gateway_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        gateway = %gateway_addr,
        admin = %admin_addr,
        upstream = %config.upstream.url,
        version = %config.cache.version,
        manifest_entries = config.manifest.paths.len(),
        db = %config.cache.db_path,
        "satchel gateway starting"
    );

    let gateway_listener = tokio::net::TcpListener::bind(&gateway_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind gateway to {gateway_addr}: {e}"));

    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind admin to {admin_addr}: {e}"));

    // Spawn shutdown signal handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    // Run both servers with graceful shutdown
    let gateway_shutdown = shutdown.clone();
    let admin_shutdown = shutdown.clone();

    let gateway_future = axum::serve(gateway_listener, gateway_router)
        .with_graceful_shutdown(gateway_shutdown.cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin_router)
        .with_graceful_shutdown(admin_shutdown.cancelled_owned());

    tokio::select! {
        result = gateway_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "gateway server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    tracing::info!("satchel gateway shut down");
}

/// Install and activate the configured generation. On install failure the
/// previous generation (if any) stays authoritative and is served instead.
async fn bring_up(backend: &Arc<SqliteBackend>, config: &Config) -> String {
    let fetch = HttpUpstream::new(
        &config.upstream.url,
        Duration::from_millis(config.upstream.timeout_ms),
    );
    let lifecycle = LifecycleController::new(
        Arc::clone(backend),
        &config.cache.app_name,
        &config.cache.version,
        Manifest::new(config.manifest.paths.clone()),
    );

    match lifecycle.install(&fetch).await {
        Ok(report) => {
            match lifecycle.activate() {
                Ok(activated) => {
                    tracing::info!(
                        version = %config.cache.version,
                        entries = report.entries,
                        bytes = report.bytes,
                        pruned = activated.deleted.len(),
                        "cache generation ready"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "activation failed; serving without pruning");
                }
            }
            config.cache.version.clone()
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                version = %config.cache.version,
                "install failed, falling back to existing generation"
            );
            existing_generation(backend, &config.cache.app_name).unwrap_or_else(|| {
                tracing::warn!("no existing generation on disk, serving network-only");
                config.cache.version.clone()
            })
        }
    }
}

/// Newest generation already on disk, by static store name. Versions are
/// expected to sort (v1 < v2).
fn existing_generation(backend: &Arc<SqliteBackend>, app: &str) -> Option<String> {
    let prefix = format!("{app}-static-");
    let names = backend.list_stores().ok()?;
    names
        .iter()
        .filter_map(|name| name.strip_prefix(&prefix))
        .map(str::to_string)
        .max()
}

fn build_engine(backend: &Arc<SqliteBackend>, config: &Config, version: &str) -> Engine {
    let stores = StoreManager::new(Arc::clone(backend), &config.cache.app_name, version)
        .with_dynamic_capacity(config.cache.dynamic_capacity);
    let classifier = Classifier::new(
        config.cache.api_prefix.clone(),
        config.cache.document_suffixes.clone(),
    );
    let fetch = HttpUpstream::new(
        &config.upstream.url,
        Duration::from_millis(config.upstream.timeout_ms),
    );
    OfflineEngine::new(stores, classifier, fetch)
        .with_fallback_path(config.cache.offline_fallback_path.clone())
}

/// Applies config reloads and forced reinstalls, swapping the engine when
/// a new generation activates. Takeover is immediate: in-flight requests
/// finish on the old engine, everything after the swap sees the new one.
async fn reload_task(
    mut rx: mpsc::UnboundedReceiver<ReloadRequest>,
    state: Arc<AppState>,
    backend: Arc<SqliteBackend>,
    mut current: Config,
    mut active_version: String,
) {
    while let Some(request) = rx.recv().await {
        match request {
            ReloadRequest::Reinstall => {
                if let Some(version) = reinstall(&backend, &current).await {
                    active_version = version;
                    state
                        .engine
                        .store(Arc::new(build_engine(&backend, &current, &active_version)));
                }
            }
            ReloadRequest::ConfigChanged(new) => {
                let plan = config::diff(&current, &new);
                current = new;
                if plan.reinstall {
                    if let Some(version) = reinstall(&backend, &current).await {
                        active_version = version;
                    }
                }
                if plan.rebuild_engine {
                    state
                        .engine
                        .store(Arc::new(build_engine(&backend, &current, &active_version)));
                    tracing::info!(version = %active_version, "config reloaded, engine swapped");
                }
            }
        }
    }
}

/// Install and activate the configured generation. Returns the activated
/// version, or None if the install failed (the old generation keeps
/// serving).
async fn reinstall(backend: &Arc<SqliteBackend>, config: &Config) -> Option<String> {
    let fetch = HttpUpstream::new(
        &config.upstream.url,
        Duration::from_millis(config.upstream.timeout_ms),
    );
    let lifecycle = LifecycleController::new(
        Arc::clone(backend),
        &config.cache.app_name,
        &config.cache.version,
        Manifest::new(config.manifest.paths.clone()),
    );

    match lifecycle.install(&fetch).await {
        Ok(report) => {
            if let Err(e) = lifecycle.activate() {
                tracing::error!(error = %e, "activation failed after reinstall");
            }
            tracing::info!(
                version = %config.cache.version,
                entries = report.entries,
                "generation reinstalled"
            );
            Some(config.cache.version.clone())
        }
        Err(e) => {
            tracing::error!(error = %e, "reinstall failed, keeping current generation");
            None
        }
    }
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Spawn a filesystem watcher on config.toml that feeds changed configs to
/// the reload task.
fn spawn_config_watcher(config_path: PathBuf, state: Arc<AppState>) {
    let path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                match Config::load(&path_clone) {
                    Ok(new_config) => {
                        let _ = state.reload_tx.send(ReloadRequest::ConfigChanged(new_config));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config.toml");
                    }
                }
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config.toml");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
