use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Satchel load generator — mixed document/API/page traffic for the
/// offline gateway, tallying where responses were served from.
#[derive(Parser)]
#[command(name = "loadgen")]
struct Args {
    /// Target gateway URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    gateway_url: String,

    /// Number of distinct documents in the simulated library
    #[arg(long, default_value_t = 200)]
    num_documents: u64,

    /// Number of concurrent request tasks
    #[arg(long, default_value_t = 8)]
    concurrency: u64,

    /// Target requests per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rps: u64,

    /// Control server listen address
    #[arg(long, default_value = "0.0.0.0:9091")]
    control_addr: String,
}

/// Shared state for the load generator.
struct LoadGenState {
    gateway_url: String,
    num_documents: u64,
    running: AtomicBool,
    rps: u64,
    concurrency: u64,
    total_requests: AtomicU64,
    /// Per-source tallies, from the gateway's X-Cache header.
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    fallbacks: AtomicU64,
    synthesized: AtomicU64,
    errors: AtomicU64,
}

impl LoadGenState {
    fn tally(&self, x_cache: Option<&str>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match x_cache {
            Some("HIT") => self.hits.fetch_add(1, Ordering::Relaxed),
            Some("MISS") => self.misses.fetch_add(1, Ordering::Relaxed),
            Some("STALE") => self.stale.fetch_add(1, Ordering::Relaxed),
            Some("FALLBACK") => self.fallbacks.fetch_add(1, Ordering::Relaxed),
            Some("SYNTH") => self.synthesized.fetch_add(1, Ordering::Relaxed),
            _ => self.errors.fetch_add(1, Ordering::Relaxed),
        };
    }
}

#[derive(Deserialize)]
struct ControlRequest {
    #[serde(default)]
    running: Option<bool>,
}

#[derive(Serialize)]
struct StatusResponse {
    running: bool,
    total_requests: u64,
    hits: u64,
    misses: u64,
    stale: u64,
    fallbacks: u64,
    synthesized: u64,
    errors: u64,
    concurrency: u64,
    rps: u64,
}

fn status(state: &LoadGenState) -> StatusResponse {
    StatusResponse {
        running: state.running.load(Ordering::Relaxed),
        total_requests: state.total_requests.load(Ordering::Relaxed),
        hits: state.hits.load(Ordering::Relaxed),
        misses: state.misses.load(Ordering::Relaxed),
        stale: state.stale.load(Ordering::Relaxed),
        fallbacks: state.fallbacks.load(Ordering::Relaxed),
        synthesized: state.synthesized.load(Ordering::Relaxed),
        errors: state.errors.load(Ordering::Relaxed),
        concurrency: state.concurrency,
        rps: state.rps,
    }
}

async fn control_handler(
    State(state): State<Arc<LoadGenState>>,
    Json(body): Json<ControlRequest>,
) -> Json<StatusResponse> {
    if let Some(running) = body.running {
        state.running.store(running, Ordering::Relaxed);
        tracing::info!(running, "running state updated");
    }
    Json(status(&state))
}

async fn status_handler(State(state): State<Arc<LoadGenState>>) -> Json<StatusResponse> {
    Json(status(&state))
}

/// Pick the next request: mostly documents, some API reads, some pages.
/// The skew keeps the static/dynamic stores exercised unevenly, like real
/// study sessions do.
fn next_path(num_documents: u64) -> (String, bool) {
    let mut rng = rand::thread_rng();
    let roll: u8 = rng.gen_range(0..100);
    if roll < 50 {
        let class = rng.gen_range(1..=3);
        let doc = rng.gen_range(1..=num_documents);
        (format!("/books/class{class}/doc{doc}.pdf"), false)
    } else if roll < 80 {
        let subject = ["math", "english", "hindi"][rng.gen_range(0..3)];
        (format!("/api/chapters/{subject}"), false)
    } else {
        // A navigation: lands on the shell when the gateway is offline.
        ("/".to_string(), true)
    }
}

/// Worker task that sends requests to the gateway.
async fn worker(state: Arc<LoadGenState>, client: Client, worker_id: u64) {
    let delay = if state.rps > 0 {
        let per_worker_rps = state.rps / state.concurrency.max(1);
        if per_worker_rps > 0 {
            Some(Duration::from_micros(1_000_000 / per_worker_rps))
        } else {
            None
        }
    } else {
        None
    };

    loop {
        if !state.running.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }

        let (path, navigation) = next_path(state.num_documents);
        let url = format!("{}{}", state.gateway_url, path);

        let mut request = client.get(&url);
        if navigation {
            request = request.header("sec-fetch-dest", "document");
        }

        match request.send().await {
            Ok(resp) => {
                let x_cache = resp
                    .headers()
                    .get("x-cache")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                state.tally(x_cache.as_deref());
            }
            Err(e) => {
                state.errors.fetch_add(1, Ordering::Relaxed);
                if worker_id == 0 {
                    tracing::warn!(error = %e, "request failed");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let state = Arc::new(LoadGenState {
        gateway_url: args.gateway_url.clone(),
        num_documents: args.num_documents,
        running: AtomicBool::new(true),
        rps: args.rps,
        concurrency: args.concurrency,
        total_requests: AtomicU64::new(0),
        hits: AtomicU64::new(0),
        misses: AtomicU64::new(0),
        stale: AtomicU64::new(0),
        fallbacks: AtomicU64::new(0),
        synthesized: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    // Build control server
    let control_router = Router::new()
        .route("/control", post(control_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::clone(&state));

    let control_addr = args.control_addr.clone();

    tracing::info!(
        gateway = %args.gateway_url,
        num_documents = args.num_documents,
        concurrency = args.concurrency,
        rps = args.rps,
        control = %control_addr,
        "loadgen starting"
    );

    // Spawn control server
    let control_listener = tokio::net::TcpListener::bind(&control_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind control server to {control_addr}: {e}"));

    tokio::spawn(async move {
        if let Err(e) = axum::serve(control_listener, control_router).await {
            tracing::error!(error = %e, "control server error");
        }
    });

    // Build HTTP client for gateway requests
    let client = Client::builder()
        .pool_max_idle_per_host(64)
        .timeout(Duration::from_secs(5))
        .build()
        .expect("failed to build HTTP client");

    // Spawn workers
    let mut handles = Vec::new();
    for i in 0..args.concurrency {
        let s = Arc::clone(&state);
        let c = client.clone();
        handles.push(tokio::spawn(worker(s, c, i)));
    }

    // Log throughput and source mix every 5 seconds
    let stats_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut prev = 0u64;
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let current = stats_state.total_requests.load(Ordering::Relaxed);
            let delta = current - prev;
            let rps = delta as f64 / 5.0;
            prev = current;
            tracing::info!(
                total = current,
                rps = format!("{:.0}", rps),
                hits = stats_state.hits.load(Ordering::Relaxed),
                misses = stats_state.misses.load(Ordering::Relaxed),
                stale = stats_state.stale.load(Ordering::Relaxed),
                fallbacks = stats_state.fallbacks.load(Ordering::Relaxed),
                synthesized = stats_state.synthesized.load(Ordering::Relaxed),
                "throughput"
            );
        }
    });

    // Wait for all workers (runs forever)
    for h in handles {
        let _ = h.await;
    }
}
