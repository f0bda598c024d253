use crate::config::Config;
use crate::upstream::HttpUpstream;
use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::State;
use axum::http::{request::Parts, HeaderMap, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use satchel_cache::{
    Destination, OfflineEngine, RequestRecord, ServeSource, ServedResponse, SqliteBackend,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub type Engine = OfflineEngine<SqliteBackend, HttpUpstream>;

/// Work for the background reload task.
pub enum ReloadRequest {
    /// config.toml changed on disk.
    ConfigChanged(Config),
    /// Admin asked for a forced install/activate of the current config.
    Reinstall,
}

/// Shared application state passed to all handlers. The engine is swapped
/// wholesale when a new generation activates.
pub struct AppState {
    pub engine: ArcSwap<Engine>,
    pub reload_tx: mpsc::UnboundedSender<ReloadRequest>,
}

/// Request headers the upstream gets to see. Everything else is gateway
/// plumbing.
const FORWARDED_HEADERS: &[&str] = &["accept", "content-type", "authorization"];

/// Main gateway handler: translate the HTTP request into a
/// [`RequestRecord`], let the engine decide, translate back.
pub async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read request body");
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Body::from("Bad Request"))
                .unwrap();
        }
    };

    let record = to_record(&parts, body);
    let engine = state.engine.load_full();
    let served = engine.handle(&record).await;

    metrics::counter!(
        "satchel_requests_total",
        "decision" => served.decision.as_str(),
        "source" => served.source.as_str(),
    )
    .increment(1);

    tracing::debug!(
        key = %record.key(),
        source = served.source.as_str(),
        status = served.response.status,
        latency_us = start.elapsed().as_micros() as u64,
        "gateway served"
    );

    build_response(served)
}

fn to_record(parts: &Parts, body: Bytes) -> RequestRecord {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut record = RequestRecord::new(parts.method.as_str(), path);
    record.destination = destination_of(&parts.headers);
    record.headers = FORWARDED_HEADERS
        .iter()
        .filter_map(|name| {
            parts
                .headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();
    record.body = body;
    record
}

/// Browsers mark navigations with Sec-Fetch-Dest; fall back to the Accept
/// header for clients that don't send it.
fn destination_of(headers: &HeaderMap) -> Destination {
    if let Some(dest) = headers.get("sec-fetch-dest").and_then(|v| v.to_str().ok()) {
        return match dest {
            "document" => Destination::Document,
            "audio" | "video" | "image" => Destination::Media,
            _ => Destination::Other,
        };
    }

    let accepts_html = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false);
    if accepts_html {
        Destination::Document
    } else {
        Destination::Other
    }
}

fn build_response(served: ServedResponse) -> Response<Body> {
    let mut builder = Response::builder().status(served.response.status);

    for (name, value) in &served.response.headers {
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }

    builder = builder
        .header("X-Cache", cache_header(served.source))
        .header("X-Cache-Decision", served.decision.as_str());

    builder.body(Body::from(served.response.body)).unwrap()
}

fn cache_header(source: ServeSource) -> &'static str {
    match source {
        ServeSource::CacheHit => "HIT",
        ServeSource::Network => "MISS",
        ServeSource::Stale => "STALE",
        ServeSource::OfflineFallback => "FALLBACK",
        ServeSource::Synthesized => "SYNTH",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_for(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn record_carries_method_path_and_query() {
        let req = Request::builder()
            .method("GET")
            .uri("http://gateway/api/chapters/math?page=2")
            .body(())
            .unwrap();

        let record = to_record(&parts_for(req), Bytes::new());
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/api/chapters/math?page=2");
        assert_eq!(record.destination, Destination::Other);
    }

    #[test]
    fn sec_fetch_dest_marks_navigations() {
        let req = Request::builder()
            .uri("/lessons/5")
            .header("sec-fetch-dest", "document")
            .body(())
            .unwrap();

        let record = to_record(&parts_for(req), Bytes::new());
        assert_eq!(record.destination, Destination::Document);
    }

    #[test]
    fn accept_html_marks_navigations_without_sec_fetch() {
        let req = Request::builder()
            .uri("/lessons/5")
            .header("accept", "text/html,application/xhtml+xml")
            .body(())
            .unwrap();

        let record = to_record(&parts_for(req), Bytes::new());
        assert_eq!(record.destination, Destination::Document);
    }

    #[test]
    fn only_interesting_headers_are_forwarded() {
        let req = Request::builder()
            .uri("/x")
            .header("accept", "application/json")
            .header("x-internal-trace", "abc")
            .body(())
            .unwrap();

        let record = to_record(&parts_for(req), Bytes::new());
        assert_eq!(
            record.headers,
            vec![("accept".to_string(), "application/json".to_string())]
        );
    }
}
