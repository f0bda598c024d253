use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Simulated upstream latency (5-20ms).
async fn simulate_latency() {
    let delay = rand::thread_rng().gen_range(5..=20);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

/// App shell. The gateway's manifest prefetches this so navigations keep
/// working offline.
async fn shell() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Learning Platform</title></head>\
         <body><h1>Learning Platform</h1><p>app shell</p></body></html>",
    )
}

/// Immutable course documents. Bodies are fake PDF bytes; real content
/// would come off disk.
async fn book(Path((class, file)): Path<(String, String)>) -> impl IntoResponse {
    simulate_latency().await;

    if !file.ends_with(".pdf") {
        return (StatusCode::NOT_FOUND, "no such document").into_response();
    }

    let body = format!("%PDF-1.4\n% {class}/{file}\n{}", "x".repeat(2048));
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf")],
        body,
    )
        .into_response()
}

async fn chapters(Path(subject): Path<String>) -> Json<Value> {
    simulate_latency().await;

    let chapters: Vec<Value> = (1..=8)
        .map(|n| {
            json!({
                "id": format!("{subject}-{n}"),
                "title": format!("{subject} chapter {n}"),
                "quiz_count": rand::thread_rng().gen_range(3..=10),
            })
        })
        .collect();

    Json(json!({
        "subject": subject,
        "chapters": chapters,
    }))
}

#[derive(Deserialize)]
struct AssistantRequest {
    prompt: String,
}

/// Stand-in for the text-generation service.
async fn assistant(Json(body): Json<AssistantRequest>) -> impl IntoResponse {
    simulate_latency().await;

    if body.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "empty prompt"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "reply": format!("Here is a study tip about: {}", body.prompt),
        })),
    )
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app = Router::new()
        .route("/", get(shell))
        .route("/books/{class}/{file}", get(book))
        .route("/api/chapters/{subject}", get(chapters))
        .route("/api/assistant", post(assistant))
        .route("/health", get(health));

    let addr = "0.0.0.0:3000";
    tracing::info!(addr, "demo backend starting");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
