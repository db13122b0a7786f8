mod debug;

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::get};
use log::info;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::ServeDir;

use crate::config::ServerConfig;
use crate::engine::GenerationEngine;
use crate::lifecycle;
use crate::registry::RequestRegistry;
use debug::DebugView;

/// Sent before the first generated fragment; the model writes the rest of the
/// document.
const HTML_PREAMBLE: &str =
    "<!doctype html>\n<html><head><meta charset=\"utf-8\"></head><body>\n";

/// Instruction prefix prepended to the user's prompt before tokenization.
const PROMPT_PREFIX: &str = "Write a web page about the following topic: ";

const CAPACITY_MESSAGE: &str = "sorry, all generation slots are busy; try again in a moment\n";

/// Fragments buffered between the lifecycle manager and the HTTP body. Kept
/// small so a stalled client exerts backpressure instead of accumulating
/// output.
const BODY_CHANNEL_CAPACITY: usize = 8;

struct AppState {
    registry: Arc<RequestRegistry>,
    engine: Arc<dyn GenerationEngine>,
    config: ServerConfig,
}

#[derive(Deserialize)]
struct GenerateParams {
    #[serde(default)]
    prompt: String,
}

/// `GET /?prompt=...` — admit, then stream the generated page. The lifecycle
/// manager runs on its own task; dropping the body (client gone) closes the
/// channel, which the manager observes on its next send.
async fn generate(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GenerateParams>,
) -> Response {
    let admission = match state.registry.admit() {
        Ok(admission) => admission,
        Err(e) => {
            info!("admission rejected: {e}");
            return CAPACITY_MESSAGE.into_response();
        }
    };
    info!(
        "request {}: prompt_len={}",
        admission.id,
        params.prompt.len()
    );

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(lifecycle::stream_generation(
        Arc::clone(&state.registry),
        Arc::clone(&state.engine),
        admission,
        state.config.timeout,
        HTML_PREAMBLE,
        format!("{PROMPT_PREFIX}{}", params.prompt),
        tx,
    ));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `GET /debug` — read-only registry snapshot.
async fn debug_state(State(state): State<Arc<AppState>>) -> Json<DebugView> {
    Json(DebugView::from_snapshot(state.registry.snapshot()))
}

pub fn build_app(
    registry: Arc<RequestRegistry>,
    engine: Arc<dyn GenerationEngine>,
    config: ServerConfig,
    static_dir: &Path,
) -> Router {
    let state = Arc::new(AppState {
        registry,
        engine,
        config,
    });

    Router::new()
        .route("/", get(generate))
        .route("/debug", get(debug_state))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}
