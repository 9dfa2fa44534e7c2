use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::orchestrator::{GenerationRequest, Orchestrator};
use crate::progress::{self, GenerationProgress, ProgressCallback};
use crate::response::{ErrorBody, GenerateResponse};
use crate::tools::generate::GenerateBody;
use crate::tools::providers::{ListProvidersResponse, ProviderInfo};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/api/generate-3d", post(generate_handler))
        .route("/generate/stream", post(generate_stream_handler))
        .route("/providers", get(providers_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { orchestrator })
}

pub async fn serve(orchestrator: Arc<Orchestrator>, addr: &str) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    tracing::info!(addr = addr, "HTTP server ready to accept connections");

    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

/// Bodies are parsed by hand so malformed JSON gets the same 400 shape as a
/// missing field instead of axum's plain-text rejection.
fn parse_body(body: &[u8]) -> Result<GenerationRequest, GenerationError> {
    let parsed: GenerateBody = if body.iter().all(u8::is_ascii_whitespace) {
        GenerateBody::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| GenerationError::InvalidRequest(format!("malformed JSON body: {e}")))?
    };
    parsed.into_request()
}

fn error_response(err: &GenerationError) -> Response {
    let status = match err {
        GenerationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(reason = err.reason(), "generate failed: {err}");
    }
    (status, Json(ErrorBody::from_error(err))).into_response()
}

async fn generate_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };
    tracing::info!(
        has_prompt = request.prompt.is_some(),
        has_image = request.source_image.is_some(),
        "generate request"
    );

    match state.orchestrator.run(request, progress::noop(), None).await {
        Ok(outcome) => (StatusCode::OK, Json(GenerateResponse::from(outcome))).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Streams `progress` events, then one `result` or `error` event.
/// Dropping the stream (client disconnect) cancels the run at its next checkpoint.
async fn generate_stream_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&e),
    };

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let progress_tx = tx.clone();
    let callback: ProgressCallback = Arc::new(move |p: &GenerationProgress| {
        if let Ok(event) = Event::default().event("progress").json_data(p) {
            let _ = progress_tx.send(event);
        }
    });

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        let event = match orchestrator.run(request, callback, Some(cancel)).await {
            Ok(outcome) => Event::default()
                .event("result")
                .json_data(GenerateResponse::from(outcome)),
            Err(GenerationError::Cancelled) => {
                tracing::info!("stream client went away, run cancelled");
                return;
            }
            Err(e) => Event::default()
                .event("error")
                .json_data(ErrorBody::from_error(&e)),
        };
        match event {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => tracing::error!("failed to encode final event: {e}"),
        }
    });

    let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), (rx, guard)))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn providers_handler(State(state): State<AppState>) -> Json<ListProvidersResponse> {
    Json(ListProvidersResponse {
        providers: state
            .orchestrator
            .registry()
            .entries()
            .iter()
            .map(ProviderInfo::from)
            .collect(),
        image_synthesis: state.orchestrator.images().can_synthesize(),
    })
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
