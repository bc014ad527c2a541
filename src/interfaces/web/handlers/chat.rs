use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderName, HeaderValue},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::super::AppState;
use crate::core::chunks::StreamChunk;

pub const RUN_ID_HEADER: &str = "x-run-id";
pub const DONE_SENTINEL: &str = "[DONE]";

/// `POST /api/chat` and `/api/chat/continue`. Rejections happen before any
/// stream is opened; afterwards every failure travels as an `error` chunk.
pub async fn chat_stream_endpoint(State(state): State<AppState>, body: Bytes) -> Response {
    let resolved = match state.resolver.resolve(&body).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(code = e.code(), "Rejected chat request: {}", e);
            return e.into_response();
        }
    };
    let run_id = resolved.run.id.clone();
    info!(
        run_id = %run_id,
        continuation = resolved.is_continuation,
        "Streaming run phase"
    );

    let rx = state.orchestrator.spawn_phase(resolved);
    let stream = ReceiverStream::new(rx)
        .map(|chunk| Ok::<_, Infallible>(chunk_event(&chunk)))
        .chain(tokio_stream::once(Ok(Event::default().data(DONE_SENTINEL))));

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        headers.insert(HeaderName::from_static(RUN_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn chunk_event(chunk: &StreamChunk) -> Event {
    match serde_json::to_string(chunk) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!(run_id = %chunk.id, "Failed to serialize chunk: {}", e);
            let fallback = serde_json::json!({
                "type": "error",
                "id": chunk.id,
                "model": chunk.model,
                "timestamp": chunk.timestamp,
                "error": { "message": e.to_string(), "code": "encoding_error" },
            });
            Event::default().data(fallback.to_string())
        }
    }
}
