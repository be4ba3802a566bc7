use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;

use crate::metrics::{Collector, Realtime};

/// Shared application state available to every handler.
pub struct AppState {
    pub collector: Arc<Collector>,
}

/// Builds the Axum `Router`: snapshot JSON plus the live SSE feed.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/metrics", get(get_metrics))
        .route("/api/metrics/stream", get(metrics_stream))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// ─── GET /api/metrics ────────────────────────────────────────────
/// Returns the latest published snapshot — useful for curl / debugging.
/// `null` until the first publish.

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Option<Realtime>> {
    Json(state.collector.latest().map(|snap| (*snap).clone()))
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the latest `Realtime` snapshot as JSON once per second, which
/// matches the collector's own publish cadence.

async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_secs(1));

    let stream = IntervalStream::new(interval).map(move |_| {
        let json = state
            .collector
            .latest()
            .and_then(|snap| snap.to_json().ok())
            .unwrap_or_else(|| "null".to_owned());
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
