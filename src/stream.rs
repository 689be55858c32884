//! SSE telemetry endpoint.
//!
//! Exposes the log bus over HTTP while a run executes:
//!
//! - `GET /events?runId=&levels=&limit=` — buffered backlog followed by
//!   the live stream, with a `ping` keep-alive every 15 seconds
//! - `GET /sessions` — session descriptors
//! - `GET /health`  — liveness probe

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::{EventFilter, LogBus, LogLevel, SessionDescriptor};
use crate::{Error, Result};

/// Keep-alive interval mandated by the streaming contract.
const PING_INTERVAL: Duration = Duration::from_secs(15);
/// Default backlog replayed to a late subscriber.
const DEFAULT_BACKLOG: usize = 100;

#[derive(Clone)]
struct AppState {
    bus: Arc<LogBus>,
}

/// Build the telemetry router over a bus.
#[must_use]
pub fn router(bus: Arc<LogBus>) -> Router {
    Router::new()
        .route("/events", get(events))
        .route("/sessions", get(sessions))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { bus })
}

/// Serve the endpoint until the token fires.
///
/// # Errors
///
/// Bind or serve failures.
pub async fn serve(addr: &str, bus: Arc<LogBus>, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("Cannot bind telemetry endpoint on {addr}: {e}")))?;
    info!(addr = %addr, "Telemetry endpoint listening");

    axum::serve(listener, router(bus))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("telemetry endpoint failed: {e}")))
}

/// Parse `runId` / `levels` query params into a bus filter.
fn filter_from_params(params: &HashMap<String, String>) -> EventFilter {
    let run_id = params.get("runId").cloned();
    let levels = params.get("levels").map(|csv| {
        csv.split(',')
            .filter_map(|level| level.trim().parse::<LogLevel>().ok())
            .collect::<Vec<_>>()
    });
    EventFilter { run_id, levels }
}

async fn events(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let filter = filter_from_params(&params);
    let limit = params
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_BACKLOG);

    let backlog = state.bus.buffered_events(&filter, limit);
    let mut subscriber = state.bus.subscribe(filter);

    let stream = stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(json!({ "backlog": backlog.len() }).to_string()));

        for event in backlog {
            yield Ok(to_sse_event(&event));
        }

        while let Some(event) = subscriber.recv().await {
            yield Ok(to_sse_event(&event));
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(PING_INTERVAL)
            .event(Event::default().event("ping").data("{}")),
    )
}

fn to_sse_event(event: &crate::bus::LogEvent) -> Event {
    Event::default()
        .event("log")
        .id(event.id.clone())
        .data(serde_json::to_string(event).unwrap_or_default())
}

async fn sessions(State(state): State<AppState>) -> Json<Vec<SessionDescriptor>> {
    Json(state.bus.list_sessions())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_build_a_filter() {
        let params = HashMap::from([
            ("runId".to_string(), "run-9".to_string()),
            ("levels".to_string(), "error, warn".to_string()),
        ]);
        let filter = filter_from_params(&params);
        assert_eq!(filter.run_id.as_deref(), Some("run-9"));
        assert_eq!(
            filter.levels,
            Some(vec![LogLevel::Error, LogLevel::Warn])
        );
    }

    #[test]
    fn unknown_levels_are_dropped() {
        let params = HashMap::from([("levels".to_string(), "error,bogus".to_string())]);
        let filter = filter_from_params(&params);
        assert_eq!(filter.levels, Some(vec![LogLevel::Error]));
    }

    #[test]
    fn missing_params_mean_no_filtering() {
        let filter = filter_from_params(&HashMap::new());
        assert!(filter.run_id.is_none());
        assert!(filter.levels.is_none());
    }
}
