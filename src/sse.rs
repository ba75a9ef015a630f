// src/sse.rs
//
// Server-Sent Events (SSE) endpoint for the plugin's lifecycle events.
//
// ─ Usage ────────────────────────────────────────────────────────────────────
//
//   GET /v1/events?capture_id=<id>
//
//   The connection stays open and streams events as they occur.
//
//   Optional query parameters:
//     capture_id -- filter events to one capture (omit for all).
//     types      -- comma-separated event types to receive
//                   (e.g. "capture.started,entry.removed").
//
//   Each SSE message has:
//     event: <event_type>       (e.g. "capture.started")
//     id:    <event_id>         (e.g. "evt_a1b2c3d4")
//     data:  <json payload>
//
// ────────────────────────────────────────────────────────────────────────────

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::events::{EventType, RecastEvent};

// ─── Query parameters ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    /// Filter to a specific capture.
    pub capture_id: Option<u64>,

    /// Comma-separated list of event types.
    pub types: Option<String>,
}

impl SseQuery {
    fn parsed_types(&self) -> Option<Vec<EventType>> {
        self.types.as_ref().map(|s| {
            s.split(',')
                .filter_map(|t| {
                    let trimmed = t.trim();
                    serde_json::from_str::<EventType>(&format!("\"{trimmed}\"")).ok()
                })
                .collect()
        })
    }

    /// Returns `true` if the event matches this query's filters.
    fn matches(&self, event: &RecastEvent) -> bool {
        if let Some(capture_id) = self.capture_id {
            if event.capture_id() != capture_id {
                return false;
            }
        }

        if let Some(types) = self.parsed_types() {
            if !types.is_empty() && !types.contains(&event.event_type) {
                return false;
            }
        }

        true
    }
}

// ─── SSE handler ────────────────────────────────────────────────────────────

/// `GET /v1/events` -- SSE stream of real-time lifecycle events.
///
/// The stream emits a heartbeat comment every 15 seconds to keep the
/// connection alive through proxies and load balancers.
pub async fn sse_events(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<SseQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut rx = engine.events.subscribe();

    info!(
        capture_id = query.capture_id.map(|id| id.to_string()).as_deref().unwrap_or("*"),
        types = query.types.as_deref().unwrap_or("*"),
        "SSE client connected"
    );

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !query.matches(&event) {
                        continue;
                    }

                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("SSE: failed to serialize event: {e}");
                            continue;
                        }
                    };

                    let sse_event = SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(json);

                    yield Ok(sse_event);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {n} events");
                    let warning = SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}"));
                    yield Ok(warning);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_no_filter() {
        let query = SseQuery {
            capture_id: None,
            types: None,
        };
        let evt = RecastEvent::entry_created(1, "demo");
        assert!(query.matches(&evt));
    }

    #[test]
    fn query_matches_capture_filter() {
        let query = SseQuery {
            capture_id: Some(42),
            types: None,
        };
        assert!(query.matches(&RecastEvent::capture_started(1, 42)));
        assert!(!query.matches(&RecastEvent::capture_started(1, 43)));
    }

    #[test]
    fn query_matches_type_filter() {
        let query = SseQuery {
            capture_id: None,
            types: Some("replay.started,replay.stopped".to_string()),
        };
        assert!(query.matches(&RecastEvent::replay_started(1, 42)));
        assert!(!query.matches(&RecastEvent::entry_created(42, "x")));
    }

    #[test]
    fn query_matches_combined_filters() {
        let query = SseQuery {
            capture_id: Some(7),
            types: Some("capture.stopped".to_string()),
        };
        assert!(query.matches(&RecastEvent::capture_stopped(1, 7)));
        assert!(!query.matches(&RecastEvent::capture_stopped(1, 8)));
        assert!(!query.matches(&RecastEvent::capture_started(1, 7)));
    }
}
