// src/events.rs
//
// Central event bus for the plugin.
//
// Every meaningful lifecycle change (capture start/stop, replay start/stop,
// catalog entry creation/removal) is represented as a `RecastEvent`. A single
// `EventBus` backed by a `tokio::sync::broadcast` channel fans out each event
// to every consumer: the SSE stream and any embedded event handler the host
// gateway attaches.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::host::SessionId;

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and SSE `event:` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "capture.started")]
    CaptureStarted,
    #[serde(rename = "capture.stopped")]
    CaptureStopped,
    #[serde(rename = "replay.started")]
    ReplayStarted,
    #[serde(rename = "replay.stopped")]
    ReplayStopped,
    #[serde(rename = "entry.created")]
    EntryCreated,
    #[serde(rename = "entry.removed")]
    EntryRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CaptureStarted => "capture.started",
            Self::CaptureStopped => "capture.stopped",
            Self::ReplayStarted => "replay.started",
            Self::ReplayStopped => "replay.stopped",
            Self::EntryCreated => "entry.created",
            Self::EntryRemoved => "entry.removed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

/// Metadata attached to capture/replay lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub session_id: SessionId,
    pub capture_id: u64,
}

/// Metadata attached to catalog entry events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPayload {
    pub capture_id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Session(SessionPayload),
    Entry(EntryPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// A fully self-describing event, ready for serialisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecastEvent {
    /// Globally unique event identifier (format: `evt_<uuid-v4>`).
    pub id: String,

    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// ISO-8601 timestamp (UTC).
    pub created_at: DateTime<Utc>,

    /// Type-specific payload.
    pub data: EventPayload,
}

impl RecastEvent {
    pub fn capture_started(session_id: SessionId, capture_id: u64) -> Self {
        Self::session(EventType::CaptureStarted, session_id, capture_id)
    }

    pub fn capture_stopped(session_id: SessionId, capture_id: u64) -> Self {
        Self::session(EventType::CaptureStopped, session_id, capture_id)
    }

    pub fn replay_started(session_id: SessionId, capture_id: u64) -> Self {
        Self::session(EventType::ReplayStarted, session_id, capture_id)
    }

    pub fn replay_stopped(session_id: SessionId, capture_id: u64) -> Self {
        Self::session(EventType::ReplayStopped, session_id, capture_id)
    }

    pub fn entry_created(capture_id: u64, name: &str) -> Self {
        Self::new(
            EventType::EntryCreated,
            EventPayload::Entry(EntryPayload {
                capture_id,
                name: name.to_string(),
            }),
        )
    }

    pub fn entry_removed(capture_id: u64, name: &str) -> Self {
        Self::new(
            EventType::EntryRemoved,
            EventPayload::Entry(EntryPayload {
                capture_id,
                name: name.to_string(),
            }),
        )
    }

    fn session(event_type: EventType, session_id: SessionId, capture_id: u64) -> Self {
        Self::new(
            event_type,
            EventPayload::Session(SessionPayload {
                session_id,
                capture_id,
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }

    /// Extract the capture id from any payload variant.
    pub fn capture_id(&self) -> u64 {
        match &self.data {
            EventPayload::Session(p) => p.capture_id,
            EventPayload::Entry(p) => p.capture_id,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `RecastEvent`.
///
/// Capacity is generous (4096 events) -- subscribers that lag more than that
/// will skip events (same semantic as `broadcast::RecvError::Lagged`).
///
/// The bus is **cheap to clone** (interior `Arc`).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RecastEvent>,
    enabled: bool,
}

impl EventBus {
    /// Create a new bus. When `enabled` is false, `emit` becomes a no-op
    /// (the `events` configuration flag).
    pub fn new(enabled: bool) -> Self {
        let (tx, _) = broadcast::channel(4096);
        Self { tx, enabled }
    }

    /// Publish an event. Returns the number of active subscribers that
    /// will receive it. Silently succeeds even if there are none.
    pub fn emit(&self, event: RecastEvent) -> usize {
        if !self.enabled {
            return 0;
        }
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        // broadcast::send returns Err only if there are 0 receivers, which
        // is perfectly normal when no SSE client is connected.
        self.tx.send(event).unwrap_or(0)
    }

    /// Obtain a new receiver. Each receiver gets an independent copy of
    /// every event published *after* this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RecastEvent> {
        self.tx.subscribe()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::CaptureStarted).unwrap();
        assert_eq!(json, "\"capture.started\"");

        let parsed: EventType = serde_json::from_str("\"entry.removed\"").unwrap();
        assert_eq!(parsed, EventType::EntryRemoved);
    }

    #[test]
    fn event_envelope_json() {
        let evt = RecastEvent::capture_started(7, 42);
        let json = serde_json::to_string_pretty(&evt).unwrap();
        assert!(json.contains("\"type\": \"capture.started\""));
        assert!(json.contains("\"capture_id\": 42"));
        assert!(evt.id.starts_with("evt_"));
    }

    #[tokio::test]
    async fn bus_fanout() {
        let bus = EventBus::new(true);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let n = bus.emit(RecastEvent::entry_created(1, "demo"));
        assert_eq!(n, 2);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.id, e2.id);
    }

    #[tokio::test]
    async fn disabled_bus_swallows_events() {
        let bus = EventBus::new(false);
        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(RecastEvent::entry_created(1, "demo")), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn capture_id_extraction() {
        let e = RecastEvent::replay_stopped(3, 99);
        assert_eq!(e.capture_id(), 99);
        let e = RecastEvent::entry_removed(11, "old");
        assert_eq!(e.capture_id(), 11);
    }
}
