use serde::{Deserialize, Serialize};

use crate::codecs::Medium;

// ---------------------------------------------------------------------------
// Host gateway contract
// ---------------------------------------------------------------------------
//
// The plugin never touches ICE/DTLS or the wire: the host gateway owns the
// peer connections and calls into the engine (`incoming_rtp`, `setup_media`,
// `hangup_media`, ...) from its I/O threads. Everything flowing the other
// way goes through this trait.

/// Opaque per-handle identifier assigned by the engine.
pub type SessionId = u64;

/// SDP attachment on a request or event ("jsep" at the host boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    /// `"offer"` or `"answer"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".into(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".into(),
            sdp,
        }
    }
}

/// Callbacks into the host gateway.
///
/// Implementations must be non-blocking: `relay_rtp` is called from the
/// pacer at media cadence and `relay_rtcp` from the ingest path.
pub trait HostTransport: Send + Sync + 'static {
    /// Relay an RTP packet to the session's peer.
    fn relay_rtp(&self, session: SessionId, medium: Medium, buf: &[u8]);

    /// Send an RTCP feedback packet (REMB / PLI / FIR) to the session's peer.
    fn relay_rtcp(&self, session: SessionId, medium: Medium, buf: &[u8]);

    /// Push an asynchronous plugin event (and optional SDP) to the client.
    fn push_event(
        &self,
        session: SessionId,
        transaction: Option<&str>,
        body: serde_json::Value,
        jsep: Option<Jsep>,
    );

    /// Ask the host to tear down the session's peer connection. The host
    /// answers with a `hangup_media` callback.
    fn close_peer(&self, session: SessionId);
}

/// Host that drops media and events on the floor. Used by the standalone
/// binary for sessions that have no gateway transport attached.
pub struct NullHost;

impl HostTransport for NullHost {
    fn relay_rtp(&self, _session: SessionId, _medium: Medium, _buf: &[u8]) {}
    fn relay_rtcp(&self, _session: SessionId, _medium: Medium, _buf: &[u8]) {}
    fn push_event(
        &self,
        _session: SessionId,
        _transaction: Option<&str>,
        _body: serde_json::Value,
        _jsep: Option<Jsep>,
    ) {
    }
    fn close_peer(&self, _session: SessionId) {}
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Records every host callback for assertions.
    #[derive(Default)]
    pub struct MockHost {
        pub rtp: Mutex<Vec<(SessionId, Medium, Vec<u8>)>>,
        pub rtcp: Mutex<Vec<(SessionId, Medium, Vec<u8>)>>,
        pub events: Mutex<Vec<(SessionId, serde_json::Value, Option<Jsep>)>>,
        pub closed: Mutex<Vec<SessionId>>,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn event_count(&self) -> usize {
            self.events.lock().unwrap().len()
        }

        pub fn rtp_count(&self) -> usize {
            self.rtp.lock().unwrap().len()
        }

        /// Events whose `result.status` matches `status`.
        pub fn events_with_status(&self, status: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, body, _)| body["result"]["status"] == status)
                .count()
        }
    }

    impl HostTransport for MockHost {
        fn relay_rtp(&self, session: SessionId, medium: Medium, buf: &[u8]) {
            self.rtp.lock().unwrap().push((session, medium, buf.to_vec()));
        }

        fn relay_rtcp(&self, session: SessionId, medium: Medium, buf: &[u8]) {
            self.rtcp
                .lock()
                .unwrap()
                .push((session, medium, buf.to_vec()));
        }

        fn push_event(
            &self,
            session: SessionId,
            _transaction: Option<&str>,
            body: serde_json::Value,
            jsep: Option<Jsep>,
        ) {
            self.events.lock().unwrap().push((session, body, jsep));
        }

        fn close_peer(&self, session: SessionId) {
            self.closed.lock().unwrap().push(session);
        }
    }
}
