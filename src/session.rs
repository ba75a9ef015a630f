use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CaptureEntry};
use crate::codecs::{Medium, VideoCodec};
use crate::events::{EventBus, RecastEvent};
use crate::feedback::{self, FeedbackState};
use crate::frame_index::FrameList;
use crate::host::{HostTransport, SessionId};
use crate::mjr::MjrWriter;
use crate::simulcast::{FilterOutcome, SimulcastSelector, VideoFilter};
use crate::sink::PublishSink;

// ---------------------------------------------------------------------------
// Session — per-handle runtime state
// ---------------------------------------------------------------------------
//
// States: Fresh → MediaReady → (Capturing | Replaying) → HangingUp →
// Destroyed. The `hanging_up` and `destroyed` latches are monotonic;
// teardown runs at most once no matter how it is triggered (`stop` verb,
// host `hangup_media`, or the pacer draining its lists).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    MediaReady,
    Capturing,
    Replaying,
    HangingUp,
    Destroyed,
}

pub struct Session {
    pub id: SessionId,
    state: RwLock<SessionState>,
    /// Set once media is flowing; cleared on hangup.
    pub active: AtomicBool,
    pub hanging_up: AtomicBool,
    pub destroyed: AtomicBool,

    // Feedback knobs, adjustable through `configure` while capturing.
    pub video_bitrate: AtomicU32,
    pub keyframe_interval_ms: AtomicU64,

    // SDP o= line bookkeeping for renegotiation.
    pub sdp_session_id: u64,
    pub sdp_version: AtomicU64,

    pub(crate) capture: Mutex<Option<CaptureHandle>>,
    pub(crate) replay: Mutex<Option<ReplayHandle>>,
}

impl Session {
    pub fn new(id: SessionId, video_bitrate: u32, keyframe_interval_ms: u64) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState::Fresh),
            active: AtomicBool::new(false),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            video_bitrate: AtomicU32::new(video_bitrate),
            keyframe_interval_ms: AtomicU64::new(keyframe_interval_ms),
            sdp_session_id: rand::random::<u64>() >> 1,
            sdp_version: AtomicU64::new(1),
            capture: Mutex::new(None),
            replay: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap() = state;
    }

    /// True when no capture or replay role is attached yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state(), SessionState::Fresh | SessionState::MediaReady)
    }

    pub fn is_capturer(&self) -> bool {
        self.capture.lock().unwrap().is_some()
    }

    pub fn is_replayer(&self) -> bool {
        self.replay.lock().unwrap().is_some()
    }

    /// The capture entry bound to this session, in either role.
    pub fn entry(&self) -> Option<Arc<CaptureEntry>> {
        if let Some(handle) = self.capture.lock().unwrap().as_ref() {
            return Some(handle.entry.clone());
        }
        self.replay
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| h.entry.clone())
    }

    /// Hand an incoming RTP packet to the capture task. Called from the
    /// host's I/O threads; never blocks.
    pub fn ingest_rtp(&self, medium: Medium, buf: &[u8]) -> bool {
        if !self.active.load(Ordering::Acquire) || self.hanging_up.load(Ordering::Acquire) {
            return false;
        }
        let guard = self.capture.lock().unwrap();
        match guard.as_ref() {
            Some(handle) => handle
                .tx
                .send(CapturePacket {
                    medium,
                    buf: buf.to_vec(),
                })
                .is_ok(),
            None => false,
        }
    }
}

/// One packet queued from the ingest path to the capture task.
pub(crate) struct CapturePacket {
    pub medium: Medium,
    pub buf: Vec<u8>,
}

// ─── Role attachments ───────────────────────────────────────────────────────

pub(crate) struct CaptureHandle {
    pub entry: Arc<CaptureEntry>,
    pub tx: mpsc::UnboundedSender<CapturePacket>,
    pub cancel: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

/// Frame lists and file paths prepared by `play`, consumed when the pacer
/// launches at `setup_media`.
pub(crate) struct ReplaySource {
    pub path: PathBuf,
    pub frames: FrameList,
    pub clock_rate: u32,
    pub payload_type: u8,
}

pub(crate) struct ReplayHandle {
    pub entry: Arc<CaptureEntry>,
    pub audio: Option<ReplaySource>,
    pub video: Option<ReplaySource>,
    /// Client answered (`start` verb accepted).
    pub started: bool,
    pub cancel: CancellationToken,
    pub task: Option<JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// Capture task
// ---------------------------------------------------------------------------
//
// One task per capturing session. It owns the two writers, the publish
// sink, the simulcast filter and the feedback schedule; packets arrive in
// order on an unbounded channel, so disk order always matches arrival
// order. On cancellation the task finalizes the capture: writers close,
// the `.nfo` is written, the entry completes, the sink closes best-effort.

pub(crate) struct CaptureTaskConfig {
    pub audio_writer: Option<MjrWriter>,
    pub video_writer: Option<MjrWriter>,
    pub video_codec: Option<VideoCodec>,
    pub selector: Option<SimulcastSelector>,
    pub sink: Box<dyn PublishSink>,
}

pub(crate) fn spawn_capture(
    session: Arc<Session>,
    entry: Arc<CaptureEntry>,
    host: Arc<dyn HostTransport>,
    events: EventBus,
    catalog: Arc<Catalog>,
    config: CaptureTaskConfig,
) -> CaptureHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let task = CaptureTask {
        session: session.clone(),
        entry: entry.clone(),
        host,
        events,
        catalog,
        audio_writer: config.audio_writer,
        video_writer: config.video_writer,
        video_codec: config.video_codec,
        pending_selector: config.selector,
        sink: Some(config.sink),
        filter: None,
        feedback: FeedbackState::new(
            session.video_bitrate.load(Ordering::Relaxed),
            session.keyframe_interval_ms.load(Ordering::Relaxed),
        ),
        peer_video_ssrc: 0,
        failed: false,
    };

    let run_cancel = cancel.clone();
    let join = tokio::spawn(task.run(rx, run_cancel));

    CaptureHandle {
        entry,
        tx,
        cancel,
        task: Some(join),
    }
}

struct CaptureTask {
    session: Arc<Session>,
    entry: Arc<CaptureEntry>,
    host: Arc<dyn HostTransport>,
    events: EventBus,
    catalog: Arc<Catalog>,
    audio_writer: Option<MjrWriter>,
    video_writer: Option<MjrWriter>,
    video_codec: Option<VideoCodec>,
    pending_selector: Option<SimulcastSelector>,
    sink: Option<Box<dyn PublishSink>>,
    filter: Option<VideoFilter>,
    feedback: FeedbackState,
    peer_video_ssrc: u32,
    failed: bool,
}

impl CaptureTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CapturePacket>,
        cancel: CancellationToken,
    ) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.open().await {
                warn!(session = self.session.id, "publish sink failed to open: {e}");
                self.sink = None;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        self.handle(packet).await;
                        if self.failed {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        // The ingest gate (`hanging_up`) closed before the cancel fired, so
        // whatever is still queued is finite: flush it to disk.
        while !self.failed {
            match rx.try_recv() {
                Ok(packet) => self.handle(packet).await,
                Err(_) => break,
            }
        }

        self.finalize().await;
        if self.failed {
            self.host.close_peer(self.session.id);
        }
    }

    async fn handle(&mut self, packet: CapturePacket) {
        match packet.medium {
            Medium::Audio => self.handle_audio(packet.buf).await,
            Medium::Video => self.handle_video(packet.buf).await,
        }
    }

    async fn handle_audio(&mut self, buf: Vec<u8>) {
        if let Some(writer) = self.audio_writer.as_mut() {
            if let Err(e) = writer.save(&buf).await {
                warn!(session = self.session.id, "audio capture write failed: {e}");
                self.failed = true;
                return;
            }
        }
        self.push_sink(Medium::Audio, 0, &buf).await;
    }

    async fn handle_video(&mut self, mut buf: Vec<u8>) {
        if buf.len() < 12 {
            return;
        }
        self.peer_video_ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        self.run_feedback();

        let codec = match self.video_codec {
            Some(codec) => codec,
            // Video was not negotiated for this capture.
            None => return,
        };

        if self.filter.is_none() {
            // Stable output SSRC, assigned at the first video packet, masks
            // substream switches from the recording and the live sink.
            let rec_ssrc = loop {
                let ssrc = rand::random::<u32>();
                if ssrc != 0 {
                    break ssrc;
                }
            };
            debug!(ssrc = rec_ssrc, "recording SSRC assigned");
            let selector = self.pending_selector.take();
            self.filter = Some(VideoFilter::new(codec, selector, rec_ssrc));
        }
        let filter = self.filter.as_mut().expect("filter created above");

        match filter.process(&mut buf) {
            Ok(FilterOutcome::Forward { keyframe_needed }) => {
                if keyframe_needed {
                    self.request_keyframe();
                }
                let slot = self
                    .filter
                    .as_ref()
                    .map(|f| f.current_slot())
                    .unwrap_or(0);
                if let Some(writer) = self.video_writer.as_mut() {
                    if let Err(e) = writer.save(&buf).await {
                        warn!(session = self.session.id, "video capture write failed: {e}");
                        self.failed = true;
                        return;
                    }
                }
                self.push_sink(Medium::Video, slot, &buf).await;
            }
            Ok(FilterOutcome::Drop { keyframe_needed }) => {
                if keyframe_needed {
                    self.request_keyframe();
                }
            }
            Err(e) => {
                debug!(session = self.session.id, "undecodable video RTP dropped: {e}");
            }
        }
    }

    fn run_feedback(&mut self) {
        self.feedback
            .set_bitrate(self.session.video_bitrate.load(Ordering::Relaxed));
        self.feedback
            .set_keyframe_interval(self.session.keyframe_interval_ms.load(Ordering::Relaxed));

        for item in self.feedback.on_video_packet(Instant::now()) {
            if let Some(bytes) = feedback::encode(item, self.peer_video_ssrc) {
                self.host
                    .relay_rtcp(self.session.id, Medium::Video, &bytes);
            }
        }
    }

    fn request_keyframe(&mut self) {
        for item in self.feedback.keyframe_now() {
            if let Some(bytes) = feedback::encode(item, self.peer_video_ssrc) {
                self.host
                    .relay_rtcp(self.session.id, Medium::Video, &bytes);
            }
        }
    }

    async fn push_sink(&mut self, medium: Medium, slot: usize, buf: &[u8]) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.push(medium, slot, buf).await {
                // Sink trouble never aborts the capture; just stop feeding it.
                warn!(session = self.session.id, "publish sink dropped: {e}");
                self.sink = None;
            }
        }
    }

    async fn finalize(&mut self) {
        let mut audio_ok = false;
        if let Some(writer) = self.audio_writer.as_mut() {
            match writer.close().await {
                Ok(wrote) => audio_ok = wrote,
                Err(e) => warn!(session = self.session.id, "audio writer close failed: {e}"),
            }
        }
        let mut video_ok = false;
        if let Some(writer) = self.video_writer.as_mut() {
            match writer.close().await {
                Ok(wrote) => video_ok = wrote,
                Err(e) => warn!(session = self.session.id, "video writer close failed: {e}"),
            }
        }

        // The descriptor must only name files that actually exist.
        if !audio_ok {
            *self.entry.audio.write().unwrap() = None;
        }
        if !video_ok {
            *self.entry.video.write().unwrap() = None;
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.close().await;
        }

        if audio_ok || video_ok {
            if let Err(e) = self.catalog.write_nfo(&self.entry).await {
                warn!(
                    session = self.session.id,
                    id = self.entry.id,
                    "failed to write .nfo: {e}"
                );
            }
            self.entry.complete();
            self.events
                .emit(RecastEvent::entry_created(self.entry.id, &self.entry.name));
            info!(
                session = self.session.id,
                id = self.entry.id,
                "capture completed"
            );
        } else {
            // Nothing was recorded; the placeholder entry has no business
            // staying in the catalog.
            self.catalog.remove(self.entry.id);
            info!(
                session = self.session.id,
                id = self.entry.id,
                "capture ended with no media"
            );
        }

        self.events
            .emit(RecastEvent::capture_stopped(self.session.id, self.entry.id));
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Run the session's teardown exactly once; later calls return `false`.
///
/// Closes the capture pipeline (flushing writers and completing the entry)
/// or stops the pacer and unbinds the viewer. The `done` client event is
/// pushed by the winning call only.
pub(crate) async fn teardown(
    session: &Arc<Session>,
    host: &Arc<dyn HostTransport>,
    events: &EventBus,
) -> bool {
    if session.hanging_up.swap(true, Ordering::AcqRel) {
        return false;
    }
    session.set_state(SessionState::HangingUp);
    session.active.store(false, Ordering::Release);

    let capture = session.capture.lock().unwrap().take();
    let had_capture = capture.is_some();
    if let Some(mut handle) = capture {
        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                warn!(session = session.id, "capture task join error: {e}");
            }
        }
    }

    let replay = session.replay.lock().unwrap().take();
    let had_replay = replay.is_some();
    if let Some(mut handle) = replay {
        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                warn!(session = session.id, "pacer task join error: {e}");
            }
        }
        handle.entry.remove_viewer(session.id);
        events.emit(RecastEvent::replay_stopped(session.id, handle.entry.id));
    }

    // Idle sessions disappear silently; only sessions that carried media
    // owe the client a done event.
    if had_capture || had_replay {
        host.push_event(
            session.id,
            None,
            serde_json::json!({
                "transcode": "event",
                "result": { "status": "done" },
            }),
            None,
        );
    }

    info!(session = session.id, "session torn down");
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
