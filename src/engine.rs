use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{mjr_path, AudioTrack, Catalog, VideoTrack};
use crate::codecs::Medium;
use crate::config::Config;
use crate::error::PluginError;
use crate::events::{EventBus, RecastEvent};
use crate::frame_index::build_index;
use crate::host::{HostTransport, Jsep, SessionId};
use crate::mjr::MjrWriter;
use crate::replay::run_pacer;
use crate::sdp;
use crate::session::{
    self, CaptureTaskConfig, ReplayHandle, ReplaySource, Session, SessionState,
};
use crate::simulcast::SimulcastSelector;
use crate::sink::{FfmpegRtmpSink, NullSink, PublishSink};

// ---------------------------------------------------------------------------
// Engine — sessions table, request dispatch, host callback surface
// ---------------------------------------------------------------------------
//
// Built once at init and shared with every operation; there is no other
// process-wide state. Synchronous verbs (`list`, `update`, `configure`)
// answer in the calling context. Asynchronous verbs (`transcode`, `play`,
// `start`, `stop`) are queued on a single FIFO served by one worker task,
// which pushes the outcome to the client through the host transport. A
// sentinel exit message ends the worker at shutdown.

enum AsyncMessage {
    Request {
        session: SessionId,
        transaction: String,
        body: Value,
        jsep: Option<Jsep>,
    },
    Exit,
}

/// What `handle_message` hands back to the transport layer.
#[derive(Debug)]
pub enum MessageResponse {
    /// Synchronous verb: the full reply.
    Sync(Value),
    /// Asynchronous verb: queued, a "pending" acknowledgement is due.
    Ack,
}

pub struct Engine {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub events: EventBus,
    host: Arc<dyn HostTransport>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    next_session: AtomicU64,
    async_tx: mpsc::UnboundedSender<AsyncMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine: ensure the capture directory exists, reconcile the
    /// catalog with it, and start the request worker.
    pub async fn new(
        config: Config,
        host: Arc<dyn HostTransport>,
    ) -> Result<Arc<Self>, std::io::Error> {
        tokio::fs::create_dir_all(&config.path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            tokio::fs::set_permissions(&config.path, perms).await?;
        }

        let events = EventBus::new(config.events);
        let catalog = Arc::new(Catalog::new(config.path.clone()));
        let outcome = catalog.scan().await?;
        for entry in &outcome.added {
            events.emit(RecastEvent::entry_created(entry.id, &entry.name));
        }

        let (async_tx, async_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            config,
            catalog,
            events,
            host,
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            async_tx,
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(worker_loop(engine.clone(), async_rx));
        *engine.worker.lock().unwrap() = Some(worker);

        info!("engine initialized, {} capture(s) indexed", outcome.added.len());
        Ok(engine)
    }

    /// Stop the worker and tear down every remaining session.
    pub async fn shutdown(&self) {
        let _ = self.async_tx.send(AsyncMessage::Exit);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.write().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session::teardown(&session, &self.host, &self.events).await;
            session.destroyed.store(true, Ordering::Release);
            session.set_state(SessionState::Destroyed);
        }
        info!("engine shut down");
    }

    // ── Session lifecycle (host callbacks) ──────────────────────────────

    pub fn create_session(&self) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            self.config.video_bitrate,
            self.config.keyframe_interval_ms,
        ));
        self.sessions.write().unwrap().insert(id, session);
        debug!(session = id, "session created");
        id
    }

    pub async fn destroy_session(&self, id: SessionId) {
        let session = self.sessions.write().unwrap().remove(&id);
        if let Some(session) = session {
            session::teardown(&session, &self.host, &self.events).await;
            session.destroyed.store(true, Ordering::Release);
            session.set_state(SessionState::Destroyed);
            debug!(session = id, "session destroyed");
        }
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    /// Host signal: the peer connection is up and media can flow. For a
    /// replayer whose answer has been accepted this launches the pacer.
    pub fn setup_media(&self, id: SessionId) {
        let session = match self.session(id) {
            Some(session) => session,
            None => return,
        };
        if session.destroyed.load(Ordering::Acquire) {
            return;
        }
        session.hanging_up.store(false, Ordering::Release);
        session.active.store(true, Ordering::Release);
        if session.state() == SessionState::Fresh {
            session.set_state(SessionState::MediaReady);
        }
        debug!(session = id, "media ready");
        self.launch_pacer(&session);
    }

    /// Host signal: the peer connection is gone. Authoritative teardown.
    pub async fn hangup_media(&self, id: SessionId) {
        let session = match self.session(id) {
            Some(session) => session,
            None => return,
        };
        session.active.store(false, Ordering::Release);
        session::teardown(&session, &self.host, &self.events).await;
    }

    /// RTP from the capture peer; runs on the host's I/O threads.
    pub fn incoming_rtp(&self, id: SessionId, medium: Medium, buf: &[u8]) {
        if let Some(session) = self.session(id) {
            session.ingest_rtp(medium, buf);
        }
    }

    /// RTCP from the peer. Nothing here consumes it; late or unexpected
    /// feedback is absorbed silently.
    pub fn incoming_rtcp(&self, _id: SessionId, _medium: Medium, _buf: &[u8]) {}

    // ── Request dispatch ────────────────────────────────────────────────

    /// Route one request. Synchronous verbs answer inline; asynchronous
    /// verbs are queued for the worker.
    pub async fn handle_message(
        &self,
        session_id: SessionId,
        transaction: &str,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<MessageResponse, PluginError> {
        let session = self
            .session(session_id)
            .ok_or_else(|| PluginError::unknown(format!("no session {session_id}")))?;

        if !body.is_object() {
            return Err(PluginError::invalid_json("message body is not an object"));
        }
        let verb = body
            .get("request")
            .and_then(|r| r.as_str())
            .ok_or_else(|| PluginError::missing_element("request"))?;

        match verb {
            "list" => {
                let list = serde_json::to_value(self.catalog.list())
                    .unwrap_or_else(|_| Value::Array(Vec::new()));
                Ok(MessageResponse::Sync(json!({
                    "transcode": "list",
                    "list": list,
                })))
            }
            "update" => {
                let outcome = self
                    .catalog
                    .scan()
                    .await
                    .map_err(|e| PluginError::unknown(format!("scan failed: {e}")))?;
                for entry in &outcome.added {
                    self.events
                        .emit(RecastEvent::entry_created(entry.id, &entry.name));
                }
                for entry in &outcome.removed {
                    self.events
                        .emit(RecastEvent::entry_removed(entry.id, &entry.name));
                }
                Ok(MessageResponse::Sync(json!({ "transcode": "ok" })))
            }
            "configure" => self.handle_configure(&session, &body),
            "transcode" | "play" | "start" | "stop" => {
                self.async_tx
                    .send(AsyncMessage::Request {
                        session: session_id,
                        transaction: transaction.to_string(),
                        body,
                        jsep,
                    })
                    .map_err(|_| PluginError::unknown("request worker is gone"))?;
                Ok(MessageResponse::Ack)
            }
            other => Err(PluginError::invalid_request(other)),
        }
    }

    fn handle_configure(
        &self,
        session: &Arc<Session>,
        body: &Value,
    ) -> Result<MessageResponse, PluginError> {
        if let Some(value) = body.get("video-bitrate-max") {
            let bitrate = value
                .as_u64()
                .ok_or_else(|| PluginError::invalid_element("video-bitrate-max"))?;
            session
                .video_bitrate
                .store(bitrate.min(u32::MAX as u64) as u32, Ordering::Relaxed);
        }
        if let Some(value) = body.get("video-keyframe-interval") {
            // Applied unchanged; the configured interval is authoritative.
            let interval = value
                .as_u64()
                .ok_or_else(|| PluginError::invalid_element("video-keyframe-interval"))?;
            session.keyframe_interval_ms.store(interval, Ordering::Relaxed);
        }

        Ok(MessageResponse::Sync(json!({
            "transcode": "configure",
            "settings": {
                "video-bitrate-max": session.video_bitrate.load(Ordering::Relaxed),
                "video-keyframe-interval": session.keyframe_interval_ms.load(Ordering::Relaxed),
            },
        })))
    }

    // ── Asynchronous verbs ──────────────────────────────────────────────

    async fn dispatch_async(
        &self,
        session: Arc<Session>,
        body: &Value,
        jsep: Option<Jsep>,
    ) -> Result<(Value, Option<Jsep>), PluginError> {
        let verb = body.get("request").and_then(|r| r.as_str()).unwrap_or("");
        match verb {
            "transcode" => self.handle_transcode(session, body, jsep).await,
            "play" => self.handle_play(session, body, jsep).await,
            "start" => self.handle_start(session, jsep),
            "stop" => self.handle_stop(session).await,
            other => Err(PluginError::invalid_request(other)),
        }
    }

    async fn handle_transcode(
        &self,
        session: Arc<Session>,
        body: &Value,
        jsep: Option<Jsep>,
    ) -> Result<(Value, Option<Jsep>), PluginError> {
        if !session.is_idle() || session.hanging_up.load(Ordering::Acquire) {
            return Err(PluginError::invalid_state("session is not idle"));
        }
        let jsep = jsep.ok_or_else(|| PluginError::missing_element("jsep"))?;
        if jsep.kind != "offer" {
            return Err(PluginError::invalid_sdp("transcode expects an SDP offer"));
        }

        let name = match body.get("name") {
            Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
            Some(Value::String(_)) => {
                return Err(PluginError::invalid_element("name is empty"))
            }
            Some(_) => return Err(PluginError::invalid_element("name is not a string")),
            None => return Err(PluginError::missing_element("name")),
        };
        let proposed_id = match body.get("id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| PluginError::invalid_element("id is not an integer"))?,
            ),
        };

        let summary = sdp::summarize_offer(&jsep.sdp)?;
        if !summary.has_media() {
            return Err(PluginError::invalid_sdp("offer carries no supported media"));
        }

        let date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let entry = self.catalog.create(proposed_id, name, date)?;
        let id = entry.id;

        let mut audio_writer = None;
        if let Some((codec, _)) = summary.audio {
            let file = format!("rec-{id}-audio");
            *entry.audio.write().unwrap() = Some(AudioTrack::new(file.clone(), codec));
            audio_writer = Some(MjrWriter::open(
                self.catalog.dir(),
                Medium::Audio,
                codec.as_str(),
                &file,
            ));
        }
        let mut video_writer = None;
        if let Some((codec, _)) = summary.video {
            let file = format!("rec-{id}-video");
            *entry.video.write().unwrap() = Some(VideoTrack::new(file.clone(), codec));
            video_writer = Some(MjrWriter::open(
                self.catalog.dir(),
                Medium::Video,
                codec.as_str(),
                &file,
            ));
        }

        let sink: Box<dyn PublishSink> = match self.config.rtmp_url(id) {
            Some(url) => Box::new(FfmpegRtmpSink::new(url)),
            None => Box::new(NullSink),
        };

        let handle = session::spawn_capture(
            session.clone(),
            entry.clone(),
            self.host.clone(),
            self.events.clone(),
            self.catalog.clone(),
            CaptureTaskConfig {
                audio_writer,
                video_writer,
                video_codec: summary.video.map(|(codec, _)| codec),
                selector: parse_simulcast(body),
                sink,
            },
        );
        *session.capture.lock().unwrap() = Some(handle);
        session.set_state(SessionState::Capturing);
        self.events
            .emit(RecastEvent::capture_started(session.id, id));
        info!(session = session.id, id, "capture started");

        let version = session.sdp_version.fetch_add(1, Ordering::Relaxed);
        let answer = sdp::build_answer(id, &summary, session.sdp_session_id, version);
        Ok((
            json!({
                "transcode": "event",
                "result": { "status": "transcoding", "id": id },
            }),
            Some(Jsep::answer(answer)),
        ))
    }

    async fn handle_play(
        &self,
        session: Arc<Session>,
        body: &Value,
        jsep: Option<Jsep>,
    ) -> Result<(Value, Option<Jsep>), PluginError> {
        if !session.is_idle() || session.hanging_up.load(Ordering::Acquire) {
            return Err(PluginError::invalid_state("session is not idle"));
        }
        if jsep.is_some() {
            // The replay offer is server-originated.
            return Err(PluginError::invalid_element("play takes no SDP"));
        }
        let id = body
            .get("id")
            .ok_or_else(|| PluginError::missing_element("id"))?
            .as_u64()
            .ok_or_else(|| PluginError::invalid_element("id is not an integer"))?;

        let entry = self.catalog.get(id).ok_or_else(|| PluginError::not_found(id))?;
        if !entry.is_completed() {
            return Err(PluginError::invalid_capture("capture is still in progress"));
        }
        let offer = entry
            .offer
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| PluginError::invalid_capture("capture has no replay offer"))?;

        let audio_track = entry.audio.read().unwrap().clone();
        let video_track = entry.video.read().unwrap().clone();
        let mut audio = None;
        if let Some(track) = audio_track {
            audio = self.open_source(&track.file, track.codec.clock_rate(), track.pt).await;
        }
        let mut video = None;
        if let Some(track) = video_track {
            video = self.open_source(&track.file, track.codec.clock_rate(), track.pt).await;
        }
        if audio.is_none() && video.is_none() {
            return Err(PluginError::invalid_capture("capture has no readable frames"));
        }

        entry.add_viewer(session.id);
        *session.replay.lock().unwrap() = Some(ReplayHandle {
            entry: entry.clone(),
            audio,
            video,
            started: false,
            cancel: CancellationToken::new(),
            task: None,
        });
        session.set_state(SessionState::Replaying);
        info!(session = session.id, id, "replay prepared");

        Ok((
            json!({
                "transcode": "event",
                "result": { "status": "preparing", "id": id },
            }),
            Some(Jsep::offer(offer)),
        ))
    }

    fn handle_start(
        &self,
        session: Arc<Session>,
        jsep: Option<Jsep>,
    ) -> Result<(Value, Option<Jsep>), PluginError> {
        let jsep = jsep.ok_or_else(|| PluginError::missing_element("jsep"))?;
        if jsep.kind != "answer" {
            return Err(PluginError::invalid_sdp("start expects an SDP answer"));
        }
        sdp::validate_answer(&jsep.sdp)?;

        let id = {
            let mut guard = session.replay.lock().unwrap();
            let handle = guard
                .as_mut()
                .ok_or_else(|| PluginError::invalid_state("session is not replaying"))?;
            handle.started = true;
            handle.entry.id
        };

        // The host may already have signalled media readiness.
        if session.active.load(Ordering::Acquire) {
            self.launch_pacer(&session);
        }

        Ok((
            json!({
                "transcode": "event",
                "result": { "status": "playing", "id": id },
            }),
            None,
        ))
    }

    async fn handle_stop(
        &self,
        session: Arc<Session>,
    ) -> Result<(Value, Option<Jsep>), PluginError> {
        let entry_id = session.entry().map(|e| e.id);
        let torn_down = session::teardown(&session, &self.host, &self.events).await;
        if torn_down {
            self.host.close_peer(session.id);
        }

        let mut result = json!({ "status": "stopped" });
        if let Some(id) = entry_id {
            result["id"] = json!(id);
        }
        Ok((json!({ "transcode": "event", "result": result }), None))
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn open_source(
        &self,
        file: &str,
        clock_rate: u32,
        payload_type: u8,
    ) -> Option<ReplaySource> {
        let path = mjr_path(self.catalog.dir(), file);
        match build_index(&path).await {
            Ok((_, frames)) if !frames.is_empty() => Some(ReplaySource {
                path,
                frames,
                clock_rate,
                payload_type,
            }),
            Ok(_) => {
                warn!(path = %path.display(), "capture file holds no frames");
                None
            }
            Err(e) => {
                // A partially readable pair degrades to the good side.
                warn!(path = %path.display(), "capture file unreadable: {e}");
                None
            }
        }
    }

    fn launch_pacer(&self, session: &Arc<Session>) {
        let mut guard = session.replay.lock().unwrap();
        let handle = match guard.as_mut() {
            Some(handle) => handle,
            None => return,
        };
        if handle.task.is_some() || !handle.started {
            return;
        }

        let audio = handle.audio.take();
        let video = handle.video.take();
        let entry = handle.entry.clone();
        let cancel = handle.cancel.clone();
        let task = tokio::spawn(run_pacer(
            session.clone(),
            entry.clone(),
            self.host.clone(),
            audio,
            video,
            cancel,
        ));
        handle.task = Some(task);
        self.events
            .emit(RecastEvent::replay_started(session.id, entry.id));
        info!(session = session.id, id = entry.id, "replay pacing launched");
    }
}

async fn worker_loop(engine: Arc<Engine>, mut rx: mpsc::UnboundedReceiver<AsyncMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            AsyncMessage::Exit => break,
            AsyncMessage::Request {
                session,
                transaction,
                body,
                jsep,
            } => {
                let target = match engine.session(session) {
                    Some(target) => target,
                    None => {
                        debug!(session, "async request for a vanished session dropped");
                        continue;
                    }
                };

                match engine.dispatch_async(target, &body, jsep).await {
                    Ok((event, jsep)) => {
                        engine
                            .host
                            .push_event(session, Some(&transaction), event, jsep);
                    }
                    Err(err) => {
                        warn!(session, "async request failed: {err}");
                        engine
                            .host
                            .push_event(session, Some(&transaction), err.envelope(), None);
                    }
                }
            }
        }
    }
    debug!("request worker exited");
}

/// Optional simulcast description attached by the host to a `transcode`
/// request: `{"simulcast": {"ssrcs": [...], "rids": [...]}}`.
fn parse_simulcast(body: &Value) -> Option<SimulcastSelector> {
    let desc = body.get("simulcast")?;
    let mut ssrcs = [0u32; 3];
    let mut rids: [Option<String>; 3] = Default::default();

    if let Some(list) = desc.get("ssrcs").and_then(|v| v.as_array()) {
        for (i, value) in list.iter().take(3).enumerate() {
            ssrcs[i] = value.as_u64().unwrap_or(0) as u32;
        }
    }
    if let Some(list) = desc.get("rids").and_then(|v| v.as_array()) {
        for (i, value) in list.iter().take(3).enumerate() {
            rids[i] = value.as_str().map(|s| s.to_string());
        }
    }

    if ssrcs.iter().all(|s| *s == 0) && rids.iter().all(|r| r.is_none()) {
        return None;
    }
    Some(SimulcastSelector::new(ssrcs, rids))
}

// ---------------------------------------------------------------------------
// Tests — end-to-end request scenarios against a mock host
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockHost;
    use crate::testutil::rtp_packet;
    use std::time::Duration;

    const AUDIO_OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 127.0.0.1\r\n\
        s=-\r\nt=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=sendrecv\r\n";

    async fn test_engine(
        dir: &std::path::Path,
    ) -> (Arc<Engine>, Arc<MockHost>) {
        let config = Config {
            path: dir.to_path_buf(),
            ..Config::default()
        };
        let mock = Arc::new(MockHost::new());
        let engine = Engine::new(config, mock.clone()).await.unwrap();
        (engine, mock)
    }

    /// Poll the mock until an event with the given `result.status` (or an
    /// `error_code`) shows up for `session`.
    async fn wait_event(
        mock: &MockHost,
        session: SessionId,
        pred: impl Fn(&Value) -> bool,
    ) -> (Value, Option<Jsep>) {
        for _ in 0..200 {
            {
                let events = mock.events.lock().unwrap();
                if let Some((_, body, jsep)) = events
                    .iter()
                    .find(|(sid, body, _)| *sid == session && pred(body))
                {
                    return (body.clone(), jsep.clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected event never arrived");
    }

    fn status_is(status: &'static str) -> impl Fn(&Value) -> bool {
        move |body| body["result"]["status"] == status
    }

    fn error_is(code: u16) -> impl Fn(&Value) -> bool {
        move |body| body["error_code"] == code
    }

    #[tokio::test]
    async fn list_on_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        let response = engine
            .handle_message(sid, "t0", json!({"request": "list"}), None)
            .await
            .unwrap();
        match response {
            MessageResponse::Sync(value) => {
                assert_eq!(value["transcode"], "list");
                assert_eq!(value["list"], json!([]));
            }
            _ => panic!("list must answer synchronously"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_verb_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        let err = engine
            .handle_message(sid, "t0", json!({"request": "rewind"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 413);

        let err = engine
            .handle_message(sid, "t0", json!({"no_request": true}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, 415);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn capture_stop_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        let response = engine
            .handle_message(
                sid,
                "t1",
                json!({"request": "transcode", "name": "x", "id": 42}),
                Some(Jsep::offer(AUDIO_OFFER.into())),
            )
            .await
            .unwrap();
        assert!(matches!(response, MessageResponse::Ack));

        let (event, jsep) = wait_event(&mock, sid, status_is("transcoding")).await;
        assert_eq!(event["result"]["id"], 42);
        let answer = jsep.expect("transcode answers with SDP");
        assert_eq!(answer.kind, "answer");
        assert!(answer.sdp.contains("a=recvonly"));
        assert!(answer.sdp.contains("a=rtpmap:111 opus/48000/2"));

        engine.setup_media(sid);
        for i in 0..100u16 {
            engine.incoming_rtp(sid, Medium::Audio, &rtp_packet(111, i, 960 * i as u32, 0x5));
        }

        engine
            .handle_message(sid, "t2", json!({"request": "stop"}), None)
            .await
            .unwrap();
        wait_event(&mock, sid, status_is("stopped")).await;

        assert!(dir.path().join("rec-42-audio.mjr").exists());
        assert!(dir.path().join("42.nfo").exists());

        let response = engine
            .handle_message(sid, "t3", json!({"request": "list"}), None)
            .await
            .unwrap();
        match response {
            MessageResponse::Sync(value) => {
                let list = value["list"].as_array().unwrap();
                assert_eq!(list.len(), 1);
                assert_eq!(list[0]["id"], 42);
                assert_eq!(list[0]["audio_codec"], "opus");
                assert_eq!(list[0]["video_codec"], "none");
            }
            _ => panic!("list must answer synchronously"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_capture_id_is_420() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;

        let first = engine.create_session();
        engine
            .handle_message(
                first,
                "t1",
                json!({"request": "transcode", "name": "a", "id": 42}),
                Some(Jsep::offer(AUDIO_OFFER.into())),
            )
            .await
            .unwrap();
        wait_event(&mock, first, status_is("transcoding")).await;

        let second = engine.create_session();
        engine
            .handle_message(
                second,
                "t2",
                json!({"request": "transcode", "name": "b", "id": 42}),
                Some(Jsep::offer(AUDIO_OFFER.into())),
            )
            .await
            .unwrap();
        wait_event(&mock, second, error_is(420)).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn transcode_without_sdp_is_415() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        engine
            .handle_message(
                sid,
                "t1",
                json!({"request": "transcode", "name": "x"}),
                None,
            )
            .await
            .unwrap();
        wait_event(&mock, sid, error_is(415)).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn play_missing_capture_is_416() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        engine
            .handle_message(sid, "t1", json!({"request": "play", "id": 7777}), None)
            .await
            .unwrap();
        wait_event(&mock, sid, error_is(416)).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn full_capture_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;

        // Capture 10 audio packets as id 42.
        let cap = engine.create_session();
        engine
            .handle_message(
                cap,
                "t1",
                json!({"request": "transcode", "name": "x", "id": 42}),
                Some(Jsep::offer(AUDIO_OFFER.into())),
            )
            .await
            .unwrap();
        wait_event(&mock, cap, status_is("transcoding")).await;
        engine.setup_media(cap);
        for i in 0..10u16 {
            engine.incoming_rtp(cap, Medium::Audio, &rtp_packet(111, i, 960 * i as u32, 0x5));
        }
        engine
            .handle_message(cap, "t2", json!({"request": "stop"}), None)
            .await
            .unwrap();
        wait_event(&mock, cap, status_is("stopped")).await;

        // Replay on a second session.
        let rep = engine.create_session();
        engine
            .handle_message(rep, "t3", json!({"request": "play", "id": 42}), None)
            .await
            .unwrap();
        let (_, jsep) = wait_event(&mock, rep, status_is("preparing")).await;
        let offer = jsep.expect("play answers with the cached offer");
        assert_eq!(offer.kind, "offer");
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("a=sendonly"));

        engine
            .handle_message(
                rep,
                "t4",
                json!({"request": "start"}),
                Some(Jsep::answer("v=0\r\nm=audio 9 RTP/AVP 111\r\n".into())),
            )
            .await
            .unwrap();
        wait_event(&mock, rep, status_is("playing")).await;

        engine.setup_media(rep);

        // The pacer drains the capture and asks the host to close the peer.
        for _ in 0..200 {
            if mock.closed.lock().unwrap().contains(&rep) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(mock.closed.lock().unwrap().contains(&rep));

        let replayed: Vec<_> = mock
            .rtp
            .lock()
            .unwrap()
            .iter()
            .filter(|(sid, _, _)| *sid == rep)
            .map(|(_, _, buf)| buf.clone())
            .collect();
        assert_eq!(replayed.len(), 10);
        assert_eq!(replayed[0][1] & 0x7f, 111);

        // The host reports the torn-down peer; exactly one done event.
        engine.hangup_media(rep).await;
        wait_event(&mock, rep, status_is("done")).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_without_answer_is_415() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        engine
            .handle_message(sid, "t1", json!({"request": "start"}), None)
            .await
            .unwrap();
        wait_event(&mock, sid, error_is(415)).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn play_with_sdp_is_414() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        engine
            .handle_message(
                sid,
                "t1",
                json!({"request": "play", "id": 1}),
                Some(Jsep::offer("v=0\r\n".into())),
            )
            .await
            .unwrap();
        wait_event(&mock, sid, error_is(414)).await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn update_picks_up_handmade_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        // Write a capture pair by hand.
        let mut writer = MjrWriter::open(dir.path(), Medium::Audio, "opus", "rec-9-audio");
        writer.save(&rtp_packet(111, 1, 960, 0x9)).await.unwrap();
        writer.close().await.unwrap();
        tokio::fs::write(
            dir.path().join("9.nfo"),
            "[9]\r\nname = handmade\r\ndate = 2026-08-01 09:00:00\r\naudio = rec-9-audio.mjr\r\n",
        )
        .await
        .unwrap();

        let response = engine
            .handle_message(sid, "t1", json!({"request": "update"}), None)
            .await
            .unwrap();
        match response {
            MessageResponse::Sync(value) => assert_eq!(value["transcode"], "ok"),
            _ => panic!("update must answer synchronously"),
        }

        let response = engine
            .handle_message(sid, "t2", json!({"request": "list"}), None)
            .await
            .unwrap();
        match response {
            MessageResponse::Sync(value) => {
                let list = value["list"].as_array().unwrap();
                assert_eq!(list.len(), 1);
                assert_eq!(list[0]["id"], 9);
                assert_eq!(list[0]["name"], "handmade");
            }
            _ => panic!("list must answer synchronously"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn configure_echoes_settings_unclobbered() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        let response = engine
            .handle_message(
                sid,
                "t1",
                json!({
                    "request": "configure",
                    "video-bitrate-max": 512000,
                    "video-keyframe-interval": 30000,
                }),
                None,
            )
            .await
            .unwrap();
        match response {
            MessageResponse::Sync(value) => {
                assert_eq!(value["settings"]["video-bitrate-max"], 512000);
                // The configured interval must come back untouched.
                assert_eq!(value["settings"]["video-keyframe-interval"], 30000);
            }
            _ => panic!("configure must answer synchronously"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn double_stop_leaves_one_nfo_and_one_done() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mock) = test_engine(dir.path()).await;
        let sid = engine.create_session();

        engine
            .handle_message(
                sid,
                "t1",
                json!({"request": "transcode", "name": "x", "id": 50}),
                Some(Jsep::offer(AUDIO_OFFER.into())),
            )
            .await
            .unwrap();
        wait_event(&mock, sid, status_is("transcoding")).await;
        engine.setup_media(sid);
        engine.incoming_rtp(sid, Medium::Audio, &rtp_packet(111, 1, 960, 0x5));

        engine
            .handle_message(sid, "t2", json!({"request": "stop"}), None)
            .await
            .unwrap();
        engine
            .handle_message(sid, "t3", json!({"request": "stop"}), None)
            .await
            .unwrap();

        // Both stops are acknowledged with a stopped event.
        for _ in 0..200 {
            if mock.events_with_status("stopped") >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mock.events_with_status("stopped"), 2);
        assert_eq!(mock.events_with_status("done"), 1);

        let nfos: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "nfo").unwrap_or(false))
            .collect();
        assert_eq!(nfos.len(), 1);
        engine.shutdown().await;
    }
}
