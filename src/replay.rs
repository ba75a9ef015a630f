use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::CaptureEntry;
use crate::codecs::Medium;
use crate::frame_index::FrameList;
use crate::host::{HostTransport, SessionId};
use crate::session::{ReplaySource, Session};

// ---------------------------------------------------------------------------
// Replay pacer
// ---------------------------------------------------------------------------
//
// One task per replaying session. Each medium advances independently: the
// first packet goes out immediately, every later packet waits until the
// wall clock has covered the RTP timestamp delta (minus a 5 ms tolerance).
// Video packets sharing one timestamp are a fragmented frame and leave in
// a single scheduling slot. When neither medium sends in a round the task
// sleeps 5 ms.

const PACING_TOLERANCE_MS: f64 = 5.0;
const IDLE_SLEEP: Duration = Duration::from_millis(5);

struct MediumCursor {
    medium: Medium,
    file: File,
    frames: FrameList,
    next: Option<u32>,
    prev_ts: u64,
    last_send: Option<Instant>,
    clock_khz: f64,
    payload_type: u8,
}

impl MediumCursor {
    async fn open(medium: Medium, source: ReplaySource) -> std::io::Result<Self> {
        let file = File::open(&source.path).await?;
        let next = source.frames.head();
        Ok(Self {
            medium,
            file,
            frames: source.frames,
            next,
            prev_ts: 0,
            last_send: None,
            clock_khz: source.clock_rate as f64 / 1_000.0,
            payload_type: source.payload_type,
        })
    }

    fn done(&self) -> bool {
        self.next.is_none()
    }

    /// Send the due packet group, if any. Returns whether anything left.
    async fn step(
        &mut self,
        now: Instant,
        session: SessionId,
        host: &Arc<dyn HostTransport>,
    ) -> std::io::Result<bool> {
        let idx = match self.next {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let ts = self.frames.get(idx).ts;

        if let Some(last) = self.last_send {
            let due_ms = (ts - self.prev_ts) as f64 / self.clock_khz;
            let elapsed_ms = now.duration_since(last).as_secs_f64() * 1_000.0;
            if elapsed_ms < due_ms - PACING_TOLERANCE_MS {
                return Ok(false);
            }
        }

        // Video packets with one timestamp are a fragmented frame: emit the
        // whole group in this slot.
        let mut cursor = Some(idx);
        while let Some(at) = cursor {
            let node = *self.frames.get(at);
            if node.ts != ts {
                break;
            }
            self.emit(session, host, node.offset, node.len).await?;
            cursor = self.frames.next_of(at);
            if self.medium == Medium::Audio {
                break;
            }
        }

        self.next = cursor;
        self.prev_ts = ts;
        self.last_send = Some(now);
        Ok(true)
    }

    async fn emit(
        &mut self,
        session: SessionId,
        host: &Arc<dyn HostTransport>,
        offset: u64,
        len: u16,
    ) -> std::io::Result<()> {
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;

        // Replace the payload type, preserving the marker bit.
        buf[1] = (buf[1] & 0x80) | (self.payload_type & 0x7f);

        host.relay_rtp(session, self.medium, &buf);
        Ok(())
    }
}

/// Body of the per-replay pacer task.
pub(crate) async fn run_pacer(
    session: Arc<Session>,
    entry: Arc<CaptureEntry>,
    host: Arc<dyn HostTransport>,
    audio: Option<ReplaySource>,
    video: Option<ReplaySource>,
    cancel: CancellationToken,
) {
    let mut cursors: Vec<MediumCursor> = Vec::new();
    for (medium, source) in [(Medium::Audio, audio), (Medium::Video, video)] {
        if let Some(source) = source {
            match MediumCursor::open(medium, source).await {
                Ok(cursor) => cursors.push(cursor),
                Err(e) => {
                    // One unreadable side degrades the replay, it does not
                    // abort it.
                    warn!(session = session.id, %medium, "replay open failed: {e}");
                }
            }
        }
    }

    info!(
        session = session.id,
        id = entry.id,
        media = cursors.len(),
        "replay pacing started"
    );

    loop {
        if cancel.is_cancelled()
            || session.destroyed.load(std::sync::atomic::Ordering::Acquire)
            || entry.is_destroyed()
        {
            debug!(session = session.id, "replay interrupted");
            break;
        }
        if cursors.iter().all(|c| c.done()) {
            debug!(session = session.id, "replay drained");
            break;
        }

        let now = Instant::now();
        let mut sent = false;
        let mut failed = false;
        for cursor in cursors.iter_mut() {
            match cursor.step(now, session.id, &host).await {
                Ok(did) => sent |= did,
                Err(e) => {
                    warn!(session = session.id, "replay read failed: {e}");
                    failed = true;
                }
            }
        }
        if failed {
            break;
        }

        if !sent {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }

    // Frame nodes and file handles go down with the cursors.
    drop(cursors);
    entry.remove_viewer(session.id);
    host.close_peer(session.id);
    info!(session = session.id, id = entry.id, "replay finished");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::frame_index::build_index;
    use crate::host::mock::MockHost;
    use crate::mjr::MjrWriter;
    use crate::testutil::rtp_packet;

    async fn record(
        dir: &std::path::Path,
        name: &str,
        medium: Medium,
        codec: &str,
        frames: &[(u16, u32)],
    ) -> std::path::PathBuf {
        let mut writer = MjrWriter::open(dir, medium, codec, name);
        for (seq, ts) in frames {
            writer.save(&rtp_packet(96, *seq, *ts, 0xfeed)).await.unwrap();
        }
        writer.close().await.unwrap();
        dir.join(format!("{name}.mjr"))
    }

    fn fixture(dir: &std::path::Path) -> (Arc<Session>, Arc<CaptureEntry>) {
        let catalog = Catalog::new(dir.to_path_buf());
        let entry = catalog
            .create(Some(1), "replayed".into(), "d".into())
            .unwrap();
        let session = Arc::new(Session::new(9, 1_000_000, 15_000));
        entry.add_viewer(session.id);
        (session, entry)
    }

    #[tokio::test]
    async fn audio_replays_in_order_with_rewritten_payload_type() {
        let dir = tempfile::tempdir().unwrap();
        // 20 ms spacing at 48 kHz.
        let path = record(
            dir.path(),
            "a",
            Medium::Audio,
            "opus",
            &[(10, 0), (11, 960), (12, 1920)],
        )
        .await;
        let (_, frames) = build_index(&path).await.unwrap();

        let (session, entry) = fixture(dir.path());
        let mock = Arc::new(MockHost::new());
        let host: Arc<dyn HostTransport> = mock.clone();

        let started = Instant::now();
        run_pacer(
            session.clone(),
            entry.clone(),
            host,
            Some(ReplaySource {
                path,
                frames,
                clock_rate: 48_000,
                payload_type: 111,
            }),
            None,
            CancellationToken::new(),
        )
        .await;

        let sent = mock.rtp.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        for (i, (sid, medium, buf)) in sent.iter().enumerate() {
            assert_eq!(*sid, session.id);
            assert_eq!(*medium, Medium::Audio);
            assert_eq!(buf[1] & 0x7f, 111);
            assert_eq!(
                u16::from_be_bytes([buf[2], buf[3]]),
                10 + i as u16
            );
        }

        // Two 20 ms gaps paced against the wall clock (5 ms tolerance each).
        assert!(started.elapsed() >= Duration::from_millis(25));

        assert_eq!(entry.viewer_count(), 0);
        assert_eq!(mock.closed.lock().unwrap().as_slice(), &[session.id]);
    }

    #[tokio::test]
    async fn fragmented_video_frame_leaves_as_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = record(
            dir.path(),
            "v",
            Medium::Video,
            "vp8",
            &[(1, 3000), (2, 3000), (3, 3000), (4, 6000)],
        )
        .await;
        let (_, frames) = build_index(&path).await.unwrap();

        let (session, entry) = fixture(dir.path());
        let mock = Arc::new(MockHost::new());
        let host: Arc<dyn HostTransport> = mock.clone();

        run_pacer(
            session,
            entry,
            host,
            None,
            Some(ReplaySource {
                path,
                frames,
                clock_rate: 90_000,
                payload_type: 100,
            }),
            CancellationToken::new(),
        )
        .await;

        let sent = mock.rtp.lock().unwrap().clone();
        assert_eq!(sent.len(), 4);
        let seqs: Vec<u16> = sent
            .iter()
            .map(|(_, _, buf)| u16::from_be_bytes([buf[2], buf[3]]))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_pacer() {
        let dir = tempfile::tempdir().unwrap();
        // A long capture: 100 packets, 20 ms apart.
        let schedule: Vec<(u16, u32)> = (0..100u16).map(|i| (i, 960 * i as u32)).collect();
        let path = record(dir.path(), "long", Medium::Audio, "opus", &schedule).await;
        let (_, frames) = build_index(&path).await.unwrap();

        let (session, entry) = fixture(dir.path());
        let mock = Arc::new(MockHost::new());
        let host: Arc<dyn HostTransport> = mock.clone();
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        run_pacer(
            session,
            entry,
            host,
            Some(ReplaySource {
                path,
                frames,
                clock_rate: 48_000,
                payload_type: 111,
            }),
            None,
            cancel,
        )
        .await;

        let sent = mock.rtp.lock().unwrap().len();
        assert!(sent > 0, "something must have been sent before the cancel");
        assert!(sent < 100, "cancellation must cut the replay short");
    }
}
