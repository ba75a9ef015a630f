use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::codecs::Medium;

// ---------------------------------------------------------------------------
// Publish sink — opaque live-streaming endpoint
// ---------------------------------------------------------------------------
//
// The capture path hands every surviving RTP packet to the sink in arrival
// order, tagged with its medium and substream slot. The sink is fully
// independent of the on-disk writers: its failures are logged and the sink
// is dropped, never the capture.

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink is not open")]
    NotOpen,
}

/// Live sink contract: `open` once, `push` per packet, `close` best-effort.
#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn open(&mut self) -> Result<(), SinkError>;
    async fn push(&mut self, medium: Medium, slot: usize, rtp: &[u8]) -> Result<(), SinkError>;
    async fn close(&mut self);
}

// ─── NullSink ───────────────────────────────────────────────────────────────

/// Sink used when no RTMP endpoint is configured.
pub struct NullSink;

#[async_trait]
impl PublishSink for NullSink {
    async fn open(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn push(
        &mut self,
        _medium: Medium,
        _slot: usize,
        _rtp: &[u8],
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

// ─── FfmpegRtmpSink ─────────────────────────────────────────────────────────

struct FfmpegPipe {
    child: Child,
    audio: UdpSocket,
    video: UdpSocket,
}

/// RTMP publisher backed by an ffmpeg subprocess.
///
/// ffmpeg reads raw RTP from two loopback UDP ports (audio, video),
/// remuxes, and pushes FLV to the per-capture RTMP URL. The muxing and any
/// audio transcoding live entirely inside the subprocess.
pub struct FfmpegRtmpSink {
    url: String,
    pipe: Option<FfmpegPipe>,
}

impl FfmpegRtmpSink {
    pub fn new(url: String) -> Self {
        Self { url, pipe: None }
    }
}

#[async_trait]
impl PublishSink for FfmpegRtmpSink {
    async fn open(&mut self) -> Result<(), SinkError> {
        // Ephemeral loopback ports for the RTP legs.
        let audio_port: u16 = 20_000 + (rand::random::<u16>() % 10_000);
        let video_port = audio_port + 2;

        let child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-protocol_whitelist",
                "rtp,udp",
                "-i",
                &format!("rtp://127.0.0.1:{audio_port}"),
                "-protocol_whitelist",
                "rtp,udp",
                "-i",
                &format!("rtp://127.0.0.1:{video_port}"),
                "-c:v",
                "copy",
                "-c:a",
                "aac",
                "-f",
                "flv",
                &self.url,
            ])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let audio = UdpSocket::bind("127.0.0.1:0").await?;
        audio.connect(("127.0.0.1", audio_port)).await?;
        let video = UdpSocket::bind("127.0.0.1:0").await?;
        video.connect(("127.0.0.1", video_port)).await?;

        info!(
            url = %self.url,
            audio_port,
            video_port,
            pid = child.id().unwrap_or(0),
            "rtmp sink opened"
        );

        self.pipe = Some(FfmpegPipe {
            child,
            audio,
            video,
        });
        Ok(())
    }

    async fn push(&mut self, medium: Medium, _slot: usize, rtp: &[u8]) -> Result<(), SinkError> {
        let pipe = self.pipe.as_ref().ok_or(SinkError::NotOpen)?;
        let socket = match medium {
            Medium::Audio => &pipe.audio,
            Medium::Video => &pipe.video,
        };
        socket.send(rtp).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            if let Err(e) = pipe.child.kill().await {
                warn!("rtmp sink: failed to stop ffmpeg: {e}");
            }
            info!(url = %self.url, "rtmp sink closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Test sink
// ---------------------------------------------------------------------------
