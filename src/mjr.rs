use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::debug;

use crate::codecs::Medium;

// ---------------------------------------------------------------------------
// MJR container
// ---------------------------------------------------------------------------
//
// Append-only framing: a sequence of tagged records, each
//
//   [0..8]   tag: b"MJR00002"
//   [8..10]  payload length, u16 big-endian
//   [10..]   payload
//
// The first record of a file is a JSON info object:
//
//   { "t": "a"|"v", "c": "<codec>", "s": <created_us>, "u": <first_frame_us> }
//
// Every later record holds one raw RTP packet (header + payload). Records
// shorter than 12 bytes are not RTP and are skipped on read.
//
// A legacy generation tagged b"MEETECHO" is accepted on read: its single
// info payload is the 5-byte string "audio" or "video", the codec is assumed
// (Opus / VP8) and the capture is flagged degraded. Only the new format is
// ever written.

const RECORD_TAG: &[u8; 8] = b"MJR00002";

/// Minimum record payload length treated as RTP.
pub const MIN_RTP_LEN: u16 = 12;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MjrError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record tag")]
    InvalidTag,

    #[error("truncated record")]
    Truncated,

    #[error("invalid info header: {0}")]
    InvalidHeader(String),

    #[error("packet too large ({0} bytes)")]
    PacketTooLarge(usize),
}

// ─── Info header ────────────────────────────────────────────────────────────

/// Parsed per-file info header.
#[derive(Debug, Clone)]
pub struct MjrInfo {
    pub medium: Medium,
    /// Codec name as recorded (`opus`, `vp8`, ...).
    pub codec: String,
    /// Creation time, microseconds since the epoch.
    pub created_us: u64,
    /// First-frame time, microseconds since the epoch.
    pub written_us: u64,
    /// True for legacy captures whose codec is assumed rather than recorded.
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Per-stream append-only writer.
///
/// The backing file is created lazily: nothing touches the disk until the
/// first `save`, at which point the info header is emitted followed by the
/// packet record. A capture that never receives media for this stream
/// therefore leaves no file behind.
pub struct MjrWriter {
    path: PathBuf,
    name: String,
    medium: Medium,
    codec: String,
    created_us: u64,
    first_frame_us: Option<u64>,
    file: Option<File>,
    packets: u64,
}

impl MjrWriter {
    /// Prepare a writer for `<dir>/<name>.mjr`. No I/O happens here.
    pub fn open(dir: &Path, medium: Medium, codec: &str, name: &str) -> Self {
        Self {
            path: dir.join(format!("{name}.mjr")),
            name: name.to_string(),
            medium,
            codec: codec.to_string(),
            created_us: now_us(),
            first_frame_us: None,
            file: None,
            packets: 0,
        }
    }

    /// Append one RTP packet. Emits the info header first when this is the
    /// initial save for the stream.
    pub async fn save(&mut self, rtp: &[u8]) -> Result<(), MjrError> {
        if rtp.len() > u16::MAX as usize {
            return Err(MjrError::PacketTooLarge(rtp.len()));
        }

        if self.file.is_none() {
            let mut file = File::create(&self.path).await?;
            let first_us = now_us();
            self.first_frame_us = Some(first_us);

            let info = serde_json::json!({
                "t": match self.medium {
                    Medium::Audio => "a",
                    Medium::Video => "v",
                },
                "c": self.codec,
                "s": self.created_us,
                "u": first_us,
            });
            let info_bytes = serde_json::to_vec(&info)
                .map_err(|e| MjrError::InvalidHeader(e.to_string()))?;

            let mut buf = BytesMut::with_capacity(10 + info_bytes.len());
            put_record(&mut buf, &info_bytes);
            file.write_all(&buf).await?;

            debug!(path = %self.path.display(), codec = %self.codec, "mjr file created");
            self.file = Some(file);
        }

        let mut buf = BytesMut::with_capacity(10 + rtp.len());
        put_record(&mut buf, rtp);
        self.file
            .as_mut()
            .expect("file opened above")
            .write_all(&buf)
            .await?;
        self.packets += 1;
        Ok(())
    }

    /// Flush and close. Returns `true` when a file was actually written.
    pub async fn close(&mut self) -> Result<bool, MjrError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            debug!(
                path = %self.path.display(),
                packets = self.packets,
                "mjr file closed"
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Logical name (no directory, no `.mjr` extension).
    pub fn logical_name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once at least one packet has been saved.
    pub fn has_file(&self) -> bool {
        self.first_frame_us.is_some()
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }
}

fn put_record(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_slice(RECORD_TAG);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One packet record located in an MJR file.
#[derive(Debug, Clone, Copy)]
pub struct MjrRecord {
    /// Byte offset of the RTP packet in the file.
    pub offset: u64,
    /// Length of the RTP packet on disk.
    pub len: u16,
    /// First bytes of the payload (the RTP fixed header).
    pub header: [u8; 12],
}

impl MjrRecord {
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.header[2], self.header[3]])
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
    }
}

/// Sequential record reader over a single MJR file.
///
/// `open` consumes the info record; each `next` yields one packet record,
/// already skipping payloads too short to be RTP. Any short read at a
/// record boundary is a parse error, not an end of file.
pub struct MjrReader {
    file: File,
    pos: u64,
    file_len: u64,
}

impl MjrReader {
    pub async fn open(path: &Path) -> Result<(MjrInfo, Self), MjrError> {
        let mut file = File::open(path).await?;
        let file_len = file.metadata().await?.len();
        let mut pos = 0u64;

        let tag = match read_tag(&mut file).await? {
            Some(tag) => tag,
            None => return Err(MjrError::InvalidHeader("empty file".into())),
        };
        pos += 8;

        let info = match classify(&tag)? {
            TagKind::Legacy => {
                let len = read_len(&mut file).await?;
                pos += 2;
                let mut payload = vec![0u8; len as usize];
                file.read_exact(&mut payload)
                    .await
                    .map_err(short_read)?;
                pos += len as u64;
                parse_legacy_info(&payload)?
            }
            TagKind::Record => {
                let len = read_len(&mut file).await?;
                pos += 2;
                let mut payload = vec![0u8; len as usize];
                file.read_exact(&mut payload)
                    .await
                    .map_err(short_read)?;
                pos += len as u64;
                parse_info(&payload)?
            }
        };

        Ok((
            info,
            Self {
                file,
                pos,
                file_len,
            },
        ))
    }

    /// Next packet record, or `None` at a clean end of file.
    pub async fn next(&mut self) -> Result<Option<MjrRecord>, MjrError> {
        loop {
            let tag = match read_tag(&mut self.file).await? {
                Some(tag) => tag,
                None => return Ok(None),
            };
            classify(&tag)?;
            self.pos += 8;

            let len = read_len(&mut self.file).await?;
            self.pos += 2;
            let offset = self.pos;

            if len < MIN_RTP_LEN {
                // Not RTP; skip the payload entirely.
                self.skip(len as u64).await?;
                continue;
            }

            let mut header = [0u8; 12];
            self.file.read_exact(&mut header).await.map_err(short_read)?;
            self.pos += 12;
            self.skip(len as u64 - 12).await?;

            return Ok(Some(MjrRecord {
                offset,
                len,
                header,
            }));
        }
    }

    async fn skip(&mut self, n: u64) -> Result<(), MjrError> {
        let target = self.pos + n;
        // Seeking past EOF succeeds silently, so a torn final payload has
        // to be caught against the file length.
        if target > self.file_len {
            return Err(MjrError::Truncated);
        }
        self.file.seek(SeekFrom::Start(target)).await?;
        self.pos = target;
        Ok(())
    }
}

/// Read just the info header of an MJR file.
pub async fn read_info(path: &Path) -> Result<MjrInfo, MjrError> {
    let (info, _) = MjrReader::open(path).await?;
    Ok(info)
}

// ─── Reader internals ───────────────────────────────────────────────────────

enum TagKind {
    Record,
    Legacy,
}

fn classify(tag: &[u8; 8]) -> Result<TagKind, MjrError> {
    if tag[0] != b'M' {
        return Err(MjrError::InvalidTag);
    }
    match tag[1] {
        b'J' => Ok(TagKind::Record),
        b'E' => Ok(TagKind::Legacy),
        _ => Err(MjrError::InvalidTag),
    }
}

async fn read_tag(file: &mut File) -> Result<Option<[u8; 8]>, MjrError> {
    let mut tag = [0u8; 8];
    // Distinguish a clean EOF (nothing left) from a torn record.
    let n = file.read(&mut tag).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < 8 {
        file.read_exact(&mut tag[n..]).await.map_err(short_read)?;
    }
    Ok(Some(tag))
}

async fn read_len(file: &mut File) -> Result<u16, MjrError> {
    let mut len = [0u8; 2];
    file.read_exact(&mut len).await.map_err(short_read)?;
    Ok(u16::from_be_bytes(len))
}

fn short_read(e: std::io::Error) -> MjrError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        MjrError::Truncated
    } else {
        MjrError::Io(e)
    }
}

fn parse_info(payload: &[u8]) -> Result<MjrInfo, MjrError> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| MjrError::InvalidHeader(format!("info is not JSON: {e}")))?;

    let medium = match value.get("t").and_then(|t| t.as_str()) {
        Some("a") => Medium::Audio,
        Some("v") => Medium::Video,
        Some(other) => {
            return Err(MjrError::InvalidHeader(format!("unknown type '{other}'")))
        }
        None => return Err(MjrError::InvalidHeader("missing 't'".into())),
    };

    let codec = value
        .get("c")
        .and_then(|c| c.as_str())
        .ok_or_else(|| MjrError::InvalidHeader("missing 'c'".into()))?
        .to_string();

    let created_us = value.get("s").and_then(|s| s.as_u64()).unwrap_or(0);
    // 'u' is the genuine first-write time; fall back to 's' for files
    // written before the field carried a distinct value.
    let written_us = value
        .get("u")
        .and_then(|u| u.as_u64())
        .unwrap_or(created_us);

    Ok(MjrInfo {
        medium,
        codec,
        created_us,
        written_us,
        degraded: false,
    })
}

fn parse_legacy_info(payload: &[u8]) -> Result<MjrInfo, MjrError> {
    let (medium, codec) = match payload.first() {
        Some(b'a') => (Medium::Audio, "opus"),
        Some(b'v') => (Medium::Video, "vp8"),
        _ => {
            return Err(MjrError::InvalidHeader(
                "legacy header names neither audio nor video".into(),
            ))
        }
    };
    Ok(MjrInfo {
        medium,
        codec: codec.to_string(),
        created_us: 0,
        written_us: 0,
        degraded: true,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
