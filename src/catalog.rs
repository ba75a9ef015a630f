use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codecs::{AudioCodec, VideoCodec};
use crate::error::PluginError;
use crate::host::SessionId;
use crate::{mjr, sdp};

// ---------------------------------------------------------------------------
// Capture entries
// ---------------------------------------------------------------------------

/// One recorded medium of an entry: the logical file name (no directory,
/// no `.mjr` extension), its codec and the payload type used for replay.
#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub file: String,
    pub codec: AudioCodec,
    pub pt: u8,
}

#[derive(Debug, Clone)]
pub struct VideoTrack {
    pub file: String,
    pub codec: VideoCodec,
    pub pt: u8,
}

impl AudioTrack {
    pub fn new(file: String, codec: AudioCodec) -> Self {
        let pt = codec.payload_type();
        Self { file, codec, pt }
    }
}

impl VideoTrack {
    pub fn new(file: String, codec: VideoCodec) -> Self {
        let pt = codec.payload_type();
        Self { file, codec, pt }
    }
}

/// The logical unit of a recording.
///
/// Shared between the catalog, the capturing session that owns the writers
/// while `completed` is false, and any number of replaying viewers once it
/// is true. `Arc` carries the reference count: removal from the catalog
/// only drops the map's reference, so writers and viewers keep the entry
/// alive. Viewers are recorded as session ids, never as session pointers,
/// which keeps the entry→session edge weak.
#[derive(Debug)]
pub struct CaptureEntry {
    pub id: u64,
    pub name: String,
    /// Local-time string `YYYY-MM-DD HH:MM:SS`.
    pub date: String,
    pub audio: std::sync::RwLock<Option<AudioTrack>>,
    pub video: std::sync::RwLock<Option<VideoTrack>>,
    /// Replay offer, cached when the entry completes.
    pub offer: std::sync::RwLock<Option<String>>,
    /// Replay sessions currently bound to this entry.
    pub viewers: Mutex<Vec<SessionId>>,
    pub completed: AtomicBool,
    pub destroyed: AtomicBool,
}

impl CaptureEntry {
    pub fn new(id: u64, name: String, date: String) -> Self {
        Self {
            id,
            name,
            date,
            audio: std::sync::RwLock::new(None),
            video: std::sync::RwLock::new(None),
            offer: std::sync::RwLock::new(None),
            viewers: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn add_viewer(&self, session: SessionId) {
        self.viewers.lock().unwrap().push(session);
    }

    pub fn remove_viewer(&self, session: SessionId) {
        let mut viewers = self.viewers.lock().unwrap();
        if let Some(at) = viewers.iter().position(|s| *s == session) {
            viewers.remove(at);
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap().len()
    }

    /// Build and cache the replay offer, then flip `completed`.
    pub fn complete(&self) {
        let audio = self.audio.read().unwrap().as_ref().map(|t| (t.codec, t.pt));
        let video = self.video.read().unwrap().as_ref().map(|t| (t.codec, t.pt));
        let offer = sdp::build_offer(self.id, audio, video, self.id, 1);
        *self.offer.write().unwrap() = Some(offer);
        self.completed.store(true, Ordering::Release);
    }

    /// Serializable snapshot for `list` responses.
    pub fn info(&self) -> EntryInfo {
        let audio = self.audio.read().unwrap();
        let video = self.video.read().unwrap();
        EntryInfo {
            id: self.id,
            name: self.name.clone(),
            date: self.date.clone(),
            audio: audio.as_ref().map(|t| format!("{}.mjr", t.file)),
            video: video.as_ref().map(|t| format!("{}.mjr", t.file)),
            audio_codec: audio
                .as_ref()
                .map(|t| t.codec.as_str())
                .unwrap_or("none")
                .to_string(),
            video_codec: video
                .as_ref()
                .map(|t| t.codec.as_str())
                .unwrap_or("none")
                .to_string(),
            viewers: self.viewer_count(),
        }
    }

    /// `.nfo` descriptor body (CRLF line endings).
    pub fn nfo_contents(&self) -> String {
        let mut out = format!(
            "[{}]\r\nname = {}\r\ndate = {}\r\n",
            self.id, self.name, self.date
        );
        if let Some(track) = self.audio.read().unwrap().as_ref() {
            out.push_str(&format!("audio = {}.mjr\r\n", track.file));
        }
        if let Some(track) = self.video.read().unwrap().as_ref() {
            out.push_str(&format!("video = {}.mjr\r\n", track.file));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub id: u64,
    pub name: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    pub audio_codec: String,
    pub video_codec: String,
    pub viewers: usize,
}

/// Resolve a logical file name inside the capture directory.
pub fn mjr_path(dir: &Path, logical: &str) -> PathBuf {
    dir.join(format!("{logical}.mjr"))
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Net effect of one reconcile scan.
#[derive(Default)]
pub struct ScanOutcome {
    pub added: Vec<Arc<CaptureEntry>>,
    pub removed: Vec<Arc<CaptureEntry>>,
}

/// In-memory id → entry map, reconciled against the `.nfo` descriptors in
/// the capture directory. All map mutation happens under one mutex.
pub struct Catalog {
    dir: PathBuf,
    entries: Mutex<HashMap<u64, Arc<CaptureEntry>>>,
}

impl Catalog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, id: u64) -> Option<Arc<CaptureEntry>> {
        self.entries
            .lock()
            .unwrap()
            .get(&id)
            .filter(|e| !e.is_destroyed())
            .cloned()
    }

    /// Insert a new entry under the catalog lock. A client-proposed id
    /// collides with 420; a server-chosen id retries until free.
    pub fn create(
        &self,
        proposed_id: Option<u64>,
        name: String,
        date: String,
    ) -> Result<Arc<CaptureEntry>, PluginError> {
        let mut entries = self.entries.lock().unwrap();

        let id = match proposed_id {
            Some(id) => {
                if entries.contains_key(&id) {
                    return Err(PluginError::already_exists(id));
                }
                id
            }
            None => loop {
                let id = rand::random::<u64>() >> 1;
                if id != 0 && !entries.contains_key(&id) {
                    break id;
                }
            },
        };

        let entry = Arc::new(CaptureEntry::new(id, name, date));
        entries.insert(id, entry.clone());
        Ok(entry)
    }

    /// Remove an entry from the map, marking it destroyed. Writers and
    /// viewers holding references keep it alive.
    pub fn remove(&self, id: u64) -> Option<Arc<CaptureEntry>> {
        let removed = self.entries.lock().unwrap().remove(&id);
        if let Some(entry) = &removed {
            entry.destroyed.store(true, Ordering::Release);
        }
        removed
    }

    /// Completed entries only; in-flight captures are never listed.
    pub fn list(&self) -> Vec<EntryInfo> {
        let entries = self.entries.lock().unwrap();
        let mut out: Vec<EntryInfo> = entries
            .values()
            .filter(|e| e.is_completed() && !e.is_destroyed())
            .map(|e| e.info())
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    /// Enumerate `.nfo` descriptors and reconcile with the in-memory map:
    /// new descriptors become completed entries, known ids are marked still
    /// present, and completed entries whose descriptor vanished are
    /// removed. In-progress captures (no `.nfo` yet) are left alone.
    pub async fn scan(&self) -> Result<ScanOutcome, std::io::Error> {
        let known: HashSet<u64> = self.entries.lock().unwrap().keys().copied().collect();
        let mut touched: HashSet<u64> = HashSet::new();
        let mut parsed_new: Vec<(ParsedNfo, Option<AudioTrack>, Option<VideoTrack>)> = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("nfo") {
                continue;
            }

            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), "unreadable .nfo: {e}");
                    continue;
                }
            };
            let parsed = match parse_nfo(&text) {
                Some(parsed) => parsed,
                None => {
                    warn!(path = %path.display(), "invalid .nfo descriptor");
                    continue;
                }
            };

            if known.contains(&parsed.id) {
                touched.insert(parsed.id);
                continue;
            }
            if touched.contains(&parsed.id) {
                warn!(id = parsed.id, "duplicate .nfo id, keeping the first");
                continue;
            }

            let audio = match &parsed.audio {
                Some(file) => self.probe_audio(file).await,
                None => None,
            };
            let video = match &parsed.video {
                Some(file) => self.probe_video(file).await,
                None => None,
            };
            if audio.is_none() && video.is_none() {
                warn!(id = parsed.id, "descriptor names no readable capture file");
                continue;
            }

            touched.insert(parsed.id);
            parsed_new.push((parsed, audio, video));
        }

        let mut outcome = ScanOutcome::default();
        {
            let mut entries = self.entries.lock().unwrap();
            for (parsed, audio, video) in parsed_new {
                // A capture may have raced the scan; the map wins.
                if entries.contains_key(&parsed.id) {
                    continue;
                }
                let entry = Arc::new(CaptureEntry::new(parsed.id, parsed.name, parsed.date));
                *entry.audio.write().unwrap() = audio;
                *entry.video.write().unwrap() = video;
                entry.complete();
                entries.insert(parsed.id, entry.clone());
                debug!(id = parsed.id, "catalog entry added from scan");
                outcome.added.push(entry);
            }

            for id in known {
                if touched.contains(&id) {
                    continue;
                }
                let vanished = entries
                    .get(&id)
                    .map(|e| e.is_completed())
                    .unwrap_or(false);
                if vanished {
                    if let Some(entry) = entries.remove(&id) {
                        entry.destroyed.store(true, Ordering::Release);
                        debug!(id, "catalog entry removed, .nfo vanished");
                        outcome.removed.push(entry);
                    }
                }
            }
        }

        info!(
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "capture directory scanned"
        );
        Ok(outcome)
    }

    /// Persist an entry's `.nfo` descriptor.
    pub async fn write_nfo(&self, entry: &CaptureEntry) -> Result<PathBuf, std::io::Error> {
        let path = self.dir.join(format!("{}.nfo", entry.id));
        tokio::fs::write(&path, entry.nfo_contents()).await?;
        Ok(path)
    }

    async fn probe_audio(&self, file: &str) -> Option<AudioTrack> {
        let logical = file.strip_suffix(".mjr").unwrap_or(file);
        let path = mjr_path(&self.dir, logical);
        match mjr::read_info(&path).await {
            Ok(info) => match AudioCodec::from_name(&info.codec) {
                Some(codec) => {
                    if info.degraded {
                        debug!(path = %path.display(), "legacy capture, codec assumed");
                    }
                    Some(AudioTrack::new(logical.to_string(), codec))
                }
                None => {
                    warn!(path = %path.display(), codec = %info.codec, "unknown audio codec");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), "unreadable audio capture: {e}");
                None
            }
        }
    }

    async fn probe_video(&self, file: &str) -> Option<VideoTrack> {
        let logical = file.strip_suffix(".mjr").unwrap_or(file);
        let path = mjr_path(&self.dir, logical);
        match mjr::read_info(&path).await {
            Ok(info) => match VideoCodec::from_name(&info.codec) {
                Some(codec) => Some(VideoTrack::new(logical.to_string(), codec)),
                None => {
                    warn!(path = %path.display(), codec = %info.codec, "unknown video codec");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), "unreadable video capture: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// .nfo parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ParsedNfo {
    id: u64,
    name: String,
    date: String,
    audio: Option<String>,
    video: Option<String>,
}

/// Parse an INI-style descriptor:
///
/// ```text
/// [42]
/// name = weekly demo
/// date = 2026-08-01 10:30:00
/// audio = rec-42-audio.mjr
/// video = rec-42-video.mjr
/// ```
///
/// A missing section header or missing `name`/`date` invalidates the file,
/// as does naming neither medium.
fn parse_nfo(text: &str) -> Option<ParsedNfo> {
    let mut id: Option<u64> = None;
    let mut name = None;
    let mut date = None;
    let mut audio = None;
    let mut video = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            if id.is_some() {
                // A second section means this is not one of ours.
                return None;
            }
            id = Some(section.trim().parse().ok()?);
            continue;
        }

        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        match key {
            "name" => name = Some(value),
            "date" => date = Some(value),
            "audio" => audio = Some(value),
            "video" => video = Some(value),
            _ => {}
        }
    }

    let parsed = ParsedNfo {
        id: id?,
        name: name?,
        date: date?,
        audio,
        video,
    };
    if parsed.audio.is_none() && parsed.video.is_none() {
        return None;
    }
    Some(parsed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::Medium;
    use crate::mjr::MjrWriter;
    use crate::testutil::rtp_packet;

    fn entry_with_audio(id: u64) -> CaptureEntry {
        let entry = CaptureEntry::new(id, "demo".into(), "2026-08-01 10:30:00".into());
        *entry.audio.write().unwrap() =
            Some(AudioTrack::new(format!("rec-{id}-audio"), AudioCodec::Opus));
        entry
    }

    async fn write_capture(dir: &Path, logical: &str, codec: &str, medium: Medium) {
        let mut writer = MjrWriter::open(dir, medium, codec, logical);
        writer.save(&rtp_packet(111, 1, 960, 0x42)).await.unwrap();
        writer.close().await.unwrap();
    }

    #[test]
    fn nfo_round_trip() {
        let entry = entry_with_audio(42);
        let text = entry.nfo_contents();
        assert!(text.contains("[42]\r\n"));
        assert!(text.contains("audio = rec-42-audio.mjr\r\n"));
        assert!(!text.contains("video"));

        let parsed = parse_nfo(&text).unwrap();
        assert_eq!(parsed.id, 42);
        assert_eq!(parsed.name, "demo");
        assert_eq!(parsed.audio.as_deref(), Some("rec-42-audio.mjr"));
        assert!(parsed.video.is_none());
    }

    #[test]
    fn nfo_requires_name_date_and_media() {
        assert!(parse_nfo("[1]\r\nname = x\r\ndate = d\r\naudio = a.mjr\r\n").is_some());
        assert!(parse_nfo("[1]\r\ndate = d\r\naudio = a.mjr\r\n").is_none());
        assert!(parse_nfo("[1]\r\nname = x\r\naudio = a.mjr\r\n").is_none());
        assert!(parse_nfo("[1]\r\nname = x\r\ndate = d\r\n").is_none());
        assert!(parse_nfo("name = x\r\ndate = d\r\naudio = a.mjr\r\n").is_none());
        assert!(parse_nfo("[nope]\r\nname = x\r\ndate = d\r\naudio = a.mjr\r\n").is_none());
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        catalog.create(Some(42), "a".into(), "d".into()).unwrap();
        let err = catalog.create(Some(42), "b".into(), "d".into()).unwrap_err();
        assert_eq!(err.code, 420);

        // Server-chosen ids avoid the collision.
        let entry = catalog.create(None, "c".into(), "d".into()).unwrap();
        assert_ne!(entry.id, 42);
    }

    #[test]
    fn list_excludes_incomplete_entries() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        let in_progress = catalog.create(Some(1), "rec".into(), "d".into()).unwrap();
        *in_progress.audio.write().unwrap() =
            Some(AudioTrack::new("rec-1-audio".into(), AudioCodec::Opus));
        assert!(catalog.list().is_empty());

        in_progress.complete();
        let listed = catalog.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].audio_codec, "opus");
    }

    #[tokio::test]
    async fn scan_builds_entries_from_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        write_capture(dir.path(), "rec-7-audio", "pcma", Medium::Audio).await;
        write_capture(dir.path(), "rec-7-video", "vp8", Medium::Video).await;
        tokio::fs::write(
            dir.path().join("7.nfo"),
            "[7]\r\nname = handmade\r\ndate = 2026-08-01 09:00:00\r\n\
             audio = rec-7-audio.mjr\r\nvideo = rec-7-video.mjr\r\n",
        )
        .await
        .unwrap();

        let outcome = catalog.scan().await.unwrap();
        assert_eq!(outcome.added.len(), 1);

        let entry = catalog.get(7).unwrap();
        assert!(entry.is_completed());
        assert_eq!(entry.audio.read().unwrap().as_ref().unwrap().pt, 8);
        assert_eq!(entry.video.read().unwrap().as_ref().unwrap().pt, 100);

        let offer = entry.offer.read().unwrap().clone().unwrap();
        assert!(offer.contains("a=rtpmap:8 PCMA/8000"));
        assert!(offer.contains("a=sendonly"));
    }

    #[tokio::test]
    async fn scan_removes_vanished_completed_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        // Completed entry whose descriptor is about to vanish.
        let gone = catalog.create(Some(5), "gone".into(), "d".into()).unwrap();
        *gone.audio.write().unwrap() =
            Some(AudioTrack::new("rec-5-audio".into(), AudioCodec::Opus));
        gone.complete();

        // In-progress capture: no .nfo exists yet, must survive the scan.
        catalog.create(Some(6), "busy".into(), "d".into()).unwrap();

        let outcome = catalog.scan().await.unwrap();
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].id, 5);
        assert!(outcome.removed[0].is_destroyed());
        assert!(catalog.get(5).is_none());
        assert!(catalog.get(6).is_some());
    }

    #[tokio::test]
    async fn scan_skips_descriptors_without_readable_media() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        tokio::fs::write(
            dir.path().join("9.nfo"),
            "[9]\r\nname = ghost\r\ndate = d\r\naudio = missing.mjr\r\n",
        )
        .await
        .unwrap();

        let outcome = catalog.scan().await.unwrap();
        assert!(outcome.added.is_empty());
        assert!(catalog.get(9).is_none());
    }

    #[tokio::test]
    async fn partially_readable_pair_proceeds_on_one_side() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().to_path_buf());

        write_capture(dir.path(), "rec-8-audio", "opus", Medium::Audio).await;
        tokio::fs::write(
            dir.path().join("8.nfo"),
            "[8]\r\nname = half\r\ndate = d\r\n\
             audio = rec-8-audio.mjr\r\nvideo = rec-8-video.mjr\r\n",
        )
        .await
        .unwrap();

        catalog.scan().await.unwrap();
        let entry = catalog.get(8).unwrap();
        assert!(entry.audio.read().unwrap().is_some());
        assert!(entry.video.read().unwrap().is_none());
    }

    #[test]
    fn viewers_are_a_multiset() {
        let entry = entry_with_audio(1);
        entry.add_viewer(10);
        entry.add_viewer(11);
        entry.add_viewer(10);
        assert_eq!(entry.viewer_count(), 3);
        entry.remove_viewer(10);
        assert_eq!(entry.viewer_count(), 2);
    }
}
