use std::path::PathBuf;

use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Plugin configuration — loaded from environment variables
// ---------------------------------------------------------------------------

/// Complete plugin configuration loaded at startup.
///
/// Every field can be set via an environment variable prefixed with
/// `RECAST_`. Defaults are suitable for local development; the capture
/// directory is created on engine init if it does not exist.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Capture storage ─────────────────────────────────────────────────
    /// Directory holding `.mjr` captures and their `.nfo` descriptors.
    pub path: PathBuf,

    // ── Live publishing ─────────────────────────────────────────────────
    /// Base URL of the RTMP endpoint. The per-capture URL is
    /// `<rtmp>/<id>`. When unset, captures are not published live.
    pub rtmp: Option<String>,

    // ── Eventing ────────────────────────────────────────────────────────
    /// Whether lifecycle events are emitted on the event bus.
    pub events: bool,

    // ── RTCP feedback defaults ──────────────────────────────────────────
    /// REMB target bitrate (bits per second) suggested to capture peers.
    pub video_bitrate: u32,
    /// Interval between FIR/PLI keyframe requests, in milliseconds.
    pub keyframe_interval_ms: u64,

    // ── HTTP front ──────────────────────────────────────────────────────
    pub bind_addr: String,

    // ── Logging ─────────────────────────────────────────────────────────
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Automatically loads a `.env` file if present (via `dotenvy`).
    pub fn from_env() -> Self {
        // Best-effort .env loading — ignore errors.
        let _ = dotenvy::dotenv();

        let path = PathBuf::from(env_or("RECAST_PATH", "./captures"));

        let rtmp = match std::env::var("RECAST_RTMP") {
            Ok(url) if !url.is_empty() => Some(url.trim_end_matches('/').to_string()),
            _ => {
                warn!("RECAST_RTMP not set — captures will not be published live");
                None
            }
        };

        let events = env_bool("RECAST_EVENTS", true);

        let video_bitrate = env_or("RECAST_VIDEO_BITRATE", "1024000")
            .parse::<u32>()
            .unwrap_or(1_024_000);
        let keyframe_interval_ms = env_or("RECAST_KEYFRAME_INTERVAL_MS", "15000")
            .parse::<u64>()
            .unwrap_or(15_000);

        let bind_addr = env_or("RECAST_BIND_ADDR", "0.0.0.0:8188");
        let log_level = env_or("RECAST_LOG_LEVEL", "info");

        let config = Config {
            path,
            rtmp,
            events,
            video_bitrate,
            keyframe_interval_ms,
            bind_addr,
            log_level,
        };

        config.log_summary();
        config
    }

    fn log_summary(&self) {
        info!("──── Recast Configuration ────");
        info!("  path               : {}", self.path.display());
        info!(
            "  rtmp               : {}",
            self.rtmp.as_deref().unwrap_or("(disabled)")
        );
        info!("  events             : {}", self.events);
        info!("  video_bitrate      : {}", self.video_bitrate);
        info!("  keyframe_interval  : {} ms", self.keyframe_interval_ms);
        info!("  bind_addr          : {}", self.bind_addr);
        info!("  log_level          : {}", self.log_level);
        info!("──────────────────────────────");
    }

    /// Full RTMP URL for a capture id, if live publishing is enabled.
    pub fn rtmp_url(&self, id: u64) -> Option<String> {
        self.rtmp.as_ref().map(|base| format!("{base}/{id}"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::from("./captures"),
            rtmp: None,
            events: true,
            video_bitrate: 1_024_000,
            keyframe_interval_ms: 15_000,
            bind_addr: "0.0.0.0:8188".into(),
            log_level: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Environment helpers
// ---------------------------------------------------------------------------

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtmp_url_joins_id() {
        let config = Config {
            rtmp: Some("rtmp://media.example.com/live".into()),
            ..Config::default()
        };
        assert_eq!(
            config.rtmp_url(42).as_deref(),
            Some("rtmp://media.example.com/live/42")
        );
    }

    #[test]
    fn rtmp_disabled_when_unset() {
        let config = Config::default();
        assert_eq!(config.rtmp_url(42), None);
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.events);
        assert_eq!(config.keyframe_interval_ms, 15_000);
        assert_eq!(config.video_bitrate, 1_024_000);
    }
}
