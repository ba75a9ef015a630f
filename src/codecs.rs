use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Medium — audio vs video, used to tag packets, writers and sink pushes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    Audio,
    Video,
}

impl Medium {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for Medium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AudioCodec
// ---------------------------------------------------------------------------

/// Audio codec tag carried by a capture entry and by the MJR info header.
///
/// Payload types for the static codecs are fixed by RTP (pcmu=0, pcma=8,
/// g722=9); dynamic codecs replay on 111.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Opus,
    Pcma,
    Pcmu,
    G722,
}

impl AudioCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "opus" => Some(Self::Opus),
            "pcma" => Some(Self::Pcma),
            "pcmu" => Some(Self::Pcmu),
            "g722" => Some(Self::G722),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Pcma => "pcma",
            Self::Pcmu => "pcmu",
            Self::G722 => "g722",
        }
    }

    /// Payload type used when replaying this codec.
    pub fn payload_type(&self) -> u8 {
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
            Self::G722 => 9,
            Self::Opus => 111,
        }
    }

    /// RTP clock rate, used by the replay pacer to convert timestamp
    /// deltas into milliseconds.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Self::Opus => 48_000,
            Self::Pcma | Self::Pcmu | Self::G722 => 8_000,
        }
    }

    /// `a=rtpmap` encoding name with clock (and channels for opus).
    pub fn rtpmap(&self) -> &'static str {
        match self {
            Self::Opus => "opus/48000/2",
            Self::Pcma => "PCMA/8000",
            Self::Pcmu => "PCMU/8000",
            // G.722 is a historical oddity: 8 kHz RTP clock despite
            // the 16 kHz sample rate.
            Self::G722 => "G722/8000",
        }
    }
}

impl std::fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// VideoCodec
// ---------------------------------------------------------------------------

/// Video codec tag. All video replays on payload type 100 at 90 kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodec {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "vp8" => Some(Self::Vp8),
            "vp9" => Some(Self::Vp9),
            "h264" => Some(Self::H264),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::H264 => "h264",
        }
    }

    pub fn payload_type(&self) -> u8 {
        100
    }

    pub fn clock_rate(&self) -> u32 {
        90_000
    }

    pub fn rtpmap(&self) -> &'static str {
        match self {
            Self::Vp8 => "VP8/90000",
            Self::Vp9 => "VP9/90000",
            Self::H264 => "H264/90000",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_payload_types() {
        assert_eq!(AudioCodec::Pcmu.payload_type(), 0);
        assert_eq!(AudioCodec::Pcma.payload_type(), 8);
        assert_eq!(AudioCodec::G722.payload_type(), 9);
        assert_eq!(AudioCodec::Opus.payload_type(), 111);
        assert_eq!(VideoCodec::Vp8.payload_type(), 100);
    }

    #[test]
    fn clock_rates() {
        assert_eq!(AudioCodec::Opus.clock_rate(), 48_000);
        assert_eq!(AudioCodec::G722.clock_rate(), 8_000);
        assert_eq!(VideoCodec::H264.clock_rate(), 90_000);
    }

    #[test]
    fn name_round_trip() {
        for name in ["opus", "pcma", "pcmu", "g722"] {
            let codec = AudioCodec::from_name(name).unwrap();
            assert_eq!(codec.as_str(), name);
        }
        assert_eq!(AudioCodec::from_name("OPUS"), Some(AudioCodec::Opus));
        assert_eq!(AudioCodec::from_name("mp3"), None);
        assert_eq!(VideoCodec::from_name("H264"), Some(VideoCodec::H264));
    }
}
