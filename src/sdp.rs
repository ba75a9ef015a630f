use std::fmt::Write as _;

use crate::codecs::{AudioCodec, VideoCodec};
use crate::error::PluginError;

// ---------------------------------------------------------------------------
// SDP synthesis and inspection
// ---------------------------------------------------------------------------
//
// The host gateway owns real SDP negotiation (ICE, DTLS, extensions); the
// plugin only needs two narrow shapes: a server-originated sendonly offer
// advertising a capture's codecs, and a recvonly answer mirroring the
// codecs picked out of a client's capture offer. Both are fixed enough to
// format directly.

/// Media summary extracted from a client's capture offer: the first
/// recognized codec per m-line, with its offered payload type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferSummary {
    pub audio: Option<(AudioCodec, u8)>,
    pub video: Option<(VideoCodec, u8)>,
}

impl OfferSummary {
    pub fn has_media(&self) -> bool {
        self.audio.is_some() || self.video.is_some()
    }
}

/// Scan a client offer for its m-lines and recognized codecs.
pub fn summarize_offer(sdp: &str) -> Result<OfferSummary, PluginError> {
    if !sdp.trim_start().starts_with("v=") {
        return Err(PluginError::invalid_sdp("not an SDP description"));
    }

    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Audio,
        Video,
        Other,
    }

    let mut section = Section::Preamble;
    let mut summary = OfferSummary::default();

    for line in sdp.lines().map(|l| l.trim_end()) {
        if let Some(media) = line.strip_prefix("m=") {
            section = match media.split(' ').next() {
                Some("audio") => Section::Audio,
                Some("video") => Section::Video,
                _ => Section::Other,
            };
            continue;
        }

        let rtpmap = match line.strip_prefix("a=rtpmap:") {
            Some(r) => r,
            None => continue,
        };
        let mut parts = rtpmap.splitn(2, ' ');
        let pt = match parts.next().and_then(|p| p.parse::<u8>().ok()) {
            Some(pt) => pt,
            None => continue,
        };
        let name = match parts.next().and_then(|e| e.split('/').next()) {
            Some(name) => name,
            None => continue,
        };

        match section {
            Section::Audio if summary.audio.is_none() => {
                if let Some(codec) = AudioCodec::from_name(name) {
                    summary.audio = Some((codec, pt));
                }
            }
            Section::Video if summary.video.is_none() => {
                if let Some(codec) = VideoCodec::from_name(name) {
                    summary.video = Some((codec, pt));
                }
            }
            _ => {}
        }
    }

    Ok(summary)
}

/// Server-originated sendonly offer for replaying a capture.
pub fn build_offer(
    capture_id: u64,
    audio: Option<(AudioCodec, u8)>,
    video: Option<(VideoCodec, u8)>,
    session_id: u64,
    version: u64,
) -> String {
    let mut sdp = String::new();
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=- {session_id} {version} IN IP4 127.0.0.1\r\n\
         s=Capture {capture_id}\r\n\
         t=0 0\r\n"
    );
    if let Some((codec, pt)) = audio {
        let _ = write!(
            sdp,
            "m=audio 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
             c=IN IP4 127.0.0.1\r\n\
             a=rtpmap:{pt} {}\r\n\
             a=sendonly\r\n\
             a=mid:audio\r\n",
            codec.rtpmap()
        );
    }
    if let Some((codec, pt)) = video {
        let _ = write!(
            sdp,
            "m=video 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
             c=IN IP4 127.0.0.1\r\n\
             a=rtpmap:{pt} {}\r\n\
             a=sendonly\r\n\
             a=mid:video\r\n",
            codec.rtpmap()
        );
    }
    sdp
}

/// Recvonly answer to a client's capture offer, echoing the offered
/// payload types.
pub fn build_answer(
    capture_id: u64,
    summary: &OfferSummary,
    session_id: u64,
    version: u64,
) -> String {
    let mut sdp = String::new();
    let _ = write!(
        sdp,
        "v=0\r\n\
         o=- {session_id} {version} IN IP4 127.0.0.1\r\n\
         s=Capture {capture_id}\r\n\
         t=0 0\r\n"
    );
    if let Some((codec, pt)) = summary.audio {
        let _ = write!(
            sdp,
            "m=audio 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
             c=IN IP4 127.0.0.1\r\n\
             a=rtpmap:{pt} {}\r\n\
             a=recvonly\r\n\
             a=mid:audio\r\n",
            codec.rtpmap()
        );
    }
    if let Some((codec, pt)) = summary.video {
        let _ = write!(
            sdp,
            "m=video 9 UDP/TLS/RTP/SAVPF {pt}\r\n\
             c=IN IP4 127.0.0.1\r\n\
             a=rtpmap:{pt} {}\r\n\
             a=recvonly\r\n\
             a=mid:video\r\n",
            codec.rtpmap()
        );
    }
    sdp
}

/// Cheap sanity check for a client's answer SDP.
pub fn validate_answer(sdp: &str) -> Result<(), PluginError> {
    if !sdp.trim_start().starts_with("v=") || !sdp.contains("m=") {
        return Err(PluginError::invalid_sdp("answer is not an SDP description"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
