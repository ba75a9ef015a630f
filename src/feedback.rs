use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::warn;
use webrtc::rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::util::marshal::Marshal;

// ---------------------------------------------------------------------------
// RTCP feedback towards the capture peer
// ---------------------------------------------------------------------------
//
// Runs under the video ingest path. Two concerns:
//
//   * REMB ramp-up: the first four packets advertise bitrate/4, /3, /2 and
//     the full target, easing the sender towards the configured bitrate;
//     afterwards the full target is repeated every five seconds.
//   * Keyframe requests: a FIR (with incrementing sequence) plus a PLI every
//     keyframe interval. The configured interval is applied unchanged.

const REMB_STARTUP: u32 = 4;
const REMB_INTERVAL: Duration = Duration::from_secs(5);

/// A feedback decision, kept symbolic so the schedule is testable apart
/// from RTCP encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Remb { bitrate: u32 },
    Fir { seq: u8 },
    Pli,
}

/// Per-capturer feedback schedule state.
pub struct FeedbackState {
    bitrate: u32,
    remb_startup: u32,
    remb_last: Option<Instant>,
    keyframe_interval: Duration,
    keyframe_last: Option<Instant>,
    fir_seq: u8,
}

impl FeedbackState {
    pub fn new(bitrate: u32, keyframe_interval_ms: u64) -> Self {
        Self {
            bitrate,
            remb_startup: REMB_STARTUP,
            remb_last: None,
            keyframe_interval: Duration::from_millis(keyframe_interval_ms),
            keyframe_last: None,
            fir_seq: 0,
        }
    }

    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }

    pub fn set_keyframe_interval(&mut self, ms: u64) {
        self.keyframe_interval = Duration::from_millis(ms);
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn keyframe_interval_ms(&self) -> u64 {
        self.keyframe_interval.as_millis() as u64
    }

    /// Advance the schedule for one incoming video packet.
    pub fn on_video_packet(&mut self, now: Instant) -> Vec<Feedback> {
        let mut out = Vec::new();

        if self.remb_startup > 0 {
            out.push(Feedback::Remb {
                bitrate: self.bitrate / self.remb_startup,
            });
            self.remb_startup -= 1;
            self.remb_last = Some(now);
        } else {
            match self.remb_last {
                Some(last) if now.duration_since(last) < REMB_INTERVAL => {}
                _ => {
                    out.push(Feedback::Remb {
                        bitrate: self.bitrate,
                    });
                    self.remb_last = Some(now);
                }
            }
        }

        match self.keyframe_last {
            None => {
                // Arm the timer on the first packet; the peer just sent a
                // keyframe to start the stream.
                self.keyframe_last = Some(now);
            }
            Some(last) if now.duration_since(last) >= self.keyframe_interval => {
                out.push(Feedback::Fir { seq: self.fir_seq });
                self.fir_seq = self.fir_seq.wrapping_add(1);
                out.push(Feedback::Pli);
                self.keyframe_last = Some(now);
            }
            _ => {}
        }

        out
    }

    /// Immediate PLI, used when a simulcast layer switch is blocked on a
    /// keyframe.
    pub fn keyframe_now(&mut self) -> Vec<Feedback> {
        vec![Feedback::Pli]
    }
}

/// Encode one feedback decision as an RTCP wire packet.
pub fn encode(feedback: Feedback, media_ssrc: u32) -> Option<Bytes> {
    let result = match feedback {
        Feedback::Remb { bitrate } => ReceiverEstimatedMaximumBitrate {
            sender_ssrc: 0,
            bitrate: bitrate as f32,
            ssrcs: vec![media_ssrc],
        }
        .marshal(),
        Feedback::Fir { seq } => FullIntraRequest {
            sender_ssrc: 0,
            media_ssrc,
            fir: vec![FirEntry {
                ssrc: media_ssrc,
                sequence_number: seq,
            }],
        }
        .marshal(),
        Feedback::Pli => PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        }
        .marshal(),
    };

    match result {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("RTCP feedback marshal error: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rembs(feedback: &[Feedback]) -> Vec<u32> {
        feedback
            .iter()
            .filter_map(|f| match f {
                Feedback::Remb { bitrate } => Some(*bitrate),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn remb_ramp_divides_by_countdown() {
        let mut state = FeedbackState::new(1_000_000, 15_000);
        let t0 = Instant::now();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.extend(rembs(&state.on_video_packet(t0)));
        }

        // Four ramp values, then silence inside the 5 s window.
        assert_eq!(seen, vec![250_000, 333_333, 500_000, 1_000_000]);
    }

    #[test]
    fn remb_repeats_after_interval() {
        let mut state = FeedbackState::new(800_000, 15_000);
        let t0 = Instant::now();
        for _ in 0..4 {
            state.on_video_packet(t0);
        }

        assert!(rembs(&state.on_video_packet(t0 + Duration::from_secs(1))).is_empty());
        let later = state.on_video_packet(t0 + Duration::from_secs(6));
        assert_eq!(rembs(&later), vec![800_000]);
    }

    #[test]
    fn keyframe_requests_fire_on_interval_with_incrementing_fir() {
        let mut state = FeedbackState::new(1_000_000, 1_000);
        let t0 = Instant::now();

        // First packet only arms the timer.
        let first = state.on_video_packet(t0);
        assert!(!first.iter().any(|f| matches!(f, Feedback::Fir { .. })));

        let at_1s = state.on_video_packet(t0 + Duration::from_millis(1_100));
        assert!(at_1s.contains(&Feedback::Fir { seq: 0 }));
        assert!(at_1s.contains(&Feedback::Pli));

        let at_2s = state.on_video_packet(t0 + Duration::from_millis(2_200));
        assert!(at_2s.contains(&Feedback::Fir { seq: 1 }));
    }

    #[test]
    fn configured_interval_is_honored() {
        // The configured value must survive unchanged (the historical
        // implementation clobbered it to 1000 ms).
        let mut state = FeedbackState::new(1_000_000, 30_000);
        assert_eq!(state.keyframe_interval_ms(), 30_000);
        state.set_keyframe_interval(7_500);
        assert_eq!(state.keyframe_interval_ms(), 7_500);
    }

    #[test]
    fn encode_produces_psfb_packets() {
        for feedback in [
            Feedback::Remb { bitrate: 500_000 },
            Feedback::Fir { seq: 3 },
            Feedback::Pli,
        ] {
            let bytes = encode(feedback, 0x1234).unwrap();
            assert!(bytes.len() >= 12);
            // All three are payload-specific feedback (PT 206) or PLI/FIR
            // (PT 206 with different FMT); the version bits must be 2.
            assert_eq!(bytes[0] >> 6, 2);
            assert_eq!(bytes[1], 206);
        }
    }
}
