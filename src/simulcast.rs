use tracing::{debug, warn};
use webrtc::rtp::header::Header;
use webrtc::util::marshal::Unmarshal;

use crate::codecs::VideoCodec;

// ---------------------------------------------------------------------------
// Simulcast selection and rewriting
// ---------------------------------------------------------------------------
//
// A capturing peer may send the same source as up to three parallel RTP
// substreams (selected by SSRC, negotiated by SSRC list or rid). The
// selector forwards exactly one substream/temporal layer and rewrites the
// surviving packets so the output looks like a single continuous stream:
// sequence numbers and timestamps run through a switching context, the SSRC
// is replaced with the session's stable recording SSRC, and codec payload
// descriptors (VP8 picture id / tl0picidx) are made continuous through a
// codec-indexed adapter.

/// Timestamp step assumed across a substream switch (90 kHz, ~30 fps).
const SWITCH_TS_STEP: u32 = 3_000;

// ─── Switching context — seq/ts continuity ──────────────────────────────────

/// Keeps the outgoing sequence/timestamp line continuous while the input
/// jumps between substreams with unrelated counters.
#[derive(Debug, Default)]
pub struct SwitchingContext {
    last_ssrc: Option<u32>,
    seq_offset: u16,
    ts_offset: u32,
    last_out_seq: u16,
    last_out_ts: u32,
}

impl SwitchingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an incoming `(ssrc, seq, ts)` to the continuous output line.
    pub fn process(&mut self, ssrc: u32, seq: u16, ts: u32) -> (u16, u32) {
        match self.last_ssrc {
            None => {
                self.last_ssrc = Some(ssrc);
            }
            Some(last) if last != ssrc => {
                // Resume one step after the last emitted packet.
                self.seq_offset = self.last_out_seq.wrapping_add(1).wrapping_sub(seq);
                self.ts_offset = self
                    .last_out_ts
                    .wrapping_add(SWITCH_TS_STEP)
                    .wrapping_sub(ts);
                self.last_ssrc = Some(ssrc);
                debug!(ssrc, "switching context rebased");
            }
            _ => {}
        }

        let out_seq = seq.wrapping_add(self.seq_offset);
        let out_ts = ts.wrapping_add(self.ts_offset);
        self.last_out_seq = out_seq;
        self.last_out_ts = out_ts;
        (out_seq, out_ts)
    }
}

// ─── VP8 payload descriptor ─────────────────────────────────────────────────

/// Minimal view of a VP8 payload descriptor, enough to filter temporal
/// layers, detect keyframes and rewrite picture id / tl0picidx in place.
#[derive(Debug, Clone, Copy)]
struct Vp8Descriptor {
    /// Offset of the picture-id field, with its width in bytes (1 or 2).
    picture_id: Option<(usize, usize, u16)>,
    /// Offset of the tl0picidx byte and its value.
    tl0: Option<(usize, u8)>,
    tid: Option<u8>,
    /// Start of partition 0: candidate keyframe boundary.
    keyframe: bool,
}

fn parse_vp8(payload: &[u8]) -> Option<Vp8Descriptor> {
    if payload.is_empty() {
        return None;
    }
    let b0 = payload[0];
    let extended = b0 & 0x80 != 0;
    let start_of_partition = b0 & 0x10 != 0 && b0 & 0x07 == 0;
    let mut at = 1usize;

    let mut picture_id = None;
    let mut tl0 = None;
    let mut tid = None;

    if extended {
        let b1 = *payload.get(at)?;
        at += 1;
        let has_pid = b1 & 0x80 != 0;
        let has_tl0 = b1 & 0x40 != 0;
        let has_t = b1 & 0x20 != 0;
        let has_k = b1 & 0x10 != 0;

        if has_pid {
            let first = *payload.get(at)?;
            if first & 0x80 != 0 {
                let second = *payload.get(at + 1)?;
                let pid = (((first & 0x7f) as u16) << 8) | second as u16;
                picture_id = Some((at, 2, pid));
                at += 2;
            } else {
                picture_id = Some((at, 1, (first & 0x7f) as u16));
                at += 1;
            }
        }
        if has_tl0 {
            tl0 = Some((at, *payload.get(at)?));
            at += 1;
        }
        if has_t || has_k {
            let b = *payload.get(at)?;
            tid = Some((b >> 6) & 0x3);
            at += 1;
        }
    }

    // An intra frame starts partition 0 with the P bit of the VP8 frame
    // header cleared.
    let keyframe = start_of_partition
        && payload.get(at).map(|b| b & 0x01 == 0).unwrap_or(false);

    Some(Vp8Descriptor {
        picture_id,
        tl0,
        tid,
        keyframe,
    })
}

// ─── Codec-indexed payload adapter ──────────────────────────────────────────

/// Codec hook used by the selector: temporal-layer extraction, keyframe
/// detection, and descriptor rewriting across substream switches.
pub trait PayloadAdapter: Send {
    fn temporal_layer(&self, payload: &[u8]) -> Option<u8>;
    fn is_keyframe(&self, payload: &[u8]) -> bool;
    /// Rewrite the payload descriptor in place so counters stay continuous.
    /// `switched` is true on the first packet after a substream change.
    fn rewrite(&mut self, payload: &mut [u8], switched: bool);
}

pub fn adapter_for(codec: VideoCodec) -> Box<dyn PayloadAdapter> {
    match codec {
        VideoCodec::Vp8 => Box::new(Vp8Adapter::default()),
        VideoCodec::Vp9 | VideoCodec::H264 => Box::new(PassthroughAdapter),
    }
}

/// Adapter for codecs whose descriptors need no continuity fixup. Switches
/// are allowed at any packet; the receiver recovers via the requested PLI.
pub struct PassthroughAdapter;

impl PayloadAdapter for PassthroughAdapter {
    fn temporal_layer(&self, _payload: &[u8]) -> Option<u8> {
        None
    }
    fn is_keyframe(&self, _payload: &[u8]) -> bool {
        true
    }
    fn rewrite(&mut self, _payload: &mut [u8], _switched: bool) {}
}

/// VP8 adapter: keeps picture id (15-bit) and tl0picidx (8-bit) continuous
/// across substream switches.
#[derive(Default)]
pub struct Vp8Adapter {
    pid_offset: u16,
    tl0_offset: u8,
    last_out_pid: u16,
    last_out_tl0: u8,
    seen: bool,
}

impl PayloadAdapter for Vp8Adapter {
    fn temporal_layer(&self, payload: &[u8]) -> Option<u8> {
        parse_vp8(payload)?.tid
    }

    fn is_keyframe(&self, payload: &[u8]) -> bool {
        parse_vp8(payload).map(|d| d.keyframe).unwrap_or(false)
    }

    fn rewrite(&mut self, payload: &mut [u8], switched: bool) {
        let desc = match parse_vp8(payload) {
            Some(d) => d,
            None => return,
        };

        if switched && self.seen {
            if let Some((_, _, pid)) = desc.picture_id {
                self.pid_offset = self
                    .last_out_pid
                    .wrapping_add(1)
                    .wrapping_sub(pid)
                    & 0x7fff;
            }
            if let Some((_, tl0)) = desc.tl0 {
                self.tl0_offset = self.last_out_tl0.wrapping_add(1).wrapping_sub(tl0);
            }
        }
        self.seen = true;

        if let Some((at, width, pid)) = desc.picture_id {
            let out = pid.wrapping_add(self.pid_offset) & 0x7fff;
            match width {
                2 => {
                    payload[at] = 0x80 | ((out >> 8) as u8 & 0x7f);
                    payload[at + 1] = (out & 0xff) as u8;
                }
                _ => {
                    payload[at] = (out & 0x7f) as u8;
                }
            }
            self.last_out_pid = out;
        }
        if let Some((at, tl0)) = desc.tl0 {
            let out = tl0.wrapping_add(self.tl0_offset);
            payload[at] = out;
            self.last_out_tl0 = out;
        }
    }
}

// ─── Selector ───────────────────────────────────────────────────────────────

/// Outcome of running one packet through the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep the packet. `switched` marks the first packet of a new substream.
    Forward { switched: bool },
    Drop,
}

/// Per-session simulcast selection state.
pub struct SimulcastSelector {
    /// SSRC per substream slot (0 = lowest quality). A zero slot is
    /// unnegotiated.
    pub ssrcs: [u32; 3],
    /// rid per slot, when rid-based simulcast was negotiated.
    pub rids: [Option<String>; 3],
    substream_target: usize,
    templayer_target: u8,
    substream: Option<usize>,
    /// Set when a pending or completed switch needs a fresh keyframe.
    pub need_pli: bool,
}

impl SimulcastSelector {
    /// Selector defaulting to the highest negotiated layer.
    pub fn new(ssrcs: [u32; 3], rids: [Option<String>; 3]) -> Self {
        let top = ssrcs
            .iter()
            .enumerate()
            .rev()
            .find(|(_, ssrc)| **ssrc != 0)
            .map(|(i, _)| i)
            .unwrap_or(2);
        Self {
            ssrcs,
            rids,
            substream_target: top,
            templayer_target: 2,
            substream: None,
            need_pli: false,
        }
    }

    /// Record an SSRC discovered for a slot after negotiation (rid-based
    /// simulcast learns SSRCs from arriving media).
    pub fn register_ssrc(&mut self, slot: usize, ssrc: u32) {
        if slot < 3 && self.ssrcs[slot] == 0 {
            self.ssrcs[slot] = ssrc;
        }
    }

    pub fn set_targets(&mut self, substream: usize, templayer: u8) {
        let substream = substream.min(2);
        if substream != self.substream_target {
            self.substream_target = substream;
            if self.substream != Some(substream) {
                self.need_pli = true;
            }
        }
        self.templayer_target = templayer.min(2);
    }

    pub fn current_substream(&self) -> Option<usize> {
        self.substream
    }

    /// Decide whether a video packet belongs to the selected layers.
    pub fn process(
        &mut self,
        ssrc: u32,
        payload: &[u8],
        adapter: &dyn PayloadAdapter,
    ) -> Verdict {
        let slot = match self.ssrcs.iter().position(|s| *s == ssrc) {
            Some(slot) => slot,
            None => {
                warn!(ssrc, "video packet from unknown substream");
                return Verdict::Drop;
            }
        };

        // Temporal filtering applies to whichever substream we keep.
        let tid_ok = adapter
            .temporal_layer(payload)
            .map(|tid| tid <= self.templayer_target)
            .unwrap_or(true);

        match self.substream {
            None => {
                // Nothing selected yet: only the target layer may open the
                // recording; anything else is dropped while a PLI chases a
                // target keyframe.
                if slot != self.substream_target {
                    self.need_pli = true;
                    return Verdict::Drop;
                }
                self.substream = Some(slot);
                if !tid_ok {
                    return Verdict::Drop;
                }
                Verdict::Forward { switched: false }
            }
            Some(current) if slot == current => {
                if !tid_ok {
                    return Verdict::Drop;
                }
                Verdict::Forward { switched: false }
            }
            Some(_) if slot == self.substream_target => {
                // Only jump streams on a clean decode boundary.
                if adapter.is_keyframe(payload) {
                    debug!(slot, ssrc, "substream switch");
                    self.substream = Some(slot);
                    self.need_pli = false;
                    if !tid_ok {
                        return Verdict::Drop;
                    }
                    Verdict::Forward { switched: true }
                } else {
                    self.need_pli = true;
                    Verdict::Drop
                }
            }
            Some(_) => Verdict::Drop,
        }
    }
}

// ─── Whole-packet video filter ──────────────────────────────────────────────

/// Outcome of filtering a full RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// The (possibly rewritten) packet should reach the writer and sink.
    /// `keyframe_needed` asks the feedback loop for a PLI.
    Forward { keyframe_needed: bool },
    Drop { keyframe_needed: bool },
}

/// Per-session video rewrite pipeline: simulcast selection, seq/ts
/// continuity, stable recording SSRC, codec descriptor fixups.
pub struct VideoFilter {
    selector: Option<SimulcastSelector>,
    switching: SwitchingContext,
    adapter: Box<dyn PayloadAdapter>,
    /// Stable output SSRC stamped on every recorded packet.
    pub rec_ssrc: u32,
}

impl VideoFilter {
    pub fn new(codec: VideoCodec, selector: Option<SimulcastSelector>, rec_ssrc: u32) -> Self {
        Self {
            selector,
            switching: SwitchingContext::new(),
            adapter: adapter_for(codec),
            rec_ssrc,
        }
    }

    pub fn set_targets(&mut self, substream: usize, templayer: u8) {
        if let Some(selector) = self.selector.as_mut() {
            selector.set_targets(substream, templayer);
        }
    }

    /// Substream slot currently forwarded (0 when simulcast is off).
    pub fn current_slot(&self) -> usize {
        self.selector
            .as_ref()
            .and_then(|s| s.current_substream())
            .unwrap_or(0)
    }

    /// Run one video RTP packet through the filter, rewriting `buf` in
    /// place when it is kept.
    pub fn process(&mut self, buf: &mut [u8]) -> Result<FilterOutcome, webrtc::util::Error> {
        let mut slice = &buf[..];
        let header = Header::unmarshal(&mut slice)?;
        let header_len = buf.len() - slice.len();

        let switched = match self.selector.as_mut() {
            Some(selector) => {
                match selector.process(header.ssrc, &buf[header_len..], self.adapter.as_ref()) {
                    Verdict::Forward { switched } => switched,
                    Verdict::Drop => {
                        let keyframe_needed = std::mem::take(&mut selector.need_pli);
                        return Ok(FilterOutcome::Drop { keyframe_needed });
                    }
                }
            }
            None => false,
        };

        let (out_seq, out_ts) =
            self.switching
                .process(header.ssrc, header.sequence_number, header.timestamp);

        buf[2..4].copy_from_slice(&out_seq.to_be_bytes());
        buf[4..8].copy_from_slice(&out_ts.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rec_ssrc.to_be_bytes());

        self.adapter.rewrite(&mut buf[header_len..], switched);

        let keyframe_needed = self
            .selector
            .as_mut()
            .map(|s| std::mem::take(&mut s.need_pli))
            .unwrap_or(false);
        Ok(FilterOutcome::Forward { keyframe_needed })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
