use std::path::Path;

use tracing::debug;

use crate::mjr::{MjrError, MjrInfo, MjrReader};

// ---------------------------------------------------------------------------
// Frame index — two-pass MJR pre-parse
// ---------------------------------------------------------------------------
//
// Pass 1 walks the records reading only the RTP fixed header and looks for
// timestamp resets (a mid-capture source restart or a 32-bit wrap). Pass 2
// re-walks the file, extends every timestamp to 64 bits using the reset
// anchor, and inserts each packet into a list ordered by extended timestamp
// and wrap-aware sequence number.
//
// The list is a doubly linked list over an index arena: insertion walks
// backward from the tail (captures are nearly sorted already) and the pacer
// walks forward one node at a time.

/// Drop larger than this between consecutive timestamps declares a reset.
const RESET_DROP: i64 = 2_000_000_000;

/// Sequence distance beyond which two numbers are assumed to have wrapped.
const SEQ_WRAP_GAP: u16 = 10_000;

// ─── List node ──────────────────────────────────────────────────────────────

/// One RTP packet located in an MJR file, ordered for replay.
#[derive(Debug, Clone, Copy)]
pub struct FramePacket {
    /// RTP sequence number.
    pub seq: u16,
    /// Wrap-extended RTP timestamp.
    pub ts: u64,
    /// Bytes of the RTP packet on disk.
    pub len: u16,
    /// Byte offset of the RTP packet in the MJR file.
    pub offset: u64,
    prev: Option<u32>,
    next: Option<u32>,
}

// ─── FrameList ──────────────────────────────────────────────────────────────

/// Timestamp-ordered doubly linked list of frame packets.
pub struct FrameList {
    nodes: Vec<FramePacket>,
    head: Option<u32>,
    tail: Option<u32>,
}

impl FrameList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn head(&self) -> Option<u32> {
        self.head
    }

    pub fn get(&self, idx: u32) -> &FramePacket {
        &self.nodes[idx as usize]
    }

    pub fn next_of(&self, idx: u32) -> Option<u32> {
        self.nodes[idx as usize].next
    }

    /// Forward iteration in replay order.
    pub fn iter(&self) -> FrameIter<'_> {
        FrameIter {
            list: self,
            cursor: self.head,
        }
    }

    /// Insert keeping `(ts, seq)` order, walking backward from the tail.
    pub fn insert(&mut self, seq: u16, ts: u64, len: u16, offset: u64) {
        let idx = self.nodes.len() as u32;
        self.nodes.push(FramePacket {
            seq,
            ts,
            len,
            offset,
            prev: None,
            next: None,
        });

        let mut cursor = self.tail;
        while let Some(at) = cursor {
            let node = &self.nodes[at as usize];
            if comes_after(ts, seq, node.ts, node.seq) {
                break;
            }
            cursor = node.prev;
        }

        match cursor {
            Some(at) => {
                // Splice after `at`.
                let following = self.nodes[at as usize].next;
                self.nodes[idx as usize].prev = Some(at);
                self.nodes[idx as usize].next = following;
                self.nodes[at as usize].next = Some(idx);
                match following {
                    Some(f) => self.nodes[f as usize].prev = Some(idx),
                    None => self.tail = Some(idx),
                }
            }
            None => {
                // New head.
                self.nodes[idx as usize].next = self.head;
                match self.head {
                    Some(h) => self.nodes[h as usize].prev = Some(idx),
                    None => self.tail = Some(idx),
                }
                self.head = Some(idx);
            }
        }
    }
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FrameIter<'a> {
    list: &'a FrameList,
    cursor: Option<u32>,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = &'a FramePacket;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = &self.list.nodes[idx as usize];
        self.cursor = node.next;
        Some(node)
    }
}

/// True when `(a_ts, a_seq)` belongs at or after `(b_ts, b_seq)`.
///
/// Timestamps order first; equal timestamps fall back to the sequence
/// number, where a distance beyond `SEQ_WRAP_GAP` means the 16-bit counter
/// wrapped and the numerically smaller value is the later packet.
fn comes_after(a_ts: u64, a_seq: u16, b_ts: u64, b_seq: u16) -> bool {
    if a_ts != b_ts {
        return a_ts > b_ts;
    }
    if a_seq == b_seq {
        return true;
    }
    let distance = a_seq.abs_diff(b_seq);
    if distance > SEQ_WRAP_GAP {
        a_seq < b_seq
    } else {
        a_seq > b_seq
    }
}

// ---------------------------------------------------------------------------
// Index builder
// ---------------------------------------------------------------------------

/// Pre-parse one MJR file into an ordered frame list.
pub async fn build_index(path: &Path) -> Result<(MjrInfo, FrameList), MjrError> {
    // Pass 1 — reset discovery.
    let (info, mut reader) = MjrReader::open(path).await?;

    let mut first_ts: Option<i64> = None;
    let mut last_ts: Option<i64> = None;
    let mut reset_anchor: Option<u32> = None;

    while let Some(record) = reader.next().await? {
        let ts = record.timestamp() as i64;
        if first_ts.is_none() {
            // Anchor slightly below the first observation so pre-reset
            // packets still compare above it.
            first_ts = Some(ts - 1_000_000);
        }
        if let Some(last) = last_ts {
            if last - ts > RESET_DROP {
                reset_anchor = Some(record.timestamp());
            }
        }
        last_ts = Some(ts);
    }

    if let Some(anchor) = reset_anchor {
        debug!(path = %path.display(), anchor, "timestamp reset detected");
    }

    // Pass 2 — ordered insertion.
    let (_, mut reader) = MjrReader::open(path).await?;
    let first_ts = first_ts.unwrap_or(0);
    let mut list = FrameList::new();

    while let Some(record) = reader.next().await? {
        let ts = record.timestamp();
        let ts_ext = match reset_anchor {
            None => ts as u64,
            // Pre-reset packets sit above the first-timestamp anchor;
            // everything at or below it belongs to the restarted stream.
            Some(_) if (ts as i64) > first_ts => ts as u64,
            Some(_) => (1u64 << 32) + ts as u64,
        };
        list.insert(record.sequence_number(), ts_ext, record.len, record.offset);
    }

    debug!(
        path = %path.display(),
        frames = list.len(),
        "frame index built"
    );
    Ok((info, list))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
