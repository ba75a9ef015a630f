//! Small fixtures shared by the module tests.

/// A minimal RTP packet: 12-byte fixed header plus an 8-byte payload.
pub fn rtp_packet(pt: u8, seq: u16, ts: u32, ssrc: u32) -> Vec<u8> {
    rtp_packet_with_payload(pt, seq, ts, ssrc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4])
}

/// An RTP packet with a caller-chosen payload.
pub fn rtp_packet_with_payload(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + payload.len());
    buf.push(0x80); // V=2
    buf.push(pt & 0x7f);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&ssrc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}
