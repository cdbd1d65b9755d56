//! RTP framing for the NTRIP 2.0 UDP and RTSP transports
//!
//! The caster speaks plain RFC 3550 framing with none of the optional
//! machinery: version 2, no padding, no extension, no CSRC list, so every
//! header is exactly 12 bytes. Payload types are 96 (data), 97 (request) and
//! 98 (end of session); the SSRC doubles as the NTRIP session id.

use bytes::{Buf, BufMut, BytesMut};

/// First header byte of every packet we accept: version 2, nothing else set.
pub const VERSION_BYTE: u8 = 2 << 6;

/// Stream data.
pub const PT_DATA: u8 = 96;
/// Client request (the initial packet wrapping the HTTP request).
pub const PT_REQUEST: u8 = 97;
/// End of session marker.
pub const PT_TEARDOWN: u8 = 98;

pub const HEADER_LEN: usize = 12;

/// RTP timestamps advance in units of 1/125 s per the caster's clock.
pub const TIME_RESOLUTION: u32 = 125;

/// The fixed 12-byte header, packed and unpacked with explicit big-endian
/// arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RtpHeader {
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode_into(&mut buf);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(VERSION_BYTE);
        buf.put_u8(self.payload_type);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Advance the timestamp by `secs` seconds of wallclock, as done between
    /// keepalive packets.
    pub fn advance(&mut self, secs: u64) {
        self.timestamp = self
            .timestamp
            .wrapping_add((secs as u32).wrapping_mul(1_000_000 / TIME_RESOLUTION));
        self.sequence = self.sequence.wrapping_add(1);
    }
}

/// Split a datagram into header and payload.
///
/// `None` for anything shorter than a header or not carrying plain version-2
/// framing; the caller decides which payload types it accepts.
pub fn split_packet(datagram: &[u8]) -> Option<(RtpHeader, &[u8])> {
    if datagram.len() < HEADER_LEN || datagram[0] != VERSION_BYTE {
        return None;
    }

    let (mut head, payload) = datagram.split_at(HEADER_LEN);
    head.advance(1);

    Some((
        RtpHeader {
            payload_type: head.get_u8(),
            sequence: head.get_u16(),
            timestamp: head.get_u32(),
            ssrc: head.get_u32(),
        },
        payload,
    ))
}

/// What to do with a received packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// In order: hand the payload to the sink.
    Forward,
    /// Duplicate or late: drop silently.
    Drop,
    /// Wrong session or regressing timestamp: warn and ignore.
    Reject,
}

/// Per-session ordering state: last observed sequence and timestamp.
///
/// A payload is forwarded only when its sequence is strictly newer than the
/// saved one modulo the 16-bit wrap (a very low new value against a very high
/// saved one counts as a wrap, not a replay). Legal packets update the marks
/// whether or not they are forwarded, so a late packet lowers the bar for its
/// successors.
pub struct SequenceWindow {
    ssrc: u32,
    last_seq: u16,
    last_ts: u32,
    primed: bool,
}

fn seq_newer(new: u16, last: u16) -> bool {
    new != last && new.wrapping_sub(last) < 0x8000
}

impl SequenceWindow {
    pub fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            last_seq: 0,
            last_ts: 0,
            primed: false,
        }
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Observe one packet and decide its fate.
    ///
    /// The first packet primes the window: with `forward_first` (UDP mode) it
    /// is forwarded, without (RTSP mode) it only initialises the marks.
    pub fn observe(&mut self, header: &RtpHeader, forward_first: bool) -> Verdict {
        if !self.primed {
            self.primed = true;
            if forward_first {
                self.last_seq = header.sequence.wrapping_sub(1);
                self.last_ts = header.timestamp.saturating_sub(1);
            } else {
                self.last_seq = header.sequence;
                self.last_ts = header.timestamp;
                return Verdict::Drop;
            }
        }

        if header.ssrc != self.ssrc || self.last_ts > header.timestamp {
            return Verdict::Reject;
        }

        let forward = seq_newer(header.sequence, self.last_seq);
        self.last_seq = header.sequence;
        self.last_ts = header.timestamp;

        if forward {
            Verdict::Forward
        } else {
            Verdict::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(seq: u16, ts: u32, ssrc: u32) -> RtpHeader {
        RtpHeader {
            payload_type: PT_DATA,
            sequence: seq,
            timestamp: ts,
            ssrc,
        }
    }

    #[test]
    fn header_encodes_big_endian() {
        let h = RtpHeader {
            payload_type: PT_REQUEST,
            sequence: 0x0102,
            timestamp: 0x0304_0506,
            ssrc: 0x0708_090a,
        };
        assert_eq!(
            h.encode(),
            [0x80, 97, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
    }

    #[test]
    fn split_round_trips() {
        let h = header(4242, 99_000, 0xdead_beef);
        let mut datagram = h.encode().to_vec();
        datagram.extend_from_slice(b"payload");

        let (parsed, payload) = split_packet(&datagram).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn split_rejects_bad_framing() {
        assert!(split_packet(&[0x80; 11]).is_none());

        let mut datagram = header(1, 1, 1).encode().to_vec();
        datagram[0] = 0x90; // extension bit set
        assert!(split_packet(&datagram).is_none());
    }

    #[test]
    fn advance_steps_clock_and_sequence() {
        let mut h = header(10, 1000, 7);
        h.advance(15);
        assert_eq!(h.sequence, 11);
        assert_eq!(h.timestamp, 1000 + 15 * 8000);
    }

    #[test]
    fn reordered_sequence_is_dropped() {
        // 10, 12, 11, 13 forwards 10, 12 and 13
        let mut win = SequenceWindow::new(7);
        let verdicts: Vec<Verdict> = [10u16, 12, 11, 13]
            .iter()
            .map(|&s| win.observe(&header(s, 100, 7), true))
            .collect();
        assert_eq!(
            verdicts,
            [Verdict::Forward, Verdict::Forward, Verdict::Drop, Verdict::Forward]
        );
    }

    #[test]
    fn duplicate_sequence_is_dropped() {
        let mut win = SequenceWindow::new(7);
        assert_eq!(win.observe(&header(5, 100, 7), true), Verdict::Forward);
        assert_eq!(win.observe(&header(5, 100, 7), true), Verdict::Drop);
    }

    #[test]
    fn sequence_wrap_is_forward_progress() {
        let mut win = SequenceWindow::new(7);
        assert_eq!(win.observe(&header(65530, 100, 7), true), Verdict::Forward);
        assert_eq!(win.observe(&header(2, 100, 7), true), Verdict::Forward);
        // and the stale pre-wrap packet is late now
        assert_eq!(win.observe(&header(65531, 100, 7), true), Verdict::Drop);
    }

    #[test]
    fn wrong_ssrc_is_rejected_without_update() {
        let mut win = SequenceWindow::new(7);
        assert_eq!(win.observe(&header(5, 100, 7), true), Verdict::Forward);
        assert_eq!(win.observe(&header(6, 100, 8), true), Verdict::Reject);
        // the intruder did not move the window
        assert_eq!(win.observe(&header(6, 100, 7), true), Verdict::Forward);
    }

    #[test]
    fn regressing_timestamp_is_rejected() {
        let mut win = SequenceWindow::new(7);
        assert_eq!(win.observe(&header(5, 100, 7), true), Verdict::Forward);
        assert_eq!(win.observe(&header(6, 99, 7), true), Verdict::Reject);
    }

    #[test]
    fn rtsp_priming_swallows_the_first_packet() {
        let mut win = SequenceWindow::new(7);
        assert_eq!(win.observe(&header(100, 50, 7), false), Verdict::Drop);
        assert!(win.is_primed());
        assert_eq!(win.observe(&header(101, 50, 7), false), Verdict::Forward);
    }
}
