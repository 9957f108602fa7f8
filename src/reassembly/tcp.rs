//! TCP stream reassembly for one connection.
//!
//! Sequence numbers are 32-bit byte offsets that wrap; ahead/behind is the
//! signed difference at that width. Out-of-order segments are parked in a
//! per-direction map keyed by sequence number and drained whenever the
//! in-order edge reaches them. Overlapping retransmits (repacketization)
//! are not supported: a behind-edge segment either ends exactly at the
//! edge (clean retransmit, dropped) or raises a mismatch event.
//!
//! Reference: RFC 793.

use std::collections::BTreeMap;

use tracing::warn;

use crate::capture::Timestamp;
use crate::flow::{Direction, FlowKey, PerDirection};
use crate::net::TcpHeader;

use super::{SocketEvent, StreamHandler, OOO_CAP_BYTES};

/// True when `a` is strictly ahead of `b` in the 32-bit sequence space.
fn seq_ahead(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[derive(Debug, Default)]
struct TcpSideState {
    closed: bool,
    /// Sequence number of the next expected byte from this side.
    expected_seq: u32,
    /// Out-of-order segments keyed by sequence number.
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
}

/// Reassembler for one TCP connection, both directions.
pub struct TcpConnection<H> {
    key: FlowKey,
    sides: PerDirection<TcpSideState>,
    handler: H,
}

impl<H: StreamHandler> TcpConnection<H> {
    pub fn new(key: FlowKey, handler: H) -> Self {
        Self {
            key,
            sides: PerDirection::default(),
            handler,
        }
    }

    /// Record the initial sequence number; payload starts at `seq + 1`.
    pub fn syn(&mut self, hdr: &TcpHeader, dir: Direction) {
        self.sides[dir].expected_seq = hdr.seq.wrapping_add(1);
    }

    /// Close one direction. Returns true when both sides are now closed
    /// and the connection can be dropped from the table.
    pub fn fin(&mut self, ts: Timestamp, dir: Direction) -> bool {
        self.sides[dir].closed = true;
        self.handler.event(ts, SocketEvent::Fin, dir);
        self.sides[dir.opposite()].closed
    }

    pub fn rst(&mut self, ts: Timestamp, dir: Direction) {
        self.handler.event(ts, SocketEvent::Reset, dir);
    }

    /// Feed one data segment. Empty segments (pure ACKs) are surfaced as a
    /// zero-length delivery and never advance the in-order edge.
    pub fn packet(&mut self, ts: Timestamp, hdr: &TcpHeader, payload: &[u8], dir: Direction) {
        if payload.is_empty() {
            self.handler.data(ts, &[], dir);
            return;
        }
        let side = &mut self.sides[dir];
        let incoming = hdr.seq;

        if incoming != side.expected_seq {
            if seq_ahead(incoming, side.expected_seq) {
                if side.ooo_bytes + payload.len() > OOO_CAP_BYTES {
                    warn!(key = %self.key, ?dir, seq = incoming,
                        "out-of-order buffer full, dropping segment");
                    return;
                }
                if let Some(old) = side.ooo.insert(incoming, payload.to_vec()) {
                    side.ooo_bytes -= old.len();
                }
                side.ooo_bytes += payload.len();
                return;
            }
            // A clean retransmit ends exactly at the in-order edge;
            // anything else is a sequencing anomaly worth an event.
            if incoming.wrapping_add(payload.len() as u32) != side.expected_seq {
                self.handler.event(ts, SocketEvent::SeqnrMismatch, dir);
            }
            return;
        }

        side.expected_seq = side.expected_seq.wrapping_add(payload.len() as u32);
        self.handler.data(ts, payload, dir);
        while let Some(parked) = side.ooo.remove(&side.expected_seq) {
            side.expected_seq = side.expected_seq.wrapping_add(parked.len() as u32);
            side.ooo_bytes -= parked.len();
            self.handler.data(ts, &parked, dir);
        }
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::testutil::{ts, Collect};
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            src_port: 40000,
            dst_port: 6881,
        }
    }

    fn hdr(seq: u32) -> TcpHeader {
        TcpHeader {
            src_port: 40000,
            dst_port: 6881,
            seq,
            ack: 0,
            flags: 0x10,
        }
    }

    fn syn_hdr(seq: u32) -> TcpHeader {
        TcpHeader {
            flags: 0x02,
            ..hdr(seq)
        }
    }

    #[test]
    fn in_order_delivery() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.packet(ts(1), &hdr(1001), b"hello", Direction::Out);
        c.packet(ts(2), &hdr(1006), b" world", Direction::Out);
        assert_eq!(c.handler().bytes(Direction::Out), b"hello world");
        assert!(c.handler().events.is_empty());
    }

    #[test]
    fn out_of_order_segments_are_parked_and_drained() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.packet(ts(1), &hdr(1006), b" world", Direction::Out);
        assert!(c.handler().data.is_empty());
        c.packet(ts(2), &hdr(1001), b"hello", Direction::Out);
        assert_eq!(c.handler().bytes(Direction::Out), b"hello world");
    }

    #[test]
    fn clean_retransmit_is_dropped_silently() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.packet(ts(1), &hdr(1001), b"hello", Direction::Out);
        c.packet(ts(2), &hdr(1001), b"hello", Direction::Out);
        assert_eq!(c.handler().bytes(Direction::Out), b"hello");
        assert!(c.handler().events.is_empty());
    }

    #[test]
    fn partial_overlap_raises_mismatch() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.packet(ts(1), &hdr(1001), b"hello", Direction::Out);
        // Re-sent with two extra bytes: behind the edge but not a clean
        // retransmit of what was delivered.
        c.packet(ts(2), &hdr(1001), b"hello!!", Direction::Out);
        assert_eq!(
            c.handler().events,
            vec![(Direction::Out, SocketEvent::SeqnrMismatch)]
        );
        assert_eq!(c.handler().bytes(Direction::Out), b"hello");
    }

    #[test]
    fn directions_are_independent() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.syn(&syn_hdr(5000), Direction::In);
        c.packet(ts(1), &hdr(1001), b"ping", Direction::Out);
        c.packet(ts(2), &hdr(5001), b"pong", Direction::In);
        assert_eq!(c.handler().bytes(Direction::Out), b"ping");
        assert_eq!(c.handler().bytes(Direction::In), b"pong");
    }

    #[test]
    fn empty_segment_is_a_zero_length_delivery() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        c.packet(ts(1), &hdr(1001), b"", Direction::Out);
        assert_eq!(c.handler().data, vec![(Direction::Out, vec![])]);
        // The edge did not move: the next real payload still lines up.
        c.packet(ts(2), &hdr(1001), b"x", Direction::Out);
        assert_eq!(c.handler().bytes(Direction::Out), b"x");
    }

    #[test]
    fn sequence_wrap_is_handled() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(u32::MAX - 2), Direction::Out);
        c.packet(ts(1), &hdr(u32::MAX - 1), b"ab", Direction::Out);
        // Crosses zero: next expected is 1.
        c.packet(ts(2), &hdr(1), b"cd", Direction::Out);
        assert_eq!(c.handler().bytes(Direction::Out), b"abcd");
    }

    #[test]
    fn fin_reports_when_both_sides_closed() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(1000), Direction::Out);
        assert!(!c.fin(ts(1), Direction::Out));
        assert!(c.fin(ts(2), Direction::In));
        assert_eq!(
            c.handler().events,
            vec![
                (Direction::Out, SocketEvent::Fin),
                (Direction::In, SocketEvent::Fin)
            ]
        );
    }

    #[test]
    fn ooo_cap_drops_excess_segments() {
        let mut c = TcpConnection::new(key(), Collect::default());
        c.syn(&syn_hdr(0), Direction::Out);
        let chunk = vec![0u8; 1024 * 1024];
        // Leave a one-byte hole at seq 1 so nothing drains.
        for i in 0..5u32 {
            let seq = 2 + i * chunk.len() as u32;
            c.packet(ts(i), &hdr(seq), &chunk, Direction::Out);
        }
        let side = &c.sides[Direction::Out];
        assert!(side.ooo_bytes <= OOO_CAP_BYTES);
        assert_eq!(side.ooo.len(), 4);
    }
}
