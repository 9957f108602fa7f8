//! uTP stream reassembly for one connection.
//!
//! Unlike TCP, uTP sequence numbers are 16-bit *packet* counters: each
//! data packet advances the edge by one, whatever its size. A direction
//! that never saw a SYN initializes from its first packet's sequence
//! number (captures that start mid-stream).
//!
//! Reference: BEP-29.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::capture::Timestamp;
use crate::flow::{Direction, PerDirection, UtpFlowKey};
use crate::net::utp::UtpHeader;

use super::{SocketEvent, StreamHandler, OOO_CAP_BYTES};

/// True when `a` is strictly ahead of `b` in the 16-bit sequence space.
fn seq_ahead(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

#[derive(Debug, Default)]
struct UtpSideState {
    closed: bool,
    connected: bool,
    /// Sequence number of the next expected packet from this side.
    expected_seq: u16,
    connection_id: u16,
    /// Out-of-order packets keyed by sequence number.
    ooo: BTreeMap<u16, Vec<u8>>,
    ooo_bytes: usize,
}

/// Reassembler for one uTP connection, both directions.
pub struct UtpConnection<H> {
    key: UtpFlowKey,
    sides: PerDirection<UtpSideState>,
    handler: H,
}

impl<H: StreamHandler> UtpConnection<H> {
    pub fn new(key: UtpFlowKey, handler: H) -> Self {
        Self {
            key,
            sides: PerDirection::default(),
            handler,
        }
    }

    /// SYN bookkeeping: the first payload packet carries `seq + 1`.
    pub fn syn(&mut self, hdr: &UtpHeader, dir: Direction) {
        let side = &mut self.sides[dir];
        side.connected = true;
        side.expected_seq = hdr.seq_nr.wrapping_add(1);
        side.connection_id = hdr.connection_id;
    }

    /// Close one direction. Returns true when both sides are now closed.
    pub fn fin(&mut self, ts: Timestamp, dir: Direction) -> bool {
        self.sides[dir].closed = true;
        self.handler.event(ts, SocketEvent::Fin, dir);
        self.sides[dir.opposite()].closed
    }

    pub fn rst(&mut self, ts: Timestamp, dir: Direction) {
        self.handler.event(ts, SocketEvent::Reset, dir);
    }

    /// Feed one ST_DATA or ST_STATE packet. Zero-payload packets only
    /// perform connection bookkeeping.
    pub fn packet(&mut self, ts: Timestamp, hdr: &UtpHeader, payload: &[u8], dir: Direction) {
        let side = &mut self.sides[dir];
        if !side.connected {
            // Mid-stream cold start: adopt the first sequence number seen.
            debug!(key = %self.key, ?dir, seq = hdr.seq_nr, "uTP stream without SYN");
            side.expected_seq = hdr.seq_nr;
            side.connected = true;
            side.connection_id = hdr.connection_id;
        }

        if payload.is_empty() {
            return;
        }

        if hdr.seq_nr != side.expected_seq {
            if seq_ahead(hdr.seq_nr, side.expected_seq) {
                if side.ooo_bytes + payload.len() > OOO_CAP_BYTES {
                    warn!(key = %self.key, ?dir, seq = hdr.seq_nr,
                        "out-of-order buffer full, dropping packet");
                    return;
                }
                if let Some(old) = side.ooo.insert(hdr.seq_nr, payload.to_vec()) {
                    side.ooo_bytes -= old.len();
                }
                side.ooo_bytes += payload.len();
            }
            // Behind the edge: an already-delivered packet, dropped.
            return;
        }

        side.expected_seq = side.expected_seq.wrapping_add(1);
        self.handler.data(ts, payload, dir);
        while let Some(parked) = side.ooo.remove(&side.expected_seq) {
            side.expected_seq = side.expected_seq.wrapping_add(1);
            side.ooo_bytes -= parked.len();
            self.handler.data(ts, &parked, dir);
        }
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> &H {
        &self.handler
    }

    #[cfg(test)]
    pub(crate) fn expected_seq(&self, dir: Direction) -> u16 {
        self.sides[dir].expected_seq
    }
}
