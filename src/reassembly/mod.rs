//! Transport stream reassembly.
//!
//! Turns the unordered segment/packet sequence of one connection into two
//! ordered, deduplicated byte streams, one per direction, delivered to a
//! [`StreamHandler`]. The TCP and uTP variants share the same surface;
//! only the sequence-number width (32-bit byte offsets vs 16-bit packet
//! counters) and the resulting comparison rules differ.

use std::fmt;

use crate::capture::Timestamp;
use crate::flow::Direction;

pub mod tcp;
pub mod utp;

pub use tcp::TcpConnection;
pub use utp::UtpConnection;

/// Per-direction out-of-order buffer cap. Segments beyond this are dropped
/// rather than buffered; the stream recovers if the gap fills later.
pub const OOO_CAP_BYTES: usize = 4 * 1024 * 1024;

/// Connection-level events surfaced alongside the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Reset,
    Fin,
    /// A segment arrived behind the in-order edge without being a clean
    /// retransmit. No state changes; the segment is dropped.
    SeqnrMismatch,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEvent::Reset => write!(f, "RESET"),
            SocketEvent::Fin => write!(f, "FIN"),
            SocketEvent::SeqnrMismatch => {
                write!(f, "(transport layer: mismatching sequence numbers)")
            }
        }
    }
}

/// Consumer of a reassembled connection.
///
/// `data` receives in-order payload bytes for one direction; an empty
/// slice marks a pure TCP ACK. `event` carries connection lifecycle
/// events. Implementations: the BitTorrent dissector, and the raw
/// per-direction byte dumper in the `extract` binary.
pub trait StreamHandler {
    fn data(&mut self, ts: Timestamp, buf: &[u8], dir: Direction);
    fn event(&mut self, ts: Timestamp, event: SocketEvent, dir: Direction);
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Records everything it is handed; shared by the reassembler tests.
    #[derive(Default)]
    pub struct Collect {
        pub data: Vec<(Direction, Vec<u8>)>,
        pub events: Vec<(Direction, SocketEvent)>,
    }

    impl Collect {
        /// Concatenated payload bytes seen for one direction.
        pub fn bytes(&self, dir: Direction) -> Vec<u8> {
            self.data
                .iter()
                .filter(|(d, _)| *d == dir)
                .flat_map(|(_, b)| b.iter().copied())
                .collect()
        }
    }

    impl StreamHandler for Collect {
        fn data(&mut self, _ts: Timestamp, buf: &[u8], dir: Direction) {
            self.data.push((dir, buf.to_vec()));
        }

        fn event(&mut self, _ts: Timestamp, event: SocketEvent, dir: Direction) {
            self.events.push((dir, event));
        }
    }

    pub fn ts(sec: u32) -> Timestamp {
        Timestamp { sec, usec: 0 }
    }
}
