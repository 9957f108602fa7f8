//! btsniff — offline BitTorrent capture analysis.
//!
//! Reconstructs BitTorrent peer-wire streams carried over TCP or uTP from
//! a pcap file and writes one decoded transcript per connection, indexed
//! by torrent info-hash. A second front-end decodes raw uTP packet
//! headers for inspection.
//!
//! ## Pipeline
//!
//! ```text
//! pcap file → capture → demux → reassembly (TCP / uTP) → bittorrent dissector
//! ```
//!
//! - [`capture`]: streams `(timestamp, frame)` records from a pcap file.
//! - [`net`]: Ethernet/IPv4/TCP/UDP/uTP header views.
//! - [`flow`]: flow keys, direction tags, per-direction state containers.
//! - [`demux`]: connection tables and SYN/FIN/RST routing.
//! - [`reassembly`]: per-connection stream ordering and deduplication.
//! - [`bittorrent`]: the peer-wire state machine and transcript files.
//! - [`bencode`]: the extension-handshake dictionary decoder.
//! - [`analyze`]: the per-packet uTP header decoder.

pub mod analyze;
pub mod bencode;
pub mod bittorrent;
pub mod capture;
pub mod demux;
pub mod flow;
pub mod net;
pub mod reassembly;

pub use bencode::{decode, BencodeError, Value};
pub use bittorrent::BitTorrentDissector;
pub use capture::{Frame, PcapReader, Timestamp};
pub use demux::Demux;
pub use flow::{Direction, FlowKey, PerDirection, UtpFlowKey};
pub use reassembly::{SocketEvent, StreamHandler, TcpConnection, UtpConnection};
