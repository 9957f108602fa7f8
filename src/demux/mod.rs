//! Connection demultiplexing.
//!
//! Owns the population of live TCP and uTP connections and routes every
//! captured frame to the right reassembler with the right direction tag.
//! Connections are installed on SYN and torn down on RST, or on FIN once
//! both directions have closed.
//!
//! uTP lookups probe both connection-id parities: the SYN announces id
//! `C`, the initiator then stamps its packets with `C+1` while the
//! responder keeps using `C`, so the table is keyed under `C+1` and
//! probed at `C`, `C+1` and `C-1` on the reversed four-tuple.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::capture::Timestamp;
use crate::flow::{Direction, FlowKey, UtpFlowKey};
use crate::net::utp::{self, PacketType, UtpHeader, UTP_HEADER_LEN};
use crate::net::{self, Ipv4Datagram, ETHERTYPE_IPV4, IPPROTO_TCP, IPPROTO_UDP, UDP_HEADER_LEN};
use crate::reassembly::{StreamHandler, TcpConnection, UtpConnection};

/// Demultiplexer over both transports. `make` constructs the stream
/// handler for each new connection from its forward flow key.
pub struct Demux<H, F> {
    tcp: HashMap<FlowKey, TcpConnection<H>>,
    utp: HashMap<UtpFlowKey, UtpConnection<H>>,
    make: F,
}

impl<H, F> Demux<H, F>
where
    H: StreamHandler,
    F: FnMut(FlowKey) -> H,
{
    pub fn new(make: F) -> Self {
        Self {
            tcp: HashMap::new(),
            utp: HashMap::new(),
            make,
        }
    }

    /// Number of live TCP connections.
    pub fn tcp_connections(&self) -> usize {
        self.tcp.len()
    }

    /// Number of live uTP connections.
    pub fn utp_connections(&self) -> usize {
        self.utp.len()
    }

    /// Feed one captured Ethernet frame.
    pub fn process_frame(&mut self, ts: Timestamp, frame: &[u8]) {
        let Some((ethertype, ip)) = net::parse_ethernet(frame) else {
            return;
        };
        if ethertype != ETHERTYPE_IPV4 {
            return;
        }
        let dgram = match net::parse_ipv4(ip) {
            Ok(d) => d,
            Err(e) => {
                debug!(error = %e, "ignoring IP packet");
                return;
            }
        };
        if dgram.is_fragment() {
            debug!(src = %dgram.src, dst = %dgram.dst, "ignoring fragmented IP packet");
            return;
        }
        match dgram.protocol {
            IPPROTO_TCP => self.process_tcp(ts, &dgram),
            IPPROTO_UDP => self.process_utp(ts, &dgram),
            _ => {}
        }
    }

    fn process_tcp(&mut self, ts: Timestamp, dgram: &Ipv4Datagram<'_>) {
        let (hdr, payload) = match net::parse_tcp(dgram.payload) {
            Ok(seg) => seg,
            Err(e) => {
                debug!(error = %e, "ignoring TCP segment");
                return;
            }
        };
        let key = FlowKey {
            src: dgram.src,
            dst: dgram.dst,
            src_port: hdr.src_port,
            dst_port: hdr.dst_port,
        };

        if hdr.is_syn() && hdr.is_ack() {
            // The response half of the opening handshake: the connection
            // lives in the table under the other direction's key.
            if let Some(conn) = self.tcp.get_mut(&key.reverse()) {
                conn.syn(&hdr, Direction::In);
                if !payload.is_empty() {
                    debug!(%key, "SYN+ACK with payload");
                }
            }
            return;
        }

        if hdr.is_syn() {
            if self.tcp.contains_key(&key) {
                trace!(%key, "duplicate SYN");
                return;
            }
            let handler = (self.make)(key);
            let conn = self
                .tcp
                .entry(key)
                .or_insert_with(|| TcpConnection::new(key, handler));
            conn.syn(&hdr, Direction::Out);
            if !payload.is_empty() {
                debug!(%key, "SYN with payload");
            }
            return;
        }

        for (table_key, dir) in [(key, Direction::Out), (key.reverse(), Direction::In)] {
            if let Some(conn) = self.tcp.get_mut(&table_key) {
                if hdr.is_fin() {
                    if conn.fin(ts, dir) {
                        self.tcp.remove(&table_key);
                    }
                } else if hdr.is_rst() {
                    conn.rst(ts, dir);
                    self.tcp.remove(&table_key);
                } else {
                    conn.packet(ts, &hdr, payload, dir);
                }
                return;
            }
        }
        trace!(%key, "ignoring TCP segment for unknown stream");
    }

    fn process_utp(&mut self, ts: Timestamp, dgram: &Ipv4Datagram<'_>) {
        if dgram.payload.len() < UDP_HEADER_LEN + UTP_HEADER_LEN {
            return;
        }
        let Some((udp, rest)) = net::parse_udp(dgram.payload) else {
            return;
        };
        let Some((hdr, rest)) = UtpHeader::parse(rest) else {
            return;
        };
        let ptype = match hdr.check() {
            Ok(t) => t,
            Err(_) => return,
        };
        if udp.src_port == 443 || udp.dst_port == 443 {
            return;
        }
        let payload = match utp::skip_extensions(hdr.extension, rest) {
            Ok(p) => p,
            Err(_) => {
                // Most likely not a uTP packet after all.
                trace!(src = %dgram.src, "invalid uTP header options");
                return;
            }
        };

        let key = UtpFlowKey {
            flow: FlowKey {
                src: dgram.src,
                dst: dgram.dst,
                src_port: udp.src_port,
                dst_port: udp.dst_port,
            },
            connection_id: hdr.connection_id,
        };
        let found = self.find_utp(&key);

        if ptype == PacketType::Syn {
            if let Some((table_key, dir)) = found {
                if let Some(conn) = self.utp.get_mut(&table_key) {
                    conn.syn(&hdr, dir);
                }
                return;
            }
            // Peers answer with id C+1, so that's the key we file under.
            let handler = (self.make)(key.flow);
            let conn = self
                .utp
                .entry(key.with_id_offset(1))
                .or_insert_with(|| UtpConnection::new(key, handler));
            conn.syn(&hdr, Direction::Out);
            return;
        }

        let Some((table_key, dir)) = found else {
            trace!(%key, "ignoring uTP packet for unknown stream");
            return;
        };
        let Some(conn) = self.utp.get_mut(&table_key) else {
            return;
        };
        match ptype {
            PacketType::Fin => {
                if conn.fin(ts, dir) {
                    self.utp.remove(&table_key);
                }
            }
            PacketType::Reset => {
                conn.rst(ts, dir);
                self.utp.remove(&table_key);
            }
            PacketType::Data | PacketType::State => conn.packet(ts, &hdr, payload, dir),
            PacketType::Syn => unreachable!("handled above"),
        }
    }

    /// The four-probe connection-id parity lookup.
    fn find_utp(&self, key: &UtpFlowKey) -> Option<(UtpFlowKey, Direction)> {
        [
            (*key, Direction::Out),
            (key.reverse_with_offset(0), Direction::In),
            (key.reverse_with_offset(1), Direction::In),
            (key.reverse_with_offset(-1), Direction::In),
        ]
        .into_iter()
        .find(|(k, _)| self.utp.contains_key(k))
    }

    #[cfg(test)]
    pub(crate) fn tcp_conn(&self, key: &FlowKey) -> Option<&TcpConnection<H>> {
        self.tcp.get(key)
    }

    #[cfg(test)]
    pub(crate) fn utp_conn(&self, key: &UtpFlowKey) -> Option<&UtpConnection<H>> {
        self.utp.get(key)
    }
}
