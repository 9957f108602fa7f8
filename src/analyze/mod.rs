//! Per-packet uTP header decoding.
//!
//! Drives the `analyze_utp` binary: prints a human-readable decode of
//! every uTP-plausible UDP datagram in a capture, with optional
//! connection-id focus, home-address direction annotation, and a
//! stats-only mode that just counts packets per connection id.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::Ipv4Addr;

use crate::flow::FlowKey;
use crate::net::utp::{ExtensionIter, PacketType, UtpHeader, EXT_SACK, MAX_EXTENSION, UTP_HEADER_LEN};
use crate::net::{self, ETHERTYPE_IPV4, IPPROTO_UDP, UDP_HEADER_LEN};

#[derive(Debug, Default, Clone)]
pub struct AnalyzerOptions {
    /// Only print packets whose connection id is this or one off it.
    pub focus_id: Option<u16>,
    /// Mark traffic from this address as outgoing (`=>`) and traffic to it
    /// as incoming (`<=`, indented).
    pub home_ip: Option<Ipv4Addr>,
    /// Suppress per-packet output; only collect connection-id counters.
    pub stats: bool,
}

/// Streaming decoder over captured frames.
pub struct UtpAnalyzer<W> {
    opts: AnalyzerOptions,
    out: W,
    /// Packets seen per connection id, filled in every mode.
    counts: BTreeMap<u16, u64>,
    /// IP ident of the last first-fragment we printed, so continuation
    /// fragments of filtered packets stay hidden.
    last_printed_fragment: Option<u16>,
}

const IN_INDENT: &str = "          ";

impl<W: Write> UtpAnalyzer<W> {
    pub fn new(opts: AnalyzerOptions, out: W) -> Self {
        Self {
            opts,
            out,
            counts: BTreeMap::new(),
            last_printed_fragment: None,
        }
    }

    pub fn process_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let quiet = self.opts.stats;
        let unfiltered = self.opts.focus_id.is_none();

        let ipv4 = match net::parse_ethernet(frame) {
            Some((ETHERTYPE_IPV4, rest)) => rest,
            _ => {
                if !quiet && unfiltered {
                    writeln!(self.out, "[not ethernet]")?;
                }
                return Ok(());
            }
        };
        let dgram = match net::parse_ipv4(ipv4) {
            Ok(d) => d,
            Err(net::Ipv4Error::BadVersion(v)) => {
                if !quiet {
                    writeln!(self.out, "[not IPv4: {}]", v)?;
                }
                return Ok(());
            }
            Err(net::Ipv4Error::BadHeaderLen(ihl)) => {
                if !quiet {
                    writeln!(self.out, "ignoring IP packet with header length: {}", ihl)?;
                }
                return Ok(());
            }
            Err(net::Ipv4Error::TooShort) => return Ok(()),
        };
        if dgram.protocol != IPPROTO_UDP {
            return Ok(());
        }

        // Direction annotation relative to the home address.
        let (header, indent) = match self.opts.home_ip {
            Some(home) if home == dgram.src => ("=>\n", ""),
            Some(home) if home == dgram.dst => ("<=\n", IN_INDENT),
            _ => ("", ""),
        };

        if dgram.fragment_offset != 0 {
            return self.continuation_fragment(&dgram, indent);
        }

        if dgram.payload.len() < UDP_HEADER_LEN + UTP_HEADER_LEN {
            if !quiet && unfiltered {
                writeln!(
                    self.out,
                    "{}not uTP {} [packet too small]",
                    indent,
                    dgram.payload.len()
                )?;
            }
            return Ok(());
        }
        let Some((udp, rest)) = net::parse_udp(dgram.payload) else {
            return Ok(());
        };
        let Some((utp, rest)) = UtpHeader::parse(rest) else {
            return Ok(());
        };

        // Counters include packets that later fail validation; a capture
        // full of near-misses is worth seeing in the stats.
        *self.counts.entry(utp.connection_id).or_insert(0) += 1;
        if quiet {
            return Ok(());
        }

        if let Some(focus) = self.opts.focus_id {
            let id = utp.connection_id;
            if focus != id && focus != id.wrapping_add(1) && focus != id.wrapping_sub(1) {
                return Ok(());
            }
        }

        self.out.write_all(header.as_bytes())?;

        let key = FlowKey {
            src: dgram.src,
            dst: dgram.dst,
            src_port: udp.src_port,
            dst_port: udp.dst_port,
        };
        if key.src_port == 443 || key.dst_port == 443 {
            writeln!(self.out, "{}  not uTP {} [https port]", indent, key)?;
            return Ok(());
        }

        write!(self.out, "{}uTP {} pkt-size: {}", indent, key, dgram.total_len)?;
        if dgram.fragment_offset != 0 || dgram.dont_fragment || dgram.more_fragments {
            write!(
                self.out,
                " [ fragment-offset: {} fragment-id: {} flags:",
                dgram.fragment_offset * 8,
                dgram.ident
            )?;
            if dgram.dont_fragment {
                write!(self.out, " DF")?;
            }
            if dgram.more_fragments {
                write!(self.out, " MF")?;
            }
            write!(self.out, " ]")?;
            self.last_printed_fragment = Some(dgram.ident);
        } else {
            self.last_printed_fragment = None;
        }
        writeln!(self.out)?;

        if utp.version != 1 {
            writeln!(self.out, "{}  not uTP {} [invalid version]", indent, key)?;
            return Ok(());
        }
        if utp.packet_type().is_none() {
            writeln!(self.out, "{}  not uTP {} [invalid type]", indent, key)?;
            return Ok(());
        }
        if utp.extension >= MAX_EXTENSION {
            writeln!(self.out, "{}  not uTP {} [invalid extension]", indent, key)?;
            return Ok(());
        }

        let mut exts = ExtensionIter::new(utp.extension, rest);
        for ext in exts.by_ref() {
            let Ok(ext) = ext else {
                writeln!(self.out, "{}  invalid uTP header options in {}", indent, key)?;
                return Ok(());
            };
            writeln!(
                self.out,
                "{}  extension_header: {} len: {}",
                indent,
                ext.kind,
                ext.data.len()
            )?;
            if ext.kind == EXT_SACK {
                write!(self.out, "{}    SACK: ", indent)?;
                for byte in ext.data {
                    // Bit 0 first: the mask covers seq_nr + 2 onward.
                    for bit in 0..8 {
                        write!(self.out, "{}", (byte >> bit) & 1)?;
                    }
                }
                writeln!(self.out)?;
            }
        }
        let payload = exts.payload();

        match utp.packet_type() {
            Some(PacketType::Syn) => writeln!(self.out, "{}  uTP SYN", indent)?,
            Some(PacketType::Fin) => writeln!(self.out, "{}  uTP FIN", indent)?,
            Some(PacketType::Reset) => writeln!(self.out, "{}  uTP RESET", indent)?,
            _ => {}
        }

        writeln!(
            self.out,
            "{}  type: {} ver: {} ext: {} id: {} wnd: {} seq: {} ack: {}",
            indent,
            utp.raw_type,
            utp.version,
            utp.extension,
            utp.connection_id,
            utp.wnd_size,
            utp.seq_nr,
            utp.ack_nr
        )?;
        writeln!(self.out, "{}  uTP payload: {}", indent, payload.len())?;
        Ok(())
    }

    /// A later fragment of a datagram whose first fragment we printed.
    fn continuation_fragment(
        &mut self,
        dgram: &net::Ipv4Datagram<'_>,
        indent: &str,
    ) -> io::Result<()> {
        if self.opts.stats {
            return Ok(());
        }
        if self.last_printed_fragment != Some(dgram.ident) {
            return Ok(());
        }
        writeln!(
            self.out,
            "{}[packet fragment] pkt-size: {}",
            indent, dgram.total_len
        )?;
        write!(
            self.out,
            "{}  fragment-offset: {} id: {}",
            indent,
            dgram.fragment_offset * 8,
            dgram.ident
        )?;
        if dgram.dont_fragment {
            write!(self.out, " dont-fragment")?;
        }
        if dgram.more_fragments {
            write!(self.out, " more-fragments")?;
        }
        writeln!(self.out)?;
        writeln!(self.out, "{}  uTP payload: {}", indent, dgram.payload.len())?;
        Ok(())
    }

    /// Finish processing; in stats mode prints the per-connection-id
    /// packet counters in ascending id order.
    pub fn finish(mut self) -> io::Result<()> {
        if self.opts.stats {
            writeln!(self.out, "packet counters by connection ID:")?;
            for (id, n) in &self.counts {
                writeln!(self.out, "{:5}: {}", id, n)?;
            }
        }
        Ok(())
    }
}
