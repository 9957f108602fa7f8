//! PCAP file reading and frame streaming.
//!
//! Reads legacy pcap files using the `pcap-parser` crate and streams raw
//! link-layer frames with their capture timestamps. Frames whose captured
//! length differs from the on-the-wire length are reported and processed
//! with the bytes that are present.
//!
//! Reference: libpcap file format.

use std::fmt;
use std::fs::File;
use std::io::BufReader;

use anyhow::{anyhow, Context, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use tracing::warn;

/// Nanosecond-resolution variant of the legacy pcap magic.
const PCAP_MAGIC_NSEC: u32 = 0xa1b2_3c4d;

/// Capture timestamp, seconds and microseconds since the epoch.
///
/// Renders as `sec.millis`, the format used in transcript lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.sec, self.usec / 1000)
    }
}

/// A captured link-layer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ts: Timestamp,
    /// Raw frame bytes, starting at the Ethernet header.
    pub data: Vec<u8>,
}

/// Streams frames from a pcap file.
pub struct PcapReader {
    path: String,
}

impl PcapReader {
    /// Open a pcap file for reading.
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref().to_string();
        std::fs::metadata(&path).with_context(|| format!("pcap file not found: {}", path))?;
        Ok(Self { path })
    }

    /// Return an iterator over all frames in the file.
    pub fn frames(&self) -> Result<FrameIterator> {
        FrameIterator::new(&self.path)
    }
}

/// Iterator that lazily reads frames from a pcap file.
pub struct FrameIterator {
    reader: LegacyPcapReader<BufReader<File>>,
    /// Divisor turning the sub-second field into microseconds.
    ts_divisor: u32,
    /// Set after a refill that produced no new block; a second miss means
    /// the file ends mid-record.
    starved: bool,
    done: bool,
}

impl FrameIterator {
    fn new(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open pcap: {}", path))?;
        let buf = BufReader::with_capacity(256 * 1024, file);
        let reader = LegacyPcapReader::new(65536, buf)
            .map_err(|e| anyhow!("failed to create pcap reader: {:?}", e))?;
        Ok(Self {
            reader,
            ts_divisor: 1,
            starved: false,
            done: false,
        })
    }
}

impl Iterator for FrameIterator {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    self.starved = false;
                    match block {
                        PcapBlockOwned::LegacyHeader(hdr) => {
                            if hdr.magic_number == PCAP_MAGIC_NSEC {
                                self.ts_divisor = 1000;
                            }
                            self.reader.consume(offset);
                            continue;
                        }
                        PcapBlockOwned::Legacy(pkt) => {
                            if pkt.caplen != pkt.origlen {
                                warn!(
                                    packet = pkt.origlen,
                                    captured = pkt.caplen,
                                    "missing data in capture"
                                );
                            }
                            let frame = Frame {
                                ts: Timestamp {
                                    sec: pkt.ts_sec,
                                    usec: pkt.ts_usec / self.ts_divisor,
                                },
                                data: pkt.data.to_vec(),
                            };
                            self.reader.consume(offset);
                            return Some(Ok(frame));
                        }
                        _ => {
                            self.reader.consume(offset);
                            continue;
                        }
                    }
                }
                Err(PcapError::Eof) => {
                    self.done = true;
                    return None;
                }
                Err(PcapError::Incomplete(_)) => {
                    // Pull more bytes into the parser's window. A refill
                    // that cannot make progress means a truncated file.
                    if self.starved || self.reader.refill().is_err() {
                        self.done = true;
                        return None;
                    }
                    self.starved = true;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow!("pcap read error: {:?}", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_an_error() {
        assert!(PcapReader::new("/nonexistent/file.pcap").is_err());
    }

    #[test]
    fn timestamp_renders_milliseconds() {
        let ts = Timestamp {
            sec: 1590000000,
            usec: 7999,
        };
        assert_eq!(ts.to_string(), "1590000000.007");
        let ts = Timestamp { sec: 3, usec: 0 };
        assert_eq!(ts.to_string(), "3.000");
    }
}
