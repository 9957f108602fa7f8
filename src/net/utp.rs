//! uTP packet header and extension-header chain parsing.
//!
//! The 20-byte header packs a type/version nibble pair, a first-extension
//! byte, the connection id, three timing/window words and the seq/ack
//! numbers, all big-endian. An extension chain of `{next, len, data}`
//! entries follows, terminated by `next == 0`.
//!
//! Reference: BEP-29 (uTorrent transport protocol).

use thiserror::Error;

use super::{be16, be32};

pub const UTP_HEADER_LEN: usize = 20;

/// Highest extension id that plausibly appears on the wire; anything above
/// marks the datagram as not uTP.
pub const MAX_EXTENSION: u8 = 3;

/// Selective-ack extension id.
pub const EXT_SACK: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UtpError {
    #[error("packet too small")]
    TooShort,
    #[error("invalid version")]
    BadVersion(u8),
    #[error("invalid type")]
    BadType(u8),
    #[error("invalid extension")]
    BadExtension(u8),
    #[error("invalid uTP header options")]
    BadOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_raw(raw: u8) -> Option<PacketType> {
        match raw {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UtpHeader {
    pub raw_type: u8,
    pub version: u8,
    /// First extension id of the chain; 0 when there are no extensions.
    pub extension: u8,
    pub connection_id: u16,
    pub timestamp_us: u32,
    pub timestamp_diff_us: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
}

impl UtpHeader {
    /// Extract header fields without judging whether this is really uTP.
    /// Returns the bytes following the fixed header.
    pub fn parse(data: &[u8]) -> Option<(UtpHeader, &[u8])> {
        if data.len() < UTP_HEADER_LEN {
            return None;
        }
        let hdr = UtpHeader {
            raw_type: data[0] >> 4,
            version: data[0] & 0x0f,
            extension: data[1],
            connection_id: be16(&data[2..]),
            timestamp_us: be32(&data[4..]),
            timestamp_diff_us: be32(&data[8..]),
            wnd_size: be32(&data[12..]),
            seq_nr: be16(&data[16..]),
            ack_nr: be16(&data[18..]),
        };
        Some((hdr, &data[UTP_HEADER_LEN..]))
    }

    /// uTP plausibility checks: version 1, a known type, extension < 3.
    /// Anything else is taken to be an unrelated UDP payload.
    pub fn check(&self) -> Result<PacketType, UtpError> {
        if self.version != 1 {
            return Err(UtpError::BadVersion(self.version));
        }
        let Some(ptype) = PacketType::from_raw(self.raw_type) else {
            return Err(UtpError::BadType(self.raw_type));
        };
        if self.extension >= MAX_EXTENSION {
            return Err(UtpError::BadExtension(self.extension));
        }
        Ok(ptype)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_raw(self.raw_type)
    }
}

/// One entry of the extension-header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtpExtension<'a> {
    pub kind: u8,
    pub data: &'a [u8],
}

/// Walks the extension chain following a uTP header.
///
/// Yields entries until the chain terminates; a malformed chain yields one
/// `Err` and stops. [`ExtensionIter::payload`] returns the stream payload
/// after the chain (only meaningful once iteration finished cleanly).
pub struct ExtensionIter<'a> {
    data: &'a [u8],
    pos: usize,
    next_kind: u8,
    failed: bool,
}

impl<'a> ExtensionIter<'a> {
    pub fn new(first_kind: u8, data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            next_kind: first_kind,
            failed: false,
        }
    }

    /// Bytes after the extension chain.
    pub fn payload(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.pos..]
    }
}

impl<'a> Iterator for ExtensionIter<'a> {
    type Item = Result<UtpExtension<'a>, UtpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_kind == 0 {
            return None;
        }
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        if rest.len() < 2 {
            self.failed = true;
            return Some(Err(UtpError::BadOptions));
        }
        let kind = self.next_kind;
        let len = rest[1] as usize;
        if rest.len() < 2 + len {
            self.failed = true;
            return Some(Err(UtpError::BadOptions));
        }
        self.next_kind = rest[0];
        self.pos += 2 + len;
        Some(Ok(UtpExtension {
            kind,
            data: &rest[2..2 + len],
        }))
    }
}

/// Skip the extension chain, returning the stream payload that follows.
pub fn skip_extensions(first_kind: u8, data: &[u8]) -> Result<&[u8], UtpError> {
    let mut iter = ExtensionIter::new(first_kind, data);
    for ext in iter.by_ref() {
        ext?;
    }
    Ok(iter.payload())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(type_ver: u8, extension: u8, conn_id: u16, seq: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.push(type_ver);
        h.push(extension);
        h.extend_from_slice(&conn_id.to_be_bytes());
        h.extend_from_slice(&100u32.to_be_bytes()); // timestamp
        h.extend_from_slice(&50u32.to_be_bytes()); // timestamp diff
        h.extend_from_slice(&0x0010_0000u32.to_be_bytes()); // window
        h.extend_from_slice(&seq.to_be_bytes());
        h.extend_from_slice(&7u16.to_be_bytes()); // ack
        h
    }

    #[test]
    fn parses_header_fields() {
        let bytes = header_bytes(0x41, 0, 12345, 99);
        let (hdr, rest) = UtpHeader::parse(&bytes).unwrap();
        assert_eq!(hdr.raw_type, 4);
        assert_eq!(hdr.version, 1);
        assert_eq!(hdr.connection_id, 12345);
        assert_eq!(hdr.wnd_size, 0x0010_0000);
        assert_eq!(hdr.seq_nr, 99);
        assert_eq!(hdr.ack_nr, 7);
        assert!(rest.is_empty());
        assert_eq!(hdr.check(), Ok(PacketType::Syn));
    }

    #[test]
    fn rejects_implausible_headers() {
        let (h, _) = UtpHeader::parse(&header_bytes(0x42, 0, 1, 1)).unwrap();
        assert_eq!(h.check(), Err(UtpError::BadVersion(2)));
        let (h, _) = UtpHeader::parse(&header_bytes(0x51, 0, 1, 1)).unwrap();
        assert_eq!(h.check(), Err(UtpError::BadType(5)));
        let (h, _) = UtpHeader::parse(&header_bytes(0x01, 3, 1, 1)).unwrap();
        assert_eq!(h.check(), Err(UtpError::BadExtension(3)));
        assert!(UtpHeader::parse(&[0u8; 19]).is_none());
    }

    #[test]
    fn walks_extension_chain() {
        // SACK extension (4 bytes) followed by a second, unknown extension.
        let mut data = vec![2, 4, 0b0000_0011, 0, 0, 0]; // next=2, len=4
        data.extend_from_slice(&[0, 2, 0xaa, 0xbb]); // next=0, len=2
        data.extend_from_slice(b"payload");
        let mut iter = ExtensionIter::new(EXT_SACK, &data);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.kind, EXT_SACK);
        assert_eq!(first.data, &[0b0000_0011, 0, 0, 0]);
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.kind, 2);
        assert_eq!(second.data, &[0xaa, 0xbb]);
        assert!(iter.next().is_none());
        assert_eq!(iter.payload(), b"payload");

        assert_eq!(skip_extensions(EXT_SACK, &data).unwrap(), b"payload");
    }

    #[test]
    fn truncated_chain_is_an_error() {
        let data = vec![0, 8, 1]; // claims 8 bytes, has 1
        assert_eq!(skip_extensions(EXT_SACK, &data), Err(UtpError::BadOptions));
        let mut iter = ExtensionIter::new(EXT_SACK, &[0u8; 1]);
        assert_eq!(iter.next(), Some(Err(UtpError::BadOptions)));
        assert!(iter.next().is_none());
    }

    #[test]
    fn no_extensions_is_empty_chain() {
        let data = b"payload";
        let mut iter = ExtensionIter::new(0, data);
        assert!(iter.next().is_none());
        assert_eq!(iter.payload(), b"payload");
    }
}
