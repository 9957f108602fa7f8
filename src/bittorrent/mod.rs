//! BitTorrent peer-wire dissection.
//!
//! A byte-streaming state machine over the reassembled stream of one
//! connection: the fixed 68-byte handshake, then length-prefixed messages.
//! Each direction has its own parser state; a field may span any number of
//! reassembler deliveries and a single delivery may complete many fields.
//! Once the info-hash is known a transcript file is opened under
//! `<root>/<info_hash_hex>/` and every decoded event appends one line.
//!
//! Reference: BEP-3 (peer protocol), BEP-6 (fast extension), BEP-10
//! (extension protocol).

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::bencode::{self, Value};
use crate::capture::Timestamp;
use crate::flow::{Direction, FlowKey, PerDirection};
use crate::net::{be16, be32};
use crate::reassembly::{SocketEvent, StreamHandler};

/// `0x13` + "BitTorrent protocol": the first 20 bytes of every peer-wire
/// stream. Anything else disables the connection's dissector.
const HANDSHAKE_PREFIX: [u8; 20] = *b"\x13BitTorrent protocol";

/// Length prefixes above this are reported as suspicious; parsing
/// continues regardless.
const MAX_MESSAGE_LEN: u32 = 0x10_0000;

/// Transcript files get a process-wide monotonic suffix so two streams
/// between the same endpoints never collide.
static STREAM_COUNT: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ParseState {
    #[default]
    Protocol,
    Reserved,
    InfoHash,
    PeerId,
    Length,
    Msg,
    Have,
    DhtPort,
    AllowedFast,
    Request,
    Piece,
    Cancel,
    Suggest,
    Reject,
    Bitfield,
    Extension,
    ExtensionHandshake,
    Skip,
}

fn msg_type_name(msg: u8) -> String {
    const NAMES: [&str; 21] = [
        "choke",
        "unchoke",
        "interested",
        "not_interested",
        "have",
        "bitfield",
        "request",
        "piece",
        "cancel",
        "dht_port",
        "??",
        "??",
        "??",
        "suggest_piece",
        "have_all",
        "have_none",
        "reject_request",
        "allowed_fast",
        "??",
        "??",
        "extension-msg",
    ];
    match NAMES.get(msg as usize) {
        Some(name) => (*name).to_string(),
        None => format!("?? ({})", msg),
    }
}

fn hex(bytes: &[u8]) -> String {
    use fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Printable ASCII passed through, everything else dotted.
fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&c| if (b' '..0x7f).contains(&c) { c as char } else { '.' })
        .collect()
}

#[derive(Default)]
struct SideState {
    state: ParseState,
    /// Payload bytes of the current message still to consume.
    skip: u32,
    /// Cumulative stream offset, diagnostic only.
    offset: u64,
    /// Pending bytes of the field currently being assembled.
    buffer: Vec<u8>,
    /// Handshake reserved bytes, held until the info-hash opens the log.
    reserved: Vec<u8>,
    /// Extension-message names this peer announced, by numeric id. Read by
    /// the *other* direction to label inbound extension messages.
    extensions: HashMap<u8, String>,
}

impl SideState {
    /// Move bytes from `buf` into the pending buffer until it holds `n`
    /// bytes, returning the unconsumed remainder. The caller checks
    /// whether enough arrived.
    fn ensure<'a>(&mut self, buf: &'a [u8], n: usize) -> &'a [u8] {
        if self.buffer.len() >= n {
            return buf;
        }
        let take = buf.len().min(n - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..take]);
        &buf[take..]
    }
}

/// The per-connection transcript file. All writes are no-ops until the
/// info-hash arrives and the file is opened; a failed write closes the
/// transcript but dissection continues.
struct Transcript {
    root: PathBuf,
    key: FlowKey,
    out: Option<LineWriter<File>>,
}

impl Transcript {
    fn new(root: PathBuf, key: FlowKey) -> Self {
        Self {
            root,
            key,
            out: None,
        }
    }

    fn is_open(&self) -> bool {
        self.out.is_some()
    }

    /// Create `<root>/<info_hash>/<src>.<sport>_<dst>.<dport>_<n>` and
    /// retroactively log the handshake fields seen before the hash.
    fn open(&mut self, info_hash: &str, ts: Timestamp, dir: Direction, reserved: &[u8]) {
        let dir_path = self.root.join(info_hash);
        let n = STREAM_COUNT.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}.{}_{}.{}_{}",
            self.key.src, self.key.src_port, self.key.dst, self.key.dst_port, n
        );
        let path = dir_path.join(name);
        match fs::create_dir_all(&dir_path).and_then(|_| File::create(&path)) {
            Ok(file) => {
                self.out = Some(LineWriter::new(file));
                self.line(dir, ts, format_args!("HANDSHAKE"));
                self.line(dir, ts, format_args!("RESERVED {}", hex(reserved)));
            }
            Err(e) => warn!(key = %self.key, path = %path.display(), error = %e,
                "failed to open transcript"),
        }
    }

    fn line(&mut self, dir: Direction, ts: Timestamp, args: fmt::Arguments<'_>) {
        if let Some(out) = self.out.as_mut() {
            if writeln!(out, "{} {} {}", dir, ts, args).is_err() {
                warn!(key = %self.key, "transcript write failed, closing");
                self.out = None;
            }
        }
    }
}

fn check_zero(side: &mut SideState, log: &mut Transcript, ts: Timestamp, dir: Direction) {
    if side.skip == 0 {
        side.state = ParseState::Length;
    } else {
        log.line(
            dir,
            ts,
            format_args!("ERROR: unexpected bytes after message: {}", side.skip),
        );
        side.state = ParseState::Skip;
    }
}

/// Peer-wire dissector for one connection, both directions.
pub struct BitTorrentDissector {
    transcript: Transcript,
    sides: PerDirection<SideState>,
    disabled: bool,
}

impl BitTorrentDissector {
    pub fn new(key: FlowKey, root: impl Into<PathBuf>) -> Self {
        Self {
            transcript: Transcript::new(root.into(), key),
            sides: PerDirection::default(),
            disabled: false,
        }
    }

    /// Cumulative bytes consumed in one direction.
    pub fn offset(&self, dir: Direction) -> u64 {
        self.sides[dir].offset
    }
}

impl StreamHandler for BitTorrentDissector {
    fn data(&mut self, ts: Timestamp, mut buf: &[u8], dir: Direction) {
        // Not a BitTorrent stream: ignore everything that follows.
        if self.disabled {
            return;
        }
        if buf.is_empty() {
            self.transcript.line(dir, ts, format_args!("ACK"));
            return;
        }

        let (side, other) = self.sides.split_mut(dir);
        let log = &mut self.transcript;

        loop {
            match side.state {
                ParseState::Protocol => {
                    buf = side.ensure(buf, 20);
                    if side.buffer.len() < 20 {
                        return;
                    }
                    if side.buffer != HANDSHAKE_PREFIX {
                        self.disabled = true;
                        return;
                    }
                    side.buffer.clear();
                    side.offset += 20;
                    log.line(dir, ts, format_args!("HANDSHAKE"));
                    side.state = ParseState::Reserved;
                }

                ParseState::Reserved => {
                    buf = side.ensure(buf, 8);
                    if side.buffer.len() < 8 {
                        return;
                    }
                    if log.is_open() {
                        log.line(dir, ts, format_args!("RESERVED {}", hex(&side.buffer)));
                        side.buffer.clear();
                    } else {
                        // Held until the info-hash names the transcript.
                        side.reserved = std::mem::take(&mut side.buffer);
                    }
                    side.offset += 8;
                    side.state = ParseState::InfoHash;
                }

                ParseState::InfoHash => {
                    buf = side.ensure(buf, 20);
                    if side.buffer.len() < 20 {
                        return;
                    }
                    let info_hash = hex(&side.buffer);
                    if !log.is_open() {
                        log.open(&info_hash, ts, dir, &side.reserved);
                    }
                    log.line(dir, ts, format_args!("INFO-HASH {}", info_hash));
                    side.buffer.clear();
                    side.offset += 20;
                    side.state = ParseState::PeerId;
                }

                ParseState::PeerId => {
                    buf = side.ensure(buf, 20);
                    if side.buffer.len() < 20 {
                        return;
                    }
                    log.line(
                        dir,
                        ts,
                        format_args!(
                            "PEER-ID {} [{}]",
                            hex(&side.buffer),
                            printable(&side.buffer)
                        ),
                    );
                    side.buffer.clear();
                    side.offset += 20;
                    side.state = ParseState::Length;
                }

                ParseState::Length => {
                    buf = side.ensure(buf, 4);
                    if side.buffer.len() < 4 {
                        return;
                    }
                    let length = be32(&side.buffer);
                    if length > MAX_MESSAGE_LEN {
                        log.line(
                            dir,
                            ts,
                            format_args!("ERROR: message too large! {} ({:x})", length, length),
                        );
                    }
                    side.offset += 4;
                    side.buffer.clear();
                    if length == 0 {
                        log.line(dir, ts, format_args!("KEEP-ALIVE"));
                    } else {
                        side.skip = length;
                        side.state = ParseState::Msg;
                    }
                }

                ParseState::Msg => {
                    buf = side.ensure(buf, 1);
                    if side.buffer.is_empty() {
                        return;
                    }
                    let msg = side.buffer[0];
                    side.offset += 1;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(1);
                    match msg {
                        0 => {
                            log.line(dir, ts, format_args!("CHOKE"));
                            check_zero(side, log, ts, dir);
                        }
                        1 => {
                            log.line(dir, ts, format_args!("UNCHOKE"));
                            check_zero(side, log, ts, dir);
                        }
                        2 => {
                            log.line(dir, ts, format_args!("INTERESTED"));
                            check_zero(side, log, ts, dir);
                        }
                        3 => {
                            log.line(dir, ts, format_args!("NOT-INTERESTED"));
                            check_zero(side, log, ts, dir);
                        }
                        4 => side.state = ParseState::Have,
                        5 => side.state = ParseState::Bitfield,
                        6 => side.state = ParseState::Request,
                        7 => side.state = ParseState::Piece,
                        8 => side.state = ParseState::Cancel,
                        9 => side.state = ParseState::DhtPort,
                        13 => side.state = ParseState::Suggest,
                        14 => {
                            log.line(dir, ts, format_args!("HAVE-ALL"));
                            check_zero(side, log, ts, dir);
                        }
                        15 => {
                            log.line(dir, ts, format_args!("HAVE-NONE"));
                            check_zero(side, log, ts, dir);
                        }
                        16 => side.state = ParseState::Reject,
                        17 => side.state = ParseState::AllowedFast,
                        20 => side.state = ParseState::Extension,
                        _ => {
                            log.line(dir, ts, format_args!("msg: {}", msg_type_name(msg)));
                            side.state = ParseState::Skip;
                        }
                    }
                }

                ParseState::Have | ParseState::Suggest | ParseState::AllowedFast => {
                    buf = side.ensure(buf, 4);
                    if side.buffer.len() < 4 {
                        return;
                    }
                    let piece = be32(&side.buffer);
                    let name = match side.state {
                        ParseState::Have => "HAVE",
                        ParseState::Suggest => "SUGGEST",
                        _ => "ALLOWED-FAST",
                    };
                    log.line(dir, ts, format_args!("{} {}", name, piece));
                    side.offset += 4;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(4);
                    check_zero(side, log, ts, dir);
                }

                ParseState::Request | ParseState::Cancel | ParseState::Reject => {
                    buf = side.ensure(buf, 12);
                    if side.buffer.len() < 12 {
                        return;
                    }
                    let piece = be32(&side.buffer);
                    let start = be32(&side.buffer[4..]);
                    let length = be32(&side.buffer[8..]);
                    let name = match side.state {
                        ParseState::Request => "REQUEST",
                        ParseState::Cancel => "CANCEL",
                        _ => "REJECT",
                    };
                    log.line(
                        dir,
                        ts,
                        format_args!("{} {} {} {}", name, piece, start, length),
                    );
                    side.offset += 12;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(12);
                    check_zero(side, log, ts, dir);
                }

                ParseState::Piece => {
                    buf = side.ensure(buf, 8);
                    if side.buffer.len() < 8 {
                        return;
                    }
                    let piece = be32(&side.buffer);
                    let start = be32(&side.buffer[4..]);
                    log.line(dir, ts, format_args!("PIECE {} {}", piece, start));
                    side.offset += 8;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(8);
                    // The block itself is payload; skip it.
                    side.state = ParseState::Skip;
                }

                ParseState::DhtPort => {
                    buf = side.ensure(buf, 2);
                    if side.buffer.len() < 2 {
                        return;
                    }
                    let port = be16(&side.buffer);
                    log.line(dir, ts, format_args!("DHT-PORT {}", port));
                    side.offset += 2;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(2);
                    check_zero(side, log, ts, dir);
                }

                ParseState::Bitfield => {
                    let want = side.skip as usize;
                    buf = side.ensure(buf, want);
                    if side.buffer.len() < want {
                        return;
                    }
                    let mut bits = String::with_capacity(side.buffer.len() * 8);
                    for b in &side.buffer {
                        use fmt::Write as _;
                        let _ = write!(bits, "{:08b}", b);
                    }
                    log.line(dir, ts, format_args!("BITFIELD {}", bits));
                    side.offset += side.skip as u64;
                    side.buffer.clear();
                    side.skip = 0;
                    side.state = ParseState::Length;
                }

                ParseState::Extension => {
                    buf = side.ensure(buf, 1);
                    if side.buffer.is_empty() {
                        return;
                    }
                    let ext = side.buffer[0];
                    side.offset += 1;
                    side.buffer.clear();
                    side.skip = side.skip.wrapping_sub(1);
                    if ext == 0 {
                        side.state = ParseState::ExtensionHandshake;
                    } else {
                        // The name table lives on the other side: the peer
                        // that *sent* this id picked it from the names our
                        // local peer announced in its extension handshake.
                        match other.extensions.get(&ext) {
                            Some(name) => {
                                log.line(dir, ts, format_args!("EXTENSION-MSG: {}", name))
                            }
                            None => log.line(dir, ts, format_args!("EXTENSION-MSG: ?? ({})", ext)),
                        }
                        side.state = ParseState::Skip;
                    }
                }

                ParseState::ExtensionHandshake => {
                    let want = side.skip as usize;
                    buf = side.ensure(buf, want);
                    if side.buffer.len() < want {
                        return;
                    }
                    match bencode::decode(&side.buffer) {
                        Ok(value) => {
                            log.line(dir, ts, format_args!("EXTENSION-HANDSHAKE {}", value));
                            if let Some(Value::Dict(m)) = value.get(b"m") {
                                for (name, val) in m {
                                    if let Value::Integer(id) = val {
                                        if (0..=255).contains(id) {
                                            side.extensions.insert(
                                                *id as u8,
                                                String::from_utf8_lossy(name).into_owned(),
                                            );
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => log.line(dir, ts, format_args!("EXTENSION-HANDSHAKE {}", e)),
                    }
                    side.offset += side.skip as u64;
                    side.buffer.clear();
                    side.skip = 0;
                    side.state = ParseState::Length;
                }

                ParseState::Skip => {
                    if buf.is_empty() {
                        return;
                    }
                    let overlap = buf.len().min(side.skip as usize);
                    side.skip -= overlap as u32;
                    side.offset += overlap as u64;
                    buf = &buf[overlap..];
                    log.line(
                        dir,
                        ts,
                        format_args!("  - payload: {} (left: {})", overlap, side.skip),
                    );
                    if side.skip == 0 {
                        side.state = ParseState::Length;
                    }
                }
            }
        }
    }

    fn event(&mut self, ts: Timestamp, event: SocketEvent, dir: Direction) {
        self.transcript.line(dir, ts, format_args!("{}", event));
    }
}
