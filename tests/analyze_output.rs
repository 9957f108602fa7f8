//! uTP analyzer integration tests: pcap file → capture → per-packet
//! header decode.


use std::net::Ipv4Addr;

use tempfile::TempDir;

use btsniff::analyze::{AnalyzerOptions, UtpAnalyzer};
use btsniff::capture::PcapReader;
use pcap_helpers::*;

const A: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const B: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

fn analyze(frames: &[TimedFrame], opts: AnalyzerOptions) -> String {
    let dir = TempDir::new().unwrap();
    let pcap = write_pcap(dir.path(), "capture.pcap", frames);
    let reader = PcapReader::new(pcap.to_string_lossy()).unwrap();
    let mut out = Vec::new();
    let mut analyzer = UtpAnalyzer::new(opts, &mut out);
    for f in reader.frames().unwrap() {
        analyzer.process_frame(&f.unwrap().data).unwrap();
    }
    analyzer.finish().unwrap();
    String::from_utf8(out).unwrap()
}

fn id_frames() -> Vec<TimedFrame> {
    vec![
        frame(1, utp_frame(A, B, 50000, 6881, ST_DATA, 100, 1, b"x")),
        frame(2, utp_frame(B, A, 6881, 50000, ST_STATE, 101, 2, b"")),
        frame(3, utp_frame(A, B, 50000, 6881, ST_DATA, 102, 3, b"x")),
        frame(4, utp_frame(A, B, 50001, 6881, ST_DATA, 200, 4, b"x")),
    ]
}

#[test]
fn focus_id_matches_the_id_and_its_neighbours() {
    let output = analyze(
        &id_frames(),
        AnalyzerOptions {
            focus_id: Some(101),
            ..Default::default()
        },
    );
    assert!(output.contains("id: 100 "));
    assert!(output.contains("id: 101 "));
    assert!(output.contains("id: 102 "));
    assert!(!output.contains("id: 200 "));
}

#[test]
fn stats_suppresses_packets_and_prints_counters() {
    let output = analyze(
        &id_frames(),
        AnalyzerOptions {
            stats: true,
            ..Default::default()
        },
    );
    assert!(!output.contains("uTP 192.168.1.10"));
    assert!(output.contains("packet counters by connection ID:"));
    assert!(output.contains("  100: 1"));
    assert!(output.contains("  200: 1"));
    // Ascending connection-id order.
    let pos_100 = output.find("  100: ").unwrap();
    let pos_200 = output.find("  200: ").unwrap();
    assert!(pos_100 < pos_200);
}

#[test]
fn home_ip_marks_outgoing_and_incoming() {
    let output = analyze(
        &id_frames(),
        AnalyzerOptions {
            home_ip: Some(A),
            ..Default::default()
        },
    );
    assert!(output.contains("=>\nuTP 192.168.1.10:50000"));
    assert!(output.contains("<=\n          uTP 192.168.1.20:6881"));
}

#[test]
fn per_packet_decode_shows_header_fields() {
    let frames = vec![frame(1, utp_frame(A, B, 50000, 6881, ST_SYN, 7777, 1, b""))];
    let output = analyze(&frames, AnalyzerOptions::default());
    assert!(output.contains("uTP 192.168.1.10:50000 -> 192.168.1.20:6881 pkt-size: 48"));
    assert!(output.contains("  uTP SYN"));
    assert!(output.contains("  type: 4 ver: 1 ext: 0 id: 7777 wnd: 1048576 seq: 1 ack: 0"));
    assert!(output.contains("  uTP payload: 0"));
}
