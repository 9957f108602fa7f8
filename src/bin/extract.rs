use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{info, warn};

use btsniff::bittorrent::BitTorrentDissector;
use btsniff::capture::{PcapReader, Timestamp};
use btsniff::demux::Demux;
use btsniff::flow::{Direction, FlowKey, PerDirection};
use btsniff::reassembly::{SocketEvent, StreamHandler};

#[derive(Parser, Debug)]
#[command(
    name = "extract",
    about = "Extract BitTorrent peer-wire transcripts from a pcap capture"
)]
struct Cli {
    /// Dump raw reassembled byte streams under ./tcp/ instead of decoding
    /// peer-wire transcripts under ./bt/
    #[arg(long, default_value_t = false)]
    raw: bool,

    /// Path to the pcap file
    pcap_file: PathBuf,
}

static DUMP_COUNT: AtomicUsize = AtomicUsize::new(0);

/// The other stream handler: writes each direction's reassembled bytes
/// verbatim to its own file, no dissection.
struct ByteDumper {
    files: PerDirection<Option<BufWriter<File>>>,
}

impl ByteDumper {
    fn new(key: FlowKey, root: &Path) -> Self {
        let n = DUMP_COUNT.fetch_add(1, Ordering::Relaxed);
        let mut open = |suffix: &str| {
            let name = format!(
                "{}.{}_{}.{}_{}-{}",
                key.src, key.src_port, key.dst, key.dst_port, n, suffix
            );
            let path = root.join(name);
            match fs::create_dir_all(root).and_then(|_| File::create(&path)) {
                Ok(f) => Some(BufWriter::new(f)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to open dump file");
                    None
                }
            }
        };
        Self {
            files: PerDirection::new(open("out"), open("in")),
        }
    }
}

impl StreamHandler for ByteDumper {
    fn data(&mut self, _ts: Timestamp, buf: &[u8], dir: Direction) {
        if let Some(f) = self.files[dir].as_mut() {
            if f.write_all(buf).is_err() {
                self.files[dir] = None;
            }
        }
    }

    fn event(&mut self, _ts: Timestamp, _event: SocketEvent, _dir: Direction) {}
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", e);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing();

    if let Err(err) = run(cli) {
        eprintln!("failed: {:#}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(cli: Cli) -> Result<()> {
    let reader = PcapReader::new(cli.pcap_file.to_string_lossy())?;
    if cli.raw {
        let root = PathBuf::from("tcp");
        process(&reader, Demux::new(move |key| ByteDumper::new(key, &root)))
    } else {
        process(
            &reader,
            Demux::new(|key| BitTorrentDissector::new(key, "bt")),
        )
    }
}

fn process<H, F>(reader: &PcapReader, mut demux: Demux<H, F>) -> Result<()>
where
    H: StreamHandler,
    F: FnMut(FlowKey) -> H,
{
    let mut frames = 0u64;
    for frame in reader.frames()? {
        let frame = frame.context("reading capture")?;
        demux.process_frame(frame.ts, &frame.data);
        frames += 1;
    }
    info!(
        frames,
        tcp_open = demux.tcp_connections(),
        utp_open = demux.utp_connections(),
        "capture processed"
    );
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
