use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use btsniff::analyze::{AnalyzerOptions, UtpAnalyzer};
use btsniff::capture::PcapReader;

#[derive(Parser, Debug)]
#[command(
    name = "analyze_utp",
    about = "Decode uTP packet headers from a pcap capture"
)]
struct Cli {
    /// Only print uTP messages with this connection ID, or a connection ID
    /// one off this ID (to include both directions)
    #[arg(long)]
    focus_id: Option<u16>,

    /// Consider the specified IP as local, and mark messages sent from it
    /// as outgoing and messages sent to it as incoming
    #[arg(long)]
    home_ip: Option<Ipv4Addr>,

    /// Don't print any packets, just collect and print counters for
    /// connection IDs
    #[arg(long, default_value_t = false)]
    stats: bool,

    /// Path to the pcap file
    pcap_file: PathBuf,
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
    let options = AnalyzerOptions {
        focus_id: cli.focus_id,
        home_ip: cli.home_ip,
        stats: cli.stats,
    };
    let stdout = std::io::stdout();
    let mut analyzer = UtpAnalyzer::new(options, stdout.lock());
    for frame in reader.frames()? {
        let frame = frame.context("reading capture")?;
        analyzer.process_frame(&frame.data)?;
    }
    analyzer.finish()?;
    Ok(())
}

fn init_tracing() {
    // Decoded packets go to stdout; diagnostics stay on stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
