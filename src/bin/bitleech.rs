//! CLI entry point: downloads a single-file torrent to a given output path.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bitleech::conf::{generate_peer_id, Conf};
use bitleech::metainfo::Torrent;

/// A leech-only BitTorrent downloader.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the .torrent file to download.
    torrent: PathBuf,

    /// Where to write the reconstructed payload.
    #[arg(short, long)]
    output: PathBuf,

    /// Max number of concurrent peer connections.
    #[arg(long)]
    max_peer_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let torrent = match Torrent::from_file(&args.torrent, &args.output) {
        Ok(torrent) => torrent,
        Err(e) => {
            eprintln!("failed to parse {}: {}", args.torrent.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut conf = Conf::new();
    if let Some(max) = args.max_peer_connections {
        conf.torrent.max_peer_connections = max;
    }

    log::info!(
        "Starting download of {} ({} pieces, {} bytes) to {}",
        args.torrent.display(),
        torrent.piece_count(),
        torrent.total_size,
        args.output.display()
    );

    let peer_id = generate_peer_id();
    if let Err(e) = bitleech::torrent::download(torrent, conf, peer_id).await {
        eprintln!("download failed: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
