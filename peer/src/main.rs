use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use pipe_relay_peer::{AssuanPeer, PeerListener, PeerStream, Responder};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe-relay-peer")]
#[command(about = "Test peer for pipe-relay: serves a pipe or an Assuan socket")]
struct Args {
    /// Pipe path, or handshake file path with --assuan
    path: PathBuf,

    /// Publish a loopback port and secret through a handshake file
    #[arg(short, long)]
    assuan: bool,

    /// Reply with this prefix plus one chunk of input instead of echoing
    #[arg(long)]
    prefix: Option<String>,

    /// Exit after the first connection
    #[arg(long)]
    once: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

enum Source {
    Pipe(PeerListener),
    Assuan(AssuanPeer),
}

impl Source {
    fn accept(&self) -> Result<PeerStream> {
        match self {
            Source::Pipe(listener) => listener.accept(),
            Source::Assuan(peer) => peer.accept(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let responder = match args.prefix {
        Some(prefix) => Responder::greeting(prefix),
        None => Responder::Echo,
    };
    let source = if args.assuan {
        Source::Assuan(AssuanPeer::publish(&args.path)?)
    } else {
        Source::Pipe(PeerListener::bind(&args.path)?)
    };

    loop {
        match source.accept() {
            Ok(conn) => {
                tracing::info!("Client connected");
                match responder.serve(conn) {
                    Ok(sent) => tracing::info!("Connection done, sent {} bytes", sent),
                    Err(e) => tracing::warn!("Connection failed: {}", e),
                }
            }
            Err(e) => tracing::warn!("{:#}", e),
        }
        if args.once {
            return Ok(());
        }
    }
}
