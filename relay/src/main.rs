use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{error::ErrorKind, CommandFactory, Parser};
use pipe_relay::{
    stdio, Bridge, BridgePolicy, CancelToken, DialError, Dialer, RelayConfig, SessionEnd, Target,
};
use pipe_relay_common::resolve_handshake_path;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipe-relay")]
#[command(about = "Relay stdin/stdout to a named pipe or a GnuPG Assuan socket")]
#[command(version)]
struct Args {
    /// Pipe path, handshake file (with --assuan) or port (with --tcp)
    #[arg(required_unless_present = "assuan")]
    target: Option<String>,

    /// Keep retrying until the target exists and accepts connections
    #[arg(short, long)]
    poll: bool,

    /// Half-close the connection once stdin reaches end-of-file
    #[arg(short = 's', long)]
    close_write: bool,

    /// Exit as soon as the remote stops sending
    #[arg(long, visible_alias = "ep")]
    exit_on_remote_eof: bool,

    /// Exit as soon as stdin reaches end-of-file
    #[arg(long, visible_alias = "ei")]
    exit_on_local_eof: bool,

    /// Do not watch for the remote disconnect after it stops sending
    #[arg(long)]
    no_watch: bool,

    /// Treat the target as an Assuan handshake file (default: the agent socket)
    #[arg(short, long, conflicts_with = "tcp")]
    assuan: bool,

    /// Treat the target as a loopback TCP port
    #[arg(long)]
    tcp: bool,

    /// Verbose diagnostics on stderr
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let target = if self.assuan {
            Target::Assuan(resolve_handshake_path(self.target.as_deref()))
        } else if self.tcp {
            let raw = self.target.as_deref().unwrap_or_default();
            match raw.parse::<u16>() {
                Ok(port) => Target::Port(port),
                Err(e) => Args::command()
                    .error(ErrorKind::InvalidValue, format!("invalid port {raw:?}: {e}"))
                    .exit(),
            }
        } else {
            Target::Pipe(PathBuf::from(self.target.unwrap_or_default()))
        };

        let policy = BridgePolicy {
            close_write_on_local_eof: self.close_write,
            terminate_on_remote_eof: self.exit_on_remote_eof,
            terminate_on_local_eof: self.exit_on_local_eof,
            watch_disconnect: !self.no_watch,
        };

        RelayConfig::new(target)
            .with_poll(self.poll)
            .with_policy(policy)
            .with_verbose(self.verbose)
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(config: RelayConfig, cancel: CancelToken) -> Result<SessionEnd> {
    info!("Connecting to {}", config.target);
    let endpoint = match Dialer::from_config(&config, cancel.clone()).dial(&config.target) {
        Ok(endpoint) => endpoint,
        Err(DialError::Cancelled { .. }) => return Ok(SessionEnd::Cancelled),
        Err(e) => return Err(e).with_context(|| format!("failed to connect to {}", config.target)),
    };
    debug!("Connected to {}", endpoint.label());

    let (input, output) = stdio::local_streams();
    let end = Bridge::new(endpoint, config.policy, cancel)
        .run(input, output)
        .context("relay failed")?;
    Ok(end)
}

fn main() -> ExitCode {
    let config = Args::parse().into_config();
    init_tracing(config.verbose);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            debug!("Failed to install Ctrl+C handler: {}", e);
        }
    }

    match run(config, cancel) {
        Ok(end) => {
            debug!("Session ended: {}", end);
            ExitCode::from(end.exit_code())
        }
        Err(err) => {
            eprintln!("pipe-relay: {err:#}");
            ExitCode::FAILURE
        }
    }
}
