//! pipe-relay
//!
//! Bridges this process's standard input and output to a remote endpoint that
//! is only reachable through an inter-process channel: a named pipe, or a
//! loopback socket whose port and secret are published in an Assuan handshake
//! file (the way GnuPG exposes its agent on platforms without Unix sockets).
//!
//! # Example
//!
//! ```no_run
//! use pipe_relay::{Bridge, Dialer, RelayConfig, Target};
//! use pipe_relay_common::CancelToken;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = RelayConfig::new(Target::Assuan("S.gpg-agent".into())).with_poll(true);
//! let cancel = CancelToken::new();
//!
//! let endpoint = Dialer::from_config(&config, cancel.clone()).dial(&config.target)?;
//! let end = Bridge::new(endpoint, config.policy, cancel).run(std::io::empty(), std::io::sink())?;
//! println!("session ended: {end}");
//! # Ok(())
//! # }
//! ```

/// Bidirectional copy orchestration
pub mod bridge;

/// Run configuration
pub mod config;

/// Connection establishment with poll/retry
pub mod dial;

/// Owned handles on the process's standard streams
pub mod stdio;

pub use bridge::{Bridge, BridgeError, SessionEnd, SessionState};
pub use config::{BridgePolicy, RelayConfig, Target};
pub use dial::Dialer;
// Re-export important types from the common crate for convenience
pub use pipe_relay_common::{CancelToken, DialError, Disconnect, Endpoint};
