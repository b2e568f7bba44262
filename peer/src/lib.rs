//! pipe-relay test peer
//!
//! Plays the remote side of a relay session: a named-pipe server (a Unix
//! domain socket outside Windows) or an Assuan-style loopback socket that
//! publishes its port and secret through a handshake file.
//!
//! # Example
//!
//! ```no_run
//! use pipe_relay_peer::{PeerListener, Responder};
//!
//! # fn main() -> anyhow::Result<()> {
//! let listener = PeerListener::bind("/tmp/relay-test.sock")?;
//! let conn = listener.accept()?;
//! Responder::greeting("heck").serve(conn)?;
//! # Ok(())
//! # }
//! ```

/// Assuan handshake publisher
pub mod assuan;

/// Pipe listener and accepted connections
pub mod listener;

/// Scripted behaviours for accepted connections
pub mod responder;

pub use assuan::AssuanPeer;
pub use listener::{PeerListener, PeerStream};
pub use responder::Responder;
