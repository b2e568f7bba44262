//! pipe-relay common library
//!
//! This crate provides the pieces shared by the relay binary and its test
//! peer. It includes:
//!
//! - Endpoint handles giving pipes and sockets blocking-style read/write over a
//!   non-blocking (Unix) or overlapped (Windows) transport
//! - The Assuan handshake record used by GnuPG to publish a loopback port and
//!   secret through a small file
//! - A cancellation token shared by retry loops and bridge flows
//! - Error taxonomy and disconnect classification
//!
//! # Features
//!
//! - **Cross-platform IPC**: Unix domain sockets and TCP on Unix, named pipes
//!   and sockets on Windows, behind one [`Endpoint`] trait
//! - **Optional half-close**: exposed as a capability query rather than a type
//! - **Cooperative shutdown**: closing an endpoint wakes every blocked call

/// Assuan handshake file parsing
pub mod assuan;

/// Cancellation token shared by dial loops and bridge flows
pub mod cancel;

/// Constants and default path resolution
pub mod config;

/// Endpoint handles over platform transports
pub mod endpoint;

/// Error taxonomy and disconnect classification
pub mod error;

// Re-export commonly used types for convenience
pub use assuan::{HandshakeRecord, SECRET_LEN};
pub use cancel::CancelToken;
pub use config::{resolve_handshake_path, DEFAULT_SOCKET_NAME, POLL_INTERVAL};
pub use endpoint::{Endpoint, EndpointClosed, EndpointIo, HalfClose};
pub use error::{classify_disconnect, DialError, Disconnect, HandshakeError};
