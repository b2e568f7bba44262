use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::endpoint::EndpointClosed;

#[cfg(windows)]
mod codes {
    use windows::Win32::{
        Foundation::{
            ERROR_BROKEN_PIPE, ERROR_CONNECTION_REFUSED, ERROR_NETWORK_UNREACHABLE,
            ERROR_PIPE_BUSY, ERROR_PIPE_NOT_CONNECTED, ERROR_SEM_TIMEOUT,
        },
        Networking::WinSock,
    };

    pub const BROKEN_PIPE: i32 = ERROR_BROKEN_PIPE.0 as i32;
    pub const PIPE_NOT_CONNECTED: i32 = ERROR_PIPE_NOT_CONNECTED.0 as i32;
    pub const PIPE_BUSY: i32 = ERROR_PIPE_BUSY.0 as i32;
    pub const CONNECTION_REFUSED: i32 = ERROR_CONNECTION_REFUSED.0 as i32;
    pub const NETWORK_UNREACHABLE: i32 = ERROR_NETWORK_UNREACHABLE.0 as i32;
    pub const SEM_TIMEOUT: i32 = ERROR_SEM_TIMEOUT.0 as i32;

    pub const WSAECONNRESET: i32 = WinSock::WSAECONNRESET.0;
    pub const WSAENETUNREACH: i32 = WinSock::WSAENETUNREACH.0;
    pub const WSAETIMEDOUT: i32 = WinSock::WSAETIMEDOUT.0;
    pub const WSAECONNREFUSED: i32 = WinSock::WSAECONNREFUSED.0;
}

/// The two ways a channel can end that count as a normal termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// The remote end closed the channel
    RemoteClosed,
    /// The channel is already disconnected on this side
    NotConnected,
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::RemoteClosed => f.write_str("remote end closed the channel"),
            Disconnect::NotConnected => f.write_str("channel is not connected"),
        }
    }
}

/// Detects the benign disconnect conditions in a transport error.
///
/// Errors produced by a locally closed [`Endpoint`](crate::Endpoint) are never
/// benign, they mean someone on this side tore the handle down.
pub fn classify_disconnect(err: &io::Error) -> Option<Disconnect> {
    if EndpointClosed::is(err) {
        return None;
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        return match code {
            libc::EPIPE | libc::ECONNRESET => Some(Disconnect::RemoteClosed),
            libc::ENOTCONN => Some(Disconnect::NotConnected),
            _ => None,
        };
    }

    #[cfg(windows)]
    if let Some(code) = err.raw_os_error() {
        return match code {
            codes::BROKEN_PIPE | codes::WSAECONNRESET => Some(Disconnect::RemoteClosed),
            codes::PIPE_NOT_CONNECTED => Some(Disconnect::NotConnected),
            _ => None,
        };
    }

    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            Some(Disconnect::RemoteClosed)
        }
        io::ErrorKind::NotConnected => Some(Disconnect::NotConnected),
        _ => None,
    }
}

/// True when a pipe or file target simply does not exist (yet).
pub fn is_not_ready(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }

    #[cfg(unix)]
    {
        // A socket file with nobody listening behind it
        err.raw_os_error() == Some(libc::ECONNREFUSED)
    }

    #[cfg(windows)]
    {
        err.raw_os_error() == Some(codes::PIPE_BUSY)
    }
}

/// True for connect failures that mean "the listener is not up yet".
pub fn is_transient_connect(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::ECONNREFUSED | libc::ETIMEDOUT | libc::ENETUNREACH)
        )
    }

    #[cfg(windows)]
    {
        matches!(
            err.raw_os_error(),
            Some(
                codes::WSAECONNREFUSED
                    | codes::WSAETIMEDOUT
                    | codes::WSAENETUNREACH
                    | codes::CONNECTION_REFUSED
                    | codes::NETWORK_UNREACHABLE
                    | codes::SEM_TIMEOUT
            )
        )
    }
}

/// Reasons a handshake file is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// No newline terminates the port line
    #[error("port line is not terminated by a newline")]
    MissingNewline,

    /// The port line is not a decimal number
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// The port number does not fit in 0..=65535
    #[error("port {0} is out of range")]
    PortOutOfRange(u64),

    /// The secret following the port line has the wrong length
    #[error("expected a 16 byte secret, found {0} bytes")]
    SecretLength(usize),
}

/// Errors raised while establishing a connection
#[derive(Debug, Error)]
pub enum DialError {
    /// The target does not exist or does not listen yet
    #[error("{target} is not available")]
    NotReady {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The handshake file content is invalid
    #[error("malformed handshake file {}", path.display())]
    MalformedHandshake {
        path: PathBuf,
        #[source]
        source: HandshakeError,
    },

    /// Connecting to the advertised port failed for a non-transient reason
    #[error("failed to connect to {addr}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Any other I/O failure while dialing
    #[error("I/O error on {target}")]
    Io {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The retry loop was interrupted by cancellation
    #[error("dialing {target} was cancelled")]
    Cancelled { target: String },
}

impl DialError {
    /// Whether a poll loop may retry after this error
    pub fn is_not_ready(&self) -> bool {
        matches!(self, DialError::NotReady { .. })
    }
}
