//! Endpoint handles
//!
//! An [`Endpoint`] gives a native communication handle (pipe or socket) a
//! uniform byte-stream contract. Calls look blocking to the caller while the
//! transport underneath runs non-blocking (Unix) or overlapped (Windows).
//!
//! Every method takes `&self` so the two directions of a bridge can share one
//! handle. At most one read-side operation (`read` or `wait_disconnect`) and
//! one `write` may be outstanding at a time; a second caller in the same
//! direction is refused rather than queued.

use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;

#[cfg(unix)]
mod polled;
#[cfg(unix)]
pub use polled::{
    connect_tcp, open_pipe, PipeEndpoint, PolledEndpoint, SocketEndpoint, StreamSocket,
};

#[cfg(windows)]
mod overlapped;
#[cfg(windows)]
pub use overlapped::{connect_tcp, open_pipe, OverlappedEndpoint};

/// Byte-stream contract shared by every transport
pub trait Endpoint: Send + Sync {
    /// Human readable name of the remote, used in diagnostics
    fn label(&self) -> &str;

    /// Reads into `buf`, blocking until data, end-of-stream or an error
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, blocking until at least one byte is accepted
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Half-close capability, absent for transports that cannot shut down
    /// only their outbound direction
    fn half_close(&self) -> Option<&dyn HalfClose> {
        None
    }

    /// Blocks until the remote disconnects, without consuming payload bytes
    fn wait_disconnect(&self) -> io::Result<()>;

    /// Closes the handle; blocked calls wake up with [`EndpointClosed`]
    fn close(&self) -> io::Result<()>;

    /// Whether [`Endpoint::close`] has been called
    fn is_closed(&self) -> bool;
}

/// Shutting down the outbound direction while reads keep flowing
pub trait HalfClose {
    /// Signals end-of-output to the remote
    fn close_write(&self) -> io::Result<()>;
}

/// Error payload for operations on a closed endpoint
#[derive(Debug, Error)]
#[error("endpoint {label} is closed")]
pub struct EndpointClosed {
    label: String,
}

impl EndpointClosed {
    /// Builds the I/O error returned by closed endpoints
    pub fn error(label: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            EndpointClosed {
                label: label.to_owned(),
            },
        )
    }

    /// Checks whether `err` came from a closed endpoint
    pub fn is(err: &io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<EndpointClosed>())
    }
}

/// Adapter giving an endpoint `std::io::Read` and `Write`
pub struct EndpointIo<'a>(pub &'a dyn Endpoint);

impl Read for EndpointIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for EndpointIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One-operation-per-direction bookkeeping
pub(crate) struct Slot {
    busy: AtomicBool,
    direction: &'static str,
}

impl Slot {
    pub(crate) const fn new(direction: &'static str) -> Self {
        Self {
            busy: AtomicBool::new(false),
            direction,
        }
    }

    /// Claims the slot for one operation, released when the guard drops
    pub(crate) fn claim(&self, label: &str) -> io::Result<SlotGuard<'_>> {
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} already pending on {label}", self.direction),
            ));
        }
        Ok(SlotGuard(&self.busy))
    }
}

pub(crate) struct SlotGuard<'a>(&'a AtomicBool);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_refuses_second_claim() {
        let slot = Slot::new("read");
        let guard = slot.claim("test").unwrap();
        let err = slot.claim("test").err().unwrap();
        assert!(err.to_string().contains("read already pending on test"));
        drop(guard);
        assert!(slot.claim("test").is_ok());
    }

    #[test]
    fn closed_error_is_recognised() {
        let err = EndpointClosed::error("pipe");
        assert!(EndpointClosed::is(&err));
        assert_eq!(err.to_string(), "endpoint pipe is closed");
        assert!(!EndpointClosed::is(&io::Error::from(io::ErrorKind::Other)));
    }
}
