use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddrV4, TcpStream},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::net::UnixStream,
    },
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn},
};

use super::{Endpoint, EndpointClosed, HalfClose, Slot};

/// Stream transports a [`PolledEndpoint`] can drive
pub trait StreamSocket: AsFd + Send + Sync {
    /// Shuts down one or both directions
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    /// Switches the descriptor between blocking and non-blocking mode
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl StreamSocket for UnixStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, how)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

impl StreamSocket for TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

/// Endpoint over a non-blocking descriptor.
///
/// Each call is issued non-blocking; on `WouldBlock` the calling thread parks
/// in `poll(2)` until the descriptor is ready, then retries.
pub struct PolledEndpoint<S> {
    stream: S,
    label: String,
    closed: AtomicBool,
    reading: Slot,
    writing: Slot,
}

/// Named channel endpoint (a Unix domain socket path)
pub type PipeEndpoint = PolledEndpoint<UnixStream>;

/// Loopback socket endpoint
pub type SocketEndpoint = PolledEndpoint<TcpStream>;

impl<S> PolledEndpoint<S>
where
    S: StreamSocket,
    for<'a> &'a S: Read + Write,
{
    /// Wraps a connected stream, switching it to non-blocking mode
    pub fn new(stream: S, label: impl Into<String>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            label: label.into(),
            closed: AtomicBool::new(false),
            reading: Slot::new("read"),
            writing: Slot::new("write"),
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EndpointClosed::error(&self.label))
        } else {
            Ok(())
        }
    }

    /// Parks until the descriptor reports one of `events` (or a hang-up)
    fn wait(&self, events: PollFlags) -> io::Result<PollFlags> {
        self.ensure_open()?;
        let revents = poll_fd(self.stream.as_fd(), events)?;
        self.ensure_open()?;
        Ok(revents)
    }
}

impl<S> Endpoint for PolledEndpoint<S>
where
    S: StreamSocket,
    for<'a> &'a S: Read + Write,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _pending = self.reading.claim(&self.label)?;
        loop {
            self.ensure_open()?;
            match (&self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLIN)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _pending = self.writing.claim(&self.label)?;
        loop {
            self.ensure_open()?;
            match (&self.stream).write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait(PollFlags::POLLOUT)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                result => return result,
            }
        }
    }

    fn half_close(&self) -> Option<&dyn HalfClose> {
        Some(self)
    }

    fn wait_disconnect(&self) -> io::Result<()> {
        let _pending = self.reading.claim(&self.label)?;
        // An empty interest set only wakes on POLLHUP, POLLERR or POLLNVAL
        let revents = self.wait(PollFlags::empty())?;
        if revents.contains(PollFlags::POLLNVAL) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        tracing::debug!("{} hung up ({:?})", self.label, revents);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("Closing {}", self.label);
        // Shutting both directions down wakes every thread parked in poll
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<S> HalfClose for PolledEndpoint<S>
where
    S: StreamSocket,
    for<'a> &'a S: Read + Write,
{
    fn close_write(&self) -> io::Result<()> {
        self.ensure_open()?;
        self.stream.shutdown(Shutdown::Write)
    }
}

fn poll_fd(fd: BorrowedFd<'_>, events: PollFlags) -> io::Result<PollFlags> {
    loop {
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(fds[0].revents().unwrap_or_else(PollFlags::empty)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Opens a named channel, here a Unix domain socket at `path`
pub fn open_pipe(path: &Path) -> io::Result<PipeEndpoint> {
    let stream = UnixStream::connect(path)?;
    PolledEndpoint::new(stream, path.display().to_string())
}

/// Connects a stream socket to `addr`.
///
/// The socket is bound to an ephemeral local port first, then connected
/// without blocking; completion is awaited by polling for writability and
/// reading back `SO_ERROR`.
pub fn connect_tcp(addr: SocketAddrV4) -> io::Result<SocketEndpoint> {
    let fd: OwnedFd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    socket::bind(fd.as_raw_fd(), &SockaddrIn::new(0, 0, 0, 0, 0))?;

    let stream = TcpStream::from(fd);
    stream.set_nonblocking(true)?;

    match socket::connect(stream.as_raw_fd(), &SockaddrIn::from(addr)) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS | Errno::EINTR) => {
            poll_fd(stream.as_fd(), PollFlags::POLLOUT)?;
            let pending = socket::getsockopt(&stream, sockopt::SocketError)?;
            if pending != 0 {
                return Err(io::Error::from_raw_os_error(pending));
            }
        }
        Err(e) => return Err(e.into()),
    }

    tracing::debug!(
        "Connected {} -> {}",
        stream.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        addr
    );
    PolledEndpoint::new(stream, addr.to_string())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Ipv4Addr, TcpListener},
        sync::Arc,
        thread,
        time::Duration,
    };

    use super::*;
    use crate::error::classify_disconnect;

    fn pair() -> (PipeEndpoint, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (PolledEndpoint::new(ours, "pair").unwrap(), theirs)
    }

    #[test]
    fn reads_and_writes_through_the_poll_loop() {
        let (endpoint, mut peer) = pair();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            peer.write_all(b"hello").unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            buf
        });

        let mut buf = [0u8; 5];
        let n = endpoint.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(endpoint.write(b"world").unwrap(), 5);
        assert_eq!(&writer.join().unwrap(), b"world");
    }

    #[test]
    fn close_wakes_a_blocked_reader() {
        let (endpoint, _peer) = pair();
        let endpoint = Arc::new(endpoint);

        let reader = {
            let endpoint = Arc::clone(&endpoint);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                endpoint.read(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        endpoint.close().unwrap();
        let err = reader.join().unwrap().unwrap_err();
        assert!(EndpointClosed::is(&err));
        assert!(endpoint.is_closed());
    }

    #[test]
    fn operations_after_close_fail() {
        let (endpoint, _peer) = pair();
        endpoint.close().unwrap();
        endpoint.close().unwrap();
        assert!(EndpointClosed::is(&endpoint.write(b"x").unwrap_err()));
        assert!(EndpointClosed::is(&endpoint.read(&mut [0u8; 1]).unwrap_err()));
        assert!(EndpointClosed::is(&endpoint.wait_disconnect().unwrap_err()));
    }

    #[test]
    fn half_close_delivers_eof_to_the_peer() {
        let (endpoint, mut peer) = pair();
        endpoint.write(b"bye").unwrap();
        endpoint.half_close().unwrap().close_write().unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        // The inbound direction still works
        peer.write_all(b"still here").unwrap();
        let mut buf = [0u8; 16];
        let n = endpoint.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[test]
    fn wait_disconnect_returns_when_peer_goes_away() {
        let (endpoint, peer) = pair();
        let waiter = thread::spawn(move || endpoint.wait_disconnect());
        thread::sleep(Duration::from_millis(30));
        drop(peer);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn writing_to_a_vanished_peer_is_a_benign_disconnect() {
        let (endpoint, peer) = pair();
        drop(peer);
        let err = endpoint.write(b"lost").unwrap_err();
        assert!(classify_disconnect(&err).is_some(), "unexpected {err:?}");
    }

    #[test]
    fn connect_tcp_reaches_a_loopback_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let endpoint = connect_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        endpoint.write(b"ping").unwrap();
        assert_eq!(&accept.join().unwrap(), b"ping");
        assert!(endpoint.half_close().is_some());
    }

    #[test]
    fn connect_tcp_without_listener_is_refused() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn open_pipe_reports_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_pipe(&dir.path().join("absent.sock")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
