use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    io, mem,
    net::{Shutdown, SocketAddrV4, TcpStream},
    os::windows::{
        fs::OpenOptionsExt,
        io::{AsRawHandle, AsRawSocket, FromRawSocket, RawSocket},
    },
    path::Path,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Once,
    },
    thread,
};

use windows::{
    core::{GUID, PCWSTR},
    Win32::{
        Foundation::{CloseHandle, ERROR_IO_PENDING, HANDLE},
        Networking::WinSock::{
            bind, setsockopt, WSAIoctl, WSASocketW, WSAStartup, AF_INET, IN_ADDR, IN_ADDR_0,
            IPPROTO_TCP, LPFN_CONNECTEX, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR,
            SOCKADDR_IN, SOCKET, SOCK_STREAM, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, WSADATA,
            WSAID_CONNECTEX, WSA_FLAG_OVERLAPPED,
        },
        Storage::FileSystem::{ReadFile, WriteFile, FILE_FLAG_OVERLAPPED},
        System::{
            Threading::CreateEventW,
            IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
        },
    },
};

use super::{Endpoint, EndpointClosed, HalfClose, Slot};
use crate::{config::POLL_INTERVAL, error::classify_disconnect};

enum Transport {
    Pipe(File),
    Socket(TcpStream),
}

impl Transport {
    fn handle(&self) -> HANDLE {
        match self {
            Transport::Pipe(file) => HANDLE(file.as_raw_handle()),
            Transport::Socket(stream) => HANDLE(stream.as_raw_socket() as usize as *mut c_void),
        }
    }
}

/// Manual-reset event signalled when an overlapped request completes
struct Event(HANDLE);

impl Event {
    fn new() -> io::Result<Self> {
        // SAFETY: CreateEventW with no attributes and no name only allocates a
        // new anonymous event; the handle is owned by the returned value.
        let handle = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }?;
        Ok(Self(handle))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: the event handle was created by Event::new and is closed once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Endpoint over a handle opened for overlapped I/O.
///
/// Every request is issued asynchronously and the calling thread then waits
/// on its completion event, which yields blocking semantics to the caller.
pub struct OverlappedEndpoint {
    transport: Transport,
    label: String,
    closed: AtomicBool,
    reading: Slot,
    writing: Slot,
}

impl OverlappedEndpoint {
    fn new(transport: Transport, label: impl Into<String>) -> Self {
        Self {
            transport,
            label: label.into(),
            closed: AtomicBool::new(false),
            reading: Slot::new("read"),
            writing: Slot::new("write"),
        }
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(EndpointClosed::error(&self.label))
        } else {
            Ok(())
        }
    }

    /// Issues one overlapped request and waits for it to complete
    fn submit<F>(&self, request: F) -> io::Result<usize>
    where
        F: FnOnce(HANDLE, *mut OVERLAPPED) -> windows::core::Result<()>,
    {
        self.ensure_open()?;
        let event = Event::new()?;
        let mut overlapped = OVERLAPPED {
            hEvent: event.0,
            ..Default::default()
        };
        let handle = self.transport.handle();

        if let Err(err) = request(handle, &mut overlapped) {
            if err.code() != ERROR_IO_PENDING.to_hresult() {
                return Err(self.translate(err.into()));
            }
        }

        // A close that ran between ensure_open and the request above has
        // already issued its CancelIoEx; cancel this request ourselves.
        if self.closed.load(Ordering::SeqCst) {
            // SAFETY: `overlapped` identifies the request issued above and is
            // still alive; cancelling a completed request is a no-op.
            let _ = unsafe { CancelIoEx(handle, Some(&overlapped)) };
        }

        let mut transferred = 0u32;
        // SAFETY: `overlapped` and `event` outlive the request because we wait
        // for its completion (bWait = TRUE) before either is dropped.
        let completed =
            unsafe { GetOverlappedResult(handle, &overlapped, &mut transferred, true) };
        match completed {
            Ok(()) if transferred == 0 && self.is_closed() => {
                Err(EndpointClosed::error(&self.label))
            }
            Ok(()) => Ok(transferred as usize),
            Err(err) => Err(self.translate(err.into())),
        }
    }

    /// Cancelled requests surface as a closed endpoint
    fn translate(&self, err: io::Error) -> io::Error {
        if self.closed.load(Ordering::Acquire) {
            EndpointClosed::error(&self.label)
        } else {
            err
        }
    }
}

impl Endpoint for OverlappedEndpoint {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _pending = self.reading.claim(&self.label)?;
        self.submit(|handle, overlapped| {
            // SAFETY: the buffer stays borrowed until submit has waited for
            // the request to complete.
            unsafe { ReadFile(handle, Some(buf), None, Some(overlapped)) }
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _pending = self.writing.claim(&self.label)?;
        self.submit(|handle, overlapped| {
            // SAFETY: see read; the buffer outlives the overlapped request.
            unsafe { WriteFile(handle, Some(buf), None, Some(overlapped)) }
        })
    }

    fn half_close(&self) -> Option<&dyn HalfClose> {
        match self.transport {
            Transport::Socket(_) => Some(self),
            Transport::Pipe(_) => None,
        }
    }

    fn wait_disconnect(&self) -> io::Result<()> {
        let _pending = self.reading.claim(&self.label)?;
        loop {
            let mut empty = [0u8; 0];
            let result = self.submit(|handle, overlapped| {
                // SAFETY: zero-length read, the empty buffer outlives the request.
                unsafe { ReadFile(handle, Some(&mut empty[..]), None, Some(overlapped)) }
            });
            match result {
                Ok(_) => thread::sleep(POLL_INTERVAL),
                Err(e) if classify_disconnect(&e).is_some() => {
                    tracing::debug!("{} disconnected: {}", self.label, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        // SeqCst pairs with the re-check in submit
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("Closing {}", self.label);
        // SAFETY: the handle is valid for the lifetime of self; cancelling
        // with no OVERLAPPED aborts every request issued on it.
        let _ = unsafe { CancelIoEx(self.transport.handle(), None) };
        if let Transport::Socket(stream) = &self.transport {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl HalfClose for OverlappedEndpoint {
    fn close_write(&self) -> io::Result<()> {
        self.ensure_open()?;
        match &self.transport {
            Transport::Socket(stream) => stream.shutdown(Shutdown::Write),
            Transport::Pipe(_) => Ok(()),
        }
    }
}

/// Opens a named pipe such as `\\.\pipe\name` for overlapped I/O
pub fn open_pipe(path: &Path) -> io::Result<OverlappedEndpoint> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(FILE_FLAG_OVERLAPPED.0)
        .open(path)?;
    Ok(OverlappedEndpoint::new(
        Transport::Pipe(file),
        path.display().to_string(),
    ))
}

/// Connects a loopback stream socket.
///
/// The socket is created for overlapped I/O and bound to an ephemeral local
/// port first; the connect itself is a `ConnectEx` request awaited through
/// the same completion path as reads and writes.
pub fn connect_tcp(addr: SocketAddrV4) -> io::Result<OverlappedEndpoint> {
    let stream = winsock::overlapped_socket()?;
    let socket = SOCKET(stream.as_raw_socket() as usize);
    winsock::bind_ephemeral(socket)?;
    let Some(connect_ex) = winsock::connect_ex(socket)? else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "ConnectEx is not available",
        ));
    };

    let endpoint = OverlappedEndpoint::new(Transport::Socket(stream), addr.to_string());
    let target = winsock::sockaddr_in(addr);
    endpoint.submit(|_, overlapped| {
        // SAFETY: `target` outlives the request because submit waits for its
        // completion; no send buffer is passed.
        let started = unsafe {
            connect_ex(
                socket,
                &target as *const SOCKADDR_IN as *const SOCKADDR,
                mem::size_of::<SOCKADDR_IN>() as i32,
                ptr::null(),
                0,
                ptr::null_mut(),
                overlapped,
            )
        };
        if started.as_bool() {
            Ok(())
        } else {
            Err(windows::core::Error::from_win32())
        }
    })?;

    // Lets shutdown and getpeername work on a ConnectEx socket
    // SAFETY: plain option call on a socket we own.
    if unsafe { setsockopt(socket, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, None) } != 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::debug!("Connected to {}", addr);
    Ok(endpoint)
}

mod winsock {
    use super::*;

    static STARTUP: Once = Once::new();

    /// Creates an unconnected TCP socket opened for overlapped I/O
    pub(super) fn overlapped_socket() -> io::Result<TcpStream> {
        STARTUP.call_once(|| {
            let mut data = WSADATA::default();
            // SAFETY: `data` is a valid out pointer; Winsock is reference
            // counted, so this is harmless next to the standard library's own
            // start-up.
            let _ = unsafe { WSAStartup(0x0202, &mut data) };
        });

        // SAFETY: no protocol info is passed; the returned socket is owned by
        // the TcpStream built from it below.
        let socket = unsafe {
            WSASocketW(
                AF_INET.0 as i32,
                SOCK_STREAM.0,
                IPPROTO_TCP.0,
                None,
                0,
                WSA_FLAG_OVERLAPPED,
            )
        }?;
        // SAFETY: the socket was just created and nothing else owns it.
        Ok(unsafe { TcpStream::from_raw_socket(socket.0 as RawSocket) })
    }

    /// Binds to `0.0.0.0:0`, which ConnectEx requires
    pub(super) fn bind_ephemeral(socket: SOCKET) -> io::Result<()> {
        let any = SOCKADDR_IN {
            sin_family: AF_INET,
            ..Default::default()
        };
        // SAFETY: `any` is a valid SOCKADDR_IN for the duration of the call.
        let rc = unsafe {
            bind(
                socket,
                &any as *const SOCKADDR_IN as *const SOCKADDR,
                mem::size_of::<SOCKADDR_IN>() as i32,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Looks up the ConnectEx extension function for `socket`
    pub(super) fn connect_ex(socket: SOCKET) -> io::Result<LPFN_CONNECTEX> {
        let mut function: LPFN_CONNECTEX = None;
        let mut returned = 0u32;
        // SAFETY: input and output buffers point at live locals of the sizes
        // passed; the call is synchronous (no OVERLAPPED).
        let rc = unsafe {
            WSAIoctl(
                socket,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                Some(&WSAID_CONNECTEX as *const GUID as *const c_void),
                mem::size_of::<GUID>() as u32,
                Some(&mut function as *mut LPFN_CONNECTEX as *mut c_void),
                mem::size_of::<LPFN_CONNECTEX>() as u32,
                &mut returned,
                None,
                None,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(function)
    }

    pub(super) fn sockaddr_in(addr: SocketAddrV4) -> SOCKADDR_IN {
        SOCKADDR_IN {
            sin_family: AF_INET,
            sin_port: addr.port().to_be(),
            sin_addr: IN_ADDR {
                S_un: IN_ADDR_0 {
                    S_addr: u32::from(*addr.ip()).to_be(),
                },
            },
            ..Default::default()
        }
    }
}
