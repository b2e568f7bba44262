use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(windows)]
use std::{fs::File, sync::Mutex};

use anyhow::{Context, Result};

/// Listening side of a pipe target
pub enum PeerListener {
    #[cfg(unix)]
    /// Unix domain socket listener, removed from disk on drop
    Unix { listener: UnixListener, path: PathBuf },
    #[cfg(windows)]
    /// Windows named pipe server; the next instance is created ahead of
    /// `accept` so clients can open the pipe as soon as it is bound
    NamedPipe {
        name: Vec<u16>,
        path: PathBuf,
        pending: Mutex<Option<File>>,
    },
}

/// A connection accepted by the peer
pub enum PeerStream {
    #[cfg(unix)]
    /// Unix domain socket connection
    Unix(UnixStream),
    #[cfg(windows)]
    /// Connected named pipe instance
    Pipe(File),
    /// Loopback socket accepted by an Assuan peer
    Tcp(TcpStream),
}

impl PeerListener {
    /// Create a listener at `path`.
    ///
    /// On Unix a leftover socket file from an earlier run is removed first.
    /// On Windows `path` is the full pipe name (`\\.\pipe\...`).
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        #[cfg(unix)]
        {
            if path.exists() {
                tracing::warn!("Existing socket file found at {}, removing it", path.display());
                std::fs::remove_file(&path).with_context(|| {
                    format!("Could not remove existing socket file {}", path.display())
                })?;
            }

            let listener = UnixListener::bind(&path)
                .with_context(|| format!("Failed to bind Unix socket {}", path.display()))?;
            tracing::info!("Listening on {}", path.display());
            Ok(PeerListener::Unix { listener, path })
        }

        #[cfg(windows)]
        {
            use std::os::windows::ffi::OsStrExt;

            let name: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
            let first = pipe::create_instance(&name)
                .with_context(|| format!("Failed to create named pipe {}", path.display()))?;
            tracing::info!("Listening on {}", path.display());
            Ok(PeerListener::NamedPipe {
                name,
                path,
                pending: Mutex::new(Some(first)),
            })
        }
    }

    /// Path clients dial
    pub fn path(&self) -> &Path {
        match self {
            #[cfg(unix)]
            PeerListener::Unix { path, .. } => path,
            #[cfg(windows)]
            PeerListener::NamedPipe { path, .. } => path,
        }
    }

    /// Wait for the next client
    pub fn accept(&self) -> Result<PeerStream> {
        match self {
            #[cfg(unix)]
            PeerListener::Unix { listener, .. } => {
                let (stream, _) = listener
                    .accept()
                    .context("Failed to accept Unix socket connection")?;
                Ok(PeerStream::Unix(stream))
            }
            #[cfg(windows)]
            PeerListener::NamedPipe { name, pending, .. } => {
                let instance = match pending.lock() {
                    Ok(mut slot) => slot.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                let instance = match instance {
                    Some(file) => file,
                    None => pipe::create_instance(name).context("Failed to create pipe instance")?,
                };
                pipe::wait_for_client(&instance).context("Failed to connect named pipe")?;

                // Keep the name visible for the next client
                match pipe::create_instance(name) {
                    Ok(next) => {
                        if let Ok(mut slot) = pending.lock() {
                            *slot = Some(next);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to create next pipe instance: {}", e),
                }
                Ok(PeerStream::Pipe(instance))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for PeerListener {
    fn drop(&mut self) {
        let PeerListener::Unix { path, .. } = self;
        let _ = std::fs::remove_file(path);
    }
}

impl PeerStream {
    /// Signal end-of-output while keeping the read side open.
    ///
    /// Named pipes have no half-close; the remote sees end-of-stream once the
    /// stream is dropped instead.
    pub fn close_write(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PeerStream::Unix(stream) => stream.shutdown(Shutdown::Write),
            #[cfg(windows)]
            PeerStream::Pipe(_) => Ok(()),
            PeerStream::Tcp(stream) => stream.shutdown(Shutdown::Write),
        }
    }
}

impl Read for PeerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PeerStream::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            PeerStream::Pipe(file) => file.read(buf),
            PeerStream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for PeerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PeerStream::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            PeerStream::Pipe(file) => file.write(buf),
            PeerStream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PeerStream::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            PeerStream::Pipe(file) => file.flush(),
            PeerStream::Tcp(stream) => stream.flush(),
        }
    }
}

#[cfg(windows)]
mod pipe {
    use std::{
        fs::File,
        io,
        os::windows::io::{AsRawHandle, FromRawHandle},
    };

    use windows::{
        core::PCWSTR,
        Win32::{
            Foundation::{ERROR_PIPE_CONNECTED, HANDLE},
            Storage::FileSystem::PIPE_ACCESS_DUPLEX,
            System::Pipes::{
                ConnectNamedPipe, CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
                PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
            },
        },
    };

    const BUFFER_SIZE: u32 = 4096;

    /// Creates one server instance of the pipe named by the NUL-terminated
    /// wide string `name`
    pub(super) fn create_instance(name: &[u16]) -> io::Result<File> {
        // SAFETY: `name` is NUL-terminated and outlives the call; no security
        // attributes are passed, so the default DACL applies.
        let handle = unsafe {
            CreateNamedPipeW(
                PCWSTR(name.as_ptr()),
                PIPE_ACCESS_DUPLEX,
                PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                PIPE_UNLIMITED_INSTANCES,
                BUFFER_SIZE,
                BUFFER_SIZE,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the handle was just created and is owned by nothing else.
        Ok(unsafe { File::from_raw_handle(handle.0) })
    }

    /// Blocks until a client opens this instance
    pub(super) fn wait_for_client(instance: &File) -> io::Result<()> {
        // SAFETY: the handle is owned by `instance`, which outlives the call;
        // no OVERLAPPED is passed so the call blocks.
        match unsafe { ConnectNamedPipe(HANDLE(instance.as_raw_handle()), None) } {
            Ok(()) => Ok(()),
            // The client connected between create and connect
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = PeerListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path);

        let mut client = UnixStream::connect(&path).unwrap();
        let mut conn = listener.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn close_write_reaches_the_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.sock");
        let listener = PeerListener::bind(&path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        let mut conn = listener.accept().unwrap();
        conn.write_all(b"bye").unwrap();
        conn.close_write().unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }
}
