use std::{
    fs,
    io::Read,
    net::{Ipv4Addr, TcpListener},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use pipe_relay_common::{HandshakeRecord, SECRET_LEN};

use crate::listener::PeerStream;

/// Loopback listener published through an Assuan handshake file.
///
/// Clients read the file, connect to the advertised port and must send the
/// secret as their first bytes. The handshake file is removed on drop.
pub struct AssuanPeer {
    listener: TcpListener,
    record: HandshakeRecord,
    path: PathBuf,
}

impl AssuanPeer {
    /// Binds an ephemeral loopback port and writes the handshake file
    pub fn publish(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .context("Failed to bind loopback listener")?;
        let port = listener
            .local_addr()
            .context("Failed to read listener address")?
            .port();

        let record = HandshakeRecord {
            port,
            secret: uuid::Uuid::new_v4().into_bytes(),
        };
        fs::write(&path, record.to_bytes())
            .with_context(|| format!("Failed to write handshake file {}", path.display()))?;
        tracing::info!("Published port {} in {}", port, path.display());

        Ok(Self {
            listener,
            record,
            path,
        })
    }

    /// Port clients are told to connect to
    pub fn port(&self) -> u16 {
        self.record.port
    }

    /// Published port and secret
    pub fn record(&self) -> &HandshakeRecord {
        &self.record
    }

    /// Handshake file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts one client and verifies its secret.
    ///
    /// A client presenting the wrong secret is disconnected and reported as
    /// an error.
    pub fn accept(&self) -> Result<PeerStream> {
        let (mut stream, addr) = self
            .listener
            .accept()
            .context("Failed to accept loopback connection")?;

        let mut presented = [0u8; SECRET_LEN];
        stream
            .read_exact(&mut presented)
            .with_context(|| format!("Failed to read secret from {addr}"))?;
        if presented != self.record.secret {
            bail!("client {} presented the wrong secret", addr);
        }

        tracing::debug!("Accepted authenticated client {}", addr);
        Ok(PeerStream::Tcp(stream))
    }
}

impl Drop for AssuanPeer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
