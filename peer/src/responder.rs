use std::io::{self, Read, Write};

use crate::listener::PeerStream;

/// Largest request a greeting peer reads before answering
pub const GREETING_CHUNK: usize = 16;

/// What the peer does with each accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Responder {
    /// Copies everything back until end-of-stream, then half-closes
    Echo,
    /// Reads one chunk of up to 16 bytes, replies `prefix` followed by the
    /// chunk, then half-closes
    Greeting { prefix: Vec<u8> },
}

impl Responder {
    /// Greeting responder with the given prefix
    pub fn greeting(prefix: impl Into<Vec<u8>>) -> Self {
        Responder::Greeting {
            prefix: prefix.into(),
        }
    }

    /// Serves one connection and returns the number of bytes sent back
    pub fn serve(&self, mut conn: PeerStream) -> io::Result<u64> {
        let sent = match self {
            Responder::Echo => {
                let mut buf = [0u8; 4096];
                let mut sent = 0u64;
                loop {
                    let n = conn.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    conn.write_all(&buf[..n])?;
                    sent += n as u64;
                }
                sent
            }
            Responder::Greeting { prefix } => {
                let mut input = [0u8; GREETING_CHUNK];
                let n = conn.read(&mut input)?;
                tracing::info!("Got {:?}", String::from_utf8_lossy(&input[..n]));

                let mut reply = Vec::with_capacity(prefix.len() + n);
                reply.extend_from_slice(prefix);
                reply.extend_from_slice(&input[..n]);
                conn.write_all(&reply)?;
                reply.len() as u64
            }
        };

        conn.flush()?;
        if let Err(e) = conn.close_write() {
            tracing::warn!("Failed to half-close connection: {}", e);
        }
        Ok(sent)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{net::Shutdown, os::unix::net::UnixStream, thread};

    use super::*;

    fn pair() -> (UnixStream, PeerStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (client, PeerStream::Unix(server))
    }

    #[test]
    fn echo_returns_everything_then_eof() {
        let (mut client, server) = pair();
        let peer = thread::spawn(move || Responder::Echo.serve(server));

        client.write_all(b"one two three").unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();

        assert_eq!(received, b"one two three");
        assert_eq!(peer.join().unwrap().unwrap(), 13);
    }

    #[test]
    fn greeting_prefixes_one_chunk() {
        let (mut client, server) = pair();
        let peer = thread::spawn(move || Responder::greeting("heck").serve(server));

        client.write_all(b"PING").unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();

        assert_eq!(received, b"heckPING");
        assert_eq!(peer.join().unwrap().unwrap(), 8);
    }

    #[test]
    fn greeting_reads_at_most_sixteen_bytes() {
        let (mut client, server) = pair();
        client.write_all(b"0123456789abcdefXYZ").unwrap();

        let sent = Responder::greeting("").serve(server).unwrap();
        assert!(sent <= GREETING_CHUNK as u64);

        let mut received = vec![0u8; sent as usize];
        client.read_exact(&mut received).unwrap();
        assert!(b"0123456789abcdef".starts_with(&received));
    }
}
