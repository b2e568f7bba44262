//! Assuan "file socket" handshake
//!
//! Where the agent cannot expose a Unix socket it listens on a loopback TCP
//! port instead and publishes a small file in place of the socket: the port
//! in decimal ASCII on the first line, followed directly by a 16 byte secret.
//! A client proves it could read the file by sending that secret as the first
//! bytes on the new connection.

use std::{fmt, io::Write};

use crate::{
    endpoint::{Endpoint, EndpointIo},
    error::HandshakeError,
};

/// Length of the shared secret following the port line
pub const SECRET_LEN: usize = 16;

/// Port and secret parsed from a handshake file
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Loopback port the agent listens on
    pub port: u16,
    /// Secret to send before any other data
    pub secret: [u8; SECRET_LEN],
}

impl HandshakeRecord {
    /// Parses the full contents of a handshake file
    pub fn parse(contents: &[u8]) -> Result<Self, HandshakeError> {
        let newline = contents
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(HandshakeError::MissingNewline)?;
        let (line, rest) = (&contents[..newline], &contents[newline + 1..]);

        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HandshakeError::InvalidPort(text.to_owned()));
        }
        let value: u64 = text
            .parse()
            .map_err(|_| HandshakeError::InvalidPort(text.to_owned()))?;
        let port = u16::try_from(value).map_err(|_| HandshakeError::PortOutOfRange(value))?;

        let secret: [u8; SECRET_LEN] = rest
            .try_into()
            .map_err(|_| HandshakeError::SecretLength(rest.len()))?;

        Ok(Self { port, secret })
    }

    /// Serializes the record in the on-disk format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = format!("{}\n", self.port).into_bytes();
        bytes.extend_from_slice(&self.secret);
        bytes
    }

    /// Writes the secret as the first bytes of a fresh connection
    pub fn send_secret(&self, endpoint: &dyn Endpoint) -> std::io::Result<()> {
        EndpointIo(endpoint).write_all(&self.secret)
    }
}

impl fmt::Debug for HandshakeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeRecord")
            .field("port", &self.port)
            .field("secret", &hex::encode_upper(self.secret))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8; SECRET_LEN] = b"0123456789abcdef";

    fn file(first_line: &str, secret: &[u8]) -> Vec<u8> {
        let mut bytes = first_line.as_bytes().to_vec();
        bytes.extend_from_slice(secret);
        bytes
    }

    #[test]
    fn parses_port_and_secret() {
        let record = HandshakeRecord::parse(&file("49152\n", SECRET)).unwrap();
        assert_eq!(record.port, 49152);
        assert_eq!(&record.secret, SECRET);
    }

    #[test]
    fn trims_whitespace_around_the_port() {
        let record = HandshakeRecord::parse(&file("  8080 \r\n", SECRET)).unwrap();
        assert_eq!(record.port, 8080);
    }

    #[test]
    fn accepts_the_whole_port_range() {
        assert_eq!(HandshakeRecord::parse(&file("0\n", SECRET)).unwrap().port, 0);
        assert_eq!(
            HandshakeRecord::parse(&file("65535\n", SECRET)).unwrap().port,
            65535
        );
    }

    #[test]
    fn secret_may_contain_newlines_and_nul_bytes() {
        let secret = *b"\n\0\n\0\r\n\xff\xfe abc\n\n\n\n";
        let record = HandshakeRecord::parse(&file("1\n", &secret)).unwrap();
        assert_eq!(record.secret, secret);
    }

    #[test]
    fn rejects_non_numeric_ports() {
        assert_eq!(
            HandshakeRecord::parse(&file("abc\n", SECRET)),
            Err(HandshakeError::InvalidPort("abc".into()))
        );
        assert!(matches!(
            HandshakeRecord::parse(&file("-1\n", SECRET)),
            Err(HandshakeError::InvalidPort(_))
        ));
        assert!(matches!(
            HandshakeRecord::parse(&file("\n", SECRET)),
            Err(HandshakeError::InvalidPort(_))
        ));
    }

    #[test]
    fn rejects_ports_above_range() {
        assert_eq!(
            HandshakeRecord::parse(&file("65536\n", SECRET)),
            Err(HandshakeError::PortOutOfRange(65536))
        );
    }

    #[test]
    fn rejects_wrong_secret_lengths() {
        assert_eq!(
            HandshakeRecord::parse(&file("80\n", &SECRET[..15])),
            Err(HandshakeError::SecretLength(15))
        );
        let mut long = SECRET.to_vec();
        long.push(b'!');
        assert_eq!(
            HandshakeRecord::parse(&file("80\n", &long)),
            Err(HandshakeError::SecretLength(17))
        );
    }

    #[test]
    fn rejects_missing_newline() {
        assert_eq!(
            HandshakeRecord::parse(b"8080"),
            Err(HandshakeError::MissingNewline)
        );
    }

    #[test]
    fn to_bytes_matches_the_file_format() {
        let record = HandshakeRecord {
            port: 4242,
            secret: *SECRET,
        };
        assert_eq!(record.to_bytes(), file("4242\n", SECRET));
        assert_eq!(HandshakeRecord::parse(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn debug_shows_the_secret_as_hex() {
        let record = HandshakeRecord {
            port: 1,
            secret: [0xAB; SECRET_LEN],
        };
        let rendered = format!("{record:?}");
        assert!(rendered.contains(&"AB".repeat(SECRET_LEN)));
    }
}
