use std::{
    fs,
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, TcpListener},
    thread,
    time::Duration,
};

use pipe_relay::{CancelToken, DialError, Dialer, Target};
use pipe_relay_common::{EndpointIo, HandshakeRecord};
use pipe_relay_peer::AssuanPeer;

const FAST_POLL: Duration = Duration::from_millis(20);

fn handshake_file(port: u16, secret: &[u8]) -> Vec<u8> {
    let mut contents = format!("{port}\n").into_bytes();
    contents.extend_from_slice(secret);
    contents
}

#[test]
fn assuan_dial_sends_the_secret_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S.gpg-agent");
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let secret: Vec<u8> = (1..=16).collect();
    fs::write(&path, handshake_file(port, &secret)).unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = [0u8; 21];
        stream.read_exact(&mut received).unwrap();
        received
    });

    let endpoint = Dialer::new(false, CancelToken::new())
        .dial(&Target::Assuan(path))
        .unwrap();
    EndpointIo(endpoint.as_ref()).write_all(b"hello").unwrap();

    let received = server.join().unwrap();
    assert_eq!(&received[..16], &secret[..]);
    assert_eq!(&received[16..], b"hello");
}

#[test]
fn wrong_secret_length_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S.gpg-agent");
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();
    fs::write(&path, handshake_file(port, &[0u8; 15])).unwrap();

    let err = Dialer::new(true, CancelToken::new())
        .dial(&Target::Assuan(path))
        .err()
        .unwrap();
    assert!(matches!(err, DialError::MalformedHandshake { .. }), "{err:?}");

    let accepted = listener.accept().map(|_| ()).unwrap_err();
    assert_eq!(accepted.kind(), ErrorKind::WouldBlock);
}

#[test]
fn handshake_file_that_appears_later_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S.gpg-agent");
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let writer = {
        let path = path.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            // Renamed into place so the dialer never sees a partial file
            let staging = path.with_extension("tmp");
            fs::write(&staging, handshake_file(port, &[9u8; 16])).unwrap();
            fs::rename(staging, path).unwrap();
        })
    };
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut secret = [0u8; 16];
        stream.read_exact(&mut secret).unwrap();
        secret
    });

    let endpoint = Dialer::new(true, CancelToken::new())
        .with_interval(FAST_POLL)
        .dial(&Target::Assuan(path));
    assert!(endpoint.is_ok());

    writer.join().unwrap();
    assert_eq!(server.join().unwrap(), [9u8; 16]);
}

#[test]
fn assuan_peer_accepts_the_relay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S.gpg-agent");
    let peer = AssuanPeer::publish(&path).unwrap();
    let expected = HandshakeRecord::parse(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(&expected, peer.record());

    let server = thread::spawn(move || {
        let mut conn = peer.accept().unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        buf
    });

    let endpoint = Dialer::new(false, CancelToken::new())
        .dial_assuan(&path)
        .unwrap();
    EndpointIo(endpoint.as_ref()).write_all(b"PING").unwrap();
    assert_eq!(&server.join().unwrap(), b"PING");
}

#[test]
fn refused_port_without_poll_is_not_ready() {
    let port = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = Dialer::new(false, CancelToken::new())
        .dial(&Target::Port(port))
        .err()
        .unwrap();
    assert!(err.is_not_ready(), "{err:?}");
}

#[test]
fn cancel_interrupts_polling() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            cancel.cancel();
        })
    };

    let err = Dialer::new(true, cancel)
        .with_interval(FAST_POLL)
        .dial(&Target::Pipe(dir.path().join("never")))
        .err()
        .unwrap();
    assert!(matches!(err, DialError::Cancelled { .. }), "{err:?}");
    canceller.join().unwrap();
}

#[cfg(unix)]
mod pipes {
    use super::*;
    use pipe_relay_peer::{PeerListener, Responder};

    #[test]
    fn missing_pipe_without_poll_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dialer::new(false, CancelToken::new())
            .dial(&Target::Pipe(dir.path().join("absent.sock")))
            .err()
            .unwrap();
        assert!(err.is_not_ready(), "{err:?}");
    }

    #[test]
    fn pipe_that_appears_later_is_connected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");

        let server = {
            let path = path.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                let listener = PeerListener::bind(&path).unwrap();
                let conn = listener.accept().unwrap();
                Responder::greeting("heck").serve(conn).unwrap();
            })
        };

        let endpoint = Dialer::new(true, CancelToken::new())
            .with_interval(FAST_POLL)
            .dial(&Target::Pipe(path.clone()))
            .unwrap();
        assert_eq!(endpoint.label(), path.display().to_string());

        let mut io = EndpointIo(endpoint.as_ref());
        io.write_all(b"PING").unwrap();
        let mut reply = Vec::new();
        io.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"heckPING");
        server.join().unwrap();
    }
}
