use std::{
    fs,
    net::{Ipv4Addr, SocketAddrV4},
    path::Path,
    sync::Arc,
    time::Duration,
};

use pipe_relay_common::{
    endpoint,
    error::{is_not_ready, is_transient_connect},
    CancelToken, DialError, Endpoint, HandshakeRecord, POLL_INTERVAL,
};

use crate::config::{RelayConfig, Target};

/// Opens endpoints, optionally polling until the target is ready.
///
/// "Not ready" means the pipe or handshake file does not exist yet, or the
/// advertised port refuses, times out or is unreachable. With polling enabled
/// those conditions are retried every `interval`; anything else is final.
pub struct Dialer {
    poll: bool,
    interval: Duration,
    cancel: CancelToken,
}

impl Dialer {
    /// Creates a dialer with the default poll interval
    pub fn new(poll: bool, cancel: CancelToken) -> Self {
        Self {
            poll,
            interval: POLL_INTERVAL,
            cancel,
        }
    }

    /// Creates a dialer from the run configuration
    pub fn from_config(config: &RelayConfig, cancel: CancelToken) -> Self {
        Self::new(config.poll, cancel).with_interval(config.poll_interval)
    }

    /// Set the pause between attempts
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Dials any kind of target
    pub fn dial(&self, target: &Target) -> Result<Arc<dyn Endpoint>, DialError> {
        match target {
            Target::Pipe(path) => self.dial_pipe(path),
            Target::Assuan(path) => self.dial_assuan(path),
            Target::Port(port) => self.dial_port(*port),
        }
    }

    /// Opens a named pipe
    pub fn dial_pipe(&self, path: &Path) -> Result<Arc<dyn Endpoint>, DialError> {
        let target = path.display().to_string();
        let pipe = self.retry(&target, || {
            endpoint::open_pipe(path).map_err(|source| {
                if is_not_ready(&source) {
                    DialError::NotReady {
                        target: target.clone(),
                        source,
                    }
                } else {
                    DialError::Io {
                        target: target.clone(),
                        source,
                    }
                }
            })
        })?;
        Ok(Arc::new(pipe))
    }

    /// Reads an Assuan handshake file, connects to the advertised port and
    /// sends the secret before returning the connection.
    pub fn dial_assuan(&self, path: &Path) -> Result<Arc<dyn Endpoint>, DialError> {
        let target = path.display().to_string();
        let contents = self.retry(&target, || {
            fs::read(path).map_err(|source| {
                if is_not_ready(&source) {
                    DialError::NotReady {
                        target: target.clone(),
                        source,
                    }
                } else {
                    DialError::Io {
                        target: target.clone(),
                        source,
                    }
                }
            })
        })?;

        let record =
            HandshakeRecord::parse(&contents).map_err(|source| DialError::MalformedHandshake {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!("Handshake from {}: {:?}", target, record);

        let conn = self.dial_port(record.port)?;
        record
            .send_secret(conn.as_ref())
            .map_err(|source| DialError::Io {
                target: conn.label().to_owned(),
                source,
            })?;
        Ok(conn)
    }

    /// Connects to a loopback port
    pub fn dial_port(&self, port: u16) -> Result<Arc<dyn Endpoint>, DialError> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let target = addr.to_string();
        let socket = self.retry(&target, || {
            endpoint::connect_tcp(addr).map_err(|source| {
                if is_transient_connect(&source) {
                    DialError::NotReady {
                        target: target.clone(),
                        source,
                    }
                } else {
                    DialError::ConnectFailed {
                        addr: addr.into(),
                        source,
                    }
                }
            })
        })?;
        Ok(Arc::new(socket))
    }

    /// Runs `attempt` until it succeeds, fails for good, or is cancelled.
    ///
    /// Only [`DialError::NotReady`] is retried, and only when polling. Each
    /// retry is preceded by exactly one sleep of the configured interval.
    pub fn retry<T, F>(&self, target: &str, mut attempt: F) -> Result<T, DialError>
    where
        F: FnMut() -> Result<T, DialError>,
    {
        let mut failures = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DialError::Cancelled {
                    target: target.to_owned(),
                });
            }

            match attempt() {
                Err(err) if self.poll && err.is_not_ready() => {
                    failures += 1;
                    tracing::debug!(
                        "{} not ready (attempt {}), retrying in {:?}",
                        target,
                        failures,
                        self.interval
                    );
                    if !self.cancel.sleep(self.interval) {
                        return Err(DialError::Cancelled {
                            target: target.to_owned(),
                        });
                    }
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Instant};

    use super::*;

    fn not_ready() -> DialError {
        DialError::NotReady {
            target: "test".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
    }

    #[test]
    fn poll_retries_until_the_target_appears() {
        let dialer = Dialer::new(true, CancelToken::new()).with_interval(Duration::from_millis(10));
        let mut attempts = 0;
        let started = Instant::now();

        let value = dialer
            .retry("test", || {
                attempts += 1;
                if attempts <= 3 {
                    Err(not_ready())
                } else {
                    Ok(attempts)
                }
            })
            .unwrap();

        assert_eq!(value, 4);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn without_poll_not_ready_fails_at_once() {
        let dialer = Dialer::new(false, CancelToken::new()).with_interval(Duration::from_secs(5));
        let mut attempts = 0;
        let started = Instant::now();

        let err = dialer
            .retry::<(), _>("test", || {
                attempts += 1;
                Err(not_ready())
            })
            .unwrap_err();

        assert!(err.is_not_ready());
        assert_eq!(attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn terminal_errors_are_not_retried_under_poll() {
        let dialer = Dialer::new(true, CancelToken::new()).with_interval(Duration::from_millis(10));
        let mut attempts = 0;

        let err = dialer
            .retry::<(), _>("test", || {
                attempts += 1;
                Err(DialError::Io {
                    target: "test".into(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                })
            })
            .unwrap_err();

        assert!(matches!(err, DialError::Io { .. }));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn cancellation_stops_the_poll_loop() {
        let cancel = CancelToken::new();
        let dialer = Dialer::new(true, cancel.clone()).with_interval(Duration::from_millis(10));
        let mut attempts = 0;

        let err = dialer
            .retry::<(), _>("test", || {
                attempts += 1;
                if attempts == 2 {
                    cancel.cancel();
                }
                Err(not_ready())
            })
            .unwrap_err();

        assert!(matches!(err, DialError::Cancelled { .. }));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn malformed_handshake_is_rejected_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("S.gpg-agent");
        let mut contents = b"abc\n".to_vec();
        contents.extend_from_slice(&[7u8; 16]);
        fs::write(&path, contents).unwrap();

        let err = Dialer::new(true, CancelToken::new())
            .dial_assuan(&path)
            .err()
            .unwrap();
        assert!(matches!(err, DialError::MalformedHandshake { .. }), "{err:?}");
    }

    #[test]
    fn missing_handshake_file_without_poll_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let err = Dialer::new(false, CancelToken::new())
            .dial_assuan(&dir.path().join("absent"))
            .err()
            .unwrap();
        assert!(err.is_not_ready());
    }
}
