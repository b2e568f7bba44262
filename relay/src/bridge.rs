//! Bidirectional copy between local streams and an endpoint
//!
//! Two flows share one [`Endpoint`]:
//!
//! - **outbound** (local input → remote) runs on a spawned thread and reports
//!   how it ended over a channel
//! - **inbound** (remote → local output) runs on the calling thread
//!
//! Whichever flow decides the session is over closes the endpoint, which
//! wakes the other flow out of any blocked endpoint call. The outbound thread
//! may still be parked reading local input at that point; it is abandoned.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
    thread,
};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use pipe_relay_common::{classify_disconnect, CancelToken, Disconnect, Endpoint, EndpointIo};
use thiserror::Error;
use tracing::debug;

use crate::config::BridgePolicy;

/// Lifecycle of a bridge session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The endpoint is being dialed
    Connecting,
    /// Both flows are copying
    Bridging,
    /// The remote finished sending; waiting for local input or a disconnect
    Draining,
    /// The session is over
    Terminated,
}

/// Graceful ways a session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local input reached end-of-stream under `terminate_on_local_eof`
    LocalEof,
    /// The remote stopped sending under `terminate_on_remote_eof`
    RemoteEof,
    /// The channel was closed or disconnected by the remote
    Disconnected(Disconnect),
    /// Both flows finished
    Completed,
    /// The session was cancelled (Ctrl+C)
    Cancelled,
}

impl SessionEnd {
    /// Process exit status for this ending
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionEnd::Cancelled => 130,
            _ => 0,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::LocalEof => f.write_str("local input finished"),
            SessionEnd::RemoteEof => f.write_str("remote finished sending"),
            SessionEnd::Disconnected(reason) => write!(f, "{reason}"),
            SessionEnd::Completed => f.write_str("both directions finished"),
            SessionEnd::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Fatal bridge failures
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Copying local input to the remote failed
    #[error("copy from local input to {label} failed")]
    Outbound {
        label: String,
        #[source]
        source: io::Error,
    },

    /// Copying from the remote to local output failed
    #[error("copy from {label} to local output failed")]
    Inbound {
        label: String,
        #[source]
        source: io::Error,
    },

    /// Watching for the remote disconnect failed
    #[error("error while watching {label} for disconnect")]
    Watcher {
        label: String,
        #[source]
        source: io::Error,
    },
}

/// How the outbound flow ended
enum Outbound {
    /// Local input is exhausted and the session continues
    Finished,
    /// Local input is exhausted and policy ends the session
    Terminate,
    /// The remote closed the channel under an outbound write
    Disconnected(Disconnect),
    /// Copying failed
    Failed(io::Error),
}

enum FlowEvent {
    Outbound(Outbound),
    Watcher(io::Result<()>),
}

/// One bridge session over one endpoint
pub struct Bridge {
    endpoint: Arc<dyn Endpoint>,
    policy: BridgePolicy,
    cancel: CancelToken,
    state: SessionState,
    outbound_finished: bool,
}

impl Bridge {
    /// Creates a session for a freshly dialed endpoint
    pub fn new(endpoint: Arc<dyn Endpoint>, policy: BridgePolicy, cancel: CancelToken) -> Self {
        Self {
            endpoint,
            policy,
            cancel,
            state: SessionState::Connecting,
            outbound_finished: false,
        }
    }

    /// Runs both flows until the session ends, then closes the endpoint.
    pub fn run<R, W>(mut self, input: R, output: W) -> Result<SessionEnd, BridgeError>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        self.transition(SessionState::Bridging);
        let (events_tx, events) = unbounded();
        // Dropped on return, which releases the cancel guard thread
        let (_running, running) = bounded::<()>(0);
        self.spawn_cancel_guard(running);
        self.spawn_outbound(input, events_tx.clone());

        let result = self.inbound(output, &events_tx, &events);
        self.transition(SessionState::Terminated);
        if let Err(e) = self.endpoint.close() {
            debug!("Closing {} failed: {}", self.endpoint.label(), e);
        }
        result
    }

    fn inbound<W: Write>(
        &mut self,
        mut output: W,
        events_tx: &Sender<FlowEvent>,
        events: &Receiver<FlowEvent>,
    ) -> Result<SessionEnd, BridgeError> {
        let label = self.endpoint.label().to_owned();
        let copied = io::copy(&mut EndpointIo(self.endpoint.as_ref()), &mut output)
            .and_then(|bytes| output.flush().map(|()| bytes));

        // The outbound flow may be what interrupted the copy
        for event in events.try_iter() {
            if let Some(end) = self.on_event(event) {
                return end;
            }
        }

        match copied {
            Err(_) if self.cancel.is_cancelled() => return Ok(SessionEnd::Cancelled),
            Err(e) => {
                if let Some(reason) = classify_disconnect(&e) {
                    // A closed channel never carries more data; nothing to wait for
                    debug!("Copy from {} finished: {}", label, reason);
                    return Ok(SessionEnd::Disconnected(reason));
                }
                return Err(BridgeError::Inbound {
                    label,
                    source: e,
                });
            }
            Ok(bytes) => debug!(
                "Copy from {} to local output finished ({} bytes)",
                label, bytes
            ),
        }

        if self.policy.terminate_on_remote_eof {
            return Ok(SessionEnd::RemoteEof);
        }

        // Local consumers see end-of-stream while the session drains
        drop(output);
        self.transition(SessionState::Draining);
        if self.outbound_finished {
            return Ok(SessionEnd::Completed);
        }
        if self.policy.watch_disconnect {
            self.spawn_watcher(events_tx.clone());
        }

        let cancelled = self.cancel.receiver().clone();
        loop {
            select! {
                recv(events) -> event => {
                    let Ok(event) = event else {
                        return Ok(SessionEnd::Completed);
                    };
                    if let Some(end) = self.on_event(event) {
                        return end;
                    }
                    if self.outbound_finished {
                        return Ok(SessionEnd::Completed);
                    }
                }
                recv(cancelled) -> _ => return Ok(SessionEnd::Cancelled),
            }
        }
    }

    /// Applies a flow event; `Some` ends the session
    fn on_event(&mut self, event: FlowEvent) -> Option<Result<SessionEnd, BridgeError>> {
        let label = self.endpoint.label();
        match event {
            FlowEvent::Outbound(Outbound::Finished) => {
                self.outbound_finished = true;
                None
            }
            FlowEvent::Outbound(Outbound::Terminate) => Some(Ok(SessionEnd::LocalEof)),
            FlowEvent::Outbound(Outbound::Disconnected(reason)) => {
                debug!("Copy to {} stopped: {}", label, reason);
                Some(Ok(SessionEnd::Disconnected(reason)))
            }
            FlowEvent::Outbound(Outbound::Failed(source)) => Some(Err(BridgeError::Outbound {
                label: label.to_owned(),
                source,
            })),
            FlowEvent::Watcher(Ok(())) => {
                debug!("{} disconnected", label);
                Some(Ok(SessionEnd::Disconnected(Disconnect::RemoteClosed)))
            }
            FlowEvent::Watcher(Err(_)) if self.cancel.is_cancelled() => {
                Some(Ok(SessionEnd::Cancelled))
            }
            FlowEvent::Watcher(Err(source)) => Some(Err(BridgeError::Watcher {
                label: label.to_owned(),
                source,
            })),
        }
    }

    fn spawn_outbound<R>(&self, mut input: R, events: Sender<FlowEvent>)
    where
        R: Read + Send + 'static,
    {
        let endpoint = Arc::clone(&self.endpoint);
        let policy = self.policy;
        thread::spawn(move || {
            let outcome = match io::copy(&mut input, &mut EndpointIo(endpoint.as_ref())) {
                Err(e) => match classify_disconnect(&e) {
                    Some(reason) => Outbound::Disconnected(reason),
                    None => Outbound::Failed(e),
                },
                Ok(bytes) => {
                    debug!(
                        "Copy from local input to {} finished ({} bytes)",
                        endpoint.label(),
                        bytes
                    );
                    if policy.terminate_on_local_eof {
                        Outbound::Terminate
                    } else {
                        if policy.close_write_on_local_eof {
                            close_write(endpoint.as_ref());
                        }
                        drop(input);
                        Outbound::Finished
                    }
                }
            };

            let interrupt = !matches!(outcome, Outbound::Finished);
            let _ = events.send(FlowEvent::Outbound(outcome));
            if interrupt {
                // Wakes the inbound flow, which then picks up the event above
                let _ = endpoint.close();
            }
        });
    }

    /// Watches for the remote disconnect once the inbound copy is done
    fn spawn_watcher(&self, events: Sender<FlowEvent>) {
        let endpoint = Arc::clone(&self.endpoint);
        thread::spawn(move || {
            let _ = events.send(FlowEvent::Watcher(endpoint.wait_disconnect()));
        });
    }

    /// Closes the endpoint when the session is cancelled while running
    fn spawn_cancel_guard(&self, running: Receiver<()>) {
        let endpoint = Arc::clone(&self.endpoint);
        let cancel = self.cancel.clone();
        thread::spawn(move || {
            select! {
                recv(cancel.receiver()) -> _ => {
                    debug!("Cancelled, closing {}", endpoint.label());
                    let _ = endpoint.close();
                }
                recv(running) -> _ => {}
            }
        });
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Best-effort half-close; transports without the capability are skipped
fn close_write(endpoint: &dyn Endpoint) {
    match endpoint.half_close() {
        Some(half) => {
            if let Err(e) = half.close_write() {
                debug!("Failed to half-close {}: {}", endpoint.label(), e);
            }
        }
        None => debug!("{} does not support half-close", endpoint.label()),
    }
}
