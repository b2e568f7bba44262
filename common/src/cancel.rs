use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// Cancellation signal shared by retry loops and bridge flows.
///
/// Cancelling drops the only sender, so every receiver observes a
/// disconnected channel at once and no message ever needs to be sent.
#[derive(Clone)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    /// Creates a token that has not been cancelled
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }

    /// Cancels the token and every clone of it
    pub fn cancel(&self) {
        if let Ok(mut trigger) = self.trigger.lock() {
            trigger.take();
        }
    }

    /// Whether [`CancelToken::cancel`] has been called
    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        matches!(
            self.signal.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }

    /// Channel that becomes ready once the token is cancelled, for use with
    /// `crossbeam_channel::select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
