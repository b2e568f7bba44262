use std::{fmt, path::PathBuf, time::Duration};

use pipe_relay_common::POLL_INTERVAL;

/// What to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A named pipe (a Unix domain socket path outside Windows)
    Pipe(PathBuf),
    /// An Assuan handshake file advertising a loopback port and secret
    Assuan(PathBuf),
    /// A loopback TCP port, connected to directly without a handshake
    Port(u16),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pipe(path) => write!(f, "pipe {}", path.display()),
            Target::Assuan(path) => write!(f, "assuan socket {}", path.display()),
            Target::Port(port) => write!(f, "127.0.0.1:{port}"),
        }
    }
}

/// How the bridge reacts to end-of-stream on either side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgePolicy {
    /// Half-close the endpoint once local input is exhausted
    pub close_write_on_local_eof: bool,
    /// End the session as soon as the remote stops sending
    pub terminate_on_remote_eof: bool,
    /// End the session as soon as local input is exhausted
    pub terminate_on_local_eof: bool,
    /// After the remote stops sending, keep watching for its disconnect
    pub watch_disconnect: bool,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            close_write_on_local_eof: false,
            terminate_on_remote_eof: false,
            terminate_on_local_eof: false,
            watch_disconnect: true,
        }
    }
}

/// Configuration for one relay run, built once at startup
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Endpoint to dial
    pub target: Target,
    /// Keep retrying while the target does not exist or listen yet
    pub poll: bool,
    /// Pause between retries
    pub poll_interval: Duration,
    /// End-of-stream handling
    pub policy: BridgePolicy,
    /// Verbose diagnostics on stderr
    pub verbose: bool,
}

impl RelayConfig {
    /// Creates a configuration with default policy for `target`
    pub fn new(target: Target) -> Self {
        Self {
            target,
            poll: false,
            poll_interval: POLL_INTERVAL,
            policy: BridgePolicy::default(),
            verbose: false,
        }
    }

    /// Enable polling until the target becomes available
    pub fn with_poll(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    /// Set the pause between poll attempts
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the end-of-stream policy
    pub fn with_policy(mut self, policy: BridgePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_a_plain_relay() {
        let config = RelayConfig::new(Target::Port(1));
        assert!(!config.poll);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.policy, BridgePolicy::default());
        assert!(config.policy.watch_disconnect);
    }

    #[test]
    fn targets_render_for_logs() {
        assert_eq!(Target::Port(8080).to_string(), "127.0.0.1:8080");
        assert_eq!(
            Target::Pipe(PathBuf::from("agent.sock")).to_string(),
            "pipe agent.sock"
        );
    }
}
