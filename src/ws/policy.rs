use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;

use super::config::ReconnectConfig;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, and not trying to be
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the backoff delay before the next attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
        /// Delay before the attempt starts
        delay: Duration,
    },
    /// Reconnection gave up, or the session could not be re-authenticated.
    /// Left only through a manual reconnect or a token refresh.
    Error,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a connection attempt is underway or scheduled.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

/// What to do after a connection attempt failed or a live connection dropped.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Stop and enter [`ConnectionState::Error`]
    GiveUp { attempts: u32 },
}

/// Exponential-backoff bookkeeping for reconnects.
///
/// Failures `1..=max_attempts` yield [`Decision::Retry`] with non-decreasing
/// delays capped at `max_backoff`; failure `max_attempts + 1` gives up.
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            backoff: config.clone().into(),
            config,
            attempts: 0,
        }
    }

    /// Failed attempts since the last successful connection.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and decide whether to retry.
    pub fn on_failure(&mut self) -> Decision {
        self.attempts = self.attempts.saturating_add(1);

        if let Some(max) = self.config.max_attempts
            && self.attempts > max
        {
            return Decision::GiveUp {
                attempts: self.attempts - 1,
            };
        }

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_backoff);
        Decision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// Forget all failures: after CONNECTED, a manual reconnect or a token refresh.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }
}
