#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::stomp::HeartBeat;

const DEFAULT_HEARTBEAT_DURATION: Duration = Duration::from_secs(4);
const DEFAULT_HEARTBEAT_TOLERANCE: u32 = 2;
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_SEND_QUEUE_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_WAIT_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_TOKEN_POLL_DURATION: Duration = Duration::from_millis(250);
const DEFAULT_TOKEN_REFRESH_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Configuration for the STOMP session.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Heart-beat intervals offered in the CONNECT frame
    pub heartbeat: HeartBeat,
    /// Missed incoming heart-beat intervals tolerated before the link is considered dead
    pub heartbeat_tolerance: u32,
    /// Upper bound for [`crate::ws::ConnectionManager::get_client`] to wait for CONNECTED
    pub connect_timeout: Duration,
    /// Time allowed for the WebSocket upgrade plus the CONNECT/CONNECTED exchange
    pub handshake_timeout: Duration,
    /// How long a queued send waits for the connection to come back
    pub send_queue_timeout: Duration,
    /// Token acquisition before each connection attempt
    pub auth: AuthConfig,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    /// Value of the CONNECT `host` header; defaults to the endpoint host
    pub virtual_host: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat: HeartBeat::new(DEFAULT_HEARTBEAT_DURATION, DEFAULT_HEARTBEAT_DURATION),
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_DURATION,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            send_queue_timeout: DEFAULT_SEND_QUEUE_TIMEOUT_DURATION,
            auth: AuthConfig::default(),
            reconnect: ReconnectConfig::default(),
            virtual_host: None,
        }
    }
}

/// How the session waits for a usable token before connecting.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Maximum time to wait for a valid token before connecting without one
    pub token_wait: Duration,
    /// Interval between token validity checks while waiting
    pub token_poll_interval: Duration,
    /// Maximum time a forced refresh may take after the server rejected our token
    pub refresh_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_wait: DEFAULT_TOKEN_WAIT_DURATION,
            token_poll_interval: DEFAULT_TOKEN_POLL_DURATION,
            refresh_timeout: DEFAULT_TOKEN_REFRESH_TIMEOUT_DURATION,
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before entering the error state.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Initial backoff duration for first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // Delays must never shrink between attempts
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence_doubles() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = config.into();

        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 3.0,
            max_attempts: None,
        };
        let mut backoff: ExponentialBackoff = config.into();

        // Exhaust several iterations
        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        let duration = backoff.next_backoff().unwrap();
        assert_eq!(duration, Duration::from_secs(2));
    }

    #[test]
    fn default_heartbeat_is_four_seconds_both_ways() {
        let config = Config::default();
        assert_eq!(config.heartbeat.to_header(), "4000,4000");
        assert_eq!(config.send_queue_timeout, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_backoff, Duration::from_secs(30));
    }
}
