//! STOMP 1.2 wire format.
//!
//! Frames travel one (or a few) per WebSocket text message. A message made
//! only of EOLs is a heart-beat.

pub mod frame;

use std::time::Duration;

pub use frame::{Command, Frame, FrameError, decode, is_heartbeat};

/// Protocol version advertised in CONNECT frames.
pub const ACCEPT_VERSION: &str = "1.2";

/// A `heart-beat` header value: what one side can send and what it wants to receive.
///
/// A zero duration means "not supported" for that direction.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl HeartBeat {
    #[must_use]
    pub const fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Parse an `outgoing,incoming` millisecond pair. Malformed values disable heart-beating.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let Some((outgoing, incoming)) = value.split_once(',') else {
            return Self::default();
        };
        let millis = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .unwrap_or_default()
        };
        Self::new(millis(outgoing), millis(incoming))
    }

    #[must_use]
    pub fn to_header(self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Negotiate the effective intervals from our (client) settings and the
    /// server's CONNECTED header.
    #[must_use]
    pub fn negotiate(self, server: HeartBeat) -> Negotiated {
        let pick = |ours: Duration, theirs: Duration| {
            (!ours.is_zero() && !theirs.is_zero()).then(|| ours.max(theirs))
        };

        Negotiated {
            send_every: pick(self.outgoing, server.incoming),
            expect_within: pick(self.incoming, server.outgoing),
        }
    }
}

/// Heart-beat intervals agreed for one connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    /// How often we must send something, if at all
    pub send_every: Option<Duration>,
    /// How often the server promised to send something, if at all
    pub expect_within: Option<Duration>,
}
