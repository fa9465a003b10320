#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use crate::stomp::Frame;
use crate::stomp::frame::MESSAGE;

/// Fragments of ERROR frame text that mean the server refused our credentials.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "unauthorised",
    "forbidden",
    "expired",
    "invalid token",
    "invalid jwt",
    "authentication",
    "access denied",
];

/// WebSocket and STOMP session error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The server answered with a STOMP ERROR frame
    Protocol {
        /// The frame's `message` header
        message: String,
        /// The frame's body, often a longer description
        details: String,
    },
    /// The server rejected the bearer token
    AuthenticationFailed(String),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// The server stopped sending heart-beats
    HeartbeatTimeout,
    /// Operation timed out
    Timeout,
    /// Received an invalid or unexpected message
    InvalidMessage(String),
    /// Reconnection stopped after the configured number of attempts
    GaveUp {
        /// Number of failed attempts
        attempts: u32,
    },
}

impl WsError {
    /// Build a protocol error from a STOMP ERROR frame.
    ///
    /// Frames whose text points at rejected credentials become
    /// [`WsError::AuthenticationFailed`].
    #[must_use]
    pub fn from_error_frame(frame: &Frame) -> Self {
        let message = frame.header(MESSAGE).unwrap_or_default().to_owned();
        if is_auth_failure(&message) || is_auth_failure(&frame.body) {
            return Self::AuthenticationFailed(message);
        }
        Self::Protocol {
            message,
            details: frame.body.clone(),
        }
    }

    /// Whether this error should trigger a token refresh instead of plain backoff.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::AuthenticationFailed(_) => true,
            Self::Connection(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                matches!(response.status().as_u16(), 401 | 403)
            }
            _ => false,
        }
    }
}

fn is_auth_failure(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    AUTH_FAILURE_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Protocol { message, details } if details.is_empty() => {
                write!(f, "STOMP error: {message}")
            }
            Self::Protocol { message, details } => write!(f, "STOMP error: {message} ({details})"),
            Self::AuthenticationFailed(reason) => {
                write!(f, "STOMP authentication failed: {reason}")
            }
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::HeartbeatTimeout => write!(f, "No heart-beat received from the server"),
            Self::Timeout => write!(f, "WebSocket operation timed out"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
            Self::GaveUp { attempts } => {
                write!(f, "Gave up reconnecting after {attempts} attempts")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        let kind = if e.is_auth_failure() {
            crate::error::Kind::Authentication
        } else {
            crate::error::Kind::WebSocket
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into()
    }
}
