use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::stomp::Frame;
use crate::stomp::frame::{DESTINATION, SUBSCRIPTION};

/// Extra STOMP headers attached to SUBSCRIBE or SEND frames.
pub type Headers = HashMap<String, String>;

/// A MESSAGE frame delivered through a subscription.
///
/// The body is kept as received and only parsed on demand.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Destination the message was published to
    pub destination: String,
    /// Id of the subscription that routed it, when the server supplied one
    pub subscription: Option<String>,
    /// All frame headers, in wire order
    pub headers: Vec<(String, String)>,
    /// Raw frame body
    pub body: String,
}

impl InboundMessage {
    #[must_use]
    pub fn new<D: Into<String>, B: Into<String>>(destination: D, body: B) -> Self {
        Self {
            destination: destination.into(),
            subscription: None,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Deserialize the body into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }

    /// Parse the body as JSON, falling back to the raw text when that fails.
    #[must_use]
    pub fn payload(&self) -> Payload {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(value) => Payload::Json(value),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    destination = %self.destination,
                    error = %e,
                    "Message body is not JSON, forwarding raw text"
                );
                #[cfg(not(feature = "tracing"))]
                let _: &serde_json::Error = &e;
                Payload::Raw(self.body.clone())
            }
        }
    }
}

impl From<Frame> for InboundMessage {
    fn from(frame: Frame) -> Self {
        Self {
            destination: frame.header(DESTINATION).unwrap_or_default().to_owned(),
            subscription: frame.header(SUBSCRIPTION).map(ToOwned::to_owned),
            headers: frame.headers,
            body: frame.body,
        }
    }
}

/// A message body as seen by channel subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The body parsed as JSON
    Json(Value),
    /// The body was not valid JSON and is passed through untouched
    Raw(String),
}

impl Payload {
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    #[must_use]
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Raw(raw) => Some(raw),
        }
    }

    /// Convert a JSON payload into `T`. Raw payloads yield `None`.
    #[must_use]
    pub fn to_typed<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(self.as_json()?).ok()
    }
}
