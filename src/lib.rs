#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
#[cfg(feature = "chat")]
pub mod chat;
pub mod error;
pub mod global;
#[cfg(feature = "chat")]
pub(crate) mod serde_helpers;
pub mod stomp;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use auth::{AuthContext, MemoryTokenProvider, TokenProvider};
pub use ws::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState, InboundMessage,
    MessageChannel, Payload, Status,
};
