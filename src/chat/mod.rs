//! Chat on top of the STOMP session.
//!
//! Chat frames carry an optional `command`: `EDIT` and `DELETE` patch an
//! earlier message, anything else is a new message. [`ChatEvent`] performs
//! that classification and [`MessageLog`] applies it to an ordered history.
//! [`ChatClient`] wires both to a [`crate::ws::MessageChannel`] and keeps
//! per-conversation unread counters.
//!
//! **Feature flag:** `chat`

pub mod client;
pub mod log;
pub mod types;

pub use client::{ChatClient, ChatConfig};
pub use log::{Applied, LogEntry, MessageLog, Toast};
pub use types::{
    Attachment, ChatEvent, ChatMessage, Command, CommandRequest, NewMessageRequest, Sender,
};
