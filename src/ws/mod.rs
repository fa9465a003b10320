//! STOMP session over a single WebSocket.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the one live connection, reconnects with
//!   backoff and follows token refreshes
//! - [`SubscriptionRegistry`]: remembers subscriptions and replays them after
//!   every reconnect
//! - [`MessageChannel`]: JSON publish/subscribe helpers with an optional
//!   outbound queue
//! - [`ReconnectPolicy`]: the backoff state machine
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new("wss://api.example.com/ws", Config::default(), tokens)?;
//! manager.get_client().await?;
//!
//! let channel = manager.channel();
//! channel.subscribe_to_channel("/chat/42", |payload| println!("{payload:?}"), Headers::new());
//! channel.send_message("/app/chat/42", &message, &Headers::new());
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod policy;
mod queue;
pub mod registry;
pub mod traits;

pub use channel::MessageChannel;
pub use config::{AuthConfig, Config, ReconnectConfig};
pub use connection::{
    ConnectionEvent, ConnectionHandle, ConnectionManager, ErrorInfo, PendingConnection, Status,
};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use message::{Headers, InboundMessage, Payload};
pub use policy::{ConnectionState, Decision, ReconnectPolicy};
pub use registry::{SubscriptionInfo, SubscriptionRegistry};
pub use traits::*;
