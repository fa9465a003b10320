//! Re-exported types from external crates for convenience.
//!
//! These types appear in this crate's public API and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for message timestamps and error records.
pub use chrono::{DateTime, Utc};
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
/// Untyped JSON, as carried by [`crate::ws::Payload::Json`].
pub use serde_json::Value;
/// Endpoint URL type.
pub use url::Url;
