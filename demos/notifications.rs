//! Follows the per-user notification topic and logs session lifecycle events.
//!
//! This example shows how to:
//! 1. Create a `ConnectionManager` bound to a token provider
//! 2. Subscribe to `/message/{userId}` as a payload stream
//! 3. Observe reconnects and token refreshes through `ConnectionManager::events`
//!
//! Run with tracing enabled:
//! ```sh
//! STOMP_ENDPOINT=ws://localhost:8080/ws STOMP_TOKEN=... STOMP_USER=7 \
//!     RUST_LOG=info,stomp_session=debug cargo run --example notifications --features tracing
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use stomp_session::auth::AuthContext;
use stomp_session::ws::{Config, Headers};
use stomp_session::{ConnectionManager, MemoryTokenProvider, Payload};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let endpoint =
        std::env::var("STOMP_ENDPOINT").unwrap_or_else(|_| "ws://localhost:8080/ws".to_owned());
    let token = std::env::var("STOMP_TOKEN").unwrap_or_default();
    let user_id = std::env::var("STOMP_USER").unwrap_or_else(|_| "7".to_owned());

    let tokens = Arc::new(MemoryTokenProvider::with_context(AuthContext::new(
        token,
        user_id.as_str(),
    )));
    let manager = ConnectionManager::new(&endpoint, Config::default(), tokens)?;

    let mut events = manager.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "session event");
        }
    });

    let handle = manager.get_client().await?;
    info!(generation = handle.generation(), %endpoint, "connected");

    let topic = format!("/message/{user_id}");
    let Some(stream) = handle.channel().subscribe_stream(&topic, Headers::new()) else {
        warn!(%topic, "connection dropped before subscribing");
        return Ok(());
    };
    let mut stream = Box::pin(stream);

    while let Ok(Some(payload)) = timeout(Duration::from_secs(60), stream.next()).await {
        match payload {
            Payload::Json(value) => info!(%topic, %value, "notification"),
            Payload::Raw(text) => warn!(%topic, %text, "non-JSON notification"),
            _ => {}
        }
    }

    let status = manager.status();
    info!(
        state = ?status.state,
        subscriptions = status.subscriptions,
        reconnect_attempts = status.reconnect_attempts,
        "shutting down"
    );
    manager.teardown().await;

    Ok(())
}
