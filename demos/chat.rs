//! Minimal terminal chat: follows one conversation and posts lines from stdin.
//!
//! This example shows how to:
//! 1. Install the process-wide manager with `global::init`
//! 2. Keep a `MessageLog` in sync with `/chat/{chatId}`, including edits and deletes
//! 3. Post, edit and delete messages through `ChatClient`
//!
//! Lines typed on stdin are sent as messages. `/edit <id> <text>` and
//! `/delete <id>` patch earlier messages.
//!
//! Run with tracing enabled:
//! ```sh
//! STOMP_ENDPOINT=ws://localhost:8080/ws STOMP_TOKEN=... STOMP_USER=7 CHAT_ID=42 \
//!     RUST_LOG=info cargo run --example chat --features chat,tracing
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use stomp_session::auth::AuthContext;
use stomp_session::chat::{ChatClient, MessageLog};
use stomp_session::global;
use stomp_session::ws::Config;
use stomp_session::MemoryTokenProvider;
use tokio::io::{AsyncBufReadExt as _, BufReader};
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
    let chat_id = std::env::var("CHAT_ID").unwrap_or_else(|_| "42".to_owned());

    let tokens = Arc::new(MemoryTokenProvider::with_context(AuthContext::new(
        token,
        user_id.as_str(),
    )));
    let manager = global::init(&endpoint, Config::default(), tokens)?;
    let handle = manager.get_client().await?;

    let chat = ChatClient::new(handle.channel(), user_id);
    let log = Arc::new(Mutex::new(MessageLog::new()));
    chat.follow_chat(&chat_id, Arc::clone(&log));

    let mut toasts = chat.toasts();
    tokio::spawn(async move {
        while let Ok(toast) = toasts.recv().await {
            info!(from = %toast.sender, id = %toast.message_id, "{}", toast.preview);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match line.split_once(' ') {
            Some(("/edit", rest)) => match rest.split_once(' ') {
                Some((id, content)) => chat.edit(&chat_id, id, content),
                None => {
                    warn!("usage: /edit <id> <text>");
                    continue;
                }
            },
            Some(("/delete", id)) => chat.delete(&chat_id, id.trim()),
            _ if line.trim().is_empty() => continue,
            _ => chat.send(&chat_id, line.as_str(), Vec::new()),
        };

        if !sent {
            warn!("not connected, message dropped");
        }

        let log = log.lock().unwrap_or_else(PoisonError::into_inner);
        info!(
            messages = log.len(),
            visible = log.visible().count(),
            unread = chat.unread(&chat_id),
            "conversation"
        );
        chat.mark_read(&chat_id);
    }

    global::teardown().await;
    Ok(())
}
