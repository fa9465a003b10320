use std::sync::{Arc, Mutex, PoisonError};

use bon::Builder;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};

use super::log::{Applied, MessageLog, Toast};
use super::types::{Attachment, ChatEvent, Command, CommandRequest, NewMessageRequest};
use crate::Result;
use crate::ws::{Headers, MessageChannel, Payload, SubscriptionInfo};

const DEFAULT_SEND_PREFIX: &str = "/app";
const DEFAULT_CHAT_PREFIX: &str = "/chat";
const DEFAULT_NOTIFICATION_PREFIX: &str = "/message";
const TOAST_CAPACITY: usize = 64;

/// Destination layout of the chat server.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ChatConfig {
    /// Prefix for application destinations that SENDs go to
    #[builder(into, default = DEFAULT_SEND_PREFIX.to_owned())]
    pub send_prefix: String,
    /// Prefix of per-conversation topics: `{chat_prefix}/{chatId}`
    #[builder(into, default = DEFAULT_CHAT_PREFIX.to_owned())]
    pub chat_prefix: String,
    /// Prefix of per-user notification topics: `{notification_prefix}/{userId}`
    #[builder(into, default = DEFAULT_NOTIFICATION_PREFIX.to_owned())]
    pub notification_prefix: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ChatConfig {
    /// Topic carrying messages for one conversation.
    #[must_use]
    pub fn chat_topic(&self, chat_id: &str) -> String {
        format!("{}/{chat_id}", self.chat_prefix)
    }

    /// Topic carrying account-level notifications for one user.
    #[must_use]
    pub fn notification_topic(&self, user_id: &str) -> String {
        format!("{}/{user_id}", self.notification_prefix)
    }

    /// Destination that messages for one conversation are sent to.
    #[must_use]
    pub fn send_destination(&self, chat_id: &str) -> String {
        format!("{}{}", self.send_prefix, self.chat_topic(chat_id))
    }
}

/// Chat on top of a [`MessageChannel`]: typed events, unread counters and toasts.
///
/// # Example
///
/// ```ignore
/// let chat = ChatClient::new(manager.channel(), "7");
/// let log = Arc::new(Mutex::new(MessageLog::new()));
/// chat.follow_chat("42", Arc::clone(&log));
///
/// let mut toasts = chat.toasts();
/// while let Ok(toast) = toasts.recv().await {
///     println!("{}: {}", toast.sender, toast.preview);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ChatClient {
    channel: MessageChannel,
    config: ChatConfig,
    user_id: String,
    unread: Arc<DashMap<String, usize>>,
    toasts: broadcast::Sender<Toast>,
}

impl ChatClient {
    /// Chat client for the local user `user_id`, using [`ChatConfig::default`].
    #[must_use]
    pub fn new<U: Into<String>>(channel: MessageChannel, user_id: U) -> Self {
        Self::with_config(channel, user_id, ChatConfig::default())
    }

    #[must_use]
    pub fn with_config<U: Into<String>>(
        channel: MessageChannel,
        user_id: U,
        config: ChatConfig,
    ) -> Self {
        let (toasts, _) = broadcast::channel(TOAST_CAPACITY);
        Self {
            channel,
            config,
            user_id: user_id.into(),
            unread: Arc::new(DashMap::new()),
            toasts,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Receive every parsed event on a conversation.
    ///
    /// Frames that are not valid chat events are logged and skipped.
    /// Returns `None` when not connected.
    pub fn subscribe_chat<F>(&self, chat_id: &str, handler: F) -> Option<SubscriptionInfo>
    where
        F: Fn(ChatEvent) + Send + Sync + 'static,
    {
        let topic = self.config.chat_topic(chat_id);
        self.channel.subscribe_to_channel(
            &topic,
            move |payload| match ChatEvent::from_payload(&payload) {
                Ok(event) => handler(event),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, ?payload, "Skipping malformed chat frame");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            },
            Headers::new(),
        )
    }

    /// [`ChatClient::subscribe_chat`] as a stream.
    pub fn chat_events(
        &self,
        chat_id: &str,
    ) -> Option<impl Stream<Item = ChatEvent> + Send + use<>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribe_chat(chat_id, move |event| {
            _ = tx.send(event);
        })?;

        Some(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        })
    }

    /// Keep `log` in sync with a conversation.
    ///
    /// New messages from other users bump the conversation's unread count and
    /// are published on [`ChatClient::toasts`].
    pub fn follow_chat(&self, chat_id: &str, log: Arc<Mutex<MessageLog>>) -> Option<SubscriptionInfo> {
        let chat = chat_id.to_owned();
        let user_id = self.user_id.clone();
        let unread = Arc::clone(&self.unread);
        let toasts = self.toasts.clone();

        self.subscribe_chat(chat_id, move |event| {
            let applied = log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(event, Some(&user_id));

            match applied {
                Applied::Appended { unread: counts, toast, .. } => {
                    if counts {
                        *unread.entry(chat.clone()).or_insert(0) += 1;
                    }
                    if let Some(toast) = toast {
                        // Nobody listening for toasts is fine.
                        _ = toasts.send(toast);
                    }
                }
                Applied::Ignored { id } => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(chat = %chat, %id, "Edit or delete for unknown message");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &id;
                }
                _ => {}
            }
        })
    }

    /// Stop receiving a conversation. Safe to call repeatedly.
    pub fn leave_chat(&self, chat_id: &str) -> bool {
        self.channel
            .manager()
            .unsubscribe(&self.config.chat_topic(chat_id))
    }

    /// Receive account-level notifications for the local user.
    pub fn subscribe_notifications<F>(&self, handler: F) -> Option<SubscriptionInfo>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let topic = self.config.notification_topic(&self.user_id);
        self.channel
            .subscribe_to_channel(&topic, handler, Headers::new())
    }

    /// Post a message. Returns `false` when not connected.
    pub fn send<C: Into<String>>(&self, chat_id: &str, content: C, attachments: Vec<Attachment>) -> bool {
        let request = NewMessageRequest::builder()
            .chat_id(chat_id)
            .content(content)
            .attachments(attachments)
            .build();
        self.channel.send_message(
            &self.config.send_destination(chat_id),
            &request,
            &Headers::new(),
        )
    }

    /// Post a message, waiting out a disconnect.
    pub async fn send_queued<C: Into<String>>(&self, chat_id: &str, content: C) -> Result<()> {
        let request = NewMessageRequest::builder()
            .chat_id(chat_id)
            .content(content)
            .build();
        self.channel
            .send_queued(&self.config.send_destination(chat_id), &request, Headers::new())
            .await
    }

    /// Replace the content of one of our messages.
    pub fn edit<C: Into<String>>(&self, chat_id: &str, message_id: &str, content: C) -> bool {
        let request = CommandRequest::builder()
            .command(Command::Edit)
            .id(message_id)
            .chat_id(chat_id)
            .content(content)
            .build();
        self.channel.send_message(
            &self.config.send_destination(chat_id),
            &request,
            &Headers::new(),
        )
    }

    /// Delete one of our messages.
    pub fn delete(&self, chat_id: &str, message_id: &str) -> bool {
        let request = CommandRequest::builder()
            .command(Command::Delete)
            .id(message_id)
            .chat_id(chat_id)
            .build();
        self.channel.send_message(
            &self.config.send_destination(chat_id),
            &request,
            &Headers::new(),
        )
    }

    #[must_use]
    pub fn unread(&self, chat_id: &str) -> usize {
        self.unread.get(chat_id).map_or(0, |count| *count)
    }

    #[must_use]
    pub fn total_unread(&self) -> usize {
        self.unread.iter().map(|entry| *entry.value()).sum()
    }

    pub fn mark_read(&self, chat_id: &str) {
        _ = self.unread.remove(chat_id);
    }

    /// Toasts for messages from other users in followed conversations.
    #[must_use]
    pub fn toasts(&self) -> broadcast::Receiver<Toast> {
        self.toasts.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_topics() {
        let config = ChatConfig::default();
        assert_eq!(config.chat_topic("42"), "/chat/42");
        assert_eq!(config.notification_topic("7"), "/message/7");
        assert_eq!(config.send_destination("42"), "/app/chat/42");
    }

    #[test]
    fn custom_prefixes() {
        let config = ChatConfig::builder()
            .send_prefix("/ws-app")
            .chat_prefix("/topic/chat")
            .build();
        assert_eq!(config.chat_topic("1"), "/topic/chat/1");
        assert_eq!(config.send_destination("1"), "/ws-app/topic/chat/1");
        assert_eq!(config.notification_topic("1"), "/message/1");
    }
}
