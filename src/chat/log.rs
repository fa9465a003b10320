use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use super::types::{ChatEvent, ChatMessage};

/// Longest toast preview, in characters.
const PREVIEW_CHARS: usize = 80;

/// One message in a [`MessageLog`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub message: ChatMessage,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    /// Tombstoned by a DELETE. The content is cleared but the entry keeps its place.
    pub deleted: bool,
}

/// Notification to surface for a message from someone else.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub chat_id: Option<String>,
    pub message_id: String,
    pub sender: String,
    pub preview: String,
}

/// What applying a [`ChatEvent`] did to the log.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A new message was appended at `index`
    Appended {
        index: usize,
        /// Whether the message counts towards the unread total
        unread: bool,
        toast: Option<Toast>,
    },
    Edited { id: String },
    Deleted { id: String },
    /// A message with this id is already in the log
    Duplicate { id: String },
    /// EDIT or DELETE for an id the log does not hold, or that is already deleted
    Ignored { id: String },
}

/// Ordered message history for one conversation.
///
/// Messages stay in arrival order. The socket is not the source of truth for
/// history: callers seed the log from a history fetch with
/// [`MessageLog::extend`] and feed it live events with [`MessageLog::apply`].
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: IndexMap<String, LogEntry>,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append already-known messages without producing side effects.
    pub fn extend<I: IntoIterator<Item = ChatMessage>>(&mut self, messages: I) {
        for message in messages {
            if !self.entries.contains_key(&message.id) {
                self.entries.insert(message.id.clone(), LogEntry::new(message));
            }
        }
    }

    /// Apply one live event.
    ///
    /// `self_user_id` identifies the local user, whose own messages neither
    /// count as unread nor raise a toast.
    pub fn apply(&mut self, event: ChatEvent, self_user_id: Option<&str>) -> Applied {
        match event {
            ChatEvent::New(message) => {
                if self.entries.contains_key(&message.id) {
                    return Applied::Duplicate { id: message.id };
                }

                let from_other = match (message.sender_id(), self_user_id) {
                    (Some(sender), Some(me)) => sender != me,
                    _ => true,
                };
                let toast = from_other.then(|| Toast::for_message(&message));
                let (index, _) = self
                    .entries
                    .insert_full(message.id.clone(), LogEntry::new(message));

                Applied::Appended {
                    index,
                    unread: from_other,
                    toast,
                }
            }
            ChatEvent::Edit {
                id,
                content,
                edited_at,
            } => match self.entries.get_mut(&id) {
                Some(entry) if !entry.deleted => {
                    entry.message.content = content;
                    entry.edited = true;
                    entry.edited_at = Some(edited_at.unwrap_or_else(Utc::now));
                    Applied::Edited { id }
                }
                _ => Applied::Ignored { id },
            },
            ChatEvent::Delete { id } => match self.entries.get_mut(&id) {
                Some(entry) if !entry.deleted => {
                    entry.deleted = true;
                    entry.message.content.clear();
                    entry.message.attachment = None;
                    entry.message.attachments.clear();
                    Applied::Deleted { id }
                }
                _ => Applied::Ignored { id },
            },
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LogEntry> {
        self.entries.get(id)
    }

    /// Entries in arrival order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values()
    }

    /// Entries in arrival order, without tombstones.
    pub fn visible(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.values().filter(|entry| !entry.deleted)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LogEntry {
    fn new(message: ChatMessage) -> Self {
        Self {
            message,
            edited: false,
            edited_at: None,
            deleted: false,
        }
    }
}

impl Toast {
    fn for_message(message: &ChatMessage) -> Self {
        let sender = message
            .sender
            .as_ref()
            .map(|sender| sender.username.clone())
            .unwrap_or_default();
        let mut preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        if message.content.chars().nth(PREVIEW_CHARS).is_some() {
            preview.push('…');
        }

        Self {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            sender,
            preview,
        }
    }
}
