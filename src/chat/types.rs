use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, skip_serializing_none};
use strum_macros::Display;

use crate::Result;
use crate::error::Error;
use crate::serde_helpers::{StringFromAny, TimestampFromAny};
use crate::ws::Payload;

/// The `command` discriminator on chat frames. Absent or unrecognised means a
/// new message.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Edit,
    Delete,
}

/// Author of a chat message.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Sender {
    #[serde_as(as = "StringFromAny")]
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// A file attached to a message.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Attachment {
    #[builder(into)]
    pub url: String,
    #[builder(into)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    #[builder(into)]
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

/// A chat message as delivered on `/chat/{chatId}`.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChatMessage {
    #[serde_as(as = "StringFromAny")]
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub sender: Option<Sender>,
    #[serde_as(as = "Option<TimestampFromAny>")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<StringFromAny>")]
    pub chat_id: Option<String>,
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatMessage {
    /// Id of the sender, if the frame named one.
    #[must_use]
    pub fn sender_id(&self) -> Option<&str> {
        self.sender.as_ref().map(|sender| sender.id.as_str())
    }

    /// The single `attachment` followed by the `attachments` list.
    pub fn all_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachment.iter().chain(&self.attachments)
    }
}

/// A parsed chat frame: the three-way `command` dispatch.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// No `command`, or one that is not recognised: append to the log
    New(ChatMessage),
    /// `EDIT`: replace the content of an existing message
    Edit {
        id: String,
        content: String,
        edited_at: Option<DateTime<Utc>>,
    },
    /// `DELETE`: tombstone an existing message
    Delete { id: String },
}

#[derive(Deserialize)]
struct Envelope {
    command: Option<String>,
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditFields {
    #[serde_as(as = "StringFromAny")]
    id: String,
    #[serde(default)]
    content: String,
    #[serde_as(as = "Option<TimestampFromAny>")]
    edited_at: Option<DateTime<Utc>>,
}

#[serde_as]
#[derive(Deserialize)]
struct DeleteFields {
    #[serde_as(as = "StringFromAny")]
    id: String,
}

impl ChatEvent {
    /// Classify a JSON chat frame by its `command` field.
    ///
    /// `EDIT` and `DELETE` patch the log; anything else is a new message.
    pub fn from_value(value: Value) -> Result<Self> {
        let Envelope { command } = Envelope::deserialize(&value)?;
        let event = match command.as_deref() {
            Some("EDIT") => {
                let EditFields {
                    id,
                    content,
                    edited_at,
                } = serde_json::from_value(value)?;
                Self::Edit {
                    id,
                    content,
                    edited_at,
                }
            }
            Some("DELETE") => {
                let DeleteFields { id } = serde_json::from_value(value)?;
                Self::Delete { id }
            }
            other => {
                #[cfg(feature = "tracing")]
                if let Some(command) = other {
                    tracing::debug!(%command, "Unrecognised chat command, treating as a new message");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
                Self::New(serde_json::from_value(value)?)
            }
        };
        Ok(event)
    }

    /// Classify a subscription payload. Raw (non-JSON) payloads are rejected.
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        match payload {
            Payload::Json(value) => Self::from_value(value.clone()),
            Payload::Raw(raw) => Err(Error::validation(format!(
                "chat frame is not JSON: {}",
                raw.chars().take(64).collect::<String>()
            ))),
        }
    }

    /// Id of the message this event creates or targets.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::New(message) => &message.id,
            Self::Edit { id, .. } | Self::Delete { id } => id,
        }
    }

    #[must_use]
    pub const fn command(&self) -> Option<Command> {
        match self {
            Self::New(_) => None,
            Self::Edit { .. } => Some(Command::Edit),
            Self::Delete { .. } => Some(Command::Delete),
        }
    }
}

/// Body of a new message SEND.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct NewMessageRequest {
    #[builder(into)]
    pub chat_id: String,
    #[builder(into)]
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub attachments: Vec<Attachment>,
}

/// Body of an `EDIT` or `DELETE` SEND.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Builder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CommandRequest {
    pub command: Command,
    #[builder(into)]
    pub id: String,
    #[builder(into)]
    pub chat_id: String,
    #[builder(into)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn absent_command_is_new_message() {
        let event = ChatEvent::from_value(json!({
            "id": 11,
            "content": "hello",
            "sender": {"id": 3, "username": "ana"},
            "sentAt": "2024-05-01T10:00:00",
            "chatId": 42,
            "attachments": [{"url": "https://cdn/x.png", "type": "image/png"}]
        }))
        .unwrap();

        let ChatEvent::New(message) = event else {
            panic!("expected a new message");
        };
        assert_eq!(message.id, "11");
        assert_eq!(message.sender_id(), Some("3"));
        assert_eq!(message.chat_id.as_deref(), Some("42"));
        assert_eq!(message.all_attachments().count(), 1);
        assert!(message.sent_at.is_some());
    }

    #[test]
    fn edit_and_delete_are_classified() {
        let edit = ChatEvent::from_value(json!({"command": "EDIT", "id": 7, "content": "hi"})).unwrap();
        assert_eq!(
            edit,
            ChatEvent::Edit {
                id: "7".to_owned(),
                content: "hi".to_owned(),
                edited_at: None
            }
        );
        assert_eq!(edit.command(), Some(Command::Edit));

        let delete = ChatEvent::from_value(json!({"command": "DELETE", "id": "7"})).unwrap();
        assert_eq!(delete, ChatEvent::Delete { id: "7".to_owned() });
        assert_eq!(delete.id(), "7");
    }

    #[test]
    fn unrecognised_command_is_new_message() {
        let event = ChatEvent::from_value(json!({
            "command": "PIN",
            "id": 9,
            "content": "x",
            "sender": {"id": 3, "username": "ana"}
        }))
        .unwrap();

        let ChatEvent::New(message) = event else {
            panic!("expected a new message");
        };
        assert_eq!(message.id, "9");
        assert_eq!(message.content, "x");

        let lowercase = ChatEvent::from_value(json!({"command": "edit", "id": 9})).unwrap();
        assert!(matches!(lowercase, ChatEvent::New(_)));
    }

    #[test]
    fn missing_id_and_raw_payloads_are_rejected() {
        assert!(ChatEvent::from_value(json!({"content": "no id"})).is_err());
        assert!(ChatEvent::from_value(json!({"command": "PIN", "content": "no id"})).is_err());
        assert!(ChatEvent::from_payload(&Payload::Raw("oops".to_owned())).is_err());
    }

    #[test]
    fn command_request_serializes_uppercase() {
        let request = CommandRequest::builder()
            .command(Command::Delete)
            .id("7")
            .chat_id("42")
            .build();

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"command": "DELETE", "id": "7", "chatId": "42"})
        );
    }
}
