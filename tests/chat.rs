#![cfg(feature = "chat")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{MockStompServer, WAIT, manager};
use futures_util::StreamExt as _;
use serde_json::{Value, json};
use stomp_session::chat::{Attachment, ChatClient, ChatEvent, MessageLog};
use stomp_session::stomp::Command;
use stomp_session::stomp::frame::DESTINATION;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{Instant, sleep, timeout};

/// Poll `check` until it holds or [`WAIT`] runs out.
async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn new_message(id: u32, sender: u32, content: &str) -> String {
    json!({
        "id": id,
        "content": content,
        "sender": {"id": sender, "username": format!("user{sender}")},
        "sentAt": "2024-05-01T10:00:00",
        "chatId": 42
    })
    .to_string()
}

async fn connected_chat(server: &MockStompServer) -> ChatClient {
    let manager = manager(server, "token-a");
    let handle = manager.get_client().await.unwrap();
    ChatClient::new(handle.channel(), "7")
}

#[tokio::test]
async fn follow_chat_applies_new_edit_and_delete() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;
    let log = Arc::new(Mutex::new(MessageLog::new()));
    let mut toasts = chat.toasts();

    chat.follow_chat("42", Arc::clone(&log)).unwrap();
    server.wait_for_frames(Command::Subscribe, 1).await;

    server.publish("/chat/42", &new_message(1, 3, "helo"));
    server.publish("/chat/42", &new_message(2, 7, "my own"));
    server.publish(
        "/chat/42",
        &json!({"command": "EDIT", "id": 1, "content": "hello"}).to_string(),
    );
    server.publish(
        "/chat/42",
        &json!({"command": "DELETE", "id": "2"}).to_string(),
    );

    assert!(eventually(|| log.lock().unwrap().get("2").is_some_and(|entry| entry.deleted)).await);

    {
        let log = log.lock().unwrap();
        let first = log.get("1").unwrap();
        assert_eq!(first.message.content, "hello");
        assert!(first.edited);
        assert_eq!(log.len(), 2);
        assert_eq!(log.visible().count(), 1);
    }

    let toast = timeout(WAIT, toasts.recv()).await.unwrap().unwrap();
    assert_eq!(toast.sender, "user3");
    assert_eq!(toast.message_id, "1");
    assert_eq!(toast.chat_id.as_deref(), Some("42"));

    // Our own message neither counts as unread nor raises a toast.
    assert_eq!(chat.unread("42"), 1);
    assert_eq!(chat.total_unread(), 1);
    assert!(matches!(toasts.try_recv(), Err(TryRecvError::Empty)));

    chat.mark_read("42");
    assert_eq!(chat.unread("42"), 0);
}

#[tokio::test]
async fn duplicate_and_unknown_events_leave_log_untouched() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;
    let log = Arc::new(Mutex::new(MessageLog::new()));
    chat.follow_chat("42", Arc::clone(&log)).unwrap();
    server.wait_for_frames(Command::Subscribe, 1).await;

    server.publish("/chat/42", &new_message(1, 3, "hi"));
    server.publish("/chat/42", &new_message(1, 3, "hi again"));
    server.publish(
        "/chat/42",
        &json!({"command": "EDIT", "id": 99, "content": "ghost"}).to_string(),
    );
    server.publish("/chat/42", "garbage");
    server.publish("/chat/42", &new_message(2, 3, "still here"));

    assert!(eventually(|| log.lock().unwrap().len() == 2).await);
    let log = log.lock().unwrap();
    assert_eq!(log.get("1").unwrap().message.content, "hi");
    assert!(!log.get("1").unwrap().edited);
    assert_eq!(chat.unread("42"), 2);
}

#[tokio::test]
async fn unrecognised_command_is_appended_as_new_message() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;
    let log = Arc::new(Mutex::new(MessageLog::new()));
    chat.follow_chat("42", Arc::clone(&log)).unwrap();
    server.wait_for_frames(Command::Subscribe, 1).await;

    server.publish(
        "/chat/42",
        &json!({
            "command": "PIN",
            "id": 9,
            "content": "pinned",
            "sender": {"id": 3, "username": "user3"}
        })
        .to_string(),
    );

    assert!(eventually(|| log.lock().unwrap().get("9").is_some()).await);
    assert_eq!(log.lock().unwrap().get("9").unwrap().message.content, "pinned");
    assert_eq!(chat.unread("42"), 1);
}

#[tokio::test]
async fn chat_events_stream_classifies_commands() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;
    let mut events = Box::pin(chat.chat_events("42").unwrap());
    server.wait_for_frames(Command::Subscribe, 1).await;

    server.publish("/chat/42", &new_message(5, 3, "hey"));
    server.publish("/chat/42", "not json");
    server.publish(
        "/chat/42",
        &json!({"command": "EDIT", "id": 5, "content": "hey!"}).to_string(),
    );
    server.publish("/chat/42", &json!({"command": "DELETE", "id": 5}).to_string());

    let first = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert!(matches!(&first, ChatEvent::New(message) if message.id == "5"));

    let second = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert!(matches!(&second, ChatEvent::Edit { content, .. } if content == "hey!"));

    let third = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert_eq!(third, ChatEvent::Delete { id: "5".to_owned() });
}

#[tokio::test]
async fn send_edit_and_delete_target_app_destination() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;

    let attachment = Attachment::builder()
        .url("https://cdn.example.com/a.png")
        .content_type("image/png")
        .build();
    assert!(chat.send("42", "hello", vec![attachment]));
    assert!(chat.edit("42", "11", "hello!"));
    assert!(chat.delete("42", "11"));

    let sends = server.wait_for_frames(Command::Send, 3).await;
    assert!(
        sends
            .iter()
            .all(|frame| frame.header(DESTINATION) == Some("/app/chat/42"))
    );

    let bodies: Vec<Value> = sends
        .iter()
        .map(|frame| serde_json::from_str(&frame.body).unwrap())
        .collect();
    assert_eq!(
        bodies[0],
        json!({
            "chatId": "42",
            "content": "hello",
            "attachments": [{"url": "https://cdn.example.com/a.png", "type": "image/png"}]
        })
    );
    assert_eq!(
        bodies[1],
        json!({"command": "EDIT", "id": "11", "chatId": "42", "content": "hello!"})
    );
    assert_eq!(
        bodies[2],
        json!({"command": "DELETE", "id": "11", "chatId": "42"})
    );
}

#[tokio::test]
async fn notifications_and_leave_chat() {
    let server = MockStompServer::start().await;
    let chat = connected_chat(&server).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    chat.subscribe_notifications(move |payload| {
        drop(tx.send(payload));
    })
    .unwrap();
    chat.subscribe_chat("42", |_| {}).unwrap();
    server.wait_for_frames(Command::Subscribe, 2).await;
    assert_eq!(server.subscribed_destinations(), ["/message/7", "/chat/42"]);

    server.publish("/message/7", r#"{"type":"FRIEND_REQUEST","from":3}"#);
    let notification = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(notification.as_json().unwrap()["type"], "FRIEND_REQUEST");

    assert!(chat.leave_chat("42"));
    assert!(!chat.leave_chat("42"));
    assert_eq!(server.wait_for_frames(Command::Unsubscribe, 1).await.len(), 1);
}
