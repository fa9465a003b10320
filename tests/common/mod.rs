#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and each test binary uses a subset of the helpers"
)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use stomp_session::auth::AuthContext;
use stomp_session::stomp::frame::{
    AUTHORIZATION, DESTINATION, HEART_BEAT, MESSAGE, SUBSCRIPTION, SUBSCRIPTION_ID,
};
use stomp_session::stomp::{Command, Frame, decode, is_heartbeat};
use stomp_session::ws::Config;
use stomp_session::{ConnectionManager, ConnectionState, MemoryTokenProvider};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(3);

/// Something the test asks every open connection to do.
#[derive(Debug, Clone)]
enum Action {
    /// Deliver a MESSAGE to every subscription on `destination`
    Publish { destination: String, body: String },
    /// Write a text message verbatim
    Raw(String),
    /// Drop the connection without a DISCONNECT
    CloseAll,
}

struct Shared {
    /// Every client frame received, across all connections
    frames: Mutex<Vec<Frame>>,
    /// Tokens answered with an ERROR frame instead of CONNECTED
    rejected: Mutex<HashSet<String>>,
    /// `heart-beat` header sent in CONNECTED
    heartbeat: Mutex<String>,
    connects: AtomicUsize,
    refusing: AtomicBool,
}

/// Minimal STOMP broker: answers CONNECT, tracks subscriptions per
/// connection and routes published bodies to them.
pub struct MockStompServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    actions: broadcast::Sender<Action>,
}

impl MockStompServer {
    /// Start a mock broker on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Arc::new(Shared {
            frames: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            heartbeat: Mutex::new("0,0".to_owned()),
            connects: AtomicUsize::new(0),
            refusing: AtomicBool::new(false),
        });
        let (actions, _) = broadcast::channel::<Action>(100);

        let accept_shared = Arc::clone(&shared);
        let accept_actions = actions.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                if accept_shared.refusing.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }

                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&accept_shared),
                    accept_actions.subscribe(),
                ));
            }
        });

        Self {
            addr,
            shared,
            actions,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Deliver `body` to every client subscribed to `destination`.
    pub fn publish(&self, destination: &str, body: &str) {
        drop(self.actions.send(Action::Publish {
            destination: destination.to_owned(),
            body: body.to_owned(),
        }));
    }

    /// Write `text` as-is to every open connection.
    pub fn send_raw(&self, text: &str) {
        drop(self.actions.send(Action::Raw(text.to_owned())));
    }

    /// Drop every open connection. New connections are still accepted.
    pub fn disconnect_all(&self) {
        drop(self.actions.send(Action::CloseAll));
    }

    /// Drop new TCP connections before the WebSocket upgrade.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Answer CONNECTs carrying `token` with an auth ERROR frame.
    pub fn reject_token(&self, token: &str) {
        self.shared
            .rejected
            .lock()
            .unwrap()
            .insert(token.to_owned());
    }

    /// `heart-beat` header for subsequent CONNECTED frames.
    pub fn set_heartbeat(&self, value: &str) {
        *self.shared.heartbeat.lock().unwrap() = value.to_owned();
    }

    /// Number of CONNECT frames received.
    pub fn connection_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Client frames received so far with `command`, in arrival order.
    pub fn frames(&self, command: Command) -> Vec<Frame> {
        self.shared
            .frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| frame.command == command)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` frames with `command` arrived and return them all.
    pub async fn wait_for_frames(&self, command: Command, count: usize) -> Vec<Frame> {
        let deadline = Instant::now() + WAIT;
        loop {
            let frames = self.frames(command);
            if frames.len() >= count || Instant::now() >= deadline {
                return frames;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` CONNECT frames arrived.
    pub async fn wait_for_connections(&self, count: usize) -> usize {
        let deadline = Instant::now() + WAIT;
        while self.connection_count() < count && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        self.connection_count()
    }

    /// Destinations of every SUBSCRIBE received, in order.
    pub fn subscribed_destinations(&self) -> Vec<String> {
        self.frames(Command::Subscribe)
            .iter()
            .map(|frame| frame.header(DESTINATION).unwrap_or_default().to_owned())
            .collect()
    }
}

async fn serve_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut actions: broadcast::Receiver<Action>,
) {
    let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    let (mut write, mut read) = ws_stream.split();
    // (subscription id, destination) for this connection
    let mut subscriptions: Vec<(String, String)> = Vec::new();
    let mut message_id = 0_u64;

    loop {
        tokio::select! {
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                };
                if is_heartbeat(text.as_str()) {
                    continue;
                }
                let Ok(frames) = decode(text.as_str()) else {
                    continue;
                };

                for frame in frames {
                    shared.frames.lock().unwrap().push(frame.clone());

                    match frame.command {
                        Command::Connect | Command::Stomp => {
                            shared.connects.fetch_add(1, Ordering::SeqCst);
                            let token = frame
                                .header(AUTHORIZATION)
                                .unwrap_or_default()
                                .trim_start_matches("Bearer ")
                                .to_owned();
                            let rejected = shared.rejected.lock().unwrap().contains(&token);

                            if rejected {
                                let error = Frame::new(Command::Error)
                                    .with_header(MESSAGE, "Unauthorized")
                                    .with_body("Token expired");
                                drop(write.send(Message::Text(error.encode().into())).await);
                                drop(write.close().await);
                                return;
                            }

                            let heartbeat = shared.heartbeat.lock().unwrap().clone();
                            let connected = Frame::new(Command::Connected)
                                .with_header("version", "1.2")
                                .with_header(HEART_BEAT, heartbeat);
                            if write.send(Message::Text(connected.encode().into())).await.is_err() {
                                return;
                            }
                        }
                        Command::Subscribe => {
                            let id = frame.header(SUBSCRIPTION_ID).unwrap_or_default().to_owned();
                            let destination = frame.header(DESTINATION).unwrap_or_default().to_owned();
                            subscriptions.push((id, destination));
                        }
                        Command::Unsubscribe => {
                            let id = frame.header(SUBSCRIPTION_ID).unwrap_or_default();
                            subscriptions.retain(|(sub_id, _)| sub_id != id);
                        }
                        Command::Disconnect => return,
                        _ => {}
                    }
                }
            }

            action = actions.recv() => {
                match action {
                    Ok(Action::Publish { destination, body }) => {
                        for (id, _) in subscriptions.iter().filter(|(_, dest)| *dest == destination) {
                            message_id += 1;
                            let message = Frame::new(Command::Message)
                                .with_header(DESTINATION, destination.as_str())
                                .with_header(SUBSCRIPTION, id.as_str())
                                .with_header("message-id", message_id.to_string())
                                .with_body(body.as_str());
                            if write.send(Message::Text(message.encode().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Action::Raw(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(Action::CloseAll) | Err(_) => return,
                }
            }
        }
    }
}

/// Fast timings so reconnect scenarios finish quickly.
pub fn config() -> Config {
    let mut config = Config::default();
    config.connect_timeout = Duration::from_secs(2);
    config.handshake_timeout = Duration::from_secs(1);
    config.send_queue_timeout = Duration::from_secs(2);
    config.auth.token_wait = Duration::from_millis(100);
    config.auth.token_poll_interval = Duration::from_millis(10);
    config.auth.refresh_timeout = Duration::from_millis(500);
    config.reconnect.max_attempts = Some(5);
    config.reconnect.initial_backoff = Duration::from_millis(50);
    config.reconnect.max_backoff = Duration::from_millis(200);
    config
}

pub fn tokens(token: &str) -> Arc<MemoryTokenProvider> {
    Arc::new(MemoryTokenProvider::with_context(AuthContext::new(
        token, "7",
    )))
}

/// A manager for `server` using [`config`] and a fixed token.
pub fn manager(server: &MockStompServer, token: &str) -> ConnectionManager {
    ConnectionManager::new(&server.ws_url(), config(), tokens(token)).unwrap()
}

/// Wait for the manager to reach a state matching `predicate`.
pub async fn wait_for_state<P>(manager: &ConnectionManager, predicate: P) -> ConnectionState
where
    P: FnMut(&ConnectionState) -> bool,
{
    let mut state = manager.state_receiver();
    let reached = timeout(WAIT, state.wait_for(predicate))
        .await
        .is_ok_and(|result| result.is_ok());
    assert!(reached, "state not reached, still {:?}", manager.state());
    manager.state()
}

/// Receive the next item within [`WAIT`].
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    timeout(WAIT, rx.recv()).await.ok().flatten()
}

/// Assert nothing arrives on `rx` for a short while.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    let extra = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected item: {extra:?}");
}
