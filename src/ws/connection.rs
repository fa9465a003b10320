#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::error::Error as StdError;
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::SplitSink;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::channel::MessageChannel;
use super::config::Config;
use super::error::WsError;
use super::message::{Headers, InboundMessage};
use super::policy::{ConnectionState, Decision, ReconnectPolicy};
use super::queue::OutboundQueue;
use super::registry::{SubscriptionInfo, SubscriptionRegistry};
use super::traits::MessageHandler;
use crate::auth::TokenProvider;
use crate::error::{Error, Kind};
use crate::stomp::frame::{
    AUTHORIZATION, CONTENT_TYPE, DESTINATION, HEART_BEAT, SUBSCRIPTION_ID,
};
use crate::stomp::{ACCEPT_VERSION, Command, Frame, HeartBeat, Negotiated, decode, is_heartbeat};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Broadcast channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 64;

/// Upper bound for the DISCONNECT frame and close handshake on deliberate shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const JSON_CONTENT_TYPE: &str = "application/json";

/// Lifecycle notifications, delivered to every [`ConnectionManager::events`] receiver.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// CONNECTED received and all subscriptions replayed
    Connected { generation: u64 },
    /// The live connection ended
    Disconnected {
        /// Whether this was caused by [`ConnectionManager::disconnect`]
        deliberate: bool,
    },
    /// A reconnect attempt is scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// The server sent an ERROR frame or refused the upgrade
    StompError { message: String, auth: bool },
    /// The session is reconnecting with a new token
    TokenRefreshed,
    /// The server rejected our credentials and no new token could be obtained
    SessionExpired,
    /// Reconnection stopped after the configured number of attempts
    GaveUp { attempts: u32 },
}

/// The most recent failure, as surfaced through [`Status`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: Kind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    fn from_ws(error: &WsError) -> Self {
        let kind = if error.is_auth_failure() {
            Kind::Authentication
        } else {
            Kind::WebSocket
        };
        Self {
            kind,
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.message, self.at.to_rfc3339())
    }
}

impl StdError for ErrorInfo {}

/// Point-in-time health snapshot of the session.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Status {
    pub state: ConnectionState,
    pub connected: bool,
    pub connecting: bool,
    /// Number of registered subscriptions
    pub subscriptions: usize,
    /// Failed attempts since the last CONNECTED
    pub reconnect_attempts: u32,
    /// Sends waiting for the connection to come back
    pub queued_sends: usize,
    pub last_error: Option<ErrorInfo>,
}

/// Requests from the manager to a running session driver.
#[derive(Debug)]
enum Control {
    /// The token provider published a new token
    Refresh(SecretString),
    /// Skip any backoff and connect again now
    Reconnect,
}

/// Handles to one spawned session driver.
struct Session {
    generation: u64,
    control_tx: mpsc::UnboundedSender<Control>,
    frames_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    endpoint: Url,
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    registry: SubscriptionRegistry,
    queue: OutboundQueue,
    /// At most one live driver. Every state transition happens under this lock.
    session: Mutex<Option<Session>>,
    next_generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    last_error: RwLock<Option<ErrorInfo>>,
    watcher: CancellationToken,
}

impl Inner {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    fn emit(&self, event: ConnectionEvent) {
        #[cfg(feature = "tracing")]
        tracing::debug!(?event, "Connection event");
        // No receivers is fine.
        _ = self.events_tx.send(event);
    }

    fn record_error(&self, error: &WsError) {
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(ErrorInfo::from_ws(error));
    }

    fn last_error(&self) -> Option<ErrorInfo> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.watcher.cancel();
    }
}

/// Owns the single STOMP session for one endpoint.
///
/// Cheap to clone; every clone drives the same session. At most one
/// connection is live at any time. Subscriptions made through the manager
/// are remembered and replayed, in registration order, after every reconnect.
///
/// # Example
///
/// ```ignore
/// let tokens = Arc::new(MemoryTokenProvider::with_context(AuthContext::new(jwt, "42")));
/// let manager = ConnectionManager::new("wss://api.example.com/ws", Config::default(), tokens)?;
///
/// let handle = manager.get_client().await?;
/// manager.subscribe("/chat/42", |message: InboundMessage| {
///     println!("{}", message.body);
/// }, Headers::new());
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for `endpoint` and bind it to `tokens`' refresh notifications.
    ///
    /// No connection is opened until [`ConnectionManager::get_client`] or
    /// [`ConnectionManager::create_connection`] is called. Must be called
    /// inside a Tokio runtime.
    pub fn new(endpoint: &str, config: Config, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint must use ws or wss, got {}",
                endpoint.scheme()
            )));
        }

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            endpoint,
            config,
            tokens,
            state_tx,
            events_tx,
            registry: SubscriptionRegistry::new(),
            queue: OutboundQueue::default(),
            session: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_error: RwLock::new(None),
            watcher: CancellationToken::new(),
        });

        spawn_token_watcher(&inner);

        Ok(Self { inner })
    }

    /// Return a handle to the live connection, connecting first if needed.
    ///
    /// Concurrent callers share one connection attempt. Fails if the attempt
    /// ends in [`ConnectionState::Error`], if [`ConnectionManager::disconnect`]
    /// is called meanwhile, or after [`Config::connect_timeout`].
    pub async fn get_client(&self) -> Result<ConnectionHandle> {
        if let Some(handle) = self.current_handle() {
            return Ok(handle);
        }
        self.pending().await
    }

    /// Like [`ConnectionManager::get_client`], then run `on_connect` with the handle.
    pub async fn get_client_with<F>(&self, on_connect: F) -> Result<ConnectionHandle>
    where
        F: FnOnce(&ConnectionHandle),
    {
        let handle = self.get_client().await?;
        on_connect(&handle);
        Ok(handle)
    }

    /// The in-flight connection attempt, starting one if none is running.
    #[must_use]
    pub fn pending(&self) -> PendingConnection {
        {
            let mut slot = self.inner.lock_session();
            if slot.is_none() {
                spawn_session(&self.inner, &mut slot);
            }
        }
        PendingConnection {
            manager: self.clone(),
            state_rx: self.inner.state_tx.subscribe(),
            timeout: self.inner.config.connect_timeout,
        }
    }

    /// Replace any existing session with a new one and return its generation.
    ///
    /// State is [`ConnectionState::Connecting`] when this returns.
    pub fn create_connection(&self) -> u64 {
        let mut slot = self.inner.lock_session();
        spawn_session(&self.inner, &mut slot)
    }

    /// Close the session and forget every subscription.
    ///
    /// Sends DISCONNECT when connected, cancels backoff and heart-beat timers,
    /// and fails queued sends. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let (session, was_active) = {
            let mut slot = self.inner.lock_session();
            let session = slot.take();
            let was_active = session.is_some() || self.state() != ConnectionState::Disconnected;
            _ = self.inner.registry.clear();
            _ = self.inner.queue.reject_all();
            self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
            self.inner
                .state_tx
                .send_replace(ConnectionState::Disconnected);
            (session, was_active)
        };

        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Session task failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        if was_active {
            self.inner
                .emit(ConnectionEvent::Disconnected { deliberate: true });
        }
    }

    /// Retry now: reset the attempt counter and skip any pending backoff.
    ///
    /// Also the way out of [`ConnectionState::Error`].
    pub fn reconnect(&self) {
        let mut slot = self.inner.lock_session();
        self.inner.reconnect_attempts.store(0, Ordering::Relaxed);
        match slot.as_ref() {
            Some(session) => {
                _ = session.control_tx.send(Control::Reconnect);
            }
            None => {
                spawn_session(&self.inner, &mut slot);
            }
        }
    }

    /// [`ConnectionManager::disconnect`] and stop following token refreshes.
    pub async fn teardown(&self) {
        self.inner.watcher.cancel();
        self.disconnect().await;
    }

    /// Register `handler` for `topic` and SUBSCRIBE.
    ///
    /// Returns `None` without recording anything when not connected.
    /// Subscribing to a topic again replaces its handler and headers.
    pub fn subscribe<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
        headers: Headers,
    ) -> Option<SubscriptionInfo> {
        let slot = self.inner.lock_session();
        let session = slot.as_ref()?;
        if !self.inner.is_connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(%topic, "Subscribe while not connected");
            return None;
        }

        let (info, replaced) = self.inner.registry.record(topic, handler, headers);
        if let Some(old_id) = replaced {
            _ = session.frames_tx.send(unsubscribe_frame(&old_id));
        }
        _ = session.frames_tx.send(subscribe_frame(&info));

        #[cfg(feature = "tracing")]
        tracing::debug!(%topic, id = %info.id, "Subscribed");
        Some(info)
    }

    /// Forget `topic` and UNSUBSCRIBE when connected. Returns whether it was registered.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let slot = self.inner.lock_session();
        let Some(info) = self.inner.registry.remove(topic) else {
            return false;
        };
        if let Some(session) = slot.as_ref()
            && self.inner.is_connected()
        {
            _ = session.frames_tx.send(unsubscribe_frame(&info.id));
        }
        true
    }

    /// Publish a raw SEND. Returns `false` when not connected.
    pub fn send(&self, destination: &str, body: String, headers: &Headers) -> bool {
        let slot = self.inner.lock_session();
        match slot.as_ref() {
            Some(session) if self.inner.is_connected() => session
                .frames_tx
                .send(send_frame(destination, body, headers))
                .is_ok(),
            _ => false,
        }
    }

    /// Send now if connected, otherwise queue for the next CONNECTED.
    ///
    /// Returns the queue entry to await when the send was queued.
    pub(crate) fn send_or_enqueue(
        &self,
        destination: &str,
        body: String,
        headers: Headers,
    ) -> Option<(u64, oneshot::Receiver<Result<()>>)> {
        let slot = self.inner.lock_session();
        if let Some(session) = slot.as_ref()
            && self.inner.is_connected()
        {
            let frame = send_frame(destination, body, &headers);
            match session.frames_tx.send(frame) {
                Ok(()) => return None,
                Err(mpsc::error::SendError(frame)) => {
                    return Some(self.inner.queue.push(
                        destination.to_owned(),
                        frame.body,
                        headers,
                    ));
                }
            }
        }
        Some(
            self.inner
                .queue
                .push(destination.to_owned(), body, headers),
        )
    }

    /// Withdraw a queued send that its caller stopped waiting for.
    pub(crate) fn cancel_queued(&self, id: u64) -> bool {
        self.inner.queue.take(id).is_some()
    }

    /// JSON send/receive helpers bound to this manager.
    #[must_use]
    pub fn channel(&self) -> MessageChannel {
        MessageChannel::new(self.clone())
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    #[must_use]
    pub fn status(&self) -> Status {
        let state = self.state();
        Status {
            state,
            connected: state.is_connected(),
            connecting: state.is_connecting(),
            subscriptions: self.inner.registry.len(),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::Relaxed),
            queued_sends: self.inner.queue.prune(self.inner.config.send_queue_timeout),
            last_error: self.inner.last_error(),
        }
    }

    /// Registered subscriptions in replay order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.registry.snapshot()
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        let slot = self.inner.lock_session();
        let session = slot.as_ref()?;
        self.inner.is_connected().then(|| ConnectionHandle {
            generation: session.generation,
            manager: self.clone(),
        })
    }

    fn on_new_token(&self, token: SecretString) {
        let mut slot = self.inner.lock_session();
        match slot.as_ref() {
            Some(session) => {
                _ = session.control_tx.send(Control::Refresh(token));
            }
            None if self.state() == ConnectionState::Error => {
                #[cfg(feature = "tracing")]
                tracing::info!("New token while in error state, reconnecting");
                spawn_session(&self.inner, &mut slot);
            }
            None => {}
        }
    }
}

/// A connected session, as returned by [`ConnectionManager::get_client`].
///
/// The handle stays tied to the session generation it was created for; once
/// that session is replaced, [`ConnectionHandle::is_connected`] is `false`.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    generation: u64,
    manager: ConnectionManager,
}

impl ConnectionHandle {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.manager
            .current_handle()
            .is_some_and(|current| current.generation == self.generation)
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.manager.status()
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub fn channel(&self) -> MessageChannel {
        self.manager.channel()
    }
}

/// A connection attempt that any number of callers can await.
///
/// Resolves on CONNECTED, fails when the attempt ends in
/// [`ConnectionState::Error`] or [`ConnectionState::Disconnected`], or after
/// the configured connect timeout.
pub struct PendingConnection {
    manager: ConnectionManager,
    state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
}

impl PendingConnection {
    async fn wait(mut self) -> Result<ConnectionHandle> {
        let settled = timeout(
            self.timeout,
            self.state_rx.wait_for(|state| {
                state.is_connected()
                    || matches!(
                        state,
                        ConnectionState::Error | ConnectionState::Disconnected
                    )
            }),
        )
        .await
        .map(|result| result.map(|state| *state));

        match settled {
            Err(_elapsed) => Err(Error::timeout("connect", self.timeout)),
            Ok(Err(_closed)) => Err(WsError::ConnectionClosed.into()),
            Ok(Ok(ConnectionState::Connected { .. })) => self
                .manager
                .current_handle()
                .ok_or_else(|| WsError::ConnectionClosed.into()),
            Ok(Ok(ConnectionState::Error)) => Err(match self.manager.inner.last_error() {
                Some(info) => Error::with_source(info.kind, info),
                None => WsError::ConnectionClosed.into(),
            }),
            Ok(Ok(_)) => Err(WsError::ConnectionClosed.into()),
        }
    }
}

impl IntoFuture for PendingConnection {
    type Output = Result<ConnectionHandle>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

/// Start a driver with a fresh generation, cancelling whatever occupied `slot`.
fn spawn_session(inner: &Arc<Inner>, slot: &mut Option<Session>) -> u64 {
    if let Some(stale) = slot.take() {
        stale.cancel.cancel();
    }

    let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    inner.reconnect_attempts.store(0, Ordering::Relaxed);
    inner.state_tx.send_replace(ConnectionState::Connecting);

    let driver = Driver {
        inner: Arc::clone(inner),
        generation,
        cancel: cancel.clone(),
        control_rx,
        frames_rx,
        policy: ReconnectPolicy::new(inner.config.reconnect.clone()),
        token: None,
        pending_refresh: None,
    };
    let task = tokio::spawn(driver.run());

    *slot = Some(Session {
        generation,
        control_tx,
        frames_tx,
        cancel,
        task,
    });

    #[cfg(feature = "tracing")]
    tracing::debug!(generation, "Spawned session");
    generation
}

/// Follow the token provider: reconnect on new tokens, disconnect on logout.
fn spawn_token_watcher(inner: &Arc<Inner>) {
    let mut refreshes = inner.tokens.on_token_refresh();
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let stop = inner.watcher.clone();

    tokio::spawn(async move {
        loop {
            let notification = tokio::select! {
                () = stop.cancelled() => break,
                received = refreshes.recv() => received,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let manager = ConnectionManager { inner };

            match notification {
                Ok(Some(token)) => manager.on_new_token(token),
                Ok(None) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Token cleared, disconnecting");
                    manager.disconnect().await;
                }
                Err(RecvError::Lagged(_count)) => {
                    // Only the latest token matters.
                    if let Some(token) = manager.inner.tokens.token() {
                        manager.on_new_token(token);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Why one connection ended.
enum SessionEnd {
    /// Disconnected or replaced by the manager
    Deliberate,
    /// A different token arrived while connected
    TokenRefreshed,
    /// [`ConnectionManager::reconnect`] was called
    ReconnectNow,
    /// The server refused our credentials
    AuthRejected(WsError),
    /// The transport failed or the server stopped responding
    Lost(WsError),
}

/// Outcome of waiting out a backoff delay.
enum Wake {
    Elapsed,
    Now,
    Cancelled,
}

/// Runs one session: connect, serve, and reconnect until told to stop.
struct Driver {
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
    control_rx: mpsc::UnboundedReceiver<Control>,
    frames_rx: mpsc::UnboundedReceiver<Frame>,
    policy: ReconnectPolicy,
    /// Token used for the current connection
    token: Option<SecretString>,
    /// A token that arrived while the connection was being established
    pending_refresh: Option<SecretString>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if !self.transition(ConnectionState::Connecting) {
                break;
            }

            match self.connect_once().await {
                SessionEnd::Deliberate => break,
                SessionEnd::TokenRefreshed => {
                    self.policy.reset();
                    self.sync_attempts();
                    self.inner.emit(ConnectionEvent::TokenRefreshed);
                }
                SessionEnd::ReconnectNow => {
                    self.policy.reset();
                    self.sync_attempts();
                }
                SessionEnd::AuthRejected(error) => {
                    self.note_failure(&error);
                    if !self.recover_auth().await {
                        break;
                    }
                }
                SessionEnd::Lost(error) => {
                    self.note_failure(&error);
                    if !self.back_off().await {
                        break;
                    }
                }
            }
        }

        self.release();
    }

    /// Record a failure and tell observers about it.
    fn note_failure(&self, error: &WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(generation = self.generation, error = %error, "Connection failed");

        self.inner.record_error(error);
        match error {
            WsError::Protocol { message, .. } => {
                self.inner.emit(ConnectionEvent::StompError {
                    message: message.clone(),
                    auth: false,
                });
            }
            _ if error.is_auth_failure() => {
                self.inner.emit(ConnectionEvent::StompError {
                    message: error.to_string(),
                    auth: true,
                });
            }
            _ => {}
        }
        if self.inner.is_connected() {
            self.inner
                .emit(ConnectionEvent::Disconnected { deliberate: false });
        }
    }

    /// Ask the provider for a new token after an auth rejection.
    ///
    /// Returns whether to keep running.
    async fn recover_auth(&mut self) -> bool {
        if !self.transition(ConnectionState::Connecting) {
            return false;
        }

        let refresh_timeout = self.inner.config.auth.refresh_timeout;
        let refreshed = tokio::select! {
            () = self.cancel.cancelled() => return false,
            result = timeout(refresh_timeout, self.inner.tokens.refresh()) => result,
        };

        match refreshed {
            // The provider handing back the rejected token counts as no token.
            Ok(Ok(Some(token))) if !same_token(self.token.as_ref(), &token) => match self
                .policy
                .on_failure()
            {
                Decision::Retry { attempt, .. } => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(attempt, "Token refreshed after rejection, reconnecting");
                    #[cfg(not(feature = "tracing"))]
                    let _ = attempt;
                    self.sync_attempts();
                    true
                }
                Decision::GiveUp { attempts } => {
                    self.give_up(attempts);
                    false
                }
            },
            outcome => {
                #[cfg(feature = "tracing")]
                match outcome {
                    Ok(Err(e)) => tracing::warn!(error = %e, "Token refresh failed"),
                    Err(_) => tracing::warn!(?refresh_timeout, "Token refresh timed out"),
                    _ => tracing::warn!("No token available after rejection"),
                }
                #[cfg(not(feature = "tracing"))]
                let _ = outcome;
                self.expire();
                false
            }
        }
    }

    /// Consult the policy and wait out the delay. Returns whether to keep running.
    async fn back_off(&mut self) -> bool {
        match self.policy.on_failure() {
            Decision::Retry { attempt, delay } => {
                self.sync_attempts();
                if !self.transition(ConnectionState::Reconnecting { attempt, delay }) {
                    return false;
                }
                self.inner
                    .emit(ConnectionEvent::Reconnecting { attempt, delay });

                #[cfg(feature = "tracing")]
                tracing::info!(attempt, ?delay, "Reconnecting after backoff");

                match self.wait_backoff(delay).await {
                    Wake::Elapsed | Wake::Now => true,
                    Wake::Cancelled => false,
                }
            }
            Decision::GiveUp { attempts } => {
                self.give_up(attempts);
                false
            }
        }
    }

    async fn wait_backoff(&mut self, delay: Duration) -> Wake {
        tokio::select! {
            () = self.cancel.cancelled() => Wake::Cancelled,
            () = sleep(delay) => Wake::Elapsed,
            control = self.control_rx.recv() => match control {
                Some(Control::Reconnect) => {
                    self.policy.reset();
                    self.sync_attempts();
                    Wake::Now
                }
                Some(Control::Refresh(_token)) => {
                    self.policy.reset();
                    self.sync_attempts();
                    self.inner.emit(ConnectionEvent::TokenRefreshed);
                    Wake::Now
                }
                None => Wake::Cancelled,
            },
        }
    }

    fn give_up(&self, attempts: u32) {
        #[cfg(feature = "tracing")]
        tracing::error!(attempts, "Giving up on reconnection");

        if self.finish(ConnectionState::Error) {
            self.inner.record_error(&WsError::GaveUp { attempts });
            self.inner.emit(ConnectionEvent::GaveUp { attempts });
        }
    }

    /// The server keeps refusing us and no new token exists: end the session.
    fn expire(&self) {
        let mut slot = self.inner.lock_session();
        if !self.owns(&slot) {
            return;
        }
        *slot = None;
        _ = self.inner.registry.clear();
        _ = self.inner.queue.reject_all();
        self.inner.state_tx.send_replace(ConnectionState::Error);
        drop(slot);

        self.inner.emit(ConnectionEvent::SessionExpired);
    }

    /// One connection from token acquisition to close.
    async fn connect_once(&mut self) -> SessionEnd {
        let cancel = self.cancel.clone();
        let established = tokio::select! {
            () = cancel.cancelled() => return SessionEnd::Deliberate,
            result = self.establish() => result,
        };

        let (ws, negotiated) = match established {
            Ok(established) => established,
            Err(error) if error.is_auth_failure() => return SessionEnd::AuthRejected(error),
            Err(error) => return SessionEnd::Lost(error),
        };

        let Some(replay) = self.on_connected() else {
            return SessionEnd::Deliberate;
        };

        let (mut write, read) = ws.split();

        for info in &replay {
            if let Err(e) = write_frame(&mut write, &subscribe_frame(info)).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(topic = %info.topic, error = %e, "Failed to replay subscription");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        if let Err(error) = self.drain_queue(&mut write).await {
            return SessionEnd::Lost(error);
        }

        if let Some(token) = self.pending_refresh.take() {
            close_gracefully(write).await;
            self.token = Some(token);
            return SessionEnd::TokenRefreshed;
        }

        self.serve(write, read, negotiated).await
    }

    /// Wait for a token, open the socket and complete the STOMP handshake.
    async fn establish(&mut self) -> std::result::Result<(WsStream, Negotiated), WsError> {
        let token = self.acquire_token().await;
        let connect = connect_frame(
            self.virtual_host(),
            self.inner.config.heartbeat,
            token.as_ref(),
        );
        self.token = token;

        let handshake_timeout = self.inner.config.handshake_timeout;
        let endpoint = self.inner.endpoint.as_str();

        let (ws, connected) = timeout(handshake_timeout, async {
            let (mut ws, _response) = connect_async(endpoint).await.map_err(WsError::Connection)?;
            let connected = handshake(&mut ws, &connect).await?;
            Ok::<_, WsError>((ws, connected))
        })
        .await
        .map_err(|_elapsed| WsError::Timeout)??;

        let server = connected
            .header(HEART_BEAT)
            .map(HeartBeat::parse)
            .unwrap_or_default();
        let negotiated = self.inner.config.heartbeat.negotiate(server);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            generation = self.generation,
            version = connected.header("version"),
            ?negotiated,
            "STOMP session established"
        );

        Ok((ws, negotiated))
    }

    /// Poll the provider for a valid token, bounded by the configured wait.
    ///
    /// Falls back to connecting without a token.
    async fn acquire_token(&self) -> Option<SecretString> {
        let auth = &self.inner.config.auth;
        let deadline = tokio::time::Instant::now() + auth.token_wait;

        loop {
            if self.inner.tokens.is_token_valid() {
                return self.inner.tokens.token();
            }
            if tokio::time::Instant::now() >= deadline {
                #[cfg(feature = "tracing")]
                tracing::warn!(wait = ?auth.token_wait, "No valid token, connecting without one");
                return None;
            }
            sleep(auth.token_poll_interval).await;
        }
    }

    fn virtual_host(&self) -> String {
        self.inner
            .config
            .virtual_host
            .clone()
            .or_else(|| self.inner.endpoint.host_str().map(ToOwned::to_owned))
            .unwrap_or_default()
    }

    /// Publish CONNECTED. Returns the subscriptions to replay, or `None` if
    /// this driver has been superseded.
    fn on_connected(&mut self) -> Option<Vec<SubscriptionInfo>> {
        // Controls that raced the handshake.
        while let Ok(control) = self.control_rx.try_recv() {
            if let Control::Refresh(token) = control
                && !same_token(self.token.as_ref(), &token)
            {
                self.pending_refresh = Some(token);
            }
        }

        let slot = self.inner.lock_session();
        if !self.owns(&slot) {
            return None;
        }

        // Subscription frames for the previous connection are superseded by the
        // replay. SENDs it never wrote go back to the head of the queue.
        let mut unsent = Vec::new();
        while let Ok(frame) = self.frames_rx.try_recv() {
            unsent.extend(unsent_send(frame));
        }
        if !unsent.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!(count = unsent.len(), "Requeued sends from the previous connection");
            self.inner.queue.restore_front(unsent);
        }

        self.policy.reset();
        self.sync_attempts();
        let replay = self.inner.registry.snapshot();
        self.inner.state_tx.send_replace(ConnectionState::Connected {
            since: Instant::now(),
        });
        drop(slot);

        #[cfg(feature = "tracing")]
        tracing::info!(
            generation = self.generation,
            subscriptions = replay.len(),
            "Connected"
        );

        self.inner.emit(ConnectionEvent::Connected {
            generation: self.generation,
        });
        Some(replay)
    }

    async fn drain_queue(&self, write: &mut WsSink) -> std::result::Result<(), WsError> {
        let max_age = self.inner.config.send_queue_timeout;
        while let Some(entry) = self.inner.queue.pop_live(max_age) {
            let frame = send_frame(&entry.destination, entry.body.clone(), &entry.headers);
            match write_frame(write, &frame).await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        destination = %entry.destination,
                        waited = ?entry.enqueued_at.elapsed(),
                        "Delivered queued send"
                    );
                    entry.resolve(Ok(()));
                }
                Err(error) => {
                    self.inner.queue.requeue_front(entry);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Pump frames both ways until the connection ends.
    async fn serve(
        &mut self,
        mut write: WsSink,
        mut read: futures::stream::SplitStream<WsStream>,
        negotiated: Negotiated,
    ) -> SessionEnd {
        let mut heartbeat = negotiated.send_every.map(|every| {
            let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let silence_limit = negotiated
            .expect_within
            .map(|every| every * self.inner.config.heartbeat_tolerance.max(1));
        let mut last_seen = tokio::time::Instant::now();

        loop {
            let deadline = silence_limit.map(|limit| last_seen + limit);

            tokio::select! {
                () = self.cancel.cancelled() => {
                    close_gracefully(write).await;
                    return SessionEnd::Deliberate;
                }

                message = read.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return SessionEnd::Lost(WsError::Connection(e)),
                        None => return SessionEnd::Lost(WsError::ConnectionClosed),
                    };
                    last_seen = tokio::time::Instant::now();

                    match message {
                        Message::Text(text) => {
                            if let Some(end) = self.handle_text(text.as_str()) {
                                return end;
                            }
                        }
                        Message::Close(_) => return SessionEnd::Lost(WsError::ConnectionClosed),
                        _ => {
                            // Binary frames and transport-level ping/pong only count as liveness.
                        }
                    }
                }

                Some(frame) = self.frames_rx.recv() => {
                    if let Err(error) = write_frame(&mut write, &frame).await {
                        self.inner.queue.restore_front(unsent_send(frame));
                        return SessionEnd::Lost(error);
                    }
                }

                Some(control) = self.control_rx.recv() => match control {
                    Control::Refresh(token) if !same_token(self.token.as_ref(), &token) => {
                        #[cfg(feature = "tracing")]
                        tracing::info!("Token refreshed, cycling connection");
                        close_gracefully(write).await;
                        self.token = Some(token);
                        return SessionEnd::TokenRefreshed;
                    }
                    Control::Refresh(_) => {}
                    Control::Reconnect => {
                        close_gracefully(write).await;
                        return SessionEnd::ReconnectNow;
                    }
                },

                () = tick(heartbeat.as_mut()) => {
                    if let Err(e) = write.send(Message::Text("\n".into())).await {
                        return SessionEnd::Lost(WsError::Connection(e));
                    }
                }

                () = wait_until(deadline) => {
                    return SessionEnd::Lost(WsError::HeartbeatTimeout);
                }
            }
        }
    }

    /// Route the frames in one text message. Returns how the session ends, if it does.
    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        if is_heartbeat(text) {
            return None;
        }

        let frames = match decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Failed to parse STOMP frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return None;
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => {
                    _ = self.inner.registry.dispatch(InboundMessage::from(frame));
                }
                Command::Error => {
                    let error = WsError::from_error_frame(&frame);
                    return Some(if error.is_auth_failure() {
                        SessionEnd::AuthRejected(error)
                    } else {
                        SessionEnd::Lost(error)
                    });
                }
                Command::Receipt => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(receipt = frame.header("receipt-id"), "Receipt");
                }
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(command = %frame.command, "Ignoring unexpected frame");
                }
            }
        }
        None
    }

    fn owns(&self, slot: &Option<Session>) -> bool {
        slot.as_ref()
            .is_some_and(|session| session.generation == self.generation)
    }

    /// Set `state` if this driver is still the live session.
    fn transition(&self, state: ConnectionState) -> bool {
        let slot = self.inner.lock_session();
        if !self.owns(&slot) {
            return false;
        }
        self.inner.state_tx.send_replace(state);
        true
    }

    /// Set a terminal `state` and vacate the session slot.
    fn finish(&self, state: ConnectionState) -> bool {
        let mut slot = self.inner.lock_session();
        if !self.owns(&slot) {
            return false;
        }
        *slot = None;
        self.inner.state_tx.send_replace(state);
        true
    }

    fn release(&self) {
        let mut slot = self.inner.lock_session();
        if self.owns(&slot) {
            *slot = None;
            self.inner
                .state_tx
                .send_replace(ConnectionState::Disconnected);
        }
    }

    fn sync_attempts(&self) {
        self.inner
            .reconnect_attempts
            .store(self.policy.attempts(), Ordering::Relaxed);
    }
}

fn same_token(current: Option<&SecretString>, candidate: &SecretString) -> bool {
    current.is_some_and(|current| current.expose_secret() == candidate.expose_secret())
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Send CONNECT and wait for CONNECTED or ERROR.
async fn handshake(ws: &mut WsStream, connect: &Frame) -> std::result::Result<Frame, WsError> {
    ws.send(Message::Text(connect.encode().into()))
        .await
        .map_err(WsError::Connection)?;

    while let Some(message) = ws.next().await {
        match message.map_err(WsError::Connection)? {
            Message::Text(text) => {
                let frames =
                    decode(text.as_str()).map_err(|e| WsError::InvalidMessage(e.to_string()))?;
                for frame in frames {
                    match frame.command {
                        Command::Connected => return Ok(frame),
                        Command::Error => return Err(WsError::from_error_frame(&frame)),
                        _ => {}
                    }
                }
            }
            Message::Close(_) => return Err(WsError::ConnectionClosed),
            _ => {}
        }
    }
    Err(WsError::ConnectionClosed)
}

async fn write_frame(write: &mut WsSink, frame: &Frame) -> std::result::Result<(), WsError> {
    #[cfg(feature = "tracing")]
    tracing::trace!(command = %frame.command, destination = frame.header(DESTINATION), "Sending frame");
    write
        .send(Message::Text(frame.encode().into()))
        .await
        .map_err(WsError::Connection)
}

/// Best-effort DISCONNECT and close.
async fn close_gracefully(mut write: WsSink) {
    let closed = timeout(CLOSE_TIMEOUT, async {
        write_frame(&mut write, &Frame::new(Command::Disconnect)).await?;
        write.close().await.map_err(WsError::Connection)
    })
    .await;

    if let Ok(Err(e)) = closed {
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %e, "Close was not clean");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}

fn connect_frame(host: String, heartbeat: HeartBeat, token: Option<&SecretString>) -> Frame {
    let authorization = token
        .map(|token| format!("Bearer {}", token.expose_secret()))
        .unwrap_or_default();
    Frame::new(Command::Connect)
        .with_header("accept-version", ACCEPT_VERSION)
        .with_header("host", host)
        .with_header(HEART_BEAT, heartbeat.to_header())
        .with_header(AUTHORIZATION, authorization)
}

fn subscribe_frame(info: &SubscriptionInfo) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header(SUBSCRIPTION_ID, info.id.as_str())
        .with_header(DESTINATION, info.topic.as_str())
        .with_headers(&info.headers)
}

fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).with_header(SUBSCRIPTION_ID, id)
}

fn send_frame(destination: &str, body: String, headers: &Headers) -> Frame {
    let frame = Frame::new(Command::Send)
        .with_header(DESTINATION, destination)
        .with_headers(headers);
    let frame = if frame.header(CONTENT_TYPE).is_none() {
        frame.with_header(CONTENT_TYPE, JSON_CONTENT_TYPE)
    } else {
        frame
    };
    frame.with_body(body)
}

/// Split a SEND that was never written back into its queue parts.
fn unsent_send(frame: Frame) -> Option<(String, String, Headers)> {
    if frame.command != Command::Send {
        return None;
    }
    let destination = frame.header(DESTINATION)?.to_owned();
    let headers = frame
        .headers
        .into_iter()
        .filter(|(name, _)| name != DESTINATION)
        .collect();
    Some((destination, frame.body, headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_carries_bearer_token() {
        let token = SecretString::from("abc".to_owned());
        let frame = connect_frame(
            "chat.example.com".to_owned(),
            HeartBeat::new(Duration::from_secs(4), Duration::from_secs(4)),
            Some(&token),
        );

        assert_eq!(frame.command, Command::Connect);
        assert_eq!(frame.header(AUTHORIZATION), Some("Bearer abc"));
        assert_eq!(frame.header(HEART_BEAT), Some("4000,4000"));
        assert_eq!(frame.header("accept-version"), Some("1.2"));
    }

    #[test]
    fn connect_frame_without_token_has_empty_authorization() {
        let frame = connect_frame("h".to_owned(), HeartBeat::default(), None);
        assert_eq!(frame.header(AUTHORIZATION), Some(""));
    }

    #[test]
    fn send_frame_defaults_to_json_but_respects_caller() {
        let frame = send_frame("/app/chat", "{}".to_owned(), &Headers::new());
        assert_eq!(frame.header(CONTENT_TYPE), Some(JSON_CONTENT_TYPE));

        let headers = Headers::from([(CONTENT_TYPE.to_owned(), "text/plain".to_owned())]);
        let frame = send_frame("/app/chat", "hi".to_owned(), &headers);
        assert_eq!(frame.header(CONTENT_TYPE), Some("text/plain"));
        assert_eq!(
            frame
                .headers
                .iter()
                .filter(|(name, _)| name == CONTENT_TYPE)
                .count(),
            1
        );
    }

    #[test]
    fn unsent_send_keeps_destination_body_and_headers() {
        let headers = Headers::from([("x-trace".to_owned(), "1".to_owned())]);
        let frame = send_frame("/app/chat/42", r#"{"n":1}"#.to_owned(), &headers);

        let (destination, body, headers) = unsent_send(frame).unwrap();
        assert_eq!(destination, "/app/chat/42");
        assert_eq!(body, r#"{"n":1}"#);
        assert_eq!(headers.get("x-trace").map(String::as_str), Some("1"));
        assert_eq!(headers.get(CONTENT_TYPE).map(String::as_str), Some(JSON_CONTENT_TYPE));
        assert!(!headers.contains_key(DESTINATION));

        // Rebuilding it yields the same frame on the wire.
        let rebuilt = send_frame(&destination, body, &headers);
        assert_eq!(rebuilt.header(DESTINATION), Some("/app/chat/42"));
        assert_eq!(rebuilt.header("x-trace"), Some("1"));
    }

    #[test]
    fn unsent_send_ignores_subscription_frames() {
        let info = SubscriptionInfo {
            topic: "/chat/1".to_owned(),
            id: "sub-1".to_owned(),
            headers: Headers::new(),
            created_at: Instant::now(),
        };
        assert!(unsent_send(subscribe_frame(&info)).is_none());
        assert!(unsent_send(unsubscribe_frame("sub-1")).is_none());
    }

    #[test]
    fn same_token_compares_secrets() {
        let a = SecretString::from("a".to_owned());
        let b = SecretString::from("b".to_owned());
        assert!(same_token(Some(&a), &a.clone()));
        assert!(!same_token(Some(&a), &b));
        assert!(!same_token(None, &a));
    }

    #[test]
    fn rejects_non_websocket_endpoint() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let tokens = Arc::new(crate::auth::MemoryTokenProvider::new());
            let error = ConnectionManager::new("http://localhost/ws", Config::default(), tokens)
                .unwrap_err();
            assert_eq!(error.kind(), Kind::Validation);
        });
    }
}
