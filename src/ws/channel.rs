use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::connection::ConnectionManager;
use super::error::WsError;
use super::message::{Headers, InboundMessage, Payload};
use super::registry::SubscriptionInfo;
use crate::Result;
use crate::error::Error;

/// JSON publish/subscribe on top of a [`ConnectionManager`].
///
/// Fallible operations report failure through their return value; only
/// [`MessageChannel::send_queued`] returns an error.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    manager: ConnectionManager,
}

impl MessageChannel {
    #[must_use]
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Serialize `message` and SEND it to `destination`.
    ///
    /// `content-type: application/json` is added unless `headers` sets one.
    /// Returns `false` when not connected or when serialization fails.
    pub fn send_message<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        message: &T,
        headers: &Headers,
    ) -> bool {
        let body = match serde_json::to_string(message) {
            Ok(body) => body,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(%destination, error = %e, "Failed to serialize message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return false;
            }
        };

        let sent = self.manager.send(destination, body, headers);
        if !sent {
            #[cfg(feature = "tracing")]
            tracing::warn!(%destination, "Dropped send while not connected");
        }
        sent
    }

    /// Like [`MessageChannel::send_message`], but waits out a disconnect.
    ///
    /// While disconnected the send is queued and written, in order, after the
    /// next CONNECTED. Fails with a timeout error if that does not happen
    /// within [`crate::ws::config::Config::send_queue_timeout`], and with a
    /// WebSocket error if the session is closed first.
    ///
    /// Dropping the returned future withdraws the send. An entry is never
    /// written once it is older than the queue timeout.
    pub async fn send_queued<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        message: &T,
        headers: Headers,
    ) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let Some((id, mut ack)) = self.manager.send_or_enqueue(destination, body, headers) else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%destination, id, "Queued send until reconnect");

        let wait = self.manager.config().send_queue_timeout;
        match timeout(wait, &mut ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_dropped)) => Err(WsError::ConnectionClosed.into()),
            Err(_elapsed) => {
                if self.manager.cancel_queued(id) {
                    Err(Error::timeout("queued send", wait))
                } else {
                    // Already taken by the driver; its outcome is on the way.
                    ack.await.unwrap_or_else(|_| Err(WsError::ConnectionClosed.into()))
                }
            }
        }
    }

    /// Subscribe with a callback that receives each body as a [`Payload`].
    ///
    /// Bodies that are not valid JSON are logged and passed on as
    /// [`Payload::Raw`]; the subscription stays active either way.
    /// Returns `None` when not connected.
    pub fn subscribe_to_channel<F>(
        &self,
        topic: &str,
        callback: F,
        headers: Headers,
    ) -> Option<SubscriptionInfo>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.manager.subscribe(
            topic,
            move |message: InboundMessage| callback(message.payload()),
            headers,
        )
    }

    /// Subscribe and receive payloads as a stream.
    ///
    /// The stream ends when the topic is unsubscribed, replaced, or cleared by
    /// a disconnect. Returns `None` when not connected.
    pub fn subscribe_stream(
        &self,
        topic: &str,
        headers: Headers,
    ) -> Option<impl Stream<Item = Payload> + Send + use<>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribe_to_channel(
            topic,
            move |payload| {
                // Receiver gone means the stream was dropped.
                _ = tx.send(payload);
            },
            headers,
        )?;

        Some(async_stream::stream! {
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        })
    }
}
