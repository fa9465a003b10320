use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use super::error::WsError;
use super::message::Headers;
use crate::Result;
use crate::error::Error;

/// A SEND waiting for the connection to come back.
#[derive(Debug)]
pub(crate) struct QueuedSend {
    pub id: u64,
    pub destination: String,
    pub body: String,
    pub headers: Headers,
    pub enqueued_at: Instant,
    /// `None` for sends accepted on a link that died before writing them.
    pub ack: Option<oneshot::Sender<Result<()>>>,
}

impl QueuedSend {
    /// Resolve the caller waiting on this entry. A caller that already gave up is ignored.
    pub fn resolve(self, outcome: Result<()>) {
        if let Some(ack) = self.ack {
            _ = ack.send(outcome);
        }
    }

    /// The caller dropped its `send_queued` future.
    fn is_abandoned(&self) -> bool {
        self.ack.as_ref().is_some_and(oneshot::Sender::is_closed)
    }

    fn is_expired(&self, max_age: Duration) -> bool {
        self.enqueued_at.elapsed() >= max_age
    }
}

/// FIFO of sends made while disconnected, drained after the next CONNECTED.
///
/// An entry is removed before it is resolved, so it is delivered at most once
/// whether it drains or times out.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    entries: Mutex<VecDeque<QueuedSend>>,
    next_id: AtomicU64,
}

impl OutboundQueue {
    /// Append a send and return its id with the receiver the caller awaits.
    pub fn push(
        &self,
        destination: String,
        body: String,
        headers: Headers,
    ) -> (u64, oneshot::Receiver<Result<()>>) {
        let (ack, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedSend {
                id,
                destination,
                body,
                headers,
                enqueued_at: Instant::now(),
                ack: Some(ack),
            });
        (id, rx)
    }

    /// Put sends that nobody awaits back at the head, keeping their order.
    pub fn restore_front<I>(&self, sends: I)
    where
        I: IntoIterator<Item = (String, String, Headers)>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (destination, body, headers) in sends.into_iter().rev() {
            entries.push_front(QueuedSend {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                destination,
                body,
                headers,
                enqueued_at: Instant::now(),
                ack: None,
            });
        }
    }

    /// Put an entry back at the head after a failed write.
    pub fn requeue_front(&self, entry: QueuedSend) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(entry);
    }

    /// Remove a specific entry, e.g. when its caller timed out.
    pub fn take(&self, id: u64) -> Option<QueuedSend> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let position = entries.iter().position(|entry| entry.id == id)?;
        entries.remove(position)
    }

    /// Pop the oldest entry still worth writing.
    ///
    /// Entries older than `max_age` fail with a timeout and abandoned entries
    /// are dropped, so neither is ever written.
    pub fn pop_live(&self, max_age: Duration) -> Option<QueuedSend> {
        loop {
            let entry = self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()?;
            if entry.is_abandoned() {
                #[cfg(feature = "tracing")]
                tracing::debug!(destination = %entry.destination, "Dropped abandoned queued send");
                continue;
            }
            if entry.is_expired(max_age) {
                #[cfg(feature = "tracing")]
                tracing::debug!(destination = %entry.destination, "Expired queued send");
                entry.resolve(Err(Error::timeout("queued send", max_age)));
                continue;
            }
            return Some(entry);
        }
    }

    /// Remove abandoned and expired entries, returning how many are left.
    pub fn prune(&self, max_age: Duration) -> usize {
        let (stale, left) = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let (stale, live): (VecDeque<_>, VecDeque<_>) = entries
                .drain(..)
                .partition(|entry| entry.is_abandoned() || entry.is_expired(max_age));
            *entries = live;
            (stale, entries.len())
        };
        for entry in stale {
            entry.resolve(Err(Error::timeout("queued send", max_age)));
        }
        left
    }

    /// Fail every waiting send, returning how many there were.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(WsError::ConnectionClosed.into()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
