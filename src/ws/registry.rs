#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use indexmap::IndexMap;
use uuid::Uuid;

use super::message::{Headers, InboundMessage};
use super::traits::MessageHandler;

/// Information about an active subscription.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Destination this subscription targets
    pub topic: String,
    /// STOMP subscription id sent in the SUBSCRIBE frame
    pub id: String,
    /// Extra headers sent with every SUBSCRIBE for this topic
    pub headers: Headers,
    /// When the subscription was registered
    pub created_at: Instant,
}

struct Entry {
    info: SubscriptionInfo,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Entries {
    by_topic: IndexMap<String, Entry>,
    /// Subscription id to topic, for routing MESSAGE frames
    by_id: HashMap<String, String>,
}

/// Subscriptions to replay after every reconnect, keyed by topic.
///
/// Iteration follows registration order. Registering a topic again replaces
/// its handler and headers (last registration wins) but keeps its place in
/// that order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Entries>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription.
    ///
    /// Returns the new entry and, when the topic was already registered, the
    /// subscription id it replaces.
    pub fn record<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
        headers: Headers,
    ) -> (SubscriptionInfo, Option<String>) {
        let info = SubscriptionInfo {
            topic: topic.to_owned(),
            id: format!("sub-{}", Uuid::new_v4().simple()),
            headers,
            created_at: Instant::now(),
        };

        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.by_id.insert(info.id.clone(), topic.to_owned());
        let replaced = entries.by_topic.insert(
            topic.to_owned(),
            Entry {
                info: info.clone(),
                handler: Arc::new(handler),
            },
        );
        let replaced_id = replaced.map(|entry| entry.info.id);
        if let Some(id) = &replaced_id {
            entries.by_id.remove(id);
        }

        (info, replaced_id)
    }

    /// Forget a topic. Removing an unknown topic is a no-op.
    pub fn remove(&self, topic: &str) -> Option<SubscriptionInfo> {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = entries.by_topic.shift_remove(topic)?;
        entries.by_id.remove(&entry.info.id);
        Some(entry.info)
    }

    /// Drop every subscription, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let count = entries.by_topic.len();
        entries.by_topic.clear();
        entries.by_id.clear();
        count
    }

    /// All subscriptions in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_topic
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<SubscriptionInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_topic
            .get(topic)
            .map(|entry| entry.info.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_topic
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the handler for a message: by subscription id first, then by destination.
    ///
    /// Messages carrying the id of a replaced or removed subscription are not
    /// routed, so a late frame never reaches a handler that superseded it.
    fn handler_for(&self, message: &InboundMessage) -> Option<Arc<dyn MessageHandler>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let topic = match &message.subscription {
            Some(id) => entries.by_id.get(id)?,
            None => &message.destination,
        };
        entries
            .by_topic
            .get(topic)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Deliver a message to its handler. Returns whether a handler was found.
    ///
    /// The handler runs without the registry lock held, so it may subscribe or
    /// unsubscribe. A panicking handler is contained and logged.
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        let Some(handler) = self.handler_for(&message) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                destination = %message.destination,
                subscription = ?message.subscription,
                "No subscription found for message"
            );
            return false;
        };

        #[cfg(feature = "tracing")]
        let destination = message.destination.clone();
        if catch_unwind(AssertUnwindSafe(|| handler.handle(message))).is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!(%destination, "Subscription handler panicked");
        }
        true
    }
}
