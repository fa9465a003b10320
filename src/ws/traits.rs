//! Core traits for the STOMP session.

use super::message::InboundMessage;

/// Receives messages routed through a subscription.
///
/// Implemented for any `Fn(InboundMessage)` closure, so most callers never
/// name this trait.
///
/// # Example
///
/// ```ignore
/// manager.subscribe("/chat/42", |message: InboundMessage| {
///     println!("{}", message.body);
/// }, Headers::new());
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message. Called on the session task, in delivery order.
    fn handle(&self, message: InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    fn handle(&self, message: InboundMessage) {
        self(message);
    }
}
