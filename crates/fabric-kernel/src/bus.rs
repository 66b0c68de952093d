//! The `Bus` capability trait: the thin, four-method contract the Publisher
//! and Subscriber both depend on, breaking the cycle between them (neither
//! owns the other; both just hold an `Arc<dyn Bus>`).
//!
//! A `Bus` implementation promises subject-addressed publish with a
//! reply-to inbox, queue-group subscriptions, at-most-once delivery, no
//! persistence, and best-effort ordering within a single publisher→subscriber
//! pair. `fabric-runtime` ships one implementation (`InProcessBus`); a
//! production deployment swaps in an external message-bus-backed one.

use crate::frame::Frame;
use async_trait::async_trait;
use thiserror::Error;

/// Whether a subscription is bus-distributed among replicas of the same
/// host (`Default`) or delivered to every replica (`None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueGroup {
    /// Shared group keyed by `host + method + route`; the bus picks one
    /// subscriber in the group per message.
    Default,
    /// Every replica gets its own unique group, so every replica receives
    /// every message.
    None,
}

/// A message received off a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Frame,
    /// The inbox to reply to, if the sender expects a response.
    pub reply_to: Option<String>,
}

/// Errors a `Bus` implementation can raise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusError {
    /// No subscribers were registered for the subject at publish time.
    #[error("no subscriber for subject '{0}'")]
    NoSubscriber(String),
    /// The subscription (or the whole bus) has been closed.
    #[error("bus connection closed")]
    Closed,
    /// The subject string failed validation.
    #[error("invalid subject '{0}': {1}")]
    InvalidSubject(String, String),
    /// A backend-specific failure not covered by the above.
    #[error("bus error: {0}")]
    Other(String),
}

/// A live subscription returned by [`Bus::subscribe`].
#[async_trait]
pub trait Subscription: Send {
    /// Await the next message, or `None` once the subscription is closed
    /// and drained.
    async fn next(&mut self) -> Option<BusMessage>;

    /// Cancel the subscription. Implementations should stop delivering new
    /// messages but may let any buffered message already pulled finish
    /// processing.
    async fn unsubscribe(self: Box<Self>);
}

/// The bus capability surface the Publisher and Subscriber both depend on.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` to `subject` with no reply expected.
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: Frame,
    ) -> Result<(), BusError>;

    /// Subscribe to `subject` under `queue_group`.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: QueueGroup,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Send a response on `inbox` (a reply-to address handed out by a
    /// publisher's request/publish call).
    async fn reply(&self, inbox: &str, payload: Vec<u8>, headers: Frame) -> Result<(), BusError>;

    /// Publish to `subject` with `inbox` set as the reply-to address.
    async fn request(
        &self,
        subject: &str,
        inbox: &str,
        payload: Vec<u8>,
        headers: Frame,
    ) -> Result<(), BusError>;
}
