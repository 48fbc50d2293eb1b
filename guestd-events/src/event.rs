use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;

/// A single occurrence delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Event<E> {
    /// Identity of the watcher that produced the event.
    pub source: &'static str,
    /// Event kind subscribers filter on.
    pub kind: &'static str,
    /// Payload, or the error the producer ran into.
    pub result: Result<E, WatchError>,
}

/// Subscriber verdict after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberAction {
    /// Stay registered for future events of this kind.
    Keep,
    /// Drop this subscription.
    Unsubscribe,
}

/// A named event producer.
///
/// The bus runs each watcher in its own task, calling [`Watcher::next`]
/// in a loop and forwarding whatever it yields.
#[async_trait]
pub trait Watcher<E>: Send + 'static {
    /// Stable identity, used in logs and event envelopes.
    fn id(&self) -> &'static str;

    /// Event kind this watcher produces.
    fn kind(&self) -> &'static str;

    /// Block until the next outcome is available.
    ///
    /// Returning `None` retires the watcher. Implementations must observe
    /// `cancel` inside their blocking wait and return `None` promptly once
    /// it fires.
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Result<E, WatchError>>;
}

/// A callback bound to one event kind.
#[async_trait]
pub trait Subscriber<E>: Send {
    async fn on_event(&mut self, event: &Event<E>) -> SubscriberAction;
}
