use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::{Event, Subscriber, SubscriberAction, Watcher};

/// Bound on events queued between producers and the dispatch loop.
/// Producers are backpressured while a dispatch is in flight.
const EVENT_QUEUE_DEPTH: usize = 16;

/// Publish/subscribe core: a registry of watchers and per-kind
/// subscriptions plus the blocking fetch-dispatch loop.
pub struct EventBus<E> {
    watchers: Vec<Box<dyn Watcher<E>>>,
    subscribers: HashMap<&'static str, Vec<Box<dyn Subscriber<E>>>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            watchers: Vec::new(),
            subscribers: HashMap::new(),
        }
    }
}

impl<E: Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer. Its loop starts when [`EventBus::run`] does.
    pub fn add_watcher(&mut self, watcher: Box<dyn Watcher<E>>) {
        self.watchers.push(watcher);
    }

    /// Register a subscriber for one event kind. Subscriptions are
    /// additive and dispatched in registration order.
    pub fn subscribe(&mut self, kind: &'static str, subscriber: Box<dyn Subscriber<E>>) {
        self.subscribers.entry(kind).or_default().push(subscriber);
    }

    /// Run until cancellation or until every watcher has retired.
    ///
    /// Spawns one task per watcher, then dispatches events serially: at
    /// most one dispatch is in flight at any time. On cancellation, all
    /// watcher tasks are joined before this returns.
    pub async fn run(mut self, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<Event<E>>(EVENT_QUEUE_DEPTH);

        let mut producers = JoinSet::new();
        for mut watcher in self.watchers.drain(..) {
            let tx = tx.clone();
            let cancel = cancel.clone();
            producers.spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = watcher.next(&cancel) => item,
                    };
                    let Some(result) = item else {
                        break;
                    };
                    let event = Event {
                        source: watcher.id(),
                        kind: watcher.kind(),
                        result,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                debug!(watcher = watcher.id(), "watcher retired");
            });
        }
        // Only producer tasks hold senders now; rx drains to None once
        // every watcher has retired.
        drop(tx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("event bus cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        debug!("all watchers retired, event bus stopping");
                        break;
                    }
                }
            }
        }

        while producers.join_next().await.is_some() {}
    }

    async fn dispatch(&mut self, event: Event<E>) {
        let Some(subscribers) = self.subscribers.get_mut(event.kind) else {
            debug!(kind = event.kind, "no subscribers for event");
            return;
        };
        let mut retained = Vec::with_capacity(subscribers.len());
        for mut subscriber in subscribers.drain(..) {
            match subscriber.on_event(&event).await {
                SubscriberAction::Keep => retained.push(subscriber),
                SubscriberAction::Unsubscribe => {}
            }
        }
        *subscribers = retained;
    }
}
