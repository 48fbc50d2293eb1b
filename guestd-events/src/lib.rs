//! Typed event bus for the guestd agent.
//!
//! Watchers are independent producers, each running in its own task and
//! blocking on an underlying source (a long-poll, a timer, a socket).
//! Subscribers register per event kind and are invoked synchronously, in
//! registration order, by a single dispatch loop. Error outcomes from a
//! watcher are dispatched like any other event so subscribers own the
//! recovery policy.
//!
//! The bus run loop is the consuming program's main blocking point: it
//! returns once the cancellation token fires (after joining all watcher
//! tasks) or once every watcher has retired.

mod bus;
mod error;
mod event;

pub use bus::EventBus;
pub use error::WatchError;
pub use event::{Event, Subscriber, SubscriberAction, Watcher};
