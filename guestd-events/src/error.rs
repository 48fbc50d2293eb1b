use thiserror::Error;

/// Error produced by a watcher iteration.
///
/// Carried inside the event envelope and dispatched to subscribers, not
/// swallowed by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("watcher {watcher}: {message}")]
pub struct WatchError {
    /// Identity of the watcher that failed.
    pub watcher: &'static str,
    pub message: String,
}

impl WatchError {
    pub fn new(watcher: &'static str, message: impl Into<String>) -> Self {
        Self {
            watcher,
            message: message.into(),
        }
    }
}
