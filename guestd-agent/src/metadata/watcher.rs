//! Event-bus watcher that long-polls the metadata service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guestd_events::{WatchError, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::DescriptorSource;
use crate::agent::AgentEvent;

/// Event kind emitted for every descriptor the watcher receives.
pub const DESCRIPTOR_EVENT: &str = "metadata.descriptor";

/// Delay before retrying after a failed watch attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Long-poll producer for descriptor updates.
///
/// Failures are emitted as error events (subscribers decide the recovery
/// policy) and retried after a fixed backoff. A sustained failure streak
/// is logged once at warn level, then suppressed to debug until the error
/// changes or a watch succeeds. The watcher never compares descriptors;
/// old/new designation happens in the subscriber.
pub struct MetadataWatcher {
    source: Arc<dyn DescriptorSource>,
    /// Error message of the current failure streak, if any.
    last_error: Option<String>,
}

impl MetadataWatcher {
    pub fn new(source: Arc<dyn DescriptorSource>) -> Self {
        Self {
            source,
            last_error: None,
        }
    }
}

#[async_trait]
impl Watcher<AgentEvent> for MetadataWatcher {
    fn id(&self) -> &'static str {
        "metadata-watcher"
    }

    fn kind(&self) -> &'static str {
        DESCRIPTOR_EVENT
    }

    async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<AgentEvent, WatchError>> {
        if self.last_error.is_some() {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_BACKOFF) => {}
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = self.source.watch() => outcome,
        };

        match outcome {
            Ok(descriptor) => {
                if self.last_error.take().is_some() {
                    debug!("metadata watch recovered");
                }
                Some(Ok(AgentEvent::DescriptorUpdated(Arc::new(descriptor))))
            }
            Err(e) => {
                let message = format!("{e:#}");
                if self.last_error.as_deref() == Some(message.as_str()) {
                    debug!("metadata watch still failing: {message}");
                } else {
                    warn!(
                        "metadata watch failed, retrying in {}s: {message}",
                        RETRY_BACKOFF.as_secs()
                    );
                    self.last_error = Some(message.clone());
                }
                Some(Err(WatchError::new("metadata-watcher", message)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;
    use tokio::sync::Mutex;

    use super::*;
    use crate::metadata::descriptor::Descriptor;

    struct ScriptedSource {
        script: Mutex<VecDeque<anyhow::Result<Descriptor>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<anyhow::Result<Descriptor>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl DescriptorSource for ScriptedSource {
        async fn fetch(&self) -> anyhow::Result<Descriptor> {
            self.watch().await
        }

        async fn watch(&self) -> anyhow::Result<Descriptor> {
            match self.script.lock().await.pop_front() {
                Some(outcome) => outcome,
                None => std::future::pending().await,
            }
        }
    }

    fn descriptor_with_hostname(hostname: &str) -> Descriptor {
        let mut descriptor = Descriptor::default();
        descriptor.instance.hostname = hostname.to_string();
        descriptor
    }

    #[tokio::test(start_paused = true)]
    async fn emits_error_then_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(anyhow!("connection refused")),
            Ok(descriptor_with_hostname("vm-1")),
        ]));
        let mut watcher = MetadataWatcher::new(source);
        let cancel = CancellationToken::new();

        let first = watcher.next(&cancel).await.unwrap();
        assert!(first.is_err());

        // Second attempt waits out the backoff (paused clock) and succeeds.
        let second = watcher.next(&cancel).await.unwrap().unwrap();
        let AgentEvent::DescriptorUpdated(descriptor) = second;
        assert_eq!(descriptor.instance.hostname, "vm-1");
        assert!(watcher.last_error.is_none());
    }

    #[tokio::test]
    async fn cancellation_retires_the_watcher() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let mut watcher = MetadataWatcher::new(source);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(watcher.next(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_keep_the_streak() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(anyhow!("connection refused")),
            Err(anyhow!("connection refused")),
        ]));
        let mut watcher = MetadataWatcher::new(source);
        let cancel = CancellationToken::new();

        assert!(watcher.next(&cancel).await.unwrap().is_err());
        assert!(watcher.next(&cancel).await.unwrap().is_err());
        assert_eq!(watcher.last_error.as_deref(), Some("connection refused"));
    }
}
