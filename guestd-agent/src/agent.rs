//! Agent wiring: seeds the first cycle, owns the descriptor pair, and
//! drives the event bus until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use guestd_events::{Event, EventBus, Subscriber, SubscriberAction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::manager::{run_cycle, Cycle, Manager};
use crate::metadata::client::DescriptorSource;
use crate::metadata::descriptor::Descriptor;
use crate::metadata::watcher::{MetadataWatcher, DESCRIPTOR_EVENT};

/// Events flowing over the agent's bus.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    DescriptorUpdated(Arc<Descriptor>),
}

/// Attempts before giving up on the metadata service at boot.
const STARTUP_FETCH_ATTEMPTS: u32 = 10;

/// Delay between startup fetch attempts.
const STARTUP_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// The reconciliation agent: a fixed manager set plus the event plumbing
/// that feeds it descriptor updates.
pub struct GuestAgent {
    source: Arc<dyn DescriptorSource>,
    managers: Vec<Arc<dyn Manager>>,
    config: Arc<AgentConfig>,
}

impl GuestAgent {
    pub fn new(
        source: Arc<dyn DescriptorSource>,
        managers: Vec<Arc<dyn Manager>>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            source,
            managers,
            config,
        }
    }

    /// Fetch the initial descriptor, run the seed cycle, then watch for
    /// updates until the token is cancelled.
    pub async fn start(self, cancel: CancellationToken) -> Result<()> {
        let Some(initial) = self.initial_fetch(&cancel).await? else {
            // Cancelled before the first descriptor arrived.
            return Ok(());
        };
        let new = Arc::new(initial);

        info!("running initial reconciliation cycle");
        let seed = Cycle::new(None, Arc::clone(&new), Arc::clone(&self.config));
        run_cycle(&seed, &self.managers).await;

        let mut bus = EventBus::new();
        bus.add_watcher(Box::new(MetadataWatcher::new(Arc::clone(&self.source))));
        bus.subscribe(
            DESCRIPTOR_EVENT,
            Box::new(CycleSubscriber {
                old: None,
                new,
                managers: self.managers.clone(),
                config: Arc::clone(&self.config),
            }),
        );

        bus.run(cancel).await;
        Ok(())
    }

    async fn initial_fetch(&self, cancel: &CancellationToken) -> Result<Option<Descriptor>> {
        let mut attempt = 0u32;
        loop {
            match self.source.fetch().await {
                Ok(descriptor) => return Ok(Some(descriptor)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= STARTUP_FETCH_ATTEMPTS {
                        return Err(e).context("metadata service unreachable at startup");
                    }
                    warn!("initial descriptor fetch failed (attempt {attempt}): {e:#}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(STARTUP_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

/// Owns the old/new descriptor pair. The sole writer: the previous `new`
/// is designated `old` strictly before the cycle is dispatched, and
/// managers only ever see the pair read-only.
struct CycleSubscriber {
    old: Option<Arc<Descriptor>>,
    new: Arc<Descriptor>,
    managers: Vec<Arc<dyn Manager>>,
    config: Arc<AgentConfig>,
}

#[async_trait]
impl Subscriber<AgentEvent> for CycleSubscriber {
    async fn on_event(&mut self, event: &Event<AgentEvent>) -> SubscriberAction {
        match &event.result {
            Err(e) => {
                // The watcher already logged and scheduled the retry; the
                // retained descriptor pair is left untouched.
                debug!("descriptor watch error: {e}");
            }
            Ok(AgentEvent::DescriptorUpdated(descriptor)) => {
                self.old = Some(std::mem::replace(&mut self.new, Arc::clone(descriptor)));
                let cycle = Cycle::new(
                    self.old.clone(),
                    Arc::clone(&self.new),
                    Arc::clone(&self.config),
                );
                run_cycle(&cycle, &self.managers).await;
            }
        }
        SubscriberAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use guestd_events::WatchError;
    use tokio::sync::Mutex;

    use super::*;
    use crate::manager::tests::FakeManager;

    fn descriptor_with_hostname(hostname: &str) -> Arc<Descriptor> {
        let mut descriptor = Descriptor::default();
        descriptor.instance.hostname = hostname.to_string();
        Arc::new(descriptor)
    }

    /// Manager that records the descriptor pair of every cycle it sees.
    struct PairRecorder {
        pairs: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl Manager for PairRecorder {
        fn name(&self) -> &'static str {
            "pair-recorder"
        }

        async fn disabled(&self, _cycle: &Cycle) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn drifted(&self, cycle: &Cycle) -> anyhow::Result<bool> {
            self.pairs.lock().await.push((
                cycle.old.as_ref().map(|d| d.instance.hostname.clone()),
                cycle.new.instance.hostname.clone(),
            ));
            Ok(false)
        }

        async fn converge(&self, _cycle: &Cycle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn event(result: Result<AgentEvent, WatchError>) -> Event<AgentEvent> {
        Event {
            source: "metadata-watcher",
            kind: DESCRIPTOR_EVENT,
            result,
        }
    }

    #[tokio::test]
    async fn error_events_leave_the_descriptor_pair_intact() {
        let recorder = Arc::new(PairRecorder {
            pairs: Mutex::new(Vec::new()),
        });
        let mut subscriber = CycleSubscriber {
            old: None,
            new: descriptor_with_hostname("gen-1"),
            managers: vec![Arc::clone(&recorder) as Arc<dyn Manager>],
            config: Arc::new(AgentConfig::default()),
        };

        // A transient watch error arrives between two good descriptors.
        let keep = subscriber
            .on_event(&event(Ok(AgentEvent::DescriptorUpdated(
                descriptor_with_hostname("gen-2"),
            ))))
            .await;
        assert_eq!(keep, SubscriberAction::Keep);

        subscriber
            .on_event(&event(Err(WatchError::new("metadata-watcher", "boom"))))
            .await;

        subscriber
            .on_event(&event(Ok(AgentEvent::DescriptorUpdated(
                descriptor_with_hostname("gen-3"),
            ))))
            .await;

        let pairs = recorder.pairs.lock().await;
        assert_eq!(
            *pairs,
            vec![
                (Some("gen-1".to_string()), "gen-2".to_string()),
                // The error did not corrupt the retained "old".
                (Some("gen-2".to_string()), "gen-3".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn each_update_runs_one_cycle() {
        let manager = Arc::new(FakeManager::drifting("counting"));
        let mut subscriber = CycleSubscriber {
            old: None,
            new: descriptor_with_hostname("gen-1"),
            managers: vec![Arc::clone(&manager) as Arc<dyn Manager>],
            config: Arc::new(AgentConfig::default()),
        };

        for generation in ["gen-2", "gen-3"] {
            subscriber
                .on_event(&event(Ok(AgentEvent::DescriptorUpdated(
                    descriptor_with_hostname(generation),
                ))))
                .await;
        }

        assert_eq!(
            manager
                .converge_count
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }
}
