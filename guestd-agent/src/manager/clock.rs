//! Clock-skew manager: resynchronizes the guest clock when the host
//! signals possible drift (live migration, resume from suspend).

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{Cycle, Manager};
use crate::os::ClockOps;

pub struct ClockManager {
    clock: Arc<dyn ClockOps>,
}

impl ClockManager {
    pub fn new(clock: Arc<dyn ClockOps>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Manager for ClockManager {
    fn name(&self) -> &'static str {
        "clock-skew"
    }

    async fn disabled(&self, cycle: &Cycle) -> Result<bool> {
        Ok(cycle.config.clock.disable.unwrap_or(false))
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        let Some(old) = &cycle.old else {
            return Ok(true);
        };
        Ok(old.instance.virtual_clock.drift_token
            != cycle.new.instance.virtual_clock.drift_token)
    }

    async fn converge(&self, _cycle: &Cycle) -> Result<()> {
        self.clock
            .sync_time()
            .await
            .context("clock resynchronization failed")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::AgentConfig;
    use crate::metadata::descriptor::Descriptor;
    use crate::os::OsError;

    #[derive(Default)]
    struct FakeClock {
        syncs: AtomicUsize,
    }

    #[async_trait]
    impl ClockOps for FakeClock {
        async fn sync_time(&self) -> Result<(), OsError> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor_with_token(token: &str) -> Arc<Descriptor> {
        let mut descriptor = Descriptor::default();
        descriptor.instance.virtual_clock.drift_token = token.to_string();
        Arc::new(descriptor)
    }

    #[tokio::test]
    async fn drift_follows_the_token() {
        let manager = ClockManager::new(Arc::new(FakeClock::default()));
        let config = Arc::new(AgentConfig::default());

        let unchanged = Cycle::new(
            Some(descriptor_with_token("7")),
            descriptor_with_token("7"),
            Arc::clone(&config),
        );
        assert!(!manager.drifted(&unchanged).await.unwrap());

        let bumped = Cycle::new(
            Some(descriptor_with_token("7")),
            descriptor_with_token("8"),
            config,
        );
        assert!(manager.drifted(&bumped).await.unwrap());
    }

    #[tokio::test]
    async fn converge_invokes_the_sync_primitive() {
        let clock = Arc::new(FakeClock::default());
        let clock_dyn: Arc<dyn ClockOps> = clock.clone();
        let manager = ClockManager::new(clock_dyn);
        let cycle = Cycle::new(
            None,
            descriptor_with_token("7"),
            Arc::new(AgentConfig::default()),
        );

        manager.converge(&cycle).await.unwrap();
        assert_eq!(clock.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_config_can_disable() {
        let manager = ClockManager::new(Arc::new(FakeClock::default()));
        let mut config = AgentConfig::default();
        config.clock.disable = Some(true);
        let cycle = Cycle::new(None, descriptor_with_token("7"), Arc::new(config));
        assert!(manager.disabled(&cycle).await.unwrap());
    }
}
