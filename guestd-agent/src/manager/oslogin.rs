//! OS-login manager: applies the resolved (enabled, two-factor) pair to
//! the host's login stack.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Cycle, Manager};
use crate::config::resolve_flag;
use crate::os::OsLoginOps;

pub struct OsLoginManager {
    oslogin: Arc<dyn OsLoginOps>,
    /// (enabled, two_factor) applied on the last converge.
    last_applied: Mutex<Option<(bool, bool)>>,
}

impl OsLoginManager {
    pub fn new(oslogin: Arc<dyn OsLoginOps>) -> Self {
        Self {
            oslogin,
            last_applied: Mutex::new(None),
        }
    }

    fn resolved(cycle: &Cycle) -> (bool, bool) {
        let instance = &cycle.new.instance.attributes;
        let project = &cycle.new.project.attributes;
        let enabled = resolve_flag(
            cycle.config.os_login.disable.map(|disable| !disable),
            instance.enable_os_login,
            project.enable_os_login,
            false,
        );
        let two_factor = resolve_flag(
            None,
            instance.enable_two_factor,
            project.enable_two_factor,
            false,
        );
        (enabled, two_factor)
    }
}

#[async_trait]
impl Manager for OsLoginManager {
    fn name(&self) -> &'static str {
        "os-login"
    }

    // Always runs, so a toggle-off is applied as a deactivation rather
    // than silently skipped.
    async fn disabled(&self, _cycle: &Cycle) -> Result<bool> {
        Ok(false)
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        let wanted = Self::resolved(cycle);
        Ok(self.last_applied.lock().await.map_or(true, |applied| applied != wanted))
    }

    async fn converge(&self, cycle: &Cycle) -> Result<()> {
        let (enabled, two_factor) = Self::resolved(cycle);
        self.oslogin
            .apply(enabled, two_factor)
            .await
            .context("failed to apply OS-login state")?;
        *self.last_applied.lock().await = Some((enabled, two_factor));
        Ok(())
    }
}
