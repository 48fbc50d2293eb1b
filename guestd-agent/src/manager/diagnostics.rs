//! Diagnostics manager: kicks off a one-shot collection run when the
//! descriptor publishes a new diagnostics request.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Cycle, Manager};
use crate::config::resolve_flag;
use crate::os::DiagnosticsOps;

pub struct DiagnosticsManager {
    diagnostics: Arc<dyn DiagnosticsOps>,
    /// Request payload of the last collection run.
    last_request: Mutex<Option<String>>,
}

impl DiagnosticsManager {
    pub fn new(diagnostics: Arc<dyn DiagnosticsOps>) -> Self {
        Self {
            diagnostics,
            last_request: Mutex::new(None),
        }
    }

    fn request(cycle: &Cycle) -> Option<String> {
        cycle
            .new
            .instance
            .attributes
            .diagnostics
            .as_ref()
            .filter(|payload| !payload.trim().is_empty())
            .cloned()
    }
}

#[async_trait]
impl Manager for DiagnosticsManager {
    fn name(&self) -> &'static str {
        "diagnostics"
    }

    async fn disabled(&self, cycle: &Cycle) -> Result<bool> {
        let instance = &cycle.new.instance.attributes;
        let project = &cycle.new.project.attributes;
        Ok(!resolve_flag(
            cycle.config.diagnostics.enable,
            instance.enable_diagnostics,
            project.enable_diagnostics,
            false,
        ))
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        let Some(request) = Self::request(cycle) else {
            return Ok(false);
        };
        Ok(self.last_request.lock().await.as_deref() != Some(request.as_str()))
    }

    async fn converge(&self, cycle: &Cycle) -> Result<()> {
        let Some(request) = Self::request(cycle) else {
            return Ok(());
        };
        self.diagnostics
            .collect(&request)
            .await
            .context("diagnostics collection failed")?;
        *self.last_request.lock().await = Some(request);
        Ok(())
    }
}
