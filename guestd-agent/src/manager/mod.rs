//! Manager contract and the per-cycle orchestrator.
//!
//! Each manager reconciles one OS-state concern. The orchestrator fans
//! the four-phase protocol out across all managers for one update cycle
//! and isolates per-manager failures.

pub mod accounts;
pub mod addresses;
pub mod clock;
pub mod diagnostics;
pub mod oslogin;
pub mod wsfc;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::AgentConfig;
use crate::metadata::descriptor::Descriptor;

/// Read-only inputs for one reconciliation cycle.
///
/// The descriptor pair is swapped by the event subscriber strictly before
/// dispatch begins; managers never write through it.
#[derive(Clone)]
pub struct Cycle {
    /// Descriptor as of the previous completed cycle, if any.
    pub old: Option<Arc<Descriptor>>,
    /// Descriptor that triggered this cycle.
    pub new: Arc<Descriptor>,
    pub config: Arc<AgentConfig>,
}

impl Cycle {
    pub fn new(
        old: Option<Arc<Descriptor>>,
        new: Arc<Descriptor>,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self { old, new, config }
    }
}

/// A reconciler for one OS-state concern.
///
/// The orchestrator invokes the phases strictly in order, stopping at the
/// first that answers "do nothing": `converge` runs iff the manager is
/// enabled and either a refresh is due or drift was detected. `converge`
/// is the only phase allowed to mutate OS state and must be idempotent,
/// since a due refresh re-runs it even when nothing changed.
#[async_trait]
pub trait Manager: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this manager is turned off for this cycle. Consults local
    /// configuration first, then instance attributes, then project
    /// attributes; absence of all three falls back to the manager's
    /// default.
    async fn disabled(&self, cycle: &Cycle) -> Result<bool>;

    /// Whether the manager must run even without detected drift.
    async fn refresh_due(&self, _cycle: &Cycle) -> Result<bool> {
        Ok(false)
    }

    /// Whether the manager's slice of desired state differs from what was
    /// last applied. May update the manager's own memoized comparison
    /// state, nothing else.
    async fn drifted(&self, cycle: &Cycle) -> Result<bool>;

    /// Converge local OS state toward the descriptor.
    async fn converge(&self, cycle: &Cycle) -> Result<()>;
}

/// Outcome of one manager within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Disabled,
    /// No drift and no refresh due.
    Clean,
    Converged,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ManagerReport {
    pub manager: &'static str,
    pub outcome: Outcome,
}

/// Per-manager outcomes of one orchestrator pass.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub managers: Vec<ManagerReport>,
}

impl CycleReport {
    pub fn converged(&self) -> usize {
        self.count(Outcome::Converged)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.managers
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }
}

/// Run one full reconciliation cycle across all managers.
///
/// Managers run concurrently and independently; an error or panic in one
/// is logged with its identity and never aborts the siblings. Returns
/// only once every manager has finished, so the caller serializes cycles
/// simply by awaiting.
pub async fn run_cycle(cycle: &Cycle, managers: &[Arc<dyn Manager>]) -> CycleReport {
    let mut handles = Vec::with_capacity(managers.len());
    for manager in managers {
        let manager = Arc::clone(manager);
        let cycle = cycle.clone();
        let name = manager.name();
        handles.push((
            name,
            tokio::spawn(async move { run_manager(manager.as_ref(), &cycle).await }),
        ));
    }

    let mut report = CycleReport::default();
    for (name, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!(manager = name, "manager panicked: {e}");
                Outcome::Failed
            }
            Err(e) => {
                error!(manager = name, "manager task aborted: {e}");
                Outcome::Failed
            }
        };
        report.managers.push(ManagerReport {
            manager: name,
            outcome,
        });
    }

    info!(
        converged = report.converged(),
        failed = report.failed(),
        total = report.managers.len(),
        "reconciliation cycle finished"
    );
    report
}

async fn run_manager(manager: &dyn Manager, cycle: &Cycle) -> Outcome {
    let name = manager.name();

    match manager.disabled(cycle).await {
        Ok(true) => {
            debug!(manager = name, "disabled, skipping");
            return Outcome::Disabled;
        }
        Ok(false) => {}
        Err(e) => {
            error!(manager = name, "disabled check failed, skipping cycle: {e:#}");
            return Outcome::Failed;
        }
    }

    let refresh = match manager.refresh_due(cycle).await {
        Ok(refresh) => refresh,
        Err(e) => {
            error!(manager = name, "refresh check failed, skipping cycle: {e:#}");
            return Outcome::Failed;
        }
    };

    // A due refresh already mandates convergence; only consult the diff
    // when it does not.
    let needed = refresh
        || match manager.drifted(cycle).await {
            Ok(drifted) => drifted,
            Err(e) => {
                error!(manager = name, "drift check failed, skipping cycle: {e:#}");
                return Outcome::Failed;
            }
        };

    if !needed {
        debug!(manager = name, "no drift, nothing to do");
        return Outcome::Clean;
    }

    match manager.converge(cycle).await {
        Ok(()) => {
            info!(manager = name, "converged");
            Outcome::Converged
        }
        Err(e) => {
            error!(manager = name, "converge failed: {e:#}");
            Outcome::Failed
        }
    }
}
