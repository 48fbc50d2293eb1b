//! Failover-cluster manager: lifecycle of the health-probe responder.
//!
//! Cluster load balancers probe a TCP port to decide which node owns a
//! failover address; the responder answers every probe with `1` while
//! this node is active.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Cycle, Manager};
use crate::config::resolve_flag;

/// Default port probed by the cluster's load balancer.
pub const DEFAULT_PROBE_PORT: u16 = 59998;

struct Responder {
    /// Port as resolved from config/attributes; the drift comparison key.
    port: u16,
    /// Port actually bound (differs from `port` only for port 0).
    local_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WsfcManager {
    /// Parent token; responder tasks die with the process.
    shutdown: CancellationToken,
    responder: Mutex<Option<Responder>>,
}

impl WsfcManager {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            responder: Mutex::new(None),
        }
    }

    fn resolved(cycle: &Cycle) -> (bool, u16) {
        let instance = &cycle.new.instance.attributes;
        let project = &cycle.new.project.attributes;

        // An explicit address list implies the feature even without the
        // enable flag.
        let has_addresses = cycle
            .config
            .wsfc
            .addresses
            .as_ref()
            .or(instance.wsfc_addresses.as_ref())
            .or(project.wsfc_addresses.as_ref())
            .is_some_and(|raw| !raw.trim().is_empty());
        let enabled = has_addresses
            || resolve_flag(
                cycle.config.wsfc.enable,
                instance.enable_wsfc,
                project.enable_wsfc,
                false,
            );

        let port = cycle
            .config
            .wsfc
            .port
            .or_else(|| parse_port(instance.wsfc_agent_port.as_deref()))
            .or_else(|| parse_port(project.wsfc_agent_port.as_deref()))
            .unwrap_or(DEFAULT_PROBE_PORT);

        (enabled, port)
    }

    async fn start_responder(&self, port: u16) -> Result<Responder> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind health-probe port {port}"))?;
        let local_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(port);
        info!(port = local_port, "health-probe responder listening");

        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((mut stream, peer)) => {
                        debug!(peer = %peer, "health probe");
                        if let Err(e) = stream.write_all(b"1").await {
                            debug!(peer = %peer, "failed to answer probe: {e}");
                        }
                    }
                    Err(e) => warn!("health-probe accept failed: {e}"),
                }
            }
            debug!("health-probe responder stopped");
        });

        Ok(Responder {
            port,
            local_port,
            cancel,
            task,
        })
    }

    async fn stop_responder(responder: Responder) {
        responder.cancel.cancel();
        let _ = responder.task.await;
        info!(port = responder.port, "health-probe responder stopped");
    }
}

#[async_trait]
impl Manager for WsfcManager {
    fn name(&self) -> &'static str {
        "failover-cluster"
    }

    // Always runs, so a toggle-off stops the responder.
    async fn disabled(&self, _cycle: &Cycle) -> Result<bool> {
        Ok(false)
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        let (enabled, port) = Self::resolved(cycle);
        let running = self.responder.lock().await;
        Ok(match running.as_ref() {
            Some(responder) => !enabled || responder.port != port,
            None => enabled,
        })
    }

    async fn converge(&self, cycle: &Cycle) -> Result<()> {
        let (enabled, port) = Self::resolved(cycle);
        let mut running = self.responder.lock().await;

        match (enabled, running.take()) {
            (true, Some(responder)) if responder.port == port => {
                *running = Some(responder);
            }
            (true, previous) => {
                if let Some(responder) = previous {
                    Self::stop_responder(responder).await;
                }
                *running = Some(self.start_responder(port).await?);
            }
            (false, Some(responder)) => {
                Self::stop_responder(responder).await;
            }
            (false, None) => {}
        }
        Ok(())
    }
}

fn parse_port(raw: Option<&str>) -> Option<u16> {
    let raw = raw?.trim();
    match raw.parse() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(raw = %raw, "ignoring unparseable health-probe port");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;
    use crate::config::AgentConfig;
    use crate::metadata::descriptor::Descriptor;

    fn cycle_with_wsfc(enabled: Option<bool>, port: Option<&str>) -> Cycle {
        let mut descriptor = Descriptor::default();
        descriptor.instance.attributes.enable_wsfc = enabled;
        descriptor.instance.attributes.wsfc_agent_port = port.map(str::to_string);
        Cycle::new(None, Arc::new(descriptor), Arc::new(AgentConfig::default()))
    }

    fn cycle_with_port(port: u16) -> Cycle {
        let mut descriptor = Descriptor::default();
        descriptor.instance.attributes.enable_wsfc = Some(true);
        let mut config = AgentConfig::default();
        config.wsfc.port = Some(port);
        Cycle::new(None, Arc::new(descriptor), Arc::new(config))
    }

    #[test]
    fn port_resolution_and_fallback() {
        let (enabled, port) = WsfcManager::resolved(&cycle_with_wsfc(Some(true), Some("9602")));
        assert!(enabled);
        assert_eq!(port, 9602);

        let (_, port) = WsfcManager::resolved(&cycle_with_wsfc(Some(true), Some("junk")));
        assert_eq!(port, DEFAULT_PROBE_PORT);

        let (enabled, _) = WsfcManager::resolved(&cycle_with_wsfc(None, None));
        assert!(!enabled);
    }

    #[test]
    fn explicit_address_list_implies_the_feature() {
        let mut descriptor = Descriptor::default();
        descriptor.instance.attributes.wsfc_addresses = Some("10.0.0.9".to_string());
        let cycle = Cycle::new(None, Arc::new(descriptor), Arc::new(AgentConfig::default()));
        let (enabled, _) = WsfcManager::resolved(&cycle);
        assert!(enabled);
    }

    #[tokio::test]
    async fn responder_answers_probes_and_stops_on_toggle_off() {
        let manager = WsfcManager::new(CancellationToken::new());

        // Port 0 lets the OS pick a free port; resolve it back out of the
        // running responder for the probe.
        let on = cycle_with_port(0);
        assert!(manager.drifted(&on).await.unwrap());
        manager.converge(&on).await.unwrap();

        let port = {
            let running = manager.responder.lock().await;
            running.as_ref().unwrap().local_port
        };
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1");

        let off = cycle_with_wsfc(Some(false), None);
        assert!(manager.drifted(&off).await.unwrap());
        manager.converge(&off).await.unwrap();
        assert!(manager.responder.lock().await.is_none());
    }

    #[tokio::test]
    async fn port_change_restarts_the_responder() {
        let manager = WsfcManager::new(CancellationToken::new());

        manager.converge(&cycle_with_port(0)).await.unwrap();
        assert!(!manager.drifted(&cycle_with_port(0)).await.unwrap());
        assert!(manager.drifted(&cycle_with_port(1)).await.unwrap());
    }
}
