//! Forwarded-address reconciliation: diff the descriptor's desired
//! address set against what the host actually has configured, then add
//! and remove entries to converge.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Cycle, Manager};
use crate::config::{resolve_flag, AgentConfig};
use crate::metadata::descriptor::{Descriptor, NetworkInterface};
use crate::os::{AddressOps, InterfaceOps, KvStore, NetInterface, OsError, RouteOps};

/// How configured addresses are read and recorded on this platform.
#[async_trait]
pub trait AddressBackend: Send + Sync {
    /// Addresses currently configured on the interface.
    async fn configured(&self, iface: &NetInterface) -> Result<Vec<String>, OsError>;

    async fn add(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;

    async fn remove(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;

    /// Record the final present set. No-op where the OS state itself is
    /// the authoritative record.
    async fn persist(
        &self,
        iface: &NetInterface,
        present: &BTreeSet<String>,
    ) -> Result<(), OsError>;

    /// Whether IP alias ranges can be configured through this backend.
    fn supports_aliases(&self) -> bool;
}

/// Backend over the local route table. The table is authoritative, so
/// there is nothing separate to persist.
pub struct RouteBackend {
    routes: Arc<dyn RouteOps>,
}

impl RouteBackend {
    pub fn new(routes: Arc<dyn RouteOps>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl AddressBackend for RouteBackend {
    async fn configured(&self, iface: &NetInterface) -> Result<Vec<String>, OsError> {
        self.routes.list_routes(iface).await
    }

    async fn add(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        self.routes.add_route(entry, iface).await
    }

    async fn remove(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        self.routes.remove_route(entry, iface).await
    }

    async fn persist(
        &self,
        _iface: &NetInterface,
        _present: &BTreeSet<String>,
    ) -> Result<(), OsError> {
        Ok(())
    }

    fn supports_aliases(&self) -> bool {
        true
    }
}

/// Store key holding the per-interface present list, subkeyed by
/// hardware address.
pub const STORE_KEY: &str = "guestd/forwarded-addresses";

/// Pre-rename key, migrated on first read.
pub const LEGACY_STORE_KEY: &str = "guestd/addresses";

/// Backend over bare address primitives plus a persisted list in the
/// registry-equivalent store. Used on platforms whose address
/// configuration cannot be enumerated back from the OS.
pub struct StoreBackend {
    addresses: Arc<dyn AddressOps>,
    store: Arc<dyn KvStore>,
}

impl StoreBackend {
    pub fn new(addresses: Arc<dyn AddressOps>, store: Arc<dyn KvStore>) -> Self {
        Self { addresses, store }
    }
}

#[async_trait]
impl AddressBackend for StoreBackend {
    async fn configured(&self, iface: &NetInterface) -> Result<Vec<String>, OsError> {
        let values = self.store.read_multi(STORE_KEY, &iface.mac).await?;
        if !values.is_empty() {
            return Ok(values);
        }
        let legacy = self.store.read_multi(LEGACY_STORE_KEY, &iface.mac).await?;
        if legacy.is_empty() {
            return Ok(values);
        }
        info!(iface = %iface.name, "migrating address list from legacy store key");
        self.store.write_multi(STORE_KEY, &iface.mac, &legacy).await?;
        self.store.delete_key(LEGACY_STORE_KEY, &iface.mac).await?;
        Ok(legacy)
    }

    async fn add(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        self.addresses.add_address(entry, iface).await
    }

    async fn remove(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError> {
        self.addresses.remove_address(entry, iface).await
    }

    async fn persist(
        &self,
        iface: &NetInterface,
        present: &BTreeSet<String>,
    ) -> Result<(), OsError> {
        let values: Vec<String> = present.iter().cloned().collect();
        self.store.write_multi(STORE_KEY, &iface.mac, &values).await
    }

    fn supports_aliases(&self) -> bool {
        false
    }
}

/// Strip the full-host suffix so `10.0.0.5/32` and `10.0.0.5` compare
/// equal regardless of how they were recorded.
pub fn normalize(entry: &str) -> String {
    entry.strip_suffix("/32").unwrap_or(entry).to_string()
}

/// Plain set difference in both directions:
/// `to_add = desired − actual`, `to_remove = actual − desired`.
pub fn diff_sets(
    desired: &BTreeSet<String>,
    actual: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let to_add = desired.difference(actual).cloned().collect();
    let to_remove = actual.difference(desired).cloned().collect();
    (to_add, to_remove)
}

/// Failover-cluster address exclusion, applied to the desired sets
/// before diffing. An explicit address list drops exactly those entries;
/// a bare enable flag clears the forwarded and target-instance lists
/// wholesale.
pub struct FailoverFilter {
    enabled: bool,
    addresses: Vec<String>,
}

impl FailoverFilter {
    pub fn new(config: &AgentConfig, descriptor: &Descriptor) -> Self {
        let instance = &descriptor.instance.attributes;
        let project = &descriptor.project.attributes;
        let enabled = resolve_flag(
            config.wsfc.enable,
            instance.enable_wsfc,
            project.enable_wsfc,
            false,
        );
        let raw = config
            .wsfc
            .addresses
            .clone()
            .or_else(|| instance.wsfc_addresses.clone())
            .or_else(|| project.wsfc_addresses.clone());
        let addresses = raw
            .map(|raw| {
                raw.split(',')
                    .map(|entry| normalize(entry.trim()))
                    .filter(|entry| !entry.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self { enabled, addresses }
    }

    fn apply(&self, forwarded: &mut Vec<String>, target_ips: &mut Vec<String>) {
        if !self.addresses.is_empty() {
            let excluded = |ip: &String| self.addresses.contains(&normalize(ip));
            forwarded.retain(|ip| !excluded(ip));
            target_ips.retain(|ip| !excluded(ip));
        } else if self.enabled {
            forwarded.clear();
            target_ips.clear();
        }
    }
}

/// The address/route manager: the concrete set-reconciliation engine.
pub struct AddressManager {
    interfaces: Arc<dyn InterfaceOps>,
    backend: Arc<dyn AddressBackend>,
    /// Whether this host can join a failover cluster, which gates the
    /// desired-set exclusion filter.
    failover_capable: bool,
    /// Hardware addresses already reported unresolvable this process
    /// lifetime; suppresses duplicate error logging.
    bad_macs: Mutex<HashSet<String>>,
}

impl AddressManager {
    pub fn new(
        interfaces: Arc<dyn InterfaceOps>,
        backend: Arc<dyn AddressBackend>,
        failover_capable: bool,
    ) -> Self {
        Self {
            interfaces,
            backend,
            failover_capable,
            bad_macs: Mutex::new(HashSet::new()),
        }
    }

    /// Post-filter desired set for one interface.
    fn desired_set(
        &self,
        config: &AgentConfig,
        descriptor: &Descriptor,
        nic: &NetworkInterface,
        filter: Option<&FailoverFilter>,
    ) -> BTreeSet<String> {
        let instance = &descriptor.instance.attributes;
        let project = &descriptor.project.attributes;

        let mut forwarded: Vec<String> = nic
            .forwarded_ips
            .iter()
            .chain(&nic.forwarded_ipv6s)
            .cloned()
            .collect();

        let want_target_ips = resolve_flag(
            config.network.target_instance_ips,
            instance.enable_target_instance_ips,
            project.enable_target_instance_ips,
            true,
        );
        let mut target_ips: Vec<String> = if want_target_ips {
            nic.target_instance_ips.clone()
        } else {
            Vec::new()
        };

        if let Some(filter) = filter {
            filter.apply(&mut forwarded, &mut target_ips);
        }

        let mut desired: BTreeSet<String> = forwarded
            .iter()
            .chain(&target_ips)
            .map(|entry| normalize(entry))
            .collect();

        let want_aliases = resolve_flag(
            config.network.ip_aliases,
            instance.enable_ip_aliases,
            project.enable_ip_aliases,
            true,
        ) && self.backend.supports_aliases();
        if want_aliases {
            desired.extend(nic.ip_aliases.iter().map(|entry| normalize(entry)));
        }

        desired
    }

    /// Per-interface desired sets for a whole descriptor; the slice
    /// compared by the drift check.
    fn desired_sets(
        &self,
        config: &AgentConfig,
        descriptor: &Descriptor,
    ) -> Vec<(String, BTreeSet<String>)> {
        let filter = self
            .failover_capable
            .then(|| FailoverFilter::new(config, descriptor));
        descriptor
            .instance
            .network_interfaces
            .iter()
            .filter(|nic| !nic.mac.is_empty())
            .map(|nic| {
                (
                    nic.mac.clone(),
                    self.desired_set(config, descriptor, nic, filter.as_ref()),
                )
            })
            .collect()
    }

    async fn note_bad_mac(&self, mac: &str, err: &OsError) {
        let mut bad = self.bad_macs.lock().await;
        if bad.insert(mac.to_string()) {
            warn!(mac = %mac, "cannot resolve interface, skipping: {err}");
        } else {
            debug!(mac = %mac, "interface still unresolvable, skipping");
        }
    }

    async fn reconcile_interface(
        &self,
        desired: &BTreeSet<String>,
        iface: &NetInterface,
    ) -> Result<(), OsError> {
        let actual: BTreeSet<String> = self
            .backend
            .configured(iface)
            .await?
            .iter()
            .map(|entry| normalize(entry))
            .collect();

        let (to_add, to_remove) = diff_sets(desired, &actual);
        if !to_add.is_empty() || !to_remove.is_empty() {
            info!(
                iface = %iface.name,
                adding = ?to_add,
                removing = ?to_remove,
                "converging forwarded addresses"
            );
        }

        // Entries that were already correct stay present; adds join on
        // success; failed removals are re-recorded so the persisted list
        // reflects reality rather than intent.
        let mut present: BTreeSet<String> =
            actual.intersection(desired).cloned().collect();
        for entry in &to_add {
            match self.backend.add(entry, iface).await {
                Ok(()) => {
                    present.insert(entry.clone());
                }
                Err(e) => warn!(iface = %iface.name, entry = %entry, "failed to add address: {e}"),
            }
        }
        for entry in &to_remove {
            match self.backend.remove(entry, iface).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(iface = %iface.name, entry = %entry, "failed to remove address: {e}");
                    present.insert(entry.clone());
                }
            }
        }

        self.backend.persist(iface, &present).await
    }
}

#[async_trait]
impl Manager for AddressManager {
    fn name(&self) -> &'static str {
        "addresses"
    }

    async fn disabled(&self, cycle: &Cycle) -> Result<bool> {
        let instance = &cycle.new.instance.attributes;
        let project = &cycle.new.project.attributes;
        Ok(!resolve_flag(
            cycle.config.network.manage_addresses,
            instance.enable_ip_forwarding,
            project.enable_ip_forwarding,
            true,
        ))
    }

    async fn drifted(&self, cycle: &Cycle) -> Result<bool> {
        let Some(old) = &cycle.old else {
            return Ok(true);
        };
        Ok(self.desired_sets(&cycle.config, &cycle.new)
            != self.desired_sets(&cycle.config, old))
    }

    async fn converge(&self, cycle: &Cycle) -> Result<()> {
        let filter = self
            .failover_capable
            .then(|| FailoverFilter::new(&cycle.config, &cycle.new));

        for nic in &cycle.new.instance.network_interfaces {
            if nic.mac.is_empty() {
                continue;
            }
            let iface = match self.interfaces.by_mac(&nic.mac).await {
                Ok(iface) => iface,
                Err(e @ OsError::UnknownInterface(_)) => {
                    self.note_bad_mac(&nic.mac, &e).await;
                    continue;
                }
                // Not a per-interface miss: enumeration itself is broken.
                Err(e) => return Err(e).context("interface enumeration failed"),
            };
            let desired = self.desired_set(&cycle.config, &cycle.new, nic, filter.as_ref());
            if let Err(e) = self.reconcile_interface(&desired, &iface).await {
                warn!(iface = %iface.name, "address reconciliation failed: {e}");
            }
        }
        Ok(())
    }
}
