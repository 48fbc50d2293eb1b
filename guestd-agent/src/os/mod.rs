//! Collaborator seams around OS mutation primitives.
//!
//! Everything the agent does to the host goes through these traits, so
//! the reconciliation logic stays testable against in-memory fakes and
//! the platform-specific plumbing stays thin.

pub mod linux;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OsError {
    #[error("no interface with hardware address {0}")]
    UnknownInterface(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A resolved local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
    pub mac: String,
}

/// Interface enumeration and lookup.
#[async_trait]
pub trait InterfaceOps: Send + Sync {
    async fn list(&self) -> Result<Vec<NetInterface>, OsError>;

    /// Resolve an interface by hardware address (case-insensitive).
    async fn by_mac(&self, mac: &str) -> Result<NetInterface, OsError> {
        let wanted = mac.to_ascii_lowercase();
        self.list()
            .await?
            .into_iter()
            .find(|iface| iface.mac.to_ascii_lowercase() == wanted)
            .ok_or_else(|| OsError::UnknownInterface(mac.to_string()))
    }
}

/// Local route table operations, scoped to agent-owned entries.
#[async_trait]
pub trait RouteOps: Send + Sync {
    /// Agent-owned local routes currently configured on the interface.
    async fn list_routes(&self, iface: &NetInterface) -> Result<Vec<String>, OsError>;
    async fn add_route(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;
    async fn remove_route(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;
}

/// Address add/remove primitives for platforms without a usable local
/// route table; paired with a [`KvStore`] that persists what the agent
/// believes is configured.
#[async_trait]
pub trait AddressOps: Send + Sync {
    async fn add_address(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;
    async fn remove_address(&self, entry: &str, iface: &NetInterface) -> Result<(), OsError>;
}

/// Registry-equivalent persisted multi-value store.
///
/// `read_multi` on an absent key yields an empty list, not an error.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn read_multi(&self, key: &str, subkey: &str) -> Result<Vec<String>, OsError>;
    async fn write_multi(
        &self,
        key: &str,
        subkey: &str,
        values: &[String],
    ) -> Result<(), OsError>;
    async fn delete_key(&self, key: &str, subkey: &str) -> Result<(), OsError>;
}

/// Local account provisioning. Password generation and credential
/// encryption live behind this seam.
#[async_trait]
pub trait AccountOps: Send + Sync {
    /// Create the user if needed and rotate its credentials.
    async fn ensure_user(&self, username: &str) -> Result<(), OsError>;
}

/// Host clock resynchronization.
#[async_trait]
pub trait ClockOps: Send + Sync {
    async fn sync_time(&self) -> Result<(), OsError>;
}

/// OS-login integration toggle.
#[async_trait]
pub trait OsLoginOps: Send + Sync {
    async fn apply(&self, enabled: bool, two_factor: bool) -> Result<(), OsError>;
}

/// One-shot diagnostics collection.
#[async_trait]
pub trait DiagnosticsOps: Send + Sync {
    async fn collect(&self, request: &str) -> Result<(), OsError>;
}
