//! The descriptor: a full desired-state snapshot published by the
//! metadata service, instance- and project-scoped.
//!
//! Attribute toggles arrive as the strings `"true"`/`"false"` (the
//! service stores them as flat key/value text), so the optional booleans
//! here decode both JSON booleans and their string spellings.

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Descriptor {
    pub instance: Instance,
    pub project: Project,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub id: u64,
    pub hostname: String,
    pub network_interfaces: Vec<NetworkInterface>,
    pub attributes: Attributes,
    pub virtual_clock: VirtualClock,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VirtualClock {
    /// Opaque token the host bumps whenever the guest clock may have
    /// drifted (live migration, resume).
    pub drift_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Hardware address used to resolve the local OS interface.
    pub mac: String,
    pub forwarded_ips: Vec<String>,
    pub forwarded_ipv6s: Vec<String>,
    pub target_instance_ips: Vec<String>,
    /// Alias ranges in `IP/prefix` form.
    pub ip_aliases: Vec<String>,
}

/// Feature toggles and payloads, present at instance and project scope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attributes {
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_ip_forwarding: Option<bool>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_target_instance_ips: Option<bool>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_ip_aliases: Option<bool>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_wsfc: Option<bool>,
    /// Comma-separated addresses handled by the failover cluster.
    pub wsfc_addresses: Option<String>,
    /// Port for the failover health-probe responder, as published.
    pub wsfc_agent_port: Option<String>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_os_login: Option<bool>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_two_factor: Option<bool>,
    #[serde(deserialize_with = "de_opt_bool")]
    pub enable_diagnostics: Option<bool>,
    /// Diagnostics collection request payload.
    pub diagnostics: Option<String>,
    /// Newline-separated `user:key` entries for account provisioning.
    pub user_keys: Option<String>,
}

fn de_opt_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Bool(b)) => Ok(Some(b)),
        Some(Raw::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "y" | "yes" => Ok(Some(true)),
            "false" | "0" | "n" | "no" => Ok(Some(false)),
            // An unparseable attribute behaves as unset.
            _ => Ok(None),
        },
    }
}
