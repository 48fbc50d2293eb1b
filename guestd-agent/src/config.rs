//! Local agent configuration.
//!
//! Settings are layered: the local TOML file has the highest precedence,
//! then instance-scoped descriptor attributes, then project-scoped ones,
//! then a built-in default. [`resolve_flag`] implements that lookup.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Contents of the agent's TOML config file.
///
/// Every field is optional: an unset field defers to the descriptor's
/// attributes and ultimately to the built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub network: NetworkConfig,
    pub wsfc: WsfcConfig,
    pub accounts: AccountsConfig,
    pub os_login: OsLoginConfig,
    pub diagnostics: DiagnosticsConfig,
    pub clock: ClockConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Master switch for forwarded-address reconciliation.
    pub manage_addresses: Option<bool>,
    /// Include target-instance IPs in the desired set.
    pub target_instance_ips: Option<bool>,
    /// Include IP alias ranges in the desired set.
    pub ip_aliases: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WsfcConfig {
    pub enable: Option<bool>,
    /// Comma-separated list of addresses handled by the failover cluster.
    pub addresses: Option<String>,
    /// Port the health-probe responder listens on.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AccountsConfig {
    pub disable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OsLoginConfig {
    pub disable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsConfig {
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockConfig {
    pub disable: Option<bool>,
}

impl AgentConfig {
    /// Load the config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Layered flag lookup: first explicitly-set value among
/// {local file, instance attribute, project attribute} wins, else the
/// built-in default.
pub fn resolve_flag(
    local: Option<bool>,
    instance: Option<bool>,
    project: Option<bool>,
    default: bool,
) -> bool {
    local.or(instance).or(project).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn resolve_flag_precedence() {
        assert!(resolve_flag(Some(true), Some(false), Some(false), false));
        assert!(!resolve_flag(Some(false), Some(true), Some(true), true));
        assert!(resolve_flag(None, Some(true), Some(false), false));
        assert!(!resolve_flag(None, None, Some(false), true));
        assert!(resolve_flag(None, None, None, true));
        assert!(!resolve_flag(None, None, None, false));
    }

    #[test]
    fn load_parses_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [network]
            manage_addresses = false

            [wsfc]
            enable = true
            addresses = "10.0.0.9,10.0.0.10"
            port = 9602
            "#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.network.manage_addresses, Some(false));
        assert_eq!(config.network.ip_aliases, None);
        assert_eq!(config.wsfc.enable, Some(true));
        assert_eq!(config.wsfc.port, Some(9602));
        assert_eq!(config.accounts.disable, None);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let config = AgentConfig::load(Path::new("/nonexistent/guestd.toml")).unwrap();
        assert_eq!(config.network.manage_addresses, None);
        assert_eq!(config.wsfc.enable, None);
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[network]\nmanage_adresses = true\n").unwrap();
        assert!(matches!(
            AgentConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
