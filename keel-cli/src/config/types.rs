use std::time::Duration;

use keel_coord::SessionConfig;
use serde::{Deserialize, Serialize};

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawKeelConfig {
    #[serde(default)]
    pub session: RawSessionSection,

    #[serde(default)]
    pub paths: RawPathsSection,
}

/// Session settings as stored in TOML (optional fields for proper merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawSessionSection {
    pub endpoint: Option<String>,

    #[serde(default, with = "humantime_serde")]
    pub session_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    pub max_connect_attempts: Option<u32>,

    #[serde(default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
}

/// Demo node paths as stored in TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPathsSection {
    pub election: Option<String>,
    pub lock: Option<String>,
    pub config: Option<String>,
    pub health: Option<String>,
    pub node: Option<String>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KeelConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

/// Paths used by the demo commands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Parent of election candidates
    pub election: String,

    /// Parent of lock candidates
    pub lock: String,

    /// Node followed by `keel watch`
    pub config: String,

    /// Parent of server health nodes
    pub health: String,

    /// Node used by `keel crud`
    pub node: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            election: DEFAULT_ELECTION_PATH.to_string(),
            lock: DEFAULT_LOCK_PATH.to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            health: DEFAULT_HEALTH_PATH.to_string(),
            node: DEFAULT_NODE_PATH.to_string(),
        }
    }
}

pub const DEFAULT_ELECTION_PATH: &str = "/leader-election";
pub const DEFAULT_LOCK_PATH: &str = "/locks/demo";
pub const DEFAULT_CONFIG_PATH: &str = "/cfg";
pub const DEFAULT_HEALTH_PATH: &str = "/health";
pub const DEFAULT_NODE_PATH: &str = "/myNode";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = KeelConfig::default();
        assert_eq!(config.session.endpoint, "mem://local");
        assert_eq!(config.session.session_timeout, Duration::from_secs(15));
        assert_eq!(config.session.max_connect_attempts, 5);
        assert_eq!(config.paths.election, "/leader-election");
        assert_eq!(config.paths.node, "/myNode");
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = KeelConfig::default();
        config.session.retry_delay = Duration::from_millis(250);
        config.paths.lock = "/locks/jobs".to_string();

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: KeelConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_raw_config_partial_parsing() {
        let toml_str = r#"
[session]
session_timeout = "30s"

[paths]
lock = "/locks/x"
"#;
        let raw: RawKeelConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(raw.session.session_timeout, Some(Duration::from_secs(30)));
        assert!(raw.session.endpoint.is_none());
        assert!(raw.session.retry_delay.is_none());
        assert_eq!(raw.paths.lock.as_deref(), Some("/locks/x"));
        assert!(raw.paths.election.is_none());
    }

    #[test]
    fn test_raw_config_empty_uses_none() {
        let raw: RawKeelConfig = toml::from_str("").unwrap();

        assert!(raw.session.endpoint.is_none());
        assert!(raw.session.max_connect_attempts.is_none());
        assert!(raw.paths.health.is_none());
    }
}
