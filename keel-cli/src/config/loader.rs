use super::types::{KeelConfig, PathsConfig, RawKeelConfig, RawPathsSection, RawSessionSection};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use keel_coord::SessionConfig;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<KeelConfig> {
        let mut layers = Vec::new();
        if let Some(user_path) = Self::user_config_path() {
            layers.push(user_path);
        }
        layers.push(Self::project_config_path());

        Self::load_layers(&layers)
    }

    /// Load and merge the given files in order. Missing files are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<KeelConfig> {
        let mut raw = RawKeelConfig::default();

        for path in paths {
            if let Some(layer) = Self::read_raw(path)? {
                raw = Self::merge_raw(raw, layer);
            }
        }

        // Convert to final config with defaults applied
        Ok(Self::finalize(raw))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "keel").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with KEEL_PROJECT_CONFIG_DIR env var (useful for isolated e2e tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("KEEL_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".keel/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<Option<RawKeelConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let raw = toml::from_str(&contents)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(Some(raw))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawKeelConfig, overlay: RawKeelConfig) -> RawKeelConfig {
        RawKeelConfig {
            session: RawSessionSection {
                endpoint: overlay.session.endpoint.or(base.session.endpoint),
                session_timeout: overlay
                    .session
                    .session_timeout
                    .or(base.session.session_timeout),
                connect_timeout: overlay
                    .session
                    .connect_timeout
                    .or(base.session.connect_timeout),
                max_connect_attempts: overlay
                    .session
                    .max_connect_attempts
                    .or(base.session.max_connect_attempts),
                retry_delay: overlay.session.retry_delay.or(base.session.retry_delay),
            },
            paths: RawPathsSection {
                election: overlay.paths.election.or(base.paths.election),
                lock: overlay.paths.lock.or(base.paths.lock),
                config: overlay.paths.config.or(base.paths.config),
                health: overlay.paths.health.or(base.paths.health),
                node: overlay.paths.node.or(base.paths.node),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawKeelConfig) -> KeelConfig {
        let mut session = SessionConfig::default();
        if let Some(endpoint) = raw.session.endpoint {
            session = session.with_endpoint(endpoint);
        }
        if let Some(timeout) = raw.session.session_timeout {
            session = session.with_session_timeout(timeout);
        }
        if let Some(timeout) = raw.session.connect_timeout {
            session = session.with_connect_timeout(timeout);
        }
        if let Some(attempts) = raw.session.max_connect_attempts {
            session = session.with_max_connect_attempts(attempts);
        }
        if let Some(delay) = raw.session.retry_delay {
            session = session.with_retry_delay(delay);
        }

        let defaults = PathsConfig::default();
        KeelConfig {
            session,
            paths: PathsConfig {
                election: raw.paths.election.unwrap_or(defaults.election),
                lock: raw.paths.lock.unwrap_or(defaults.lock),
                config: raw.paths.config.unwrap_or(defaults.config),
                health: raw.paths.health.unwrap_or(defaults.health),
                node: raw.paths.node.unwrap_or(defaults.node),
            },
        }
    }
}
