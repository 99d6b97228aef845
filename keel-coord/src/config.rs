//! Configuration for store sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Endpoint served by the in-process store.
pub const DEFAULT_ENDPOINT: &str = "mem://local";

/// Configuration for the session manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Store endpoint (`host:port` list or `mem://name`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Session timeout negotiated with the store.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// How long one attempt waits for the session to report connected.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Maximum number of connection attempts before giving up.
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Fixed delay between connection attempts.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            session_timeout: default_session_timeout(),
            connect_timeout: default_connect_timeout(),
            max_connect_attempts: default_max_connect_attempts(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Clamped to at least one attempt.
    #[must_use]
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}
