//! Conductor configuration.
//!
//! Loaded from a TOML file; every tuning value has a default so a bare
//! `[conductor]`-less file (or no file at all) still runs. Liveness
//! and timeout windows are deployment-specific and deliberately not
//! hard-coded anywhere else.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// This conductor's identity; must be unique across the fleet
    pub hostname: String,

    /// Partition this conductor serves; ungrouped serves ungrouped nodes
    pub group: Option<String>,

    /// Heartbeat age beyond which a conductor is considered dead
    pub liveness_window_secs: u64,

    /// How often this conductor refreshes its own presence row
    pub heartbeat_interval_secs: u64,

    /// How long a cached membership snapshot is served before re-reading
    pub snapshot_interval_secs: u64,

    /// Ring points per conductor; higher smooths load at some CPU cost
    pub ring_replicas: u32,

    /// Bounded retries for optimistic-version races
    pub cas_retries: u32,

    /// Interval of the stale-reservation and wait-timeout sweeps
    pub sweep_interval_secs: u64,

    /// How long a suspended node may go without agent activity before
    /// the transition is failed
    pub callback_timeout_secs: u64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            group: None,
            liveness_window_secs: 90,
            heartbeat_interval_secs: 10,
            snapshot_interval_secs: 30,
            ring_replicas: 128,
            cas_retries: 3,
            sweep_interval_secs: 60,
            callback_timeout_secs: 1800,
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl ConductorConfig {
    /// Parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn callback_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.callback_timeout_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConductorConfig::default();
        assert_eq!(config.liveness_window_secs, 90);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.ring_replicas, 128);
        assert_eq!(config.callback_timeout_secs, 1800);
        assert!(!config.hostname.is_empty());
    }

    #[test]
    fn test_parse_overrides() {
        let parsed: ConductorConfig = toml::from_str(
            r#"
            hostname = "alpha"
            group = "rack3"
            liveness_window_secs = 30
            ring_replicas = 64
            "#,
        )
        .unwrap();

        assert_eq!(parsed.hostname, "alpha");
        assert_eq!(parsed.group.as_deref(), Some("rack3"));
        assert_eq!(parsed.liveness_window_secs, 30);
        assert_eq!(parsed.ring_replicas, 64);
        // untouched fields keep their defaults
        assert_eq!(parsed.heartbeat_interval_secs, 10);
    }

    #[test]
    fn test_duration_helpers() {
        let config = ConductorConfig::default().with_hostname("alpha");
        assert_eq!(config.liveness_window(), Duration::from_secs(90));
        assert_eq!(config.callback_timeout(), chrono::Duration::seconds(1800));
    }
}
