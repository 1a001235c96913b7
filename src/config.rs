//! WolfMirror Configuration
//!
//! This module provides configuration structures for the WolfMirror
//! volume replication daemon.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main WolfMirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Replay configuration
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Reference journal configuration
    #[serde(default)]
    pub journal: JournalConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local mirror uuid; doubles as this replica's journal client id
    pub id: String,

    /// Local pool that receives replicas
    #[serde(default = "default_local_pool")]
    pub local_pool: String,
}

/// Replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Delay, in seconds, between an event's write time and its commit
    #[serde(default)]
    pub mirroring_replay_delay_secs: u64,

    /// Flag a resync automatically when the registration is disconnected
    #[serde(default)]
    pub resync_after_disconnect: bool,

    /// Maximum entries applied under a single exclusive ownership batch
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,

    /// Attempts for a transiently failing apply before the replay faults
    #[serde(default = "default_max_apply_retries")]
    pub max_apply_retries: u32,

    /// Pause between apply attempts in milliseconds
    #[serde(default = "default_apply_retry_delay_ms")]
    pub apply_retry_delay_ms: u64,

    /// Automatic re-bootstrap attempts allowed inside the fault window
    #[serde(default = "default_fault_retry_limit")]
    pub fault_retry_limit: u32,

    /// Fault window in seconds
    #[serde(default = "default_fault_retry_window_secs")]
    pub fault_retry_window_secs: u64,

    /// Pause before an automatic re-bootstrap in milliseconds
    #[serde(default = "default_fault_retry_delay_ms")]
    pub fault_retry_delay_ms: u64,
}

/// Reference journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Entries stored per segment
    #[serde(default = "default_entries_per_segment")]
    pub entries_per_segment: u64,

    /// Segments a client may lag before it is disconnected (0 = unlimited)
    #[serde(default)]
    pub max_lag_segments: u64,

    /// Payload size above which entries are LZ4 compressed
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_local_pool() -> String {
    "rbd".to_string()
}

fn default_max_batch_entries() -> usize {
    32
}

fn default_max_apply_retries() -> u32 {
    3
}

fn default_apply_retry_delay_ms() -> u64 {
    50
}

fn default_fault_retry_limit() -> u32 {
    3
}

fn default_fault_retry_window_secs() -> u64 {
    60
}

fn default_fault_retry_delay_ms() -> u64 {
    100
}

fn default_entries_per_segment() -> u64 {
    64
}

fn default_compress_threshold() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mirroring_replay_delay_secs: 0,
            resync_after_disconnect: false,
            max_batch_entries: default_max_batch_entries(),
            max_apply_retries: default_max_apply_retries(),
            apply_retry_delay_ms: default_apply_retry_delay_ms(),
            fault_retry_limit: default_fault_retry_limit(),
            fault_retry_window_secs: default_fault_retry_window_secs(),
            fault_retry_delay_ms: default_fault_retry_delay_ms(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            entries_per_segment: default_entries_per_segment(),
            max_lag_segments: 0,
            compress_threshold: default_compress_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: uuid::Uuid::new_v4().to_string(),
                local_pool: default_local_pool(),
            },
            replay: ReplayConfig::default(),
            journal: JournalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.replay.max_batch_entries == 0 {
            return Err(crate::Error::Config(
                "replay.max_batch_entries must be at least 1".into(),
            ));
        }

        if self.replay.max_apply_retries == 0 {
            return Err(crate::Error::Config(
                "replay.max_apply_retries must be at least 1".into(),
            ));
        }

        if self.journal.entries_per_segment == 0 {
            return Err(crate::Error::Config(
                "journal.entries_per_segment must be at least 1".into(),
            ));
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be 'pretty' or 'compact', got '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Runtime replay settings derived from this configuration
    pub fn replayer_settings(&self) -> ReplayerSettings {
        ReplayerSettings::from(&self.replay)
    }
}

/// Replay settings consumed by a running controller
///
/// These may be swapped between start attempts, the same way an operator
/// edits the replay delay or the auto-resync switch on a live daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayerSettings {
    pub mirroring_replay_delay: Duration,
    pub resync_after_disconnect: bool,
    pub max_batch_entries: usize,
    pub max_apply_retries: u32,
    pub apply_retry_delay: Duration,
    pub fault_retry_limit: u32,
    pub fault_retry_window: Duration,
    pub fault_retry_delay: Duration,
}

impl From<&ReplayConfig> for ReplayerSettings {
    fn from(config: &ReplayConfig) -> Self {
        Self {
            mirroring_replay_delay: Duration::from_secs(config.mirroring_replay_delay_secs),
            resync_after_disconnect: config.resync_after_disconnect,
            max_batch_entries: config.max_batch_entries.max(1),
            max_apply_retries: config.max_apply_retries.max(1),
            apply_retry_delay: Duration::from_millis(config.apply_retry_delay_ms),
            fault_retry_limit: config.fault_retry_limit,
            fault_retry_window: Duration::from_secs(config.fault_retry_window_secs),
            fault_retry_delay: Duration::from_millis(config.fault_retry_delay_ms),
        }
    }
}

impl Default for ReplayerSettings {
    fn default() -> Self {
        Self::from(&ReplayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "local mirror uuid"
local_pool = "mirror"

[replay]
mirroring_replay_delay_secs = 10
resync_after_disconnect = true

[journal]
entries_per_segment = 16
max_lag_segments = 4
"#;

        let config = MirrorConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "local mirror uuid");
        assert_eq!(config.node.local_pool, "mirror");
        assert_eq!(config.journal.entries_per_segment, 16);

        let settings = config.replayer_settings();
        assert_eq!(settings.mirroring_replay_delay, Duration::from_secs(10));
        assert!(settings.resync_after_disconnect);
        assert_eq!(settings.max_apply_retries, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MirrorConfig::default();
        config.node.id.clear();
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.logging.format = "json".into();
        assert!(config.validate().is_err());

        let mut config = MirrorConfig::default();
        config.replay.max_batch_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wolfmirror.toml");

        let config = MirrorConfig::default();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = MirrorConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node.id, config.node.id);
        assert_eq!(loaded.replay.fault_retry_limit, 3);
    }
}
