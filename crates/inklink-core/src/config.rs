//! Configuration system for inklink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $INKLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/inklink/config.toml
//!   3. ~/.config/inklink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::security::SecurityMode;
use crate::wire::{
    CLOCK_SKEW_SECS, DEFAULT_MAX_WRITE_LEN, MAX_WRITES_PER_SECOND, REFRESH_MIN_INTERVAL_MS,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InklinkConfig {
    pub link: LinkConfig,
    pub security: SecurityConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Usable bytes per characteristic write before MTU negotiation.
    pub default_max_write_len: usize,
    pub max_writes_per_second: usize,
    /// Minimum spacing between honoured device refresh requests.
    pub refresh_min_interval_ms: u64,
    /// Incomplete chunked messages are dropped after this long.
    pub assembly_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Pre-shared key, base64 or plain text. Unset = compatibility mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    pub clock_skew_secs: u32,
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A sync still running after this long is force-disconnected.
    pub watchdog_timeout_secs: u64,
    pub normal_interval_secs: u64,
    pub quiet_interval_secs: u64,
    /// Local hour the quiet window starts (inclusive).
    pub quiet_start_hour: u32,
    /// Local hour the quiet window ends (exclusive).
    pub quiet_end_hour: u32,
    pub connect_attempts: u32,
    pub connect_backoff_ms: Vec<u64>,
    pub push_attempts: u32,
    pub push_backoff_ms: Vec<u64>,
    /// The event-log pull ends once no notification arrives for this long.
    pub pull_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding last sync time, fingerprint and event-log cursor.
    pub state_path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            default_max_write_len: DEFAULT_MAX_WRITE_LEN,
            max_writes_per_second: MAX_WRITES_PER_SECOND,
            refresh_min_interval_ms: REFRESH_MIN_INTERVAL_MS,
            assembly_timeout_secs: 30,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            clock_skew_secs: CLOCK_SKEW_SECS,
            handshake_timeout_secs: 5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_secs: 30,
            normal_interval_secs: 3600,
            quiet_interval_secs: 4 * 3600,
            quiet_start_hour: 23,
            quiet_end_hour: 8,
            connect_attempts: 3,
            connect_backoff_ms: vec![1000, 2000, 4000],
            push_attempts: 2,
            push_backoff_ms: vec![500, 1000],
            pull_window_ms: 1500,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: data_dir().join("state.json"),
        }
    }
}

impl LinkConfig {
    pub fn refresh_min_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_min_interval_ms)
    }

    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_secs(self.assembly_timeout_secs)
    }
}

impl SecurityConfig {
    pub fn mode(&self) -> SecurityMode {
        SecurityMode::from_secret(self.shared_secret.as_deref())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl SyncConfig {
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn pull_window(&self) -> Duration {
        Duration::from_millis(self.pull_window_ms)
    }

    pub fn connect_backoff(&self) -> Vec<Duration> {
        self.connect_backoff_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn push_backoff(&self) -> Vec<Duration> {
        self.push_backoff_ms.iter().copied().map(Duration::from_millis).collect()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("inklink")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("inklink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl InklinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file, falling back to defaults when it does not exist.
    pub fn load_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(InklinkConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("INKLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&InklinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply INKLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("INKLINK_SECURITY__SHARED_SECRET") {
            self.security.shared_secret = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("INKLINK_SYNC__WATCHDOG_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.sync.watchdog_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("INKLINK_LINK__MAX_WRITES_PER_SECOND") {
            if let Ok(n) = v.parse() {
                self.link.max_writes_per_second = n;
            }
        }
        if let Some(v) = lookup("INKLINK_STORAGE__STATE_PATH") {
            self.storage.state_path = PathBuf::from(v);
        }
    }
}
