//! Timing configuration for the request/response subsystem

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for the parser and scheduler, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum gap between two sends of the same terminator
    pub throttle_ms: u64,
    /// Minimum gap between two unforced schedule scans
    pub schedule_scan_ms: u64,
    /// Age after which an unanswered request is presumed dead
    pub stale_timeout_ms: u64,
    /// How long held bytes may sit unterminated before a flush
    pub esc_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            schedule_scan_ms: 100,
            stale_timeout_ms: 5000,
            esc_timeout_ms: 50,
        }
    }
}

impl TimingConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn schedule_scan(&self) -> Duration {
        Duration::from_millis(self.schedule_scan_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn esc_timeout(&self) -> Duration {
        Duration::from_millis(self.esc_timeout_ms)
    }

    /// Load configuration from a file
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: TimingConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from the default location or return defaults
    pub fn load_or_default() -> Self {
        if let Some(config_dir) = dirs_config_path() {
            let config_path = config_dir.join("config.json");
            if config_path.exists() {
                if let Ok(config) = Self::load(&config_path) {
                    return config;
                }
            }
        }
        Self::default()
    }
}

/// Get the configuration directory path
fn dirs_config_path() -> Option<std::path::PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| std::path::PathBuf::from(home).join(".config").join("termquery"))
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
