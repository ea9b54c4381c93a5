//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is a valid
//! configuration. Validation collects all problems instead of stopping at
//! the first, so an operator sees the complete list in one pass.

use anyhow::Context;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ranging Service host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RasConfig {
    /// Maximum number of simultaneously served connections.
    pub max_active_conn: usize,

    /// Ranging-data procedure buffers reserved per connection.
    pub rd_buffers_per_conn: usize,

    /// Seconds to wait for the peer's ACK after a Complete Ranging Data
    /// indication before the session is abandoned.
    pub rascp_timeout_secs: u64,

    /// Advertise the real-time ranging data feature and declare its
    /// characteristic.
    pub realtime_ranging_data: bool,
}

impl Default for RasConfig {
    fn default() -> Self {
        Self {
            max_active_conn: 1,
            rd_buffers_per_conn: 2,
            rascp_timeout_secs: 10,
            realtime_ranging_data: false,
        }
    }
}

impl RasConfig {
    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_active_conn == 0 {
            errors.push("max_active_conn must be at least 1".to_string());
        }
        if self.rd_buffers_per_conn == 0 {
            errors.push("rd_buffers_per_conn must be at least 1".to_string());
        }
        if self.rascp_timeout_secs == 0 {
            errors.push("rascp_timeout_secs must be at least 1".to_string());
        }
        if self.rascp_timeout_secs > 10 {
            // The acknowledgement bound is at most 10 seconds.
            errors.push(format!(
                "rascp_timeout_secs is {} but must not exceed 10",
                self.rascp_timeout_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// RAS-CP response timeout as a duration.
    pub fn rascp_timeout(&self) -> Duration {
        Duration::from_secs(self.rascp_timeout_secs)
    }
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> anyhow::Result<RasConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: RasConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    config
        .validate()
        .map_err(|errors| anyhow::anyhow!("invalid configuration:\n  - {}", errors.join("\n  - ")))?;

    Ok(config)
}
