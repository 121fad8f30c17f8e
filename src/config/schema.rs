//! Configuration schema for fusecap
//!
//! Configuration is stored at `~/.config/fusecap/config.toml`

use serde::{Deserialize, Serialize};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Capability registry settings
    pub caps: CapsConfig,

    /// Client cache authority settings
    pub cache: CacheConfig,

    /// Crash restore settings
    pub restore: RestoreConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Capability registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsConfig {
    /// Lease applied to implied and issued caps when the client announced none
    pub default_lease_secs: u64,

    /// Minimum seconds between two expiry sweeps
    pub sweep_interval_secs: u64,

    /// Largest accepted difference between client and server clocks
    pub max_clock_skew_secs: u64,

    /// Recipients notified concurrently per broadcast (1 = sequential)
    pub broadcast_parallelism: usize,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            default_lease_secs: 300,
            sweep_interval_secs: 5,
            max_clock_skew_secs: 2,
            broadcast_parallelism: 1,
        }
    }
}

/// Client cache authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Largest file offset that is buffered per file (bytes)
    pub max_cache_bytes: u64,

    /// How long a closed writer keeps its cache authority (seconds)
    pub owner_lifetime_secs: u64,

    /// Minimum seconds between two expiry sweeps
    pub sweep_interval_secs: u64,

    /// Buffer capacity reserved on the first cached write
    pub min_buffer_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 64 * 1024 * 1024,
            owner_lifetime_secs: 60,
            sweep_interval_secs: 5,
            min_buffer_bytes: 4 * 1024,
        }
    }
}

/// Restore of cached files after a failed write or close
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Attempt restores at all
    pub enabled: bool,

    /// Open/upload/close attempts before giving up
    pub attempts: u32,

    /// Pause after a failed attempt (seconds)
    pub snooze_secs: u64,

    /// Upload block size (bytes)
    pub block_size: usize,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 3,
            snooze_secs: 5,
            block_size: 4 * 1024 * 1024,
        }
    }
}
