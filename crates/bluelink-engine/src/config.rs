//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration.

use std::path::PathBuf;
use std::time::Duration;

use bluelink_shared::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_CHUNK_SIZE, DEFAULT_SCAN_WINDOW_SECS, PAIRING_TIMEOUT_SECS,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name advertised to peers during pairing.
    /// Env: `BLUELINK_DEVICE_NAME`
    /// Default: `"BlueLink Device"`
    pub device_name: String,

    /// Discovery scan window.
    /// Env: `BLUELINK_SCAN_WINDOW_SECS`
    /// Default: 10 s
    pub scan_window: Duration,

    /// File chunk size in bytes.
    /// Env: `BLUELINK_CHUNK_SIZE`
    /// Default: 65536 (64 KiB)
    pub chunk_size: u32,

    /// Bound on each connection attempt (one automatic retry follows a
    /// failed attempt).
    /// Env: `BLUELINK_CONNECT_TIMEOUT_SECS`
    /// Default: 15 s
    pub connect_timeout: Duration,

    /// Bound on an in-flight pairing exchange.
    /// Env: `BLUELINK_PAIRING_TIMEOUT_SECS`
    /// Default: 30 s
    pub pairing_timeout: Duration,

    /// Directory where received files are written.
    /// Env: `BLUELINK_DOWNLOAD_DIR`
    /// Default: `./downloads`
    pub download_dir: PathBuf,

    /// Policy for a second send to a peer that already has one in flight.
    /// `false` (the default) rejects it; queueing is not implemented.
    pub queue_sends: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_name: "BlueLink Device".to_string(),
            scan_window: Duration::from_secs(DEFAULT_SCAN_WINDOW_SECS),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            pairing_timeout: Duration::from_secs(PAIRING_TIMEOUT_SECS),
            download_dir: PathBuf::from("./downloads"),
            queue_sends: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("BLUELINK_DEVICE_NAME") {
            if !name.is_empty() {
                config.device_name = name;
            }
        }

        if let Ok(val) = std::env::var("BLUELINK_SCAN_WINDOW_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.scan_window = Duration::from_secs(secs);
            } else {
                tracing::warn!(value = %val, "Invalid BLUELINK_SCAN_WINDOW_SECS, using default");
            }
        }

        if let Ok(val) = std::env::var("BLUELINK_CHUNK_SIZE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.chunk_size = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid BLUELINK_CHUNK_SIZE, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("BLUELINK_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.connect_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("BLUELINK_PAIRING_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                config.pairing_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(dir) = std::env::var("BLUELINK_DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.scan_window, Duration::from_secs(10));
        assert!(!config.queue_sends);
    }
}
