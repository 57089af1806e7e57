//! Runtime configuration structures.
//!
//! Per-model settings live in [`super::model`]; this module holds the
//! process-wide knobs shared by every manager.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Defaults overridden by `MODELSERVE_LOG_FORMAT` / `MODELSERVE_LOG_LEVEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(format) = std::env::var("MODELSERVE_LOG_FORMAT") {
            config.json_logs = format.eq_ignore_ascii_case("json");
        }
        if let Ok(level) = std::env::var("MODELSERVE_LOG_LEVEL") {
            if !level.trim().is_empty() {
                config.log_level = level;
            }
        }
        config
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes. Larger frames are framing errors.
    pub max_frame_bytes: u32,

    /// How often the manager retries opening the request pipe while the
    /// worker has not attached its reader yet.
    #[serde(with = "humantime_serde")]
    pub connect_poll_interval: Duration,

    /// Write timeout per frame. A worker that stops draining its request pipe
    /// fails the write instead of blocking callers forever.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            connect_poll_interval: Duration::from_millis(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_config_humantime_round_trip() {
        let json = r#"{"max_frame_bytes": 1024, "connect_poll_interval": "25ms", "write_timeout": "2s"}"#;
        let config: IpcConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_frame_bytes, 1024);
        assert_eq!(config.connect_poll_interval, Duration::from_millis(25));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_runtime_config_defaults_when_sections_missing() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.ipc.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.observability.log_level, "info");
    }
}
