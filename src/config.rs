//! Device open configuration.

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "/etc/livecap.conf";
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SNAPSHOT_LEN: u32 = 65535;

/// Options recognized by [`CaptureDevice::open`](crate::CaptureDevice::open).
///
/// Not every backend honors every option. A backend rejects combinations
/// it cannot express (for example monitor mode on a layer-3 channel) with
/// `CaptureError::DeviceOpen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Capture frames not addressed to this host
    pub promiscuous: bool,
    /// Longest a single receive call may block
    pub read_timeout: Duration,
    /// Maximum bytes kept per frame
    pub snapshot_len: u32,
    /// Kernel/driver ring buffer size in bytes, backend default if unset
    pub buffer_size: Option<u32>,
    /// Deliver packets as soon as they arrive instead of batching
    pub immediate_mode: bool,
    /// 802.11 monitor mode (libpcap only)
    pub monitor_mode: bool,
    /// How long `stop_capture` waits for the capture thread
    pub stop_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            promiscuous: false,
            read_timeout: DEFAULT_READ_TIMEOUT,
            snapshot_len: DEFAULT_SNAPSHOT_LEN,
            buffer_size: None,
            immediate_mode: false,
            monitor_mode: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_snapshot_len(mut self, len: u32) -> Self {
        self.snapshot_len = len;
        self
    }

    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_immediate_mode(mut self, immediate: bool) -> Self {
        self.immediate_mode = immediate;
        self
    }

    pub fn with_monitor_mode(mut self, monitor: bool) -> Self {
        self.monitor_mode = monitor;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Read timeout in whole milliseconds, at least 1, for native APIs.
    pub(crate) fn read_timeout_ms(&self) -> i32 {
        self.read_timeout.as_millis().clamp(1, i32::MAX as u128) as i32
    }

    /// Load configuration from `LIVECAP_CONFIG` (default `/etc/livecap.conf`),
    /// then apply `LIVECAP_*` environment overrides.
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("LIVECAP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::default();

        if Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)?;
            config.apply_file(&content)?;
        }

        for key in [
            "promiscuous",
            "read_timeout_ms",
            "snapshot_len",
            "buffer_size",
            "immediate_mode",
            "monitor_mode",
            "stop_timeout_ms",
        ] {
            let var = format!("LIVECAP_{}", key.to_uppercase());
            if let Ok(val) = std::env::var(&var) {
                config.apply(key, val.trim())?;
            }
        }

        Ok(config)
    }

    fn apply_file(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.apply(key.trim(), value.trim())?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "promiscuous" => self.promiscuous = parse_bool(key, value)?,
            "read_timeout_ms" => self.read_timeout = Duration::from_millis(parse_num(key, value)?),
            "snapshot_len" => self.snapshot_len = parse_num(key, value)?,
            "buffer_size" => self.buffer_size = Some(parse_num(key, value)?),
            "immediate_mode" => self.immediate_mode = parse_bool(key, value)?,
            "monitor_mode" => self.monitor_mode = parse_bool(key, value)?,
            "stop_timeout_ms" => self.stop_timeout = Duration::from_millis(parse_num(key, value)?),
            _ => tracing::debug!("Ignoring unknown config key: {}", key),
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_env() {
        for var in [
            "LIVECAP_CONFIG",
            "LIVECAP_PROMISCUOUS",
            "LIVECAP_READ_TIMEOUT_MS",
            "LIVECAP_SNAPSHOT_LEN",
            "LIVECAP_BUFFER_SIZE",
            "LIVECAP_IMMEDIATE_MODE",
            "LIVECAP_MONITOR_MODE",
            "LIVECAP_STOP_TIMEOUT_MS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new()
            .with_promiscuous(true)
            .with_read_timeout(Duration::from_millis(50))
            .with_snapshot_len(128)
            .with_buffer_size(1 << 20);

        assert!(config.promiscuous);
        assert_eq!(config.read_timeout, Duration::from_millis(50));
        assert_eq!(config.snapshot_len, 128);
        assert_eq!(config.buffer_size, Some(1 << 20));
        assert!(!config.monitor_mode);
    }

    #[test]
    fn test_read_timeout_ms_is_at_least_one() {
        let config = DeviceConfig::new().with_read_timeout(Duration::ZERO);
        assert_eq!(config.read_timeout_ms(), 1);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_uses_defaults() {
        clear_env();
        let temp = TempDir::new().unwrap();
        env::set_var("LIVECAP_CONFIG", temp.path().join("missing.conf"));

        let config = DeviceConfig::load().unwrap();
        assert_eq!(config, DeviceConfig::default());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_file_and_env_override() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("livecap.conf");
        std::fs::write(
            &path,
            concat!(
                "# capture settings\n",
                "promiscuous = yes\n",
                "read_timeout_ms = 250\n",
                "snapshot_len=96\n",
                "unknown = 1\n",
            ),
        )
        .unwrap();
        env::set_var("LIVECAP_CONFIG", &path);
        env::set_var("LIVECAP_SNAPSHOT_LEN", "1500");

        let config = DeviceConfig::load().unwrap();
        assert!(config.promiscuous);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.snapshot_len, 1500);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_rejects_bad_value() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("livecap.conf");
        std::fs::write(&path, "promiscuous = maybe\n").unwrap();
        env::set_var("LIVECAP_CONFIG", &path);

        let err = DeviceConfig::load().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "promiscuous"));
        clear_env();
    }
}
