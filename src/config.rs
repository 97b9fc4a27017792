//! CLI configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (`--config` or `DPS150_CONFIG`)
//! 3. Environment variables
//! 4. Command-line flags (applied by `main`)

use dps150_client::{ConnectionConfig, SerialConfig};
use dps150_protocol::codes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DPS150_CONFIG";

/// CLI configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial link.
    pub serial: SerialSection,
    /// Session timing.
    pub session: SessionSection,
}

impl Config {
    /// Loads the config file (explicit path first, then `DPS150_CONFIG`) and
    /// applies environment overrides.
    ///
    /// The result is not validated; callers layer their own overrides first
    /// and then call [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`], reading variables through `lookup`.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| lookup(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides looked up by variable name. Unparseable values are
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.serial.apply_overrides(&lookup);
        self.session.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Validation("serial.port is empty".to_string()));
        }
        if codes::baud_rate_index(self.serial.baud_rate).is_err() {
            return Err(ConfigError::Validation(format!(
                "unsupported baud rate {} (expected one of {:?})",
                self.serial.baud_rate,
                codes::BAUD_RATES
            )));
        }
        if self.session.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "session.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Session settings for the client.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            SerialConfig::new(&self.serial.port).with_baud_rate(self.serial.baud_rate),
        )
        .with_request_timeout(self.session.request_timeout())
        .with_settle_delay(self.session.settle_delay())
        .with_read_buffer_size(self.session.read_buffer_size)
        .with_teardown_timeout(Duration::from_millis(self.session.teardown_timeout_ms))
    }
}

/// Serial link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Port path.
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud_rate: dps150_protocol::DEFAULT_BAUD_RATE,
        }
    }
}

impl SerialSection {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("DPS150_PORT") {
            if !port.is_empty() {
                self.port = port;
            }
        }

        if let Some(baud) = lookup("DPS150_BAUD") {
            if let Ok(baud) = baud.parse() {
                self.baud_rate = baud;
            }
        }
    }
}

#[cfg(windows)]
fn default_port() -> &'static str {
    "COM3"
}

#[cfg(not(windows))]
fn default_port() -> &'static str {
    "/dev/ttyACM0"
}

/// Session timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub request_timeout_ms: u64,
    /// Pause after each write.
    pub settle_delay_ms: u64,
    pub read_buffer_size: usize,
    pub teardown_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: 1000,
            settle_delay_ms: 50,
            read_buffer_size: 1024,
            teardown_timeout_ms: 1000,
        }
    }
}

impl SessionSection {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("DPS150_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Some(ms) = lookup("DPS150_SETTLE_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                self.settle_delay_ms = ms;
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.session.request_timeout(), Duration::from_millis(1000));
        assert_eq!(config.session.settle_delay(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serial:\n  port: /dev/ttyUSB1\nsession:\n  settle_delay_ms: 20").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.session.settle_delay_ms, 20);
        assert_eq!(config.session.request_timeout_ms, 1000);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::Io(_, _))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "serial: [not, a, map]").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_, _)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DPS150_PORT", "/dev/ttyACM3"),
            ("DPS150_BAUD", "57600"),
            ("DPS150_REQUEST_TIMEOUT_MS", "250"),
            ("DPS150_SETTLE_DELAY_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.serial.port, "/dev/ttyACM3");
        assert_eq!(config.serial.baud_rate, 57_600);
        assert_eq!(config.session.request_timeout_ms, 250);
        assert_eq!(config.session.settle_delay_ms, 50);
    }

    #[test]
    fn test_load_defers_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dps150.yaml");
        std::fs::write(&path, "serial:\n  port: /dev/ttyUSB0\n").unwrap();
        let path_str = path.to_string_lossy().to_string();

        let vars: HashMap<&str, String> = [
            (CONFIG_ENV, path_str),
            ("DPS150_BAUD", "1234".to_string()),
        ]
        .into_iter()
        .collect();

        // an unsupported baud from the environment can still be overridden
        let mut config = Config::load_with(None, |key| vars.get(key).cloned()).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 1234);
        assert!(config.validate().is_err());

        config.serial.baud_rate = 57_600;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_baud() {
        let mut config = Config::default();
        config.serial.baud_rate = 14_400;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dps150.yaml");

        let mut config = Config::default();
        config.serial.port = "/dev/ttyACM9".to_string();
        config.save(&path).unwrap();

        assert_eq!(Config::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_connection_config() {
        let mut config = Config::default();
        config.session.read_buffer_size = 1;
        let conn = config.connection_config();
        assert_eq!(conn.serial.path, config.serial.port);
        assert_eq!(conn.read_buffer_size, 64);
    }
}
