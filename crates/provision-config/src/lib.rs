//! Provision Config
//!
//! Serializable configuration for the provisioning server. Loaded from a JSON
//! file; every field has a default so an empty object is a valid config.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:8080",
//!   "dut": { "host": "chromeos1-row1-host1", "identity_file": "~/.ssh/testing_rsa" },
//!   "operations": { "expiry_days": 7 },
//!   "cache_server": "http://10.0.0.2:8082"
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error type for loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid config: {message}")]
  Invalid { message: String },
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Address the HTTP surface binds to.
  pub listen: SocketAddr,
  pub dut: DutConfig,
  pub operations: OperationsConfig,
  /// Upper bound for a single provisioning run.
  pub flow_timeout_secs: u64,
  /// Base URL of a caching server the device downloads `gs://` artifacts
  /// through. When unset, artifacts are fetched over plain https from GCS.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_server: Option<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      dut: DutConfig::default(),
      operations: OperationsConfig::default(),
      flow_timeout_secs: 60 * 60,
      cache_server: None,
    }
  }
}

/// How to reach the device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DutConfig {
  pub host: String,
  pub port: u16,
  pub user: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub identity_file: Option<PathBuf>,
  pub connect_timeout_secs: u64,
}

impl Default for DutConfig {
  fn default() -> Self {
    Self {
      host: String::new(),
      port: 22,
      user: "root".to_string(),
      identity_file: None,
      connect_timeout_secs: 10,
    }
  }
}

/// Retention of finished operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
  pub sweep_interval_secs: u64,
  pub expiry_days: u64,
}

impl Default for OperationsConfig {
  fn default() -> Self {
    Self {
      sweep_interval_secs: 60 * 60,
      expiry_days: 30,
    }
  }
}

impl OperationsConfig {
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }

  pub fn expiry(&self) -> Duration {
    Duration::from_secs(self.expiry_days.saturating_mul(24 * 60 * 60))
  }
}

impl ServerConfig {
  /// Load a config file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: ServerConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  /// Load `path` if given, else the default location if it exists, else
  /// the built-in defaults.
  pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
    match path {
      Some(path) => Self::load(path),
      None => match default_config_path() {
        Some(path) if path.exists() => Self::load(&path),
        _ => Ok(Self::default()),
      },
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.flow_timeout_secs == 0 {
      return Err(ConfigError::Invalid {
        message: "flow_timeout_secs must be greater than zero".to_string(),
      });
    }
    if self.operations.sweep_interval_secs == 0 {
      return Err(ConfigError::Invalid {
        message: "operations.sweep_interval_secs must be greater than zero".to_string(),
      });
    }
    if let Some(cache) = &self.cache_server {
      if !cache.starts_with("http://") && !cache.starts_with("https://") {
        return Err(ConfigError::Invalid {
          message: format!("cache_server must be an http(s) URL, got '{}'", cache),
        });
      }
    }
    Ok(())
  }

  pub fn flow_timeout(&self) -> Duration {
    Duration::from_secs(self.flow_timeout_secs)
  }
}

/// `<config dir>/provision/config.json`, e.g. `~/.config/provision/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
  dirs::config_dir().map(|dir| dir.join("provision").join("config.json"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_empty_object_uses_defaults() {
    let config: ServerConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, ServerConfig::default());
    assert_eq!(config.dut.port, 22);
    assert_eq!(config.dut.user, "root");
    assert_eq!(config.operations.expiry(), Duration::from_secs(30 * 24 * 3600));
    assert_eq!(config.flow_timeout(), Duration::from_secs(3600));
  }

  #[test]
  fn test_load_partial_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"{{"listen": "0.0.0.0:9000", "dut": {{"host": "dut1"}}, "operations": {{"expiry_days": 7}}}}"#
    )
    .unwrap();

    let config = ServerConfig::load(file.path()).unwrap();
    assert_eq!(config.listen.port(), 9000);
    assert_eq!(config.dut.host, "dut1");
    assert_eq!(config.dut.port, 22);
    assert_eq!(config.operations.expiry_days, 7);
    assert_eq!(config.operations.sweep_interval_secs, 3600);
  }

  #[test]
  fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = ServerConfig::load(&dir.path().join("nope.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
  }

  #[test]
  fn test_load_invalid_json() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    let err = ServerConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
  }

  #[test]
  fn test_huge_expiry_saturates() {
    let operations = OperationsConfig {
      expiry_days: u64::MAX,
      ..OperationsConfig::default()
    };
    assert_eq!(operations.expiry(), Duration::from_secs(u64::MAX));
  }

  #[test]
  fn test_rejects_non_http_cache_server() {
    let config = ServerConfig {
      cache_server: Some("gs://bucket".to_string()),
      ..ServerConfig::default()
    };
    assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
  }

  #[test]
  fn test_rejects_zero_timeout() {
    let config = ServerConfig {
      flow_timeout_secs: 0,
      ..ServerConfig::default()
    };
    assert!(config.validate().is_err());
  }
}
