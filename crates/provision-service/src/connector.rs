//! Device connections handed to flows.

use std::sync::Arc;
use std::time::Duration;

use provision_config::ServerConfig;
use provision_device::{DeviceAdapter, SshDeviceAdapter, SshTarget};
use provision_flows::InstallRequest;

/// Produces the device adapter one flow run talks through.
pub trait DeviceConnector: Send + Sync {
  fn connect(&self, request: &InstallRequest) -> Arc<dyn DeviceAdapter>;
}

impl<F> DeviceConnector for F
where
  F: Fn(&InstallRequest) -> Arc<dyn DeviceAdapter> + Send + Sync,
{
  fn connect(&self, request: &InstallRequest) -> Arc<dyn DeviceAdapter> {
    self(request)
  }
}

/// Connects to the configured DUT over ssh.
#[derive(Debug, Clone)]
pub struct SshConnector {
  target: SshTarget,
  cache_server: Option<String>,
}

impl SshConnector {
  pub fn new(target: SshTarget, cache_server: Option<String>) -> Self {
    Self {
      target,
      cache_server,
    }
  }

  pub fn from_config(config: &ServerConfig) -> Self {
    let dut = &config.dut;
    Self::new(
      SshTarget {
        host: dut.host.clone(),
        port: dut.port,
        user: dut.user.clone(),
        identity_file: dut.identity_file.clone(),
        connect_timeout: Duration::from_secs(dut.connect_timeout_secs),
      },
      config.cache_server.clone(),
    )
  }

  pub fn target(&self) -> &SshTarget {
    &self.target
  }
}

impl DeviceConnector for SshConnector {
  fn connect(&self, request: &InstallRequest) -> Arc<dyn DeviceAdapter> {
    Arc::new(
      SshDeviceAdapter::new(self.target.clone())
        .with_cache_server(self.cache_server.clone())
        .with_prevent_reboot(request.prevent_reboot),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_config_copies_dut() {
    let mut config = ServerConfig::default();
    config.dut.host = "chromeos1-row1-host1".to_string();
    config.dut.connect_timeout_secs = 5;

    let connector = SshConnector::from_config(&config);
    assert_eq!(connector.target().host, "chromeos1-row1-host1");
    assert_eq!(connector.target().user, "root");
    assert_eq!(connector.target().port, 22);
    assert_eq!(connector.target().connect_timeout, Duration::from_secs(5));
  }
}
