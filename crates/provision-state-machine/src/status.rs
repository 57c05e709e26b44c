//! Install status taxonomy surfaced to callers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a provisioning flow ended the way it did.
///
/// Callers use the status to decide whether retrying the whole flow makes
/// sense; the engine itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStatus {
  Ok,
  /// The request was malformed.
  InvalidRequest,
  /// The device could not be reached before provisioning started.
  DutUnreachablePreProvision,
  /// An artifact could not be downloaded onto the device.
  DownloadFailed,
  /// A provisioning step (partition write, flash, install) failed.
  ProvisioningFailed,
  /// Setup after the payload landed failed.
  PostProvisionSetupFailed,
  /// Setup before the payload landed failed.
  PreProvisionSetupFailed,
  /// The device did not come back after provisioning.
  DutUnreachablePostProvision,
}

impl InstallStatus {
  pub fn is_ok(&self) -> bool {
    matches!(self, InstallStatus::Ok)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      InstallStatus::Ok => "OK",
      InstallStatus::InvalidRequest => "INVALID_REQUEST",
      InstallStatus::DutUnreachablePreProvision => "DUT_UNREACHABLE_PRE_PROVISION",
      InstallStatus::DownloadFailed => "DOWNLOAD_FAILED",
      InstallStatus::ProvisioningFailed => "PROVISIONING_FAILED",
      InstallStatus::PostProvisionSetupFailed => "POST_PROVISION_SETUP_FAILED",
      InstallStatus::PreProvisionSetupFailed => "PRE_PROVISION_SETUP_FAILED",
      InstallStatus::DutUnreachablePostProvision => "DUT_UNREACHABLE_POST_PROVISION",
    }
  }
}

impl fmt::Display for InstallStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_serializes_like_display() {
    for status in [
      InstallStatus::Ok,
      InstallStatus::DownloadFailed,
      InstallStatus::DutUnreachablePostProvision,
    ] {
      let json = serde_json::to_value(status).unwrap();
      assert_eq!(json, serde_json::Value::String(status.to_string()));
    }
  }

  #[test]
  fn test_only_ok_is_ok() {
    assert!(InstallStatus::Ok.is_ok());
    assert!(!InstallStatus::ProvisioningFailed.is_ok());
  }
}
