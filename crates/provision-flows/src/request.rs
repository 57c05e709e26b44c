//! Install requests and their validation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static VERSION_RE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(\d+\.)(\d+\.)(\d+\.)(\d+)$").expect("version regex is valid"));

/// Error type for malformed install requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid request field '{field}': {message}")]
pub struct RequestError {
  pub field: String,
  pub message: String,
}

impl RequestError {
  fn new(field: &str, message: impl Into<String>) -> Self {
    Self {
      field: field.to_string(),
      message: message.into(),
    }
  }
}

/// A request to provision one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRequest {
  pub target: Target,
  /// Skip every reboot the flow would issue.
  #[serde(default)]
  pub prevent_reboot: bool,
}

/// What to install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
  Cros(CrosTarget),
  Lacros(LacrosTarget),
  Ash(AshTarget),
  Firmware(FirmwareTarget),
  Android(AndroidTarget),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosTarget {
  /// Image directory, e.g. `gs://chromeos-image-archive/eve-release/R90-13816.0.0`.
  pub image_path: String,
  #[serde(default)]
  pub preserve_stateful: bool,
  /// DLC ids to install after the OS.
  #[serde(default)]
  pub dlcs: Vec<String>,
  #[serde(default)]
  pub update_firmware: bool,
  /// Tarball extracted over `/` after the partitions are written.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub overwrite_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LacrosTarget {
  pub image_path: String,
  /// Replaces the version read from `metadata.json`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub override_version: Option<String>,
  /// Component root replacing `/var/lib/imageloader/lacros`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub override_install_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AshTarget {
  /// Chrome tarball.
  pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareTarget {
  /// Firmware image (bios.bin or image-<model>.bin).
  pub image_path: String,
  /// Flash the read-only section too. Requires write protection to be off.
  #[serde(default)]
  pub flash_ro: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub board: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
}

/// An Android device driven through adb and fastboot on its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndroidTarget {
  /// adb / fastboot serial of the device.
  pub serial_number: String,
  /// Factory image zip flashed before any package is installed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub os_image_path: Option<String>,
  /// APKs installed in order.
  #[serde(default)]
  pub apk_paths: Vec<String>,
}

impl Target {
  /// Short flow name used in logs.
  pub fn kind(&self) -> &'static str {
    match self {
      Target::Cros(_) => "cros",
      Target::Lacros(_) => "lacros",
      Target::Ash(_) => "ash",
      Target::Firmware(_) => "firmware",
      Target::Android(_) => "android",
    }
  }
}

impl InstallRequest {
  pub fn validate(&self) -> Result<(), RequestError> {
    match &self.target {
      Target::Cros(cros) => {
        validate_gs_path("image_path", &cros.image_path)?;
        if let Some(payload) = &cros.overwrite_payload {
          validate_gs_path("overwrite_payload", payload)?;
        }
        for dlc in &cros.dlcs {
          if dlc.trim().is_empty() || dlc.contains('/') {
            return Err(RequestError::new("dlcs", format!("invalid DLC id '{}'", dlc)));
          }
        }
      }
      Target::Lacros(lacros) => {
        validate_gs_path("image_path", &lacros.image_path)?;
        if let Some(version) = &lacros.override_version {
          if !VERSION_RE.is_match(version) {
            return Err(RequestError::new(
              "override_version",
              format!("failed to parse version '{}'", version),
            ));
          }
        }
        if let Some(path) = &lacros.override_install_path {
          if !path.starts_with('/') {
            return Err(RequestError::new(
              "override_install_path",
              "must be an absolute path",
            ));
          }
        }
      }
      Target::Ash(ash) => validate_gs_path("image_path", &ash.image_path)?,
      Target::Firmware(firmware) => validate_gs_path("image_path", &firmware.image_path)?,
      Target::Android(android) => {
        let serial = android.serial_number.trim();
        if serial.is_empty() || serial.contains(char::is_whitespace) {
          return Err(RequestError::new(
            "serial_number",
            format!("invalid serial number '{}'", android.serial_number),
          ));
        }
        if android.os_image_path.is_none() && android.apk_paths.is_empty() {
          return Err(RequestError::new(
            "apk_paths",
            "nothing to install: set os_image_path or apk_paths",
          ));
        }
        if let Some(image) = &android.os_image_path {
          validate_gs_path("os_image_path", image)?;
          if !image.ends_with(".zip") {
            return Err(RequestError::new("os_image_path", "must point at a .zip"));
          }
        }
        for apk in &android.apk_paths {
          validate_gs_path("apk_paths", apk)?;
          if !apk.ends_with(".apk") {
            return Err(RequestError::new("apk_paths", format!("'{}' is not an .apk", apk)));
          }
        }
      }
    }
    Ok(())
  }
}

/// Whether `version` looks like `major.minor.build.patch`.
pub fn is_valid_version(version: &str) -> bool {
  VERSION_RE.is_match(version)
}

fn validate_gs_path(field: &str, path: &str) -> Result<(), RequestError> {
  match path.strip_prefix("gs://") {
    Some(rest) if !rest.trim_matches('/').is_empty() => Ok(()),
    Some(_) => Err(RequestError::new(field, "missing bucket and object")),
    None if path.is_empty() => Err(RequestError::new(field, "must not be empty")),
    None => Err(RequestError::new(
      field,
      format!("only gs:// paths are supported, got '{}'", path),
    )),
  }
}
