//! Android flow, driven through adb and fastboot on the device's host.
//!
//! ```text
//! Prepare → FlashOs → InstallPackages → Cleanup
//! ```
//!
//! The device adapter points at the host the phone is attached to; every
//! adb and fastboot call addresses the phone by serial number. Flashing is
//! skipped when no OS image is requested.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provision_state_machine::{Command, CommandError, CommandResultExt, InstallStatus, State};
use regex::Regex;
use serde_json::json;
use tracing::info;

use crate::context::FlowContext;
use crate::request::AndroidTarget;

const PROVISION_ROOT: &str = "/mnt/stateful_partition/android_provision";
const BOOT_ATTEMPTS: u32 = 60;
const BOOT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AndroidFlow {
  ctx: Arc<FlowContext>,
  target: Arc<AndroidTarget>,
}

impl AndroidFlow {
  fn serial(&self) -> &str {
    &self.target.serial_number
  }

  fn provision_dir(&self) -> String {
    format!("{}/{}", PROVISION_ROOT, self.serial())
  }

  /// Host-local path a downloaded artifact lands at.
  fn local_path(&self, source: &str) -> String {
    let file_name = source.rsplit('/').next().unwrap_or(source);
    format!("{}/{}", self.provision_dir(), file_name)
  }

  async fn adb(&self, args: &[&str]) -> Result<String, CommandError> {
    let mut full = vec!["-s", self.serial()];
    full.extend_from_slice(args);
    self.ctx.run("adb", &full).await
  }

  async fn fastboot(&self, args: &[&str]) -> Result<String, CommandError> {
    let mut full = vec!["-s", self.serial()];
    full.extend_from_slice(args);
    self.ctx.run("fastboot", &full).await
  }

  async fn remove_file(&self, path: &str) -> Result<(), CommandError> {
    self.ctx.run("rm", &["-f", path]).await.map(|_| ())
  }
}

/// First state of the Android flow.
pub fn initial_state(ctx: Arc<FlowContext>, target: AndroidTarget) -> Box<dyn State> {
  Box::new(PrepareState {
    flow: AndroidFlow {
      ctx,
      target: Arc::new(target),
    },
  })
}

struct PrepareState {
  flow: AndroidFlow,
}

impl State for PrepareState {
  fn name(&self) -> &str {
    "Android Prepare"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    vec![
      Box::new(CheckAdbDevice {
        flow: self.flow.clone(),
      }),
      Box::new(CreateProvisionDir {
        flow: self.flow.clone(),
      }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(FlashOsState {
      flow: self.flow.clone(),
    }))
  }
}

struct FlashOsState {
  flow: AndroidFlow,
}

impl State for FlashOsState {
  fn name(&self) -> &str {
    "Android Flash OS"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let Some(image) = self.flow.target.os_image_path.clone() else {
      return Vec::new();
    };
    let local = self.flow.local_path(&image);
    vec![
      Box::new(CopyArtifact {
        flow: self.flow.clone(),
        source: image,
        local: local.clone(),
      }),
      Box::new(ExtractOsImage {
        flow: self.flow.clone(),
        archive: local,
      }),
      Box::new(FlashOs {
        flow: self.flow.clone(),
      }),
      Box::new(WaitForBoot {
        flow: self.flow.clone(),
      }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(InstallPackagesState {
      flow: self.flow.clone(),
    }))
  }
}

struct InstallPackagesState {
  flow: AndroidFlow,
}

impl State for InstallPackagesState {
  fn name(&self) -> &str {
    "Android Install Packages"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let mut commands: Vec<Box<dyn Command>> = Vec::new();
    for apk in &self.flow.target.apk_paths {
      let local = self.flow.local_path(apk);
      commands.push(Box::new(CopyArtifact {
        flow: self.flow.clone(),
        source: apk.clone(),
        local: local.clone(),
      }));
      commands.push(Box::new(InstallApk {
        flow: self.flow.clone(),
        local,
      }));
    }
    commands
  }

  fn metadata(&self) -> Option<serde_json::Value> {
    let target = &self.flow.target;
    Some(json!({
      "serial_number": target.serial_number,
      "os_image_path": target.os_image_path,
      "apks": target.apk_paths,
    }))
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(CleanupState {
      flow: self.flow.clone(),
    }))
  }
}

struct CleanupState {
  flow: AndroidFlow,
}

impl State for CleanupState {
  fn name(&self) -> &str {
    "Android Cleanup"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    vec![Box::new(RemoveProvisionDir {
      flow: self.flow.clone(),
    })]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    None
  }
}

struct CheckAdbDevice {
  flow: AndroidFlow,
}

#[async_trait]
impl Command for CheckAdbDevice {
  fn name(&self) -> &str {
    "check_adb_device"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let state = self.flow.adb(&["get-state"]).await?;
    if state.trim() != "device" {
      return Err(CommandError::failed(format!(
        "adb reports '{}' for {}",
        state.trim(),
        self.flow.serial()
      )));
    }
    Ok(())
  }

  fn error_message(&self) -> &str {
    "android device is not attached"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePreProvision
  }
}

struct CreateProvisionDir {
  flow: AndroidFlow,
}

#[async_trait]
impl Command for CreateProvisionDir {
  fn name(&self) -> &str {
    "create_provision_dir"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let dir = self.flow.provision_dir();
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to create provision directory",
        ctx.device().create_directories(&[dir.as_str()]),
      )
      .await
  }

  async fn revert(&self) -> Result<(), CommandError> {
    let dir = self.flow.provision_dir();
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to remove provision directory",
        ctx.device().delete_directory(&dir),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to prepare provision directory"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

/// Download one artifact next to the others; the revert deletes it.
struct CopyArtifact {
  flow: AndroidFlow,
  source: String,
  local: String,
}

#[async_trait]
impl Command for CopyArtifact {
  fn name(&self) -> &str {
    "copy_artifact"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    ctx
      .call(
        format!("failed to download {}", self.source),
        ctx.device().copy_data(&self.source, &self.local),
      )
      .await
  }

  async fn revert(&self) -> Result<(), CommandError> {
    self.flow.remove_file(&self.local).await
  }

  fn error_message(&self) -> &str {
    "failed to copy data"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DownloadFailed
  }
}

/// Image files inside a factory zip worth unpacking.
pub(crate) fn flashable_files(listing: &str) -> Vec<String> {
  listing
    .lines()
    .map(str::trim)
    .filter(|f| f.ends_with(".img") || f.ends_with(".zip"))
    .map(str::to_string)
    .collect()
}

struct ExtractOsImage {
  flow: AndroidFlow,
  archive: String,
}

#[async_trait]
impl Command for ExtractOsImage {
  fn name(&self) -> &str {
    "extract_os_image"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    let listing = ctx.run("zipinfo", &["-1", &self.archive]).await?;
    let files = flashable_files(&listing);
    if files.is_empty() {
      return Err(CommandError::failed(format!(
        "no image files found in {}",
        self.archive
      )));
    }

    let dir = self.flow.provision_dir();
    let mut args = vec!["-oq", self.archive.as_str()];
    args.extend(files.iter().map(String::as_str));
    args.extend(["-d", dir.as_str()]);
    ctx.run("unzip", &args).await?;

    info!(files = files.len(), "android_image_extracted");
    ctx.facts().android_os_files = files;
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to extract zip file"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

/// Flash bootloader and radio, then everything else from the update zip
/// while keeping user data.
struct FlashOs {
  flow: AndroidFlow,
}

impl FlashOs {
  fn find(files: &[String], pattern: &str, what: &str) -> Result<String, CommandError> {
    let re = Regex::new(pattern).command_context(format!("invalid pattern for {}", what))?;
    files
      .iter()
      .find(|f| re.is_match(f.rsplit('/').next().unwrap_or(f.as_str())))
      .cloned()
      .ok_or_else(|| CommandError::failed(format!("cannot find '{}' image", what)))
  }
}

#[async_trait]
impl Command for FlashOs {
  fn name(&self) -> &str {
    "flash_os"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let files = self.flow.ctx.facts().android_os_files.clone();
    let dir = self.flow.provision_dir();

    self.flow.adb(&["reboot", "bootloader"]).await?;
    for partition in ["bootloader", "radio"] {
      let image = Self::find(&files, &format!(r"^{}[-.].*img$", partition), partition)?;
      let path = format!("{}/{}", dir, image);
      self.flow.fastboot(&["flash", partition, &path]).await?;
      self.flow.fastboot(&["reboot-bootloader"]).await?;
    }

    let update = Self::find(&files, r"\.zip$", "update zip")?;
    let tmp = format!("{}/tmp", dir);
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to create fastboot tmp directory",
        ctx.device().create_directories(&[tmp.as_str()]),
      )
      .await?;
    // fastboot needs TMPDIR on the stateful partition for large images.
    let tmpdir = format!("TMPDIR={}", tmp);
    let path = format!("{}/{}", dir, update);
    ctx
      .run(&tmpdir, &["fastboot", "-s", self.flow.serial(), "update", path.as_str()])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to flash Android OS"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct WaitForBoot {
  flow: AndroidFlow,
}

#[async_trait]
impl Command for WaitForBoot {
  fn name(&self) -> &str {
    "wait_for_boot"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self.flow.adb(&["wait-for-device"]).await?;
    for attempt in 1..=BOOT_ATTEMPTS {
      let booted = self.flow.adb(&["shell", "getprop", "sys.boot_completed"]).await?;
      if booted.trim() == "1" {
        return Ok(());
      }
      info!(attempt, "android_boot_pending");
      tokio::select! {
        _ = self.flow.ctx.cancel_token().cancelled() => return Err(CommandError::Cancelled),
        _ = tokio::time::sleep(BOOT_INTERVAL) => {}
      }
    }
    Err(CommandError::failed("sys.boot_completed never reached 1"))
  }

  fn error_message(&self) -> &str {
    "android device did not boot after flashing"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePostProvision
  }
}

struct InstallApk {
  flow: AndroidFlow,
  local: String,
}

#[async_trait]
impl Command for InstallApk {
  fn name(&self) -> &str {
    "install_apk"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    // Replace, allow downgrade, grant runtime permissions.
    let out = self.flow.adb(&["install", "-r", "-d", "-g", &self.local]).await?;
    if !out.contains("Success") {
      return Err(CommandError::failed(format!(
        "adb install of {} did not succeed: {}",
        self.local,
        out.trim()
      )));
    }
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to install APK"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct RemoveProvisionDir {
  flow: AndroidFlow,
}

#[async_trait]
impl Command for RemoveProvisionDir {
  fn name(&self) -> &str {
    "remove_provision_dir"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let dir = self.flow.provision_dir();
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to remove provision directory",
        ctx.device().delete_directory(&dir),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to clean up provision files"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_flashable_files_keeps_images_and_zips() {
    let listing = "oriole-sd1a/\nbootloader-oriole-slider-1.0.img\nradio-oriole-g5123b.img\nimage-oriole-sd1a.zip\nflash-all.sh\n";
    assert_eq!(
      flashable_files(listing),
      vec![
        "bootloader-oriole-slider-1.0.img",
        "radio-oriole-g5123b.img",
        "image-oriole-sd1a.zip",
      ]
    );
  }

  #[test]
  fn test_find_partition_image_by_prefix() {
    let files = vec![
      "radio-oriole.img".to_string(),
      "bootloader.oriole.img".to_string(),
    ];
    assert_eq!(
      FlashOs::find(&files, r"^bootloader[-.].*img$", "bootloader").unwrap(),
      "bootloader.oriole.img"
    );
    assert!(FlashOs::find(&files, r"\.zip$", "update zip").is_err());
  }
}
