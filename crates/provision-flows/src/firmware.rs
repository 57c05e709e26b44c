//! AP firmware flash flow over ssh.
//!
//! ```text
//! UpdateRo → UpdateRw → PostInstall
//! ```
//!
//! Exactly one of the update states flashes: RO when `flash_ro` is set
//! (which rewrites RW as well), RW otherwise.

use std::sync::Arc;

use async_trait::async_trait;
use provision_state_machine::{Command, CommandError, InstallStatus, State};
use serde_json::json;
use tracing::info;

use crate::context::FlowContext;
use crate::request::FirmwareTarget;

const FIRMWARE_TMP_DIR: &str = "/tmp/fw-provisioning-service";

#[derive(Clone)]
struct FirmwareFlow {
  ctx: Arc<FlowContext>,
  target: Arc<FirmwareTarget>,
}

impl FirmwareFlow {
  fn update_commands(&self, flash_ro: bool) -> Vec<Box<dyn Command>> {
    if self.target.flash_ro != flash_ro {
      return Vec::new();
    }
    vec![
      Box::new(DownloadFirmware { flow: self.clone() }),
      Box::new(FlashFirmware {
        ctx: self.ctx.clone(),
        flash_ro,
      }),
    ]
  }
}

/// First state of the firmware flow.
pub fn initial_state(ctx: Arc<FlowContext>, target: FirmwareTarget) -> Box<dyn State> {
  Box::new(UpdateRoState {
    flow: FirmwareFlow {
      ctx,
      target: Arc::new(target),
    },
  })
}

struct UpdateRoState {
  flow: FirmwareFlow,
}

impl State for UpdateRoState {
  fn name(&self) -> &str {
    "Firmware Update RO"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    self.flow.update_commands(true)
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(UpdateRwState {
      flow: self.flow.clone(),
    }))
  }
}

struct UpdateRwState {
  flow: FirmwareFlow,
}

impl State for UpdateRwState {
  fn name(&self) -> &str {
    "Firmware Update RW"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    self.flow.update_commands(false)
  }

  fn metadata(&self) -> Option<serde_json::Value> {
    let image = self.flow.ctx.facts().firmware_image.clone()?;
    Some(json!({
      "image": image,
      "flash_ro": self.flow.target.flash_ro,
    }))
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(PostInstallState {
      flow: self.flow.clone(),
    }))
  }
}

struct PostInstallState {
  flow: FirmwareFlow,
}

impl State for PostInstallState {
  fn name(&self) -> &str {
    "Firmware Post Install"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(RebootAfterFlash { ctx: ctx.clone() }),
      Box::new(RemoveFirmwareTmp { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    None
  }
}

/// Image names tried inside an archive, most specific first.
pub(crate) fn image_candidates(board: Option<&str>, model: Option<&str>) -> Vec<String> {
  let mut candidates = Vec::new();
  if let Some(model) = model.filter(|m| !m.is_empty()) {
    candidates.push(format!("image-{}.bin", model));
  }
  if let Some(board) = board.filter(|b| !b.is_empty()) {
    candidates.push(format!("image-{}.bin", board));
  }
  candidates.push("image.bin".to_string());
  candidates.push("bios.bin".to_string());
  candidates
}

fn is_archive(path: &str) -> bool {
  [".tar", ".tar.gz", ".tgz", ".tar.bz2"]
    .iter()
    .any(|ext| path.ends_with(ext))
}

/// Copy the firmware onto the device, extracting the AP image when the
/// source is an archive.
struct DownloadFirmware {
  flow: FirmwareFlow,
}

impl DownloadFirmware {
  async fn extract_main_image(&self, archive: &str) -> Result<String, CommandError> {
    let ctx = &self.flow.ctx;
    let listing = ctx.run("tar", &["-tf", archive]).await?;
    let files: Vec<&str> = listing
      .lines()
      .map(|l| l.trim().trim_start_matches("./"))
      .collect();

    let target = &self.flow.target;
    let candidates = image_candidates(target.board.as_deref(), target.model.as_deref());
    let picked = candidates
      .iter()
      .find(|c| files.contains(&c.as_str()))
      .ok_or_else(|| {
        CommandError::failed(format!(
          "could not find an AP image named any of: {}",
          candidates.join(", ")
        ))
      })?;

    ctx
      .run("tar", &["-xf", archive, "-C", FIRMWARE_TMP_DIR, picked.as_str()])
      .await?;
    Ok(format!("{}/{}", FIRMWARE_TMP_DIR, picked))
  }
}

#[async_trait]
impl Command for DownloadFirmware {
  fn name(&self) -> &str {
    "download_firmware"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    let source = &self.flow.target.image_path;
    let file_name = source.rsplit('/').next().unwrap_or("firmware.bin");
    let local = format!("{}/{}", FIRMWARE_TMP_DIR, file_name);

    ctx
      .call(
        "failed to create firmware directory",
        ctx.device().create_directories(&[FIRMWARE_TMP_DIR]),
      )
      .await?;
    ctx
      .call(
        "failed to download firmware",
        ctx.device().copy_data(source, &local),
      )
      .await?;

    let image = if is_archive(&local) {
      self.extract_main_image(&local).await?
    } else {
      local
    };
    info!(image = %image, "firmware_image_ready");
    ctx.facts().firmware_image = Some(image);
    Ok(())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to remove firmware directory",
        ctx.device().delete_directory(FIRMWARE_TMP_DIR),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to download firmware image"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DownloadFailed
  }
}

/// Flash with futility. RO flashing needs write protection off.
struct FlashFirmware {
  ctx: Arc<FlowContext>,
  flash_ro: bool,
}

#[async_trait]
impl Command for FlashFirmware {
  fn name(&self) -> &str {
    if self.flash_ro { "flash_ro" } else { "flash_rw" }
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let image = self
      .ctx
      .facts()
      .firmware_image
      .clone()
      .ok_or_else(|| CommandError::failed("firmware image has not been downloaded"))?;
    let image_arg = format!("--image={}", image);
    let (mode, wp) = if self.flash_ro {
      ("--mode=recovery", "--wp=0")
    } else {
      ("--mode=autoupdate", "--wp=1")
    };
    self
      .ctx
      .run("futility", &["update", mode, &image_arg, wp])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to flash firmware"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct RebootAfterFlash {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RebootAfterFlash {
  fn name(&self) -> &str {
    "reboot"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .call("device did not come back", self.ctx.device().restart())
      .await
  }

  fn error_message(&self) -> &str {
    "failed to reboot after firmware flash"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePostProvision
  }
}

struct RemoveFirmwareTmp {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RemoveFirmwareTmp {
  fn name(&self) -> &str {
    "remove_firmware_tmp"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .call(
        "failed to remove firmware directory",
        self.ctx.device().delete_directory(FIRMWARE_TMP_DIR),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to clean up firmware files"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_image_candidates_prefer_model() {
    assert_eq!(
      image_candidates(Some("hatch"), Some("kohaku")),
      vec!["image-kohaku.bin", "image-hatch.bin", "image.bin", "bios.bin"]
    );
    assert_eq!(image_candidates(None, Some("")), vec!["image.bin", "bios.bin"]);
  }

  #[test]
  fn test_archive_detection() {
    assert!(is_archive("gs://b/ChromeOS-firmware-R98-hatch.tar.bz2"));
    assert!(!is_archive("gs://b/bios.bin"));
  }
}
