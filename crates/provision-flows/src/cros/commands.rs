use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provision_state_machine::{Command, CommandError, InstallStatus};
use tracing::{info, warn};

use super::{
  DLC_CACHE_DIR, DLC_LIB_DIR, FACTORY_RESET_FILE, FIRMWARE_UPDATER, PROVISION_MARKER, PartitionInfo,
  STATEFUL_PATH, UPDATE_STATEFUL_FILE,
};
use crate::context::FlowContext;
use crate::templates;

const STABILIZE_ATTEMPTS: u32 = 30;
const STABILIZE_INTERVAL: Duration = Duration::from_secs(2);

pub(super) struct CheckReachable {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for CheckReachable {
  fn name(&self) -> &str {
    "check_reachable"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self.ctx.run("true", &[]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "device is not reachable"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePreProvision
  }
}

/// The marker outlives a failed run, so its presence after a reboot means the
/// last provision did not finish.
pub(super) struct CreateProvisionMarker {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for CreateProvisionMarker {
  fn name(&self) -> &str {
    "create_provision_marker"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self.ctx.run("touch", &[PROVISION_MARKER]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to create provision marker"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

pub(super) struct StopSystemDaemons {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for StopSystemDaemons {
  fn name(&self) -> &str {
    "stop_system_daemons"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    // Either daemon may already be stopped.
    for daemon in ["ui", "update-engine"] {
      if let Err(e) = self.ctx.run("stop", &[daemon]).await {
        if matches!(e, CommandError::Cancelled) {
          return Err(e);
        }
        warn!(daemon, error = %e, "failed to stop daemon");
      }
    }
    Ok(())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    self.ctx.run("start", &["update-engine"]).await?;
    self.ctx.run("start", &["ui"]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to stop system daemons"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

pub(super) struct DetectPartitions {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for DetectPartitions {
  fn name(&self) -> &str {
    "detect_partitions"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let root = self.ctx.run("rootdev", &["-s"]).await?;
    let disk = self.ctx.run("rootdev", &["-s", "-d"]).await?;
    let partitions = PartitionInfo::from_root(&root, &disk).map_err(CommandError::failed)?;

    info!(
      active_root = %partitions.active_root,
      inactive_root = %partitions.inactive_root,
      "partitions_detected"
    );
    self.ctx.facts().partitions = Some(partitions);
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to detect root partition"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

/// Streams the kernel and root images onto the inactive partitions.
pub(super) struct InstallPartitions {
  pub(super) ctx: Arc<FlowContext>,
  pub(super) image_path: String,
}

impl InstallPartitions {
  async fn install(&self, image: &str, output: &str) -> Result<(), CommandError> {
    let source = format!("{}/{}", self.image_path.trim_end_matches('/'), image);
    let script = templates::partition_install(&source, output)?;
    self
      .ctx
      .call(
        format!("failed to install {} to {}", image, output),
        self.ctx.device().pipe_data(&source, &script),
      )
      .await
  }
}

#[async_trait]
impl Command for InstallPartitions {
  fn name(&self) -> &str {
    "install_partitions"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let partitions = self.ctx.partitions()?;
    self
      .install("full_dev_part_KERN.bin.gz", &partitions.inactive_kernel)
      .await?;
    self
      .install("full_dev_part_ROOT.bin.gz", &partitions.inactive_root)
      .await
  }

  fn error_message(&self) -> &str {
    "failed to install partitions"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Drops the verified marks of DLCs in the slot being overwritten.
pub(super) struct ClearInactiveDlcVerified {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for ClearInactiveDlcVerified {
  fn name(&self) -> &str {
    "clear_inactive_dlc_verified"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let slot = self.ctx.partitions()?.inactive_dlc_slot();
    let exists = self
      .ctx
      .call(
        "failed to check DLC directory",
        self.ctx.device().path_exists(DLC_LIB_DIR),
      )
      .await?;
    if !exists {
      info!("no DLC directory, skipping verified mark cleanup");
      return Ok(());
    }

    if let Err(e) = self.ctx.run("stop", &["dlcservice"]).await {
      warn!(error = %e, "failed to stop dlcservice");
    }
    let pattern = format!("{}/*/*/{}/verified", DLC_CACHE_DIR, slot);
    let result = self.ctx.run("rm", &["-f", &pattern]).await;
    if let Err(e) = self.ctx.run("start", &["dlcservice"]).await {
      warn!(error = %e, "failed to start dlcservice");
    }
    result.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to clear inactive DLC artifacts"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

pub(super) struct InstallStateful {
  pub(super) ctx: Arc<FlowContext>,
  pub(super) image_path: String,
}

#[async_trait]
impl Command for InstallStateful {
  fn name(&self) -> &str {
    "install_stateful"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let var_new = format!("{}/var_new", STATEFUL_PATH);
    let dev_image_new = format!("{}/dev_image_new", STATEFUL_PATH);
    self
      .ctx
      .run("rm", &["-rf", UPDATE_STATEFUL_FILE, &var_new, &dev_image_new])
      .await?;

    let source = format!("{}/stateful.tgz", self.image_path.trim_end_matches('/'));
    let untar = format!(
      "tar --ignore-command-error --overwrite --directory={} --selinux -xzf -",
      STATEFUL_PATH
    );
    self
      .ctx
      .call(
        "failed to download stateful image",
        self.ctx.device().pipe_data(&source, &untar),
      )
      .await?;

    self
      .ctx
      .run("echo", &["-n", "clobber", ">", UPDATE_STATEFUL_FILE])
      .await
      .map(|_| ())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    let var_new = format!("{}/var_new", STATEFUL_PATH);
    let dev_image_new = format!("{}/dev_image_new", STATEFUL_PATH);
    self
      .ctx
      .run("rm", &["-rf", &var_new, &dev_image_new, UPDATE_STATEFUL_FILE])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to install stateful partition"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Requests a stateful wipe on the next boot.
pub(super) struct WipeStateful {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for WipeStateful {
  fn name(&self) -> &str {
    "wipe_stateful"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .run("echo", &["'fast keepimg'", ">", FACTORY_RESET_FILE])
      .await
      .map(|_| ())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    self.ctx.run("rm", &["-f", FACTORY_RESET_FILE]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to wipe stateful partition"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

pub(super) struct OverwriteInstall {
  pub(super) ctx: Arc<FlowContext>,
  pub(super) payload: String,
}

#[async_trait]
impl Command for OverwriteInstall {
  fn name(&self) -> &str {
    "overwrite_install"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .call(
        "failed to download and untar overwrite payload",
        self.ctx.device().pipe_data(&self.payload, "tar xf - -C /"),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to install overwrite payload"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Mounts the new root and runs its postinst, which marks it bootable.
pub(super) struct RunPostInstall {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RunPostInstall {
  fn name(&self) -> &str {
    "run_post_install"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let partitions = self.ctx.partitions()?;
    let tmp = self.ctx.run("mktemp", &["-d"]).await?;
    let tmp = tmp.trim();

    self
      .ctx
      .run("mount", &["-o", "ro", &partitions.inactive_root, tmp])
      .await?;
    let postinst = format!("{}/postinst", tmp);
    let result = self.ctx.run(&postinst, &[&partitions.inactive_root]).await;

    if let Err(e) = self.ctx.run("umount", &[tmp]).await {
      warn!(mount = %tmp, error = %e, "failed to unmount new root");
    }
    if let Err(e) = self.ctx.run("rmdir", &[tmp]).await {
      warn!(mount = %tmp, error = %e, "failed to remove mount point");
    }
    result.map(|_| ())
  }

  /// Re-running postinst from the active root marks it bootable again.
  async fn revert(&self) -> Result<(), CommandError> {
    let partitions = self.ctx.partitions()?;
    self
      .ctx
      .run("/postinst", &[&partitions.active_root, "2>&1"])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to run post install"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}

pub(super) struct ClearTpm {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for ClearTpm {
  fn name(&self) -> &str {
    "clear_tpm"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .run("crossystem", &["clear_tpm_owner_request=1"])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to request TPM clear"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}

pub(super) struct Reboot {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for Reboot {
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
    "failed to reboot device"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePostProvision
  }
}

/// Records whether the new OS ships a firmware updater. Later firmware
/// commands are no-ops without one.
pub(super) struct CheckFirmwareUpdater {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for CheckFirmwareUpdater {
  fn name(&self) -> &str {
    "check_firmware_updater"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let present = self
      .ctx
      .call(
        "failed to check firmware updater",
        self.ctx.device().path_exists(FIRMWARE_UPDATER),
      )
      .await?;
    if !present {
      info!("firmware updater does not exist on the build, skipping firmware update");
    }
    self.ctx.facts().firmware_updater_present = present;
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to check firmware updater"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Waits until upstart reports system-services as running.
pub(super) struct WaitForStabilize {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for WaitForStabilize {
  fn name(&self) -> &str {
    "wait_for_stabilize"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    if !self.ctx.facts().firmware_updater_present {
      return Ok(());
    }
    for attempt in 1..=STABILIZE_ATTEMPTS {
      let status = self.ctx.run("status", &["system-services"]).await?;
      if status.contains("start/running") {
        return Ok(());
      }
      info!(attempt, status = %status.trim(), "waiting for system-services");
      tokio::select! {
        _ = self.ctx.cancel_token().cancelled() => return Err(CommandError::Cancelled),
        _ = tokio::time::sleep(STABILIZE_INTERVAL) => {}
      }
    }
    Err(CommandError::failed("system-services did not reach start/running"))
  }

  fn error_message(&self) -> &str {
    "device did not stabilize before firmware update"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

pub(super) struct RunFirmwareUpdater {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RunFirmwareUpdater {
  fn name(&self) -> &str {
    "run_firmware_updater"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    if !self.ctx.facts().firmware_updater_present {
      return Ok(());
    }
    self
      .ctx
      .run(FIRMWARE_UPDATER, &["--wp=1", "--mode=autoupdate"])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to run firmware updater"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Reboots only when the updater scheduled a different firmware slot.
pub(super) struct RebootOnFirmwareSlotChange {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RebootOnFirmwareSlotChange {
  fn name(&self) -> &str {
    "reboot_on_firmware_slot_change"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    if !self.ctx.facts().firmware_updater_present {
      return Ok(());
    }
    let current = self.ctx.run("crossystem", &["mainfw_act"]).await?;
    let next = self.ctx.run("crossystem", &["fw_try_next"]).await?;
    if current.trim() == next.trim() {
      info!(slot = %current.trim(), "no firmware slot change detected, skipping reboot");
      return Ok(());
    }

    info!(current = %current.trim(), next = %next.trim(), "firmware_slot_changed");
    self
      .ctx
      .call("device did not come back", self.ctx.device().restart())
      .await
  }

  fn error_message(&self) -> &str {
    "failed to reboot after firmware update"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DutUnreachablePostProvision
  }
}

/// Installs every requested DLC into the slot of the new root in parallel.
pub(super) struct InstallDlcs {
  pub(super) ctx: Arc<FlowContext>,
  pub(super) image_path: String,
  pub(super) dlcs: Vec<String>,
}

impl InstallDlcs {
  async fn install_one(&self, dlc: &str, slot: &str) -> Result<(), CommandError> {
    let verified = format!("{}/{}/{}/verified", DLC_LIB_DIR, dlc, slot);
    let already = self
      .ctx
      .call(
        format!("failed to check if DLC {} is verified", dlc),
        self.ctx.device().path_exists(&verified),
      )
      .await?;
    if already {
      info!(dlc, "DLC already verified, skipping");
      return Ok(());
    }

    let output_dir = format!("{}/{}/package/{}", DLC_CACHE_DIR, dlc, slot);
    let output_image = format!("{}/dlc.img", output_dir);
    let url = format!(
      "{}/dlc/{}/package/dlc.img",
      self.image_path.trim_end_matches('/'),
      dlc
    );

    self
      .ctx
      .call(
        format!("failed to create DLC directory for {}", dlc),
        self.ctx.device().create_directories(&[&output_dir]),
      )
      .await?;
    self
      .ctx
      .call(
        format!("failed to download DLC {}", dlc),
        self.ctx.device().copy_data(&url, &output_image),
      )
      .await
  }
}

#[async_trait]
impl Command for InstallDlcs {
  fn name(&self) -> &str {
    "install_dlcs"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let slot = self.ctx.partitions()?.inactive_dlc_slot();

    let results =
      futures::future::join_all(self.dlcs.iter().map(|dlc| self.install_one(dlc, slot))).await;
    let failures: Vec<String> = results
      .into_iter()
      .filter_map(|r| r.err())
      .map(|e| e.to_string())
      .collect();
    if !failures.is_empty() {
      return Err(CommandError::failed(failures.join(", ")));
    }

    self
      .ctx
      .run("chown", &["-R", "dlcservice:dlcservice", DLC_CACHE_DIR])
      .await?;
    self
      .ctx
      .run("chmod", &["-R", "0755", DLC_CACHE_DIR])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to install DLCs"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

pub(super) struct RemoveProvisionMarker {
  pub(super) ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RemoveProvisionMarker {
  fn name(&self) -> &str {
    "remove_provision_marker"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self.ctx.run("rm", &["-f", PROVISION_MARKER]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to remove provision marker"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}
