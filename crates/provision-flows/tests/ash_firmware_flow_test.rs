use std::sync::Arc;

use async_trait::async_trait;
use provision_device::{DeviceAdapter, DeviceError, ScriptedDevice, command_line};
use provision_flows::{AshTarget, FirmwareTarget, FlowContext, InstallRequest, Target, build_flow};
use provision_state_machine::{ExecutionResult, InstallStatus, StateMachineExecutor};
use tokio_util::sync::CancellationToken;

const STAGING: &str = "/tmp/_provisioning_service_chrome_deploy";

async fn run(device: &Arc<ScriptedDevice>, target: Target) -> ExecutionResult {
  let request = InstallRequest {
    target,
    prevent_reboot: false,
  };
  let cancel = CancellationToken::new();
  let ctx = FlowContext::new(device.clone(), cancel.clone());
  StateMachineExecutor::new()
    .execute("flow-test", build_flow(ctx, &request), &cancel)
    .await
}

fn ash() -> Target {
  Target::Ash(AshTarget {
    image_path: "gs://chromeos-image-archive/eve-release/R90/chrome.tar.zst".to_string(),
  })
}

fn firmware(flash_ro: bool) -> Target {
  Target::Firmware(FirmwareTarget {
    image_path: "gs://chromeos-releases/firmware/ChromeOS-firmware-R98-hatch.tar.bz2".to_string(),
    flash_ro,
    board: Some("hatch".to_string()),
    model: Some("kohaku".to_string()),
  })
}

#[tokio::test]
async fn test_ash_deploys_staged_files() {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond(&format!("[ -e {}/chrome ]", STAGING), "1")
    .respond(&format!("[ -e {}/extensions/ ]", STAGING), "1");

  let result = run(&device, ash()).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  let stop = device.position("stop ui").unwrap();
  let remount = device.position("mount -o remount,rw /").unwrap();
  let stage = device.position("pipe_data gs://chromeos-image-archive").unwrap();
  assert!(stop < remount && remount < stage);

  assert!(device.was_called(&format!("rsync -av {}/chrome /opt/google/chrome", STAGING)));
  assert!(device.was_called(&format!(
    "rsync -av {}/extensions/ /opt/google/chrome/extensions",
    STAGING
  )));
  assert!(!device.was_called(&format!("rsync -av {}/ash_shell", STAGING)));

  let calls = device.calls();
  let start = calls.iter().position(|c| c == "start ui").unwrap();
  let hup = calls.iter().position(|c| c == "killall -HUP dbus-daemon").unwrap();
  assert!(hup < start);
  assert_eq!(calls.last().unwrap(), "rm -rf /tmp/_provisioning_service_chrome_backup");
}

#[tokio::test]
async fn test_ash_sync_failure_restores_backup() {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond(&format!("[ -e {}/chrome ]", STAGING), "1")
    .fail(&format!("rsync -av {}/chrome", STAGING), "No space left on device");

  let result = run(&device, ash()).await;

  assert_eq!(result.status, InstallStatus::ProvisioningFailed);
  assert_eq!(result.error.unwrap().state(), "Ash Install");
  assert!(device.was_called(
    "rsync -a --delete /tmp/_provisioning_service_chrome_backup/ /opt/google/chrome"
  ));
  assert!(device.was_called("rm -rf /tmp/_provisioning_service_chrome_backup"));
  assert!(!device.was_called("start ui"));
}

/// Records every call, then never answers commands starting with `prefix`.
struct HangsOn {
  inner: Arc<ScriptedDevice>,
  prefix: &'static str,
}

#[async_trait]
impl DeviceAdapter for HangsOn {
  async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String, DeviceError> {
    let out = self.inner.run_cmd(cmd, args).await;
    if command_line(cmd, args).starts_with(self.prefix) {
      std::future::pending::<()>().await;
    }
    out
  }

  async fn restart(&self) -> Result<(), DeviceError> {
    self.inner.restart().await
  }

  async fn copy_data(&self, source_url: &str, dest_path: &str) -> Result<(), DeviceError> {
    self.inner.copy_data(source_url, dest_path).await
  }

  async fn pipe_data(&self, source_url: &str, pipe_command: &str) -> Result<(), DeviceError> {
    self.inner.pipe_data(source_url, pipe_command).await
  }
}

#[tokio::test]
async fn test_ash_cancelled_sync_still_restores_backup() {
  let scripted = Arc::new(ScriptedDevice::new());
  scripted.respond(&format!("[ -e {}/chrome ]", STAGING), "1");
  let device = Arc::new(HangsOn {
    inner: scripted.clone(),
    prefix: "rsync -av",
  });
  let request = InstallRequest {
    target: ash(),
    prevent_reboot: false,
  };
  let cancel = CancellationToken::new();
  let ctx = FlowContext::new(device, cancel.clone());

  let executor = StateMachineExecutor::new();
  let (result, ()) = tokio::join!(
    executor.execute("flow-test", build_flow(ctx, &request), &cancel),
    async {
      while !scripted.was_called(&format!("rsync -av {}/chrome", STAGING)) {
        tokio::task::yield_now().await;
      }
      cancel.cancel();
    }
  );

  assert_eq!(result.error.unwrap().state(), "Ash Install");
  assert!(scripted.was_called(
    "rsync -a --delete /tmp/_provisioning_service_chrome_backup/ /opt/google/chrome"
  ));
  assert!(scripted.was_called("rm -rf /tmp/_provisioning_service_chrome_backup"));
}

#[tokio::test]
async fn test_ash_chrome_held_open_fails_prepare() {
  tokio::time::pause();
  let device = Arc::new(ScriptedDevice::new());
  device.respond("lsof /opt/google/chrome/chrome", "chrome 1234 chronos txt REG\n");

  let result = run(&device, ash()).await;

  assert_eq!(result.status, InstallStatus::PreProvisionSetupFailed);
  let pkills = device.calls().iter().filter(|c| c.starts_with("pkill")).count();
  assert_eq!(pkills, 10);
  // stop ui is undone.
  assert!(device.was_called("start ui"));
}

#[tokio::test]
async fn test_firmware_rw_update() {
  let device = Arc::new(ScriptedDevice::new());
  device.respond(
    "tar -tf /tmp/fw-provisioning-service/ChromeOS-firmware-R98-hatch.tar.bz2",
    "./image-hatch.bin\n./image-kohaku.bin\n./ec.bin\n",
  );

  let result = run(&device, firmware(false)).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  assert!(device.was_called(
    "tar -xf /tmp/fw-provisioning-service/ChromeOS-firmware-R98-hatch.tar.bz2 -C /tmp/fw-provisioning-service image-kohaku.bin"
  ));
  assert!(device.was_called(
    "futility update --mode=autoupdate --image=/tmp/fw-provisioning-service/image-kohaku.bin --wp=1"
  ));
  assert!(!device.was_called("futility update --mode=recovery"));
  assert!(device.was_called("restart"));

  let metadata = result.metadata.unwrap();
  assert_eq!(metadata["image"], "/tmp/fw-provisioning-service/image-kohaku.bin");
}

#[tokio::test]
async fn test_firmware_ro_update_uses_recovery_mode() {
  let device = Arc::new(ScriptedDevice::new());
  device.respond("tar -tf", "bios.bin\n");

  let result = run(&device, firmware(true)).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  let flashes: Vec<String> = device
    .calls()
    .into_iter()
    .filter(|c| c.starts_with("futility"))
    .collect();
  assert_eq!(
    flashes,
    vec!["futility update --mode=recovery --image=/tmp/fw-provisioning-service/bios.bin --wp=0"]
  );
}

#[tokio::test]
async fn test_firmware_missing_image_in_archive() {
  let device = Arc::new(ScriptedDevice::new());
  device.respond("tar -tf", "ec.bin\n");

  let result = run(&device, firmware(false)).await;

  assert_eq!(result.status, InstallStatus::DownloadFailed);
  let error = result.error.unwrap();
  assert_eq!(error.state(), "Firmware Update RW");
  assert!(error.to_string().contains("image-kohaku.bin"));
  assert!(!device.was_called("futility"));
}

#[tokio::test]
async fn test_firmware_flash_failure_cleans_download() {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond("tar -tf", "image.bin\n")
    .fail("futility update", "flashrom failed");

  let result = run(&device, firmware(false)).await;

  assert_eq!(result.status, InstallStatus::ProvisioningFailed);
  assert!(device.was_called("rm -rf /tmp/fw-provisioning-service"));
  assert!(!device.was_called("restart"));
}
