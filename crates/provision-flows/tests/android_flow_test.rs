use std::sync::Arc;

use provision_device::ScriptedDevice;
use provision_flows::{AndroidTarget, FlowContext, InstallRequest, Target, build_flow};
use provision_state_machine::{ExecutionResult, InstallStatus, StateMachineExecutor};
use tokio_util::sync::CancellationToken;

const SERIAL: &str = "1A2B3C4D";
const DIR: &str = "/mnt/stateful_partition/android_provision/1A2B3C4D";
const APK: &str = "gs://android-packages/gms/GmsCore.apk";
const OS_IMAGE: &str = "gs://android-images/oriole/oriole-sd1a-factory.zip";

const ZIP_LISTING: &str = "oriole-sd1a/\n\
bootloader-oriole-slider-1.0.img\n\
radio-oriole-g5123b.img\n\
image-oriole-sd1a.zip\n\
flash-all.sh\n";

fn device() -> Arc<ScriptedDevice> {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond(format!("adb -s {} get-state", SERIAL), "device\n")
    .respond(format!("adb -s {} install", SERIAL), "Performing Streamed Install\nSuccess\n")
    .respond(format!("adb -s {} shell getprop sys.boot_completed", SERIAL), "1\n")
    .respond("zipinfo -1", ZIP_LISTING);
  device
}

fn request(os_image_path: Option<&str>, apks: &[&str]) -> InstallRequest {
  InstallRequest {
    target: Target::Android(AndroidTarget {
      serial_number: SERIAL.to_string(),
      os_image_path: os_image_path.map(str::to_string),
      apk_paths: apks.iter().map(|a| a.to_string()).collect(),
    }),
    prevent_reboot: false,
  }
}

async fn run(device: &Arc<ScriptedDevice>, request: &InstallRequest) -> ExecutionResult {
  let cancel = CancellationToken::new();
  let ctx = FlowContext::new(device.clone(), cancel.clone());
  StateMachineExecutor::new()
    .execute("android-test", build_flow(ctx, request), &cancel)
    .await
}

#[tokio::test]
async fn test_android_installs_apk_without_flashing() {
  let device = device();
  let result = run(&device, &request(None, &[APK])).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  assert_eq!(
    device.calls(),
    vec![
      format!("adb -s {} get-state", SERIAL),
      format!("mkdir -p {}", DIR),
      format!("copy_data {} {}/GmsCore.apk", APK, DIR),
      format!("adb -s {} install -r -d -g {}/GmsCore.apk", SERIAL, DIR),
      format!("rm -rf {}", DIR),
    ]
  );
  let metadata = result.metadata.unwrap();
  assert_eq!(metadata["serial_number"], SERIAL);
  assert_eq!(metadata["apks"][0], APK);
}

#[tokio::test]
async fn test_android_flashes_os_before_installing_apks() {
  let device = device();
  let result = run(&device, &request(Some(OS_IMAGE), &[APK])).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  let zip = format!("{}/oriole-sd1a-factory.zip", DIR);
  assert!(device.was_called(&format!("copy_data {} {}", OS_IMAGE, zip)));
  assert!(device.was_called(&format!(
    "unzip -oq {} bootloader-oriole-slider-1.0.img radio-oriole-g5123b.img image-oriole-sd1a.zip -d {}",
    zip, DIR
  )));

  let order = [
    format!("adb -s {} reboot bootloader", SERIAL),
    format!(
      "fastboot -s {} flash bootloader {}/bootloader-oriole-slider-1.0.img",
      SERIAL, DIR
    ),
    format!("fastboot -s {} flash radio {}/radio-oriole-g5123b.img", SERIAL, DIR),
    format!(
      "TMPDIR={d}/tmp fastboot -s {} update {d}/image-oriole-sd1a.zip",
      SERIAL,
      d = DIR
    ),
    format!("adb -s {} wait-for-device", SERIAL),
    format!("adb -s {} install", SERIAL),
    format!("rm -rf {}", DIR),
  ];
  let positions: Vec<usize> = order
    .iter()
    .map(|prefix| {
      device
        .position(prefix)
        .unwrap_or_else(|| panic!("never called: {}", prefix))
    })
    .collect();
  assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", device.calls());
}

#[tokio::test]
async fn test_android_unattached_device_fails_before_changes() {
  let device = device();
  device.respond(format!("adb -s {} get-state", SERIAL), "unauthorized\n");

  let result = run(&device, &request(None, &[APK])).await;

  assert_eq!(result.status, InstallStatus::DutUnreachablePreProvision);
  assert_eq!(result.error.unwrap().state(), "Android Prepare");
  assert!(!device.was_called("mkdir"));
}

#[tokio::test]
async fn test_android_apk_download_failure() {
  let device = device();
  device.fail(format!("copy_data {}", APK), "curl: (22) 404 Not Found");

  let result = run(&device, &request(None, &[APK])).await;

  assert_eq!(result.status, InstallStatus::DownloadFailed);
  let error = result.error.unwrap();
  assert_eq!(error.state(), "Android Install Packages");
  assert!(error.to_string().starts_with("failed to copy data, "));
  assert!(!device.was_called(&format!("adb -s {} install", SERIAL)));
}

#[tokio::test]
async fn test_android_rejected_install_removes_copied_apk() {
  let device = device();
  device.respond(
    format!("adb -s {} install", SERIAL),
    "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]\n",
  );

  let result = run(&device, &request(None, &[APK])).await;

  assert_eq!(result.status, InstallStatus::ProvisioningFailed);
  let error = result.error.unwrap();
  assert!(error.to_string().contains("INSTALL_FAILED_VERSION_DOWNGRADE"));
  assert!(device.was_called(&format!("rm -f {}/GmsCore.apk", DIR)));
  assert!(!device.was_called(&format!("rm -rf {}", DIR)));
}

#[tokio::test]
async fn test_android_zip_without_images_fails_extract() {
  let device = device();
  device.respond("zipinfo -1", "flash-all.sh\nREADME\n");

  let result = run(&device, &request(Some(OS_IMAGE), &[])).await;

  assert_eq!(result.status, InstallStatus::PreProvisionSetupFailed);
  assert_eq!(result.error.unwrap().state(), "Android Flash OS");
  assert!(!device.was_called("fastboot"));
  assert!(device.was_called(&format!("rm -f {}/oriole-sd1a-factory.zip", DIR)));
}

#[tokio::test(start_paused = true)]
async fn test_android_never_booting_after_flash() {
  let device = device();
  device.respond(format!("adb -s {} shell getprop sys.boot_completed", SERIAL), "0\n");

  let result = run(&device, &request(Some(OS_IMAGE), &[])).await;

  assert_eq!(result.status, InstallStatus::DutUnreachablePostProvision);
  assert_eq!(result.error.unwrap().state(), "Android Flash OS");
}
