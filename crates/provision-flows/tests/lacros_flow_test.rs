use std::sync::Arc;

use provision_device::ScriptedDevice;
use provision_flows::{FlowContext, InstallRequest, LacrosTarget, Target, build_flow};
use provision_state_machine::{ExecutionResult, InstallStatus, StateMachineExecutor};
use tokio_util::sync::CancellationToken;

const IMAGE: &str = "gs://chrome-unsigned/desktop-5c0tCh/95.0.4638.17/lacros64";
const COMPONENT: &str = "/var/lib/imageloader/lacros/95.0.4638.17";

fn device() -> Arc<ScriptedDevice> {
  let device = Arc::new(ScriptedDevice::new());
  device
    .respond("cat /tmp/metadata.json", r#"{"content": {"version": "95.0.4638.17"}}"#)
    .respond("stat -c%s", " 8192 \n")
    .respond("sha256sum", "deadbeef\n")
    .respond("[ -e /var/lib/imageloader/lacros/95.0.4638.17/image.squash ]", "1");
  device
}

fn request(override_version: Option<&str>, override_install_path: Option<&str>) -> InstallRequest {
  InstallRequest {
    target: Target::Lacros(LacrosTarget {
      image_path: IMAGE.to_string(),
      override_version: override_version.map(str::to_string),
      override_install_path: override_install_path.map(str::to_string),
    }),
    prevent_reboot: false,
  }
}

async fn run(device: &Arc<ScriptedDevice>, request: &InstallRequest) -> ExecutionResult {
  let cancel = CancellationToken::new();
  let ctx = FlowContext::new(device.clone(), cancel.clone());
  StateMachineExecutor::new()
    .execute("lacros-test", build_flow(ctx, request), &cancel)
    .await
}

#[tokio::test]
async fn test_lacros_happy_path() {
  let device = device();
  let result = run(&device, &request(None, None)).await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  assert!(device.was_called(&format!("copy_data {}/metadata.json /tmp/metadata.json", IMAGE)));
  assert!(device.was_called(&format!("mkdir -p {}", COMPONENT)));
  assert!(device.was_called(&format!(
    "copy_data {}/lacros_compressed.squash {}/image.squash",
    IMAGE, COMPONENT
  )));
  // Already page aligned.
  assert!(!device.was_called("dd "));
  assert!(device.was_called(&format!(
    "verity mode=create alg=sha256 payload={c}/image.squash payload_blocks=2 hashtree={c}/hashtree salt=random > {c}/table",
    c = COMPONENT
  )));
  assert!(device.was_called(&format!("cat {c}/hashtree >> {c}/image.squash", c = COMPONENT)));

  let calls = device.calls();
  let manifest = calls
    .iter()
    .find(|c| c.ends_with(&format!("> {}/imageloader.json", COMPONENT)))
    .unwrap();
  assert!(manifest.contains(r#""image-sha256-hash": "deadbeef""#));
  assert!(manifest.contains(r#""version": "95.0.4638.17""#));
  assert!(device.was_called("echo '95.0.4638.17' > /var/lib/imageloader/lacros/latest-version"));
}

#[tokio::test]
async fn test_lacros_pads_image_to_page_size() {
  let device = device();
  device.respond("stat -c%s", " 100 ");

  let result = run(&device, &request(None, None)).await;

  assert!(result.is_ok());
  assert!(device.was_called(&format!(
    "dd if=/dev/zero bs=1 count=3996 seek=100 of={}/image.squash",
    COMPONENT
  )));
}

#[tokio::test]
async fn test_lacros_overrides_skip_metadata() {
  let device = device();
  device.respond(
    "[ -e /home/chronos/cros-components/9999.0.0.1/image.squash ]",
    "1",
  );

  let result = run(
    &device,
    &request(Some("9999.0.0.1"), Some("/home/chronos/cros-components")),
  )
  .await;

  assert!(result.is_ok(), "unexpected error: {:?}", result.error);
  assert!(!device.was_called("cat /tmp/metadata.json"));
  assert!(device.was_called("mkdir -p /home/chronos/cros-components/9999.0.0.1"));
  assert!(device.was_called("echo '9999.0.0.1' > /var/lib/imageloader/lacros/latest-version"));
}

#[tokio::test]
async fn test_lacros_bad_metadata_is_download_failure() {
  let device = device();
  device.respond("cat /tmp/metadata.json", "not json");

  let result = run(&device, &request(None, None)).await;

  assert_eq!(result.status, InstallStatus::DownloadFailed);
  assert_eq!(result.error.unwrap().state(), "LaCrOS Prepare");
  assert!(!device.was_called("mkdir"));
}

#[tokio::test]
async fn test_lacros_verity_failure_removes_component() {
  let device = device();
  device.fail("verity", "verity: command not found");

  let result = run(&device, &request(None, None)).await;

  assert_eq!(result.status, InstallStatus::ProvisioningFailed);
  let error = result.error.unwrap();
  assert!(error.to_string().starts_with("failed to generate verity for LaCrOS image, "));
  assert!(device.was_called(&format!("rm -rf {}", COMPONENT)));
  assert!(!device.was_called("echo"));
}

#[tokio::test]
async fn test_lacros_missing_image_fails_verify() {
  let device = device();
  device.respond("[ -e /var/lib/imageloader/lacros/95.0.4638.17/image.squash ]", "0");

  let result = run(&device, &request(None, None)).await;

  assert_eq!(result.status, InstallStatus::PostProvisionSetupFailed);
  assert_eq!(result.error.unwrap().state(), "LaCrOS Verify");
}
