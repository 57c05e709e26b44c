//! Per-flow context shared by every state and command of one run.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use provision_device::{DeviceAdapter, DeviceError, command_line};
use provision_state_machine::{CommandError, CommandResultExt};
use tokio_util::sync::CancellationToken;

use crate::cros::PartitionInfo;

/// Facts learned while the flow runs, read by later commands.
#[derive(Debug, Clone, Default)]
pub struct Facts {
  /// Root/kernel partitions detected before the install.
  pub partitions: Option<PartitionInfo>,
  /// Whether the new OS carries a firmware updater.
  pub firmware_updater_present: bool,
  /// LaCrOS version being installed.
  pub lacros_version: Option<String>,
  /// Device-local copy of the firmware image.
  pub firmware_image: Option<String>,
  /// Images unpacked from the Android factory zip.
  pub android_os_files: Vec<String>,
}

/// How long a device call issued after cancellation may take. Only
/// rollback issues such calls, so reverts still get to clean up.
pub const DEFAULT_ROLLBACK_GRACE: Duration = Duration::from_secs(120);

/// Everything a command needs to talk to the device.
pub struct FlowContext {
  device: Arc<dyn DeviceAdapter>,
  cancel: CancellationToken,
  rollback_grace: Duration,
  facts: Mutex<Facts>,
}

impl FlowContext {
  pub fn new(device: Arc<dyn DeviceAdapter>, cancel: CancellationToken) -> Arc<Self> {
    Self::with_rollback_grace(device, cancel, DEFAULT_ROLLBACK_GRACE)
  }

  pub fn with_rollback_grace(
    device: Arc<dyn DeviceAdapter>,
    cancel: CancellationToken,
    rollback_grace: Duration,
  ) -> Arc<Self> {
    Arc::new(Self {
      device,
      cancel,
      rollback_grace,
      facts: Mutex::new(Facts::default()),
    })
  }

  pub fn device(&self) -> &dyn DeviceAdapter {
    self.device.as_ref()
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn facts(&self) -> MutexGuard<'_, Facts> {
    self.facts.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Await a device call, giving up as soon as the flow is cancelled.
  ///
  /// A call started after cancellation runs under the rollback grace
  /// instead, so reverts of the interrupted state still reach the device.
  pub async fn call<T, F>(&self, context: impl Into<String>, fut: F) -> Result<T, CommandError>
  where
    F: Future<Output = Result<T, DeviceError>>,
  {
    if self.cancel.is_cancelled() {
      return match tokio::time::timeout(self.rollback_grace, fut).await {
        Ok(result) => result.command_context(context),
        Err(_) => Err(CommandError::failed(format!(
          "{}: no answer within {}s after cancellation",
          context.into(),
          self.rollback_grace.as_secs()
        ))),
      };
    }
    tokio::select! {
      _ = self.cancel.cancelled() => Err(CommandError::Cancelled),
      result = fut => result.command_context(context),
    }
  }

  /// Run a shell command on the device and return its stdout.
  pub async fn run(&self, cmd: &str, args: &[&str]) -> Result<String, CommandError> {
    let line = command_line(cmd, args);
    self
      .call(format!("failed to run '{}'", line), self.device.run_cmd(cmd, args))
      .await
  }

  /// Partition layout recorded by the init state.
  pub fn partitions(&self) -> Result<PartitionInfo, CommandError> {
    self
      .facts()
      .partitions
      .clone()
      .ok_or_else(|| CommandError::failed("partition layout has not been detected"))
  }
}
