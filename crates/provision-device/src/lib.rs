//! Provision Device
//!
//! The [`DeviceAdapter`] trait is the only way provisioning commands touch
//! the device under test. Two implementations ship here:
//!
//! - [`SshDeviceAdapter`] runs everything through the system `ssh` binary.
//! - [`ScriptedDevice`] answers from in-memory rules and records every call.
//!   Used by tests and by dry runs.

mod error;
mod scripted;
mod ssh;

pub use error::DeviceError;
pub use scripted::ScriptedDevice;
pub use ssh::{SshDeviceAdapter, SshTarget, resolve_artifact_url};

use async_trait::async_trait;

/// Remote command channel to a single device.
///
/// Every call is potentially slow and fallible. Nothing here retries.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
  /// Run `cmd args...` through the device's shell and return stdout.
  ///
  /// Arguments are joined with spaces, so shell syntax (`&&`, `>`, `$(..)`)
  /// in them is interpreted remotely. Fails when the command exits non-zero
  /// or writes anything to stderr.
  async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String, DeviceError>;

  /// Reboot the device and wait for it to come back.
  async fn restart(&self) -> Result<(), DeviceError>;

  /// Download `source_url` onto the device at `dest_path`.
  async fn copy_data(&self, source_url: &str, dest_path: &str) -> Result<(), DeviceError>;

  /// Stream `source_url` into `pipe_command` running on the device.
  async fn pipe_data(&self, source_url: &str, pipe_command: &str) -> Result<(), DeviceError>;

  async fn create_directories(&self, paths: &[&str]) -> Result<(), DeviceError> {
    let mut args = vec!["-p"];
    args.extend_from_slice(paths);
    self.run_cmd("mkdir", &args).await.map(|_| ())
  }

  async fn delete_directory(&self, path: &str) -> Result<(), DeviceError> {
    self.run_cmd("rm", &["-rf", path]).await.map(|_| ())
  }

  async fn path_exists(&self, path: &str) -> Result<bool, DeviceError> {
    let out = self
      .run_cmd("", &["[", "-e", path, "]", "&&", "echo", "-n", "1", "||", "echo", "-n", "0"])
      .await?;
    Ok(out == "1")
  }
}

/// Join a command and its arguments the way the remote shell will see them.
pub fn command_line(cmd: &str, args: &[&str]) -> String {
  std::iter::once(cmd)
    .chain(args.iter().copied())
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
}
