//! `ssh`-backed device adapter.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::DeviceError;
use crate::{DeviceAdapter, command_line};

const CURL: &str = "curl -S -s --fail --retry 3 --retry-delay 60";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Where and how to reach the device.
#[derive(Debug, Clone)]
pub struct SshTarget {
  pub host: String,
  pub port: u16,
  pub user: String,
  pub identity_file: Option<PathBuf>,
  pub connect_timeout: Duration,
}

/// Runs device commands through the system `ssh` client.
///
/// Every call spawns a fresh `ssh` process with `kill_on_drop`, so dropping
/// a call's future (on cancellation or timeout) tears the session down.
#[derive(Debug, Clone)]
pub struct SshDeviceAdapter {
  target: SshTarget,
  cache_server: Option<String>,
  prevent_reboot: bool,
  restart_timeout: Duration,
  poll_interval: Duration,
}

impl SshDeviceAdapter {
  pub fn new(target: SshTarget) -> Self {
    Self {
      target,
      cache_server: None,
      prevent_reboot: false,
      restart_timeout: Duration::from_secs(300),
      poll_interval: Duration::from_secs(1),
    }
  }

  /// Fetch `gs://` artifacts through a caching server.
  pub fn with_cache_server(mut self, cache_server: Option<String>) -> Self {
    self.cache_server = cache_server;
    self
  }

  /// Turn `restart` into a no-op.
  pub fn with_prevent_reboot(mut self, prevent_reboot: bool) -> Self {
    self.prevent_reboot = prevent_reboot;
    self
  }

  pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
    self.restart_timeout = timeout;
    self
  }

  fn ssh_args(&self, remote: &str) -> Vec<String> {
    let mut args = vec![
      "-o".to_string(),
      "BatchMode=yes".to_string(),
      "-o".to_string(),
      "StrictHostKeyChecking=no".to_string(),
      "-o".to_string(),
      "UserKnownHostsFile=/dev/null".to_string(),
      "-o".to_string(),
      "LogLevel=ERROR".to_string(),
      "-o".to_string(),
      format!("ConnectTimeout={}", self.target.connect_timeout.as_secs().max(1)),
      "-p".to_string(),
      self.target.port.to_string(),
    ];
    if let Some(identity) = &self.target.identity_file {
      args.push("-i".to_string());
      args.push(identity.display().to_string());
    }
    args.push(format!("{}@{}", self.target.user, self.target.host));
    args.push("--".to_string());
    args.push(remote.to_string());
    args
  }

  async fn exec(&self, remote: &str) -> Result<String, DeviceError> {
    debug!(host = %self.target.host, command = %remote, "ssh_exec");

    let output = Command::new("ssh")
      .args(self.ssh_args(remote))
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|source| DeviceError::Spawn {
        program: "ssh".to_string(),
        source,
      })?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
      return Err(DeviceError::Exit {
        command: remote.to_string(),
        code: output.status.code(),
        stderr,
      });
    }
    if !stderr.is_empty() {
      return Err(DeviceError::Stderr {
        command: remote.to_string(),
        stderr,
      });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
  }

  async fn boot_id(&self) -> Result<String, DeviceError> {
    Ok(self.run_cmd("cat", &[BOOT_ID_PATH]).await?.trim().to_string())
  }
}

#[async_trait]
impl DeviceAdapter for SshDeviceAdapter {
  async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String, DeviceError> {
    self.exec(&command_line(cmd, args)).await
  }

  #[instrument(name = "device_restart", skip(self), fields(host = %self.target.host))]
  async fn restart(&self) -> Result<(), DeviceError> {
    if self.prevent_reboot {
      info!(host = %self.target.host, "reboot_prevented");
      return Ok(());
    }

    let before = self.boot_id().await?;
    // Detach so the ssh session returns before the connection drops.
    self
      .run_cmd("", &["(sleep 1; reboot) > /dev/null 2>&1 &"])
      .await?;
    info!(host = %self.target.host, "reboot_issued");

    let wait = async {
      loop {
        tokio::time::sleep(self.poll_interval).await;
        match self.boot_id().await {
          Ok(current) if current != before => return,
          Ok(_) => debug!(host = %self.target.host, "device has not rebooted yet"),
          Err(e) => debug!(host = %self.target.host, error = %e, "device not reachable yet"),
        }
      }
    };

    match tokio::time::timeout(self.restart_timeout, wait).await {
      Ok(()) => {
        info!(host = %self.target.host, "device_back_online");
        Ok(())
      }
      Err(_) => {
        warn!(host = %self.target.host, timeout = ?self.restart_timeout, "device_restart_timed_out");
        Err(DeviceError::Timeout {
          operation: format!("restart of {}", self.target.host),
          timeout: self.restart_timeout,
        })
      }
    }
  }

  async fn copy_data(&self, source_url: &str, dest_path: &str) -> Result<(), DeviceError> {
    let url = resolve_artifact_url(source_url, self.cache_server.as_deref());
    let remote = format!(
      "mkdir -p \"$(dirname '{dest}')\" && {CURL} -o '{dest}' '{url}'",
      dest = dest_path,
      url = url,
    );
    self.exec(&remote).await.map(|_| ())
  }

  async fn pipe_data(&self, source_url: &str, pipe_command: &str) -> Result<(), DeviceError> {
    let url = resolve_artifact_url(source_url, self.cache_server.as_deref());
    let remote = format!("{CURL} '{url}' | {pipe_command}");
    self.exec(&remote).await.map(|_| ())
  }
}

/// Map an artifact URL to something `curl` on the device can fetch.
///
/// `gs://bucket/path` goes through the cache server's `/download/` endpoint
/// when one is configured, or straight to the public GCS endpoint otherwise.
/// Other URLs are returned unchanged.
pub fn resolve_artifact_url(url: &str, cache_server: Option<&str>) -> String {
  match url.strip_prefix("gs://") {
    Some(object) => match cache_server {
      Some(cache) => format!("{}/download/{}", cache.trim_end_matches('/'), object),
      None => format!("https://storage.googleapis.com/{}", object),
    },
    None => url.to_string(),
  }
}
