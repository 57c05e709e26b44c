//! Ash (ChromeOS Chrome) deploy flow.
//!
//! ```text
//! Prepare → Install → Cleanup
//! ```
//!
//! The chrome tarball is unpacked into a staging directory and the known
//! browser files are synced over `/opt/google/chrome`. The previous install
//! is backed up first so a failed sync can be rolled back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provision_state_machine::{Command, CommandError, InstallStatus, State};
use tracing::{info, warn};

use crate::context::FlowContext;
use crate::request::AshTarget;

const STAGING_DIR: &str = "/tmp/_provisioning_service_chrome_deploy";
const BACKUP_DIR: &str = "/tmp/_provisioning_service_chrome_backup";
const CHROME_DIR: &str = "/opt/google/chrome";
const TEST_DIRS: [&str; 2] = [
  "/usr/local/autotest/deps/chrome_test/test_src/out/Release",
  "/usr/local/libexec/chrome-binary-tests",
];

const KILL_ATTEMPTS: u32 = 10;
const KILL_INTERVAL: Duration = Duration::from_secs(1);

/// Browser files synced from the staging directory. Entries ending in `/`
/// are directories and land in a directory of the same name.
const COPY_PATHS: &[&str] = &[
  "ash_shell",
  "aura_demo",
  "chrome",
  "chrome-wrapper",
  "chrome.pak",
  "chrome_100_percent.pak",
  "chrome_200_percent.pak",
  "content_shell",
  "content_shell.pak",
  "extensions/",
  "lib/*.so",
  "libffmpegsumo.so",
  "libpdf.so",
  "libppGoogleNaClPluginChrome.so",
  "libosmesa.so",
  "libwidevinecdmadapter.so",
  "libwidevinecdm.so",
  "locales/",
  "nacl_helper_bootstrap",
  "nacl_irt_*.nexe",
  "nacl_helper",
  "resources/",
  "resources.pak",
  "xdg-settings",
  "*.png",
];

const TEST_PATHS: &[&str] = &["*test", "*tests"];

#[derive(Clone)]
struct AshFlow {
  ctx: Arc<FlowContext>,
  target: Arc<AshTarget>,
}

/// First state of the Ash flow.
pub fn initial_state(ctx: Arc<FlowContext>, target: AshTarget) -> Box<dyn State> {
  Box::new(PrepareState {
    flow: AshFlow {
      ctx,
      target: Arc::new(target),
    },
  })
}

struct PrepareState {
  flow: AshFlow,
}

impl State for PrepareState {
  fn name(&self) -> &str {
    "Ash Prepare"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(StopUi { ctx: ctx.clone() }),
      Box::new(KillChrome { ctx: ctx.clone() }),
      Box::new(RemountRootfs { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(InstallState {
      flow: self.flow.clone(),
    }))
  }
}

struct InstallState {
  flow: AshFlow,
}

impl State for InstallState {
  fn name(&self) -> &str {
    "Ash Install"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(StageTarball {
        ctx: ctx.clone(),
        image_path: self.flow.target.image_path.clone(),
      }),
      Box::new(BackupChrome { ctx: ctx.clone() }),
      Box::new(SyncChrome { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(CleanupState {
      flow: self.flow.clone(),
    }))
  }
}

struct CleanupState {
  flow: AshFlow,
}

impl State for CleanupState {
  fn name(&self) -> &str {
    "Ash Cleanup"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(RestartUi { ctx: ctx.clone() }),
      Box::new(RemoveStaging { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    None
  }
}

struct StopUi {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for StopUi {
  fn name(&self) -> &str {
    "stop_ui"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self.ctx.run("stop", &["ui"]).await.map(|_| ())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    self.ctx.run("start", &["ui"]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to stop ui"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

/// Kill chrome until nothing holds the binary open, for a bounded time.
struct KillChrome {
  ctx: Arc<FlowContext>,
}

impl KillChrome {
  /// `lsof` prints the holders and exits 0 while the binary is in use.
  async fn chrome_in_use(&self) -> Result<bool, CommandError> {
    let binary = format!("{}/chrome", CHROME_DIR);
    match self.ctx.run("lsof", &[&binary]).await {
      Ok(out) => Ok(!out.trim().is_empty()),
      Err(CommandError::Cancelled) => Err(CommandError::Cancelled),
      Err(_) => Ok(false),
    }
  }
}

#[async_trait]
impl Command for KillChrome {
  fn name(&self) -> &str {
    "kill_chrome"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    for attempt in 1..=KILL_ATTEMPTS {
      if !self.chrome_in_use().await? {
        return Ok(());
      }
      info!(attempt, "chrome still in use, killing");
      if let Err(e) = self.ctx.run("pkill", &["'chrome|session_manager'"]).await {
        warn!(error = %e, "pkill failed");
      }
      tokio::select! {
        _ = self.ctx.cancel_token().cancelled() => return Err(CommandError::Cancelled),
        _ = tokio::time::sleep(KILL_INTERVAL) => {}
      }
    }
    Err(CommandError::failed("chrome is still in use"))
  }

  fn error_message(&self) -> &str {
    "failed to stop chrome"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

struct RemountRootfs {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RemountRootfs {
  fn name(&self) -> &str {
    "remount_rootfs"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    self
      .ctx
      .run("mount", &["-o", "remount,rw", "/"])
      .await
      .map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to remount root filesystem read-write"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PreProvisionSetupFailed
  }
}

/// Unpack the tarball into a fresh staging directory.
struct StageTarball {
  ctx: Arc<FlowContext>,
  image_path: String,
}

#[async_trait]
impl Command for StageTarball {
  fn name(&self) -> &str {
    "stage_tarball"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let device = self.ctx.device();
    self
      .ctx
      .call("failed to clear staging directory", device.delete_directory(STAGING_DIR))
      .await?;
    self
      .ctx
      .call(
        "failed to create staging directory",
        device.create_directories(&[STAGING_DIR]),
      )
      .await?;

    let untar = format!(
      "tar --ignore-command-error --overwrite --preserve-permissions --directory={} -xf -",
      STAGING_DIR
    );
    self
      .ctx
      .call(
        "failed to download chrome tarball",
        device.pipe_data(&self.image_path, &untar),
      )
      .await
  }

  async fn revert(&self) -> Result<(), CommandError> {
    self
      .ctx
      .call(
        "failed to remove staging directory",
        self.ctx.device().delete_directory(STAGING_DIR),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to stage chrome"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct BackupChrome {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for BackupChrome {
  fn name(&self) -> &str {
    "backup_chrome"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let mut dirs = vec![CHROME_DIR];
    dirs.extend(TEST_DIRS);
    self
      .ctx
      .call(
        "failed to create chrome directories",
        self.ctx.device().create_directories(&dirs),
      )
      .await?;

    let source = format!("{}/", CHROME_DIR);
    self
      .ctx
      .run("rsync", &["-a", "--delete", &source, BACKUP_DIR])
      .await
      .map(|_| ())
  }

  /// Put the previous install back, undoing any partial sync.
  async fn revert(&self) -> Result<(), CommandError> {
    let backup = format!("{}/", BACKUP_DIR);
    self
      .ctx
      .run("rsync", &["-a", "--delete", &backup, CHROME_DIR])
      .await?;
    self
      .ctx
      .call(
        "failed to remove chrome backup",
        self.ctx.device().delete_directory(BACKUP_DIR),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to back up chrome"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Sync every staged browser file and test binary into place. A partial
/// sync is undone by the backup's revert.
struct SyncChrome {
  ctx: Arc<FlowContext>,
}

impl SyncChrome {
  async fn sync(&self, item: &str, dest: &str) -> Result<(), CommandError> {
    let source = format!("{}/{}", STAGING_DIR, item);
    let present = self
      .ctx
      .call(
        format!("failed to check staged {}", item),
        self.ctx.device().path_exists(&source),
      )
      .await?;
    if !present {
      return Ok(());
    }
    self.ctx.run("rsync", &["-av", &source, dest]).await.map(|_| ())
  }
}

#[async_trait]
impl Command for SyncChrome {
  fn name(&self) -> &str {
    "sync_chrome"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    for item in COPY_PATHS {
      let dest = match item.strip_suffix('/') {
        Some(dir) => format!("{}/{}", CHROME_DIR, dir),
        None => CHROME_DIR.to_string(),
      };
      self.sync(item, &dest).await?;
    }
    for item in TEST_PATHS {
      for dir in TEST_DIRS {
        self.sync(item, dir).await?;
      }
    }
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to deploy chrome"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct RestartUi {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RestartUi {
  fn name(&self) -> &str {
    "restart_ui"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    // dbus-daemon caches the browser's service files.
    self.ctx.run("killall", &["-HUP", "dbus-daemon"]).await?;
    self.ctx.run("start", &["ui"]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to restart ui"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}

struct RemoveStaging {
  ctx: Arc<FlowContext>,
}

#[async_trait]
impl Command for RemoveStaging {
  fn name(&self) -> &str {
    "remove_staging"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let device = self.ctx.device();
    self
      .ctx
      .call("failed to remove staging directory", device.delete_directory(STAGING_DIR))
      .await?;
    self
      .ctx
      .call("failed to remove chrome backup", device.delete_directory(BACKUP_DIR))
      .await
  }

  fn error_message(&self) -> &str {
    "failed to clean up after chrome deploy"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}
