//! LaCrOS install flow.
//!
//! ```text
//! Prepare → Install → Verify
//! ```
//!
//! The browser is installed as an imageloader component under
//! `<root>/<version>`: a squashfs image with an appended dm-verity hashtree,
//! plus the manifests imageloader needs to mount it.

use std::sync::Arc;

use async_trait::async_trait;
use provision_state_machine::{Command, CommandError, CommandResultExt, InstallStatus, State};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::context::FlowContext;
use crate::request::LacrosTarget;
use crate::templates;

pub(crate) const DEFAULT_COMPONENT_ROOT: &str = "/var/lib/imageloader/lacros";
const DEVICE_METADATA_PATH: &str = "/tmp/metadata.json";
const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Deserialize)]
struct LacrosMetadata {
  content: LacrosContent,
}

#[derive(Debug, Deserialize)]
struct LacrosContent {
  version: String,
}

#[derive(Clone)]
struct LacrosFlow {
  ctx: Arc<FlowContext>,
  target: Arc<LacrosTarget>,
}

impl LacrosFlow {
  fn source(&self, file: &str) -> String {
    format!("{}/{}", self.target.image_path.trim_end_matches('/'), file)
  }

  fn component_root(&self) -> &str {
    self
      .target
      .override_install_path
      .as_deref()
      .unwrap_or(DEFAULT_COMPONENT_ROOT)
      .trim_end_matches('/')
  }

  fn version(&self) -> Result<String, CommandError> {
    self
      .ctx
      .facts()
      .lacros_version
      .clone()
      .ok_or_else(|| CommandError::failed("LaCrOS version has not been resolved"))
  }

  /// `<root>/<version>`, valid once Prepare resolved the version.
  fn component_dir(&self) -> Result<String, CommandError> {
    Ok(format!("{}/{}", self.component_root(), self.version()?))
  }

  fn component_file(&self, name: &str) -> Result<String, CommandError> {
    Ok(format!("{}/{}", self.component_dir()?, name))
  }

  async fn write_file(&self, content: &str, path: &str) -> Result<(), CommandError> {
    let quoted = format!("'{}'", content);
    self.ctx.run("echo", &[&quoted, ">", path]).await.map(|_| ())
  }

  async fn sha256(&self, path: &str) -> Result<String, CommandError> {
    let out = self
      .ctx
      .run("sha256sum", &[path, "|", "cut", "-d' '", "-f1"])
      .await?;
    Ok(out.trim().to_string())
  }
}

/// First state of the LaCrOS flow.
pub fn initial_state(ctx: Arc<FlowContext>, target: LacrosTarget) -> Box<dyn State> {
  Box::new(PrepareState {
    flow: LacrosFlow {
      ctx,
      target: Arc::new(target),
    },
  })
}

struct PrepareState {
  flow: LacrosFlow,
}

impl State for PrepareState {
  fn name(&self) -> &str {
    "LaCrOS Prepare"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    vec![
      Box::new(ResolveVersion {
        flow: self.flow.clone(),
      }),
      Box::new(CreateComponentDir {
        flow: self.flow.clone(),
      }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(InstallState {
      flow: self.flow.clone(),
    }))
  }
}

struct InstallState {
  flow: LacrosFlow,
}

impl State for InstallState {
  fn name(&self) -> &str {
    "LaCrOS Install"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    vec![
      Box::new(CopyImage {
        flow: self.flow.clone(),
      }),
      Box::new(GenerateVerity {
        flow: self.flow.clone(),
      }),
      Box::new(WriteManifests {
        flow: self.flow.clone(),
      }),
      Box::new(PublishVersion {
        flow: self.flow.clone(),
      }),
    ]
  }

  fn metadata(&self) -> Option<serde_json::Value> {
    let version = self.flow.ctx.facts().lacros_version.clone()?;
    Some(json!({
      "version": version,
      "component_root": self.flow.component_root(),
    }))
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(VerifyState {
      flow: self.flow.clone(),
    }))
  }
}

struct VerifyState {
  flow: LacrosFlow,
}

impl State for VerifyState {
  fn name(&self) -> &str {
    "LaCrOS Verify"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    vec![Box::new(CheckImage {
      flow: self.flow.clone(),
    })]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    None
  }
}

/// Use the requested version, or read it from the image's metadata.json.
struct ResolveVersion {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for ResolveVersion {
  fn name(&self) -> &str {
    "resolve_version"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    let version = match &self.flow.target.override_version {
      Some(version) => version.clone(),
      None => {
        ctx
          .call(
            "failed to download metadata.json",
            ctx
              .device()
              .copy_data(&self.flow.source("metadata.json"), DEVICE_METADATA_PATH),
          )
          .await?;
        let raw = ctx.run("cat", &[DEVICE_METADATA_PATH]).await?;
        let metadata: LacrosMetadata =
          serde_json::from_str(&raw).command_context("failed to parse metadata.json")?;
        metadata.content.version
      }
    };

    if version.trim().is_empty() || version.contains('/') {
      return Err(CommandError::failed(format!("invalid LaCrOS version '{}'", version)));
    }
    info!(version = %version, "lacros_version_resolved");
    ctx.facts().lacros_version = Some(version);
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to resolve LaCrOS version"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DownloadFailed
  }
}

struct CreateComponentDir {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for CreateComponentDir {
  fn name(&self) -> &str {
    "create_component_dir"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let dir = self.flow.component_dir()?;
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to create component directory",
        ctx.device().create_directories(&[&dir]),
      )
      .await
  }

  async fn revert(&self) -> Result<(), CommandError> {
    let dir = self.flow.component_dir()?;
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to delete component directory",
        ctx.device().delete_directory(&dir),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to create LaCrOS component directory"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DownloadFailed
  }
}

/// Download the compressed squashfs and pad it to a whole number of pages.
struct CopyImage {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for CopyImage {
  fn name(&self) -> &str {
    "copy_image"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    let image = self.flow.component_file("image.squash")?;
    ctx
      .call(
        "failed to download LaCrOS image",
        ctx
          .device()
          .copy_data(&self.flow.source("lacros_compressed.squash"), &image),
      )
      .await?;

    let size = image_size(ctx, &image).await?;
    if size % PAGE_SIZE != 0 {
      let count = format!("count={}", PAGE_SIZE - size % PAGE_SIZE);
      let seek = format!("seek={}", size);
      let of = format!("of={}", image);
      ctx
        .run("dd", &["if=/dev/zero", "bs=1", &count, &seek, &of])
        .await?;
    }
    Ok(())
  }

  async fn revert(&self) -> Result<(), CommandError> {
    let dir = self.flow.component_dir()?;
    let ctx = &self.flow.ctx;
    ctx
      .call(
        "failed to delete component directory",
        ctx.device().delete_directory(&dir),
      )
      .await
  }

  fn error_message(&self) -> &str {
    "failed to copy LaCrOS image"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::DownloadFailed
  }
}

async fn image_size(ctx: &FlowContext, image: &str) -> Result<u64, CommandError> {
  let raw = ctx.run("stat", &["-c%s", image]).await?;
  raw
    .trim()
    .parse::<u64>()
    .command_context(format!("failed to parse size of {}", image))
}

/// Build the dm-verity hashtree and table, then append the hashtree to the
/// image.
struct GenerateVerity {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for GenerateVerity {
  fn name(&self) -> &str {
    "generate_verity"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let ctx = &self.flow.ctx;
    let image = self.flow.component_file("image.squash")?;
    let hashtree = self.flow.component_file("hashtree")?;
    let table = self.flow.component_file("table")?;

    let blocks = image_size(ctx, &image).await? / PAGE_SIZE;
    let payload = format!("payload={}", image);
    let payload_blocks = format!("payload_blocks={}", blocks);
    let hashtree_arg = format!("hashtree={}", hashtree);
    ctx
      .run(
        "verity",
        &[
          "mode=create",
          "alg=sha256",
          &payload,
          &payload_blocks,
          &hashtree_arg,
          "salt=random",
          ">",
          &table,
        ],
      )
      .await?;
    ctx.run("cat", &[&hashtree, ">>", &image]).await.map(|_| ())
  }

  fn error_message(&self) -> &str {
    "failed to generate verity for LaCrOS image"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct WriteManifests {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for WriteManifests {
  fn name(&self) -> &str {
    "write_manifests"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let version = self.flow.version()?;
    let image_hash = self.flow.sha256(&self.flow.component_file("image.squash")?).await?;
    let table_hash = self.flow.sha256(&self.flow.component_file("table")?).await?;

    let imageloader = templates::imageloader_manifest(&version, &image_hash, &table_hash)?;
    self
      .flow
      .write_file(&imageloader, &self.flow.component_file("imageloader.json")?)
      .await?;

    let component = templates::component_manifest(&version)?;
    self
      .flow
      .write_file(&component, &self.flow.component_file("manifest.json")?)
      .await
  }

  fn error_message(&self) -> &str {
    "failed to write LaCrOS manifests"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

/// Point imageloader at the new version. Always written under the default
/// root, which is where imageloader looks.
struct PublishVersion {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for PublishVersion {
  fn name(&self) -> &str {
    "publish_version"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let version = self.flow.version()?;
    let latest = format!("{}/latest-version", DEFAULT_COMPONENT_ROOT);
    self.flow.write_file(&version, &latest).await
  }

  fn error_message(&self) -> &str {
    "failed to publish LaCrOS version"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::ProvisioningFailed
  }
}

struct CheckImage {
  flow: LacrosFlow,
}

#[async_trait]
impl Command for CheckImage {
  fn name(&self) -> &str {
    "check_image"
  }

  async fn execute(&self) -> Result<(), CommandError> {
    let image = self.flow.component_file("image.squash")?;
    let ctx = &self.flow.ctx;
    let exists = ctx
      .call("failed to check LaCrOS image", ctx.device().path_exists(&image))
      .await?;
    if !exists {
      return Err(CommandError::failed(format!("{} is missing", image)));
    }
    Ok(())
  }

  fn error_message(&self) -> &str {
    "failed to verify LaCrOS install"
  }

  fn status(&self) -> InstallStatus {
    InstallStatus::PostProvisionSetupFailed
  }
}
