//! CrOS install flow.
//!
//! ```text
//! Init → Install → PostInstall → UpdateFirmware → Verify
//! ```
//!
//! The new OS is written to the inactive kernel/root pair, so a failure
//! before the reboot leaves the running system bootable.

mod commands;

use std::sync::Arc;

use provision_state_machine::{Command, State};
use serde::Serialize;
use serde_json::json;

use crate::context::FlowContext;
use crate::request::CrosTarget;

use commands::*;

pub(crate) const PROVISION_MARKER: &str = "/var/tmp/provision_failed";
pub(crate) const STATEFUL_PATH: &str = "/mnt/stateful_partition";
pub(crate) const UPDATE_STATEFUL_FILE: &str = "/mnt/stateful_partition/.update_available";
pub(crate) const FACTORY_RESET_FILE: &str = "/mnt/stateful_partition/factory_install_reset";
pub(crate) const DLC_CACHE_DIR: &str = "/var/cache/dlc";
pub(crate) const DLC_LIB_DIR: &str = "/var/lib/dlcservice/dlc";
pub(crate) const FIRMWARE_UPDATER: &str = "/usr/sbin/chromeos-firmwareupdate";

const ROOT_A: &str = "3";
const ROOT_B: &str = "5";
const KERNEL_A: &str = "2";
const KERNEL_B: &str = "4";

/// Active and inactive kernel/root partitions of the boot disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
  pub disk: String,
  pub active_root: String,
  pub active_kernel: String,
  pub inactive_root: String,
  pub inactive_kernel: String,
  /// Partition number of the active root, "3" or "5".
  pub active_root_num: String,
}

impl PartitionInfo {
  /// Derive the layout from `rootdev -s` and `rootdev -s -d` output, e.g.
  /// `/dev/nvme0n1p3` and `/dev/nvme0n1`.
  pub fn from_root(root: &str, disk: &str) -> Result<Self, String> {
    let root = root.trim();
    let prefix = root.trim_end_matches(|c: char| c.is_ascii_digit());
    let num = &root[prefix.len()..];

    let (active_kernel, inactive_kernel, inactive_root) = match num {
      ROOT_A => (KERNEL_A, KERNEL_B, ROOT_B),
      ROOT_B => (KERNEL_B, KERNEL_A, ROOT_A),
      "" => return Err(format!("failed to match partition number from '{}'", root)),
      other => return Err(format!("invalid root partition number {}", other)),
    };

    Ok(Self {
      disk: disk.trim().to_string(),
      active_root: root.to_string(),
      active_kernel: format!("{}{}", prefix, active_kernel),
      inactive_root: format!("{}{}", prefix, inactive_root),
      inactive_kernel: format!("{}{}", prefix, inactive_kernel),
      active_root_num: num.to_string(),
    })
  }

  /// DLC slot belonging to the running root.
  pub fn active_dlc_slot(&self) -> &'static str {
    if self.active_root_num == ROOT_A { "dlc_a" } else { "dlc_b" }
  }

  /// DLC slot belonging to the root being installed.
  pub fn inactive_dlc_slot(&self) -> &'static str {
    if self.active_root_num == ROOT_A { "dlc_b" } else { "dlc_a" }
  }
}

/// Shared by every state of one CrOS flow.
#[derive(Clone)]
struct CrosFlow {
  ctx: Arc<FlowContext>,
  target: Arc<CrosTarget>,
}

/// First state of the CrOS flow.
pub fn initial_state(ctx: Arc<FlowContext>, target: CrosTarget) -> Box<dyn State> {
  Box::new(InitState {
    flow: CrosFlow {
      ctx,
      target: Arc::new(target),
    },
  })
}

struct InitState {
  flow: CrosFlow,
}

impl State for InitState {
  fn name(&self) -> &str {
    "CrOS Init"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(CheckReachable { ctx: ctx.clone() }),
      Box::new(CreateProvisionMarker { ctx: ctx.clone() }),
      Box::new(StopSystemDaemons { ctx: ctx.clone() }),
      Box::new(DetectPartitions { ctx: ctx.clone() }),
    ]
  }

  fn metadata(&self) -> Option<serde_json::Value> {
    let partitions = self.flow.ctx.facts().partitions.clone()?;
    Some(json!({ "partitions": partitions }))
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(InstallState {
      flow: self.flow.clone(),
    }))
  }
}

struct InstallState {
  flow: CrosFlow,
}

impl State for InstallState {
  fn name(&self) -> &str {
    "CrOS Install"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let CrosFlow { ctx, target } = &self.flow;
    let mut commands: Vec<Box<dyn Command>> = vec![
      Box::new(InstallPartitions {
        ctx: ctx.clone(),
        image_path: target.image_path.clone(),
      }),
      Box::new(ClearInactiveDlcVerified { ctx: ctx.clone() }),
      Box::new(InstallStateful {
        ctx: ctx.clone(),
        image_path: target.image_path.clone(),
      }),
    ];
    if !target.preserve_stateful {
      commands.push(Box::new(WipeStateful { ctx: ctx.clone() }));
    }
    if let Some(payload) = &target.overwrite_payload {
      commands.push(Box::new(OverwriteInstall {
        ctx: ctx.clone(),
        payload: payload.clone(),
      }));
    }
    commands
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(PostInstallState {
      flow: self.flow.clone(),
    }))
  }
}

struct PostInstallState {
  flow: CrosFlow,
}

impl State for PostInstallState {
  fn name(&self) -> &str {
    "CrOS Post Install"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let ctx = &self.flow.ctx;
    vec![
      Box::new(RunPostInstall { ctx: ctx.clone() }),
      Box::new(ClearTpm { ctx: ctx.clone() }),
      Box::new(Reboot { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(UpdateFirmwareState {
      flow: self.flow.clone(),
    }))
  }
}

struct UpdateFirmwareState {
  flow: CrosFlow,
}

impl State for UpdateFirmwareState {
  fn name(&self) -> &str {
    "CrOS Update Firmware"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    if !self.flow.target.update_firmware {
      return Vec::new();
    }
    let ctx = &self.flow.ctx;
    vec![
      Box::new(CheckFirmwareUpdater { ctx: ctx.clone() }),
      Box::new(WaitForStabilize { ctx: ctx.clone() }),
      Box::new(RunFirmwareUpdater { ctx: ctx.clone() }),
      Box::new(RebootOnFirmwareSlotChange { ctx: ctx.clone() }),
    ]
  }

  fn next(&self) -> Option<Box<dyn State>> {
    Some(Box::new(VerifyState {
      flow: self.flow.clone(),
    }))
  }
}

struct VerifyState {
  flow: CrosFlow,
}

impl State for VerifyState {
  fn name(&self) -> &str {
    "CrOS Verify"
  }

  fn commands(&self) -> Vec<Box<dyn Command>> {
    let CrosFlow { ctx, target } = &self.flow;
    let mut commands: Vec<Box<dyn Command>> = Vec::new();
    if !target.dlcs.is_empty() {
      commands.push(Box::new(InstallDlcs {
        ctx: ctx.clone(),
        image_path: target.image_path.clone(),
        dlcs: target.dlcs.clone(),
      }));
    }
    commands.push(Box::new(RemoveProvisionMarker { ctx: ctx.clone() }));
    commands
  }

  fn metadata(&self) -> Option<serde_json::Value> {
    Some(json!({
      "image_path": self.flow.target.image_path,
      "dlcs": self.flow.target.dlcs,
    }))
  }

  fn next(&self) -> Option<Box<dyn State>> {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_info_root_a() {
    let info = PartitionInfo::from_root("/dev/nvme0n1p3\n", "/dev/nvme0n1\n").unwrap();
    assert_eq!(info.disk, "/dev/nvme0n1");
    assert_eq!(info.active_kernel, "/dev/nvme0n1p2");
    assert_eq!(info.inactive_kernel, "/dev/nvme0n1p4");
    assert_eq!(info.inactive_root, "/dev/nvme0n1p5");
    assert_eq!(info.active_dlc_slot(), "dlc_a");
    assert_eq!(info.inactive_dlc_slot(), "dlc_b");
  }

  #[test]
  fn test_partition_info_root_b() {
    let info = PartitionInfo::from_root("/dev/sda5", "/dev/sda").unwrap();
    assert_eq!(info.active_kernel, "/dev/sda4");
    assert_eq!(info.inactive_kernel, "/dev/sda2");
    assert_eq!(info.inactive_root, "/dev/sda3");
    assert_eq!(info.inactive_dlc_slot(), "dlc_a");
  }

  #[test]
  fn test_partition_info_rejects_other_partitions() {
    assert!(PartitionInfo::from_root("/dev/sda1", "/dev/sda").is_err());
    assert!(PartitionInfo::from_root("/dev/sda", "/dev/sda").is_err());
  }
}
