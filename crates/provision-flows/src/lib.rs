//! Provision Flows
//!
//! Concrete provisioning flows built from [`State`]s and commands:
//!
//! | Target   | States                                              |
//! |----------|-----------------------------------------------------|
//! | CrOS     | Init → Install → PostInstall → UpdateFirmware → Verify |
//! | LaCrOS   | Prepare → Install → Verify                          |
//! | Ash      | Prepare → Install → Cleanup                         |
//! | Firmware | UpdateRo → UpdateRw → PostInstall                   |
//! | Android  | Prepare → FlashOs → InstallPackages → Cleanup       |
//!
//! Every command talks to the device through the [`FlowContext`] it closes
//! over, so one flow run is bound to one device and one cancellation token.

pub mod android;
pub mod ash;
mod context;
pub mod cros;
pub mod firmware;
pub mod lacros;
mod request;
mod templates;

use std::sync::Arc;

pub use context::{DEFAULT_ROLLBACK_GRACE, Facts, FlowContext};
pub use cros::PartitionInfo;
pub use request::{
  AndroidTarget, AshTarget, CrosTarget, FirmwareTarget, InstallRequest, LacrosTarget, RequestError,
  Target, is_valid_version,
};

use provision_state_machine::State;

/// Build the initial state of the flow that installs `request`'s target.
///
/// The request is assumed to be validated.
pub fn build_flow(ctx: Arc<FlowContext>, request: &InstallRequest) -> Box<dyn State> {
  match &request.target {
    Target::Cros(target) => cros::initial_state(ctx, target.clone()),
    Target::Lacros(target) => lacros::initial_state(ctx, target.clone()),
    Target::Ash(target) => ash::initial_state(ctx, target.clone()),
    Target::Firmware(target) => firmware::initial_state(ctx, target.clone()),
    Target::Android(target) => android::initial_state(ctx, target.clone()),
  }
}
