//! A batch of commands plus the link to the next state.

use crate::command::Command;

/// One step of a provisioning flow.
///
/// States form a singly-linked, acyclic chain that is fixed when the flow
/// starts. A state with nothing to do returns an empty command list.
pub trait State: Send + Sync {
  /// Human readable state name, e.g. "CrOS Install".
  fn name(&self) -> &str;

  /// Build the ordered command list for one run of this state.
  ///
  /// Called right before the state executes, so it may look at facts that
  /// earlier states recorded in the flow context.
  fn commands(&self) -> Vec<Box<dyn Command>>;

  /// Opaque metadata describing what this state produced.
  fn metadata(&self) -> Option<serde_json::Value> {
    None
  }

  /// The state that follows this one, `None` for the terminal state.
  fn next(&self) -> Option<Box<dyn State>>;
}
