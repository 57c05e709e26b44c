//! Executor errors.

use crate::command::CommandError;

/// Errors that end a flow.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
  /// A command failed and every executed command of the state was reverted.
  #[error("{message}, {source}")]
  CommandFailed {
    state: String,
    command: String,
    message: String,
    #[source]
    source: CommandError,
  },

  /// A command failed and at least one revert failed as well.
  ///
  /// `revert` holds the first revert failure; the remaining commands were
  /// still reverted.
  #[error("{failure}; failure while reverting '{revert_command}': {revert}")]
  RollbackFailed {
    #[source]
    failure: Box<ExecutionError>,
    revert_command: String,
    revert: CommandError,
  },

  /// The flow's cancellation token fired before a state started.
  #[error("flow cancelled before state '{state}'")]
  Cancelled { state: String },
}

impl ExecutionError {
  /// Name of the state the flow stopped in.
  pub fn state(&self) -> &str {
    match self {
      ExecutionError::CommandFailed { state, .. } => state,
      ExecutionError::RollbackFailed { failure, .. } => failure.state(),
      ExecutionError::Cancelled { state } => state,
    }
  }
}
