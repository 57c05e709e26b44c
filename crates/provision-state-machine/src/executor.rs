//! Forward/rollback state machine executor.
//!
//! Walks a chain of states, running each state's commands in order. When a
//! command fails, the commands of the same state that already ran are
//! reverted in reverse order and the flow stops. Earlier states are never
//! rolled back and nothing is retried. A cancelled token stops the flow
//! before the next command, and the state is rolled back the same way.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::command::{Command, CommandError};
use crate::error::ExecutionError;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::state::State;
use crate::status::InstallStatus;

/// Result of a complete flow run.
#[derive(Debug)]
pub struct ExecutionResult {
  /// Metadata of the failing state, or the last metadata any state produced.
  pub metadata: Option<serde_json::Value>,
  pub status: InstallStatus,
  pub error: Option<ExecutionError>,
}

impl ExecutionResult {
  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }
}

/// Outcome of running the commands of one state.
struct StateFailure {
  status: InstallStatus,
  error: ExecutionError,
}

/// The state machine executor.
///
/// Generic over `N: ExecutionNotifier` to allow different notification
/// strategies. Use `StateMachineExecutor::new()` to discard events, or
/// `StateMachineExecutor::with_notifier()` to observe them.
pub struct StateMachineExecutor<N: ExecutionNotifier = NoopNotifier> {
  notifier: N,
}

impl StateMachineExecutor<NoopNotifier> {
  pub fn new() -> Self {
    Self::with_notifier(NoopNotifier)
  }
}

impl Default for StateMachineExecutor<NoopNotifier> {
  fn default() -> Self {
    Self::new()
  }
}

impl<N: ExecutionNotifier> StateMachineExecutor<N> {
  pub fn with_notifier(notifier: N) -> Self {
    Self { notifier }
  }

  /// Drive the chain starting at `initial` to completion.
  ///
  /// The cancellation token is checked before each state and each command.
  /// Commands that talk to the device observe it on their own.
  #[instrument(name = "state_machine_execute", skip(self, initial, cancel), fields(flow_id = %flow_id))]
  pub async fn execute(
    &self,
    flow_id: &str,
    initial: Box<dyn State>,
    cancel: &CancellationToken,
  ) -> ExecutionResult {
    info!(flow_id = %flow_id, initial_state = %initial.name(), "flow_started");
    self.notifier.notify(ExecutionEvent::FlowStarted {
      flow_id: flow_id.to_string(),
    });

    let mut metadata = None;
    let mut current = Some(initial);

    while let Some(state) = current {
      if cancel.is_cancelled() {
        warn!(flow_id = %flow_id, state = %state.name(), "flow cancelled");
        let error = ExecutionError::Cancelled {
          state: state.name().to_string(),
        };
        return self.fail(flow_id, state.metadata().or(metadata), InstallStatus::ProvisioningFailed, error);
      }

      if let Err(failure) = self.run_state(flow_id, state.as_ref(), cancel).await {
        return self.fail(flow_id, state.metadata(), failure.status, failure.error);
      }

      if let Some(produced) = state.metadata() {
        metadata = Some(produced);
      }
      current = state.next();
    }

    info!(flow_id = %flow_id, "flow_completed");
    self.notifier.notify(ExecutionEvent::FlowCompleted {
      flow_id: flow_id.to_string(),
    });

    ExecutionResult {
      metadata,
      status: InstallStatus::Ok,
      error: None,
    }
  }

  fn fail(
    &self,
    flow_id: &str,
    metadata: Option<serde_json::Value>,
    status: InstallStatus,
    error: ExecutionError,
  ) -> ExecutionResult {
    error!(flow_id = %flow_id, status = %status, error = %error, "flow_failed");
    self.notifier.notify(ExecutionEvent::FlowFailed {
      flow_id: flow_id.to_string(),
      status,
      error: error.to_string(),
    });

    ExecutionResult {
      metadata,
      status,
      error: Some(error),
    }
  }

  /// Run every command of a state, rolling the state back on failure.
  async fn run_state(
    &self,
    flow_id: &str,
    state: &dyn State,
    cancel: &CancellationToken,
  ) -> Result<(), StateFailure> {
    let state_name = state.name().to_string();
    let commands = state.commands();

    info!(flow_id = %flow_id, state = %state_name, commands = commands.len(), "state_started");
    self.notifier.notify(ExecutionEvent::StateStarted {
      flow_id: flow_id.to_string(),
      state: state_name.clone(),
    });

    for (index, command) in commands.iter().enumerate() {
      self.notifier.notify(ExecutionEvent::CommandStarted {
        flow_id: flow_id.to_string(),
        state: state_name.clone(),
        command: command.name().to_string(),
      });

      let outcome = if cancel.is_cancelled() {
        Err(CommandError::Cancelled)
      } else {
        command.execute().await
      };

      match outcome {
        Ok(()) => {
          info!(flow_id = %flow_id, state = %state_name, command = %command.name(), "command_completed");
          self.notifier.notify(ExecutionEvent::CommandCompleted {
            flow_id: flow_id.to_string(),
            state: state_name.clone(),
            command: command.name().to_string(),
          });
        }
        Err(source) => {
          error!(
            flow_id = %flow_id,
            state = %state_name,
            command = %command.name(),
            error = %source,
            "command_failed"
          );
          self.notifier.notify(ExecutionEvent::CommandFailed {
            flow_id: flow_id.to_string(),
            state: state_name.clone(),
            command: command.name().to_string(),
            error: source.to_string(),
          });

          let failure = ExecutionError::CommandFailed {
            state: state_name.clone(),
            command: command.name().to_string(),
            message: command.error_message().to_string(),
            source,
          };
          let error = match self.rollback(flow_id, &state_name, &commands[..index]).await {
            None => failure,
            Some((revert_command, revert)) => ExecutionError::RollbackFailed {
              failure: Box::new(failure),
              revert_command,
              revert,
            },
          };

          return Err(StateFailure {
            status: command.status(),
            error,
          });
        }
      }
    }

    info!(flow_id = %flow_id, state = %state_name, "state_completed");
    self.notifier.notify(ExecutionEvent::StateCompleted {
      flow_id: flow_id.to_string(),
      state: state_name,
    });

    Ok(())
  }

  /// Revert `executed` in reverse order.
  ///
  /// Every command is reverted even when an earlier revert fails; the first
  /// revert failure is returned together with the command that caused it.
  async fn rollback(
    &self,
    flow_id: &str,
    state_name: &str,
    executed: &[Box<dyn Command>],
  ) -> Option<(String, CommandError)> {
    let mut first_failure = None;

    for command in executed.iter().rev() {
      match command.revert().await {
        Ok(()) => {
          info!(flow_id = %flow_id, state = %state_name, command = %command.name(), "command_reverted");
          self.notifier.notify(ExecutionEvent::CommandReverted {
            flow_id: flow_id.to_string(),
            state: state_name.to_string(),
            command: command.name().to_string(),
          });
        }
        Err(e) => {
          warn!(
            flow_id = %flow_id,
            state = %state_name,
            command = %command.name(),
            error = %e,
            "revert_failed"
          );
          self.notifier.notify(ExecutionEvent::RevertFailed {
            flow_id: flow_id.to_string(),
            state: state_name.to_string(),
            command: command.name().to_string(),
            error: e.to_string(),
          });
          if first_failure.is_none() {
            first_failure = Some((command.name().to_string(), e));
          }
        }
      }
    }

    first_failure
  }
}
