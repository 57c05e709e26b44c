//! Execution events and notifiers for observability.
//!
//! Events are emitted while a flow runs so consumers can observe progress,
//! publish it into an operation, stream it to a UI, etc.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::status::InstallStatus;

/// Events emitted during flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  /// The flow has started.
  FlowStarted { flow_id: String },

  /// A state is about to run its commands.
  StateStarted { flow_id: String, state: String },

  /// A command is about to execute.
  CommandStarted {
    flow_id: String,
    state: String,
    command: String,
  },

  /// A command executed successfully.
  CommandCompleted {
    flow_id: String,
    state: String,
    command: String,
  },

  /// A command failed; rollback of the state follows.
  CommandFailed {
    flow_id: String,
    state: String,
    command: String,
    error: String,
  },

  /// A command was reverted during rollback.
  CommandReverted {
    flow_id: String,
    state: String,
    command: String,
  },

  /// Reverting a command failed; rollback continued with the next one.
  RevertFailed {
    flow_id: String,
    state: String,
    command: String,
    error: String,
  },

  /// Every command of the state succeeded.
  StateCompleted { flow_id: String, state: String },

  /// The chain was exhausted.
  FlowCompleted { flow_id: String },

  /// The flow stopped with an error.
  FlowFailed {
    flow_id: String,
    status: InstallStatus,
    error: String,
  },
}

/// Trait for receiving execution events.
///
/// The executor calls `notify` for each event. Implementations decide what
/// to do with them (publish, broadcast, log, ignore, etc.).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// The executor must never block on a slow consumer, hence unbounded. Event
/// volume is a handful per command.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

impl<N: ExecutionNotifier + ?Sized> ExecutionNotifier for std::sync::Arc<N> {
  fn notify(&self, event: ExecutionEvent) {
    (**self).notify(event)
  }
}
