//! Publishes executor progress into the pending operation's metadata.

use std::sync::atomic::{AtomicUsize, Ordering};

use provision_lro::{LroError, OperationManager};
use provision_state_machine::{ExecutionEvent, ExecutionNotifier};
use serde_json::json;
use tracing::{debug, warn};

pub(crate) struct OperationProgress {
  operations: OperationManager,
  name: String,
  states_completed: AtomicUsize,
}

impl OperationProgress {
  pub(crate) fn new(operations: OperationManager, name: String) -> Self {
    Self {
      operations,
      name,
      states_completed: AtomicUsize::new(0),
    }
  }

  fn publish(&self, state: &str, command: Option<&str>) {
    let metadata = json!({
      "state": state,
      "command": command,
      "states_completed": self.states_completed.load(Ordering::Relaxed),
    });
    match self.operations.update_metadata(&self.name, metadata) {
      Ok(()) => {}
      // Deleted or already finished: nobody is looking at progress anymore.
      Err(LroError::NotFound { .. } | LroError::AlreadyDone { .. }) => {
        debug!(operation = %self.name, "progress dropped");
      }
      Err(e) => warn!(operation = %self.name, error = %e, "failed to publish progress"),
    }
  }
}

impl ExecutionNotifier for OperationProgress {
  fn notify(&self, event: ExecutionEvent) {
    match event {
      ExecutionEvent::StateStarted { state, .. } => self.publish(&state, None),
      ExecutionEvent::CommandStarted { state, command, .. } => self.publish(&state, Some(&command)),
      ExecutionEvent::StateCompleted { .. } => {
        self.states_completed.fetch_add(1, Ordering::Relaxed);
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use provision_lro::ManagerConfig;

  #[tokio::test]
  async fn test_progress_tracks_current_command() {
    let operations = OperationManager::new(ManagerConfig::default());
    let op = operations.new_operation().unwrap();
    let progress = OperationProgress::new(operations.clone(), op.name.clone());

    progress.notify(ExecutionEvent::StateStarted {
      flow_id: op.name.clone(),
      state: "CrOS Init".to_string(),
    });
    progress.notify(ExecutionEvent::StateCompleted {
      flow_id: op.name.clone(),
      state: "CrOS Init".to_string(),
    });
    progress.notify(ExecutionEvent::CommandStarted {
      flow_id: op.name.clone(),
      state: "CrOS Install".to_string(),
      command: "install_partitions".to_string(),
    });

    let metadata = operations.get_operation(&op.name).unwrap().metadata.unwrap();
    assert_eq!(
      metadata,
      json!({"state": "CrOS Install", "command": "install_partitions", "states_completed": 1})
    );
  }

  #[tokio::test]
  async fn test_progress_after_completion_is_ignored() {
    let operations = OperationManager::new(ManagerConfig::default());
    let op = operations.new_operation().unwrap();
    operations.set_result(&op.name, json!({})).unwrap();

    let progress = OperationProgress::new(operations.clone(), op.name.clone());
    progress.notify(ExecutionEvent::StateStarted {
      flow_id: op.name.clone(),
      state: "CrOS Verify".to_string(),
    });

    assert!(operations.get_operation(&op.name).unwrap().metadata.is_none());
  }
}
