//! In-memory operation registry.
//!
//! All state lives behind one `std::sync::Mutex` that is never held across
//! an `.await`. Each operation owns a `watch` channel used as its one-shot
//! completion signal: waiters subscribe under the lock, then await outside of
//! it. Removing an entry drops the sender, which wakes every waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LroError;
use crate::operation::{OPERATION_PREFIX, Operation, OperationResult, OperationStatus};

/// Configuration for the background expiry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
  /// How often finished operations are swept.
  pub sweep_interval: Duration,
  /// How long a finished operation stays retrievable.
  pub expiry: Duration,
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      sweep_interval: Duration::from_secs(60 * 60),
      expiry: Duration::from_secs(30 * 24 * 60 * 60),
    }
  }
}

struct Entry {
  op: Operation,
  done: watch::Sender<bool>,
}

#[derive(Default)]
struct Registry {
  operations: HashMap<String, Entry>,
  closed: bool,
}

struct Inner {
  registry: Mutex<Registry>,
  expiry: chrono::Duration,
  sweep_cancel: CancellationToken,
}

impl Drop for Inner {
  fn drop(&mut self) {
    self.sweep_cancel.cancel();
  }
}

/// Tracks long-running operations.
///
/// Cheap to clone; clones share the same registry. Must be created inside a
/// tokio runtime since it spawns the expiry sweep.
#[derive(Clone)]
pub struct OperationManager {
  inner: Arc<Inner>,
}

impl OperationManager {
  pub fn new(config: ManagerConfig) -> Self {
    let expiry = chrono::Duration::from_std(config.expiry).unwrap_or(chrono::Duration::MAX);
    let inner = Arc::new(Inner {
      registry: Mutex::new(Registry::default()),
      expiry,
      sweep_cancel: CancellationToken::new(),
    });

    tokio::spawn(sweep_loop(
      Arc::downgrade(&inner),
      config.sweep_interval,
      inner.sweep_cancel.clone(),
    ));

    Self { inner }
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    self
      .inner
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a new pending operation under a fresh name.
  pub fn new_operation(&self) -> Result<Operation, LroError> {
    self.create(format!("{}{}", OPERATION_PREFIX, Uuid::new_v4()))
  }

  fn create(&self, name: String) -> Result<Operation, LroError> {
    let mut registry = self.registry();
    if registry.closed {
      return Err(LroError::Closed);
    }
    if registry.operations.contains_key(&name) {
      return Err(LroError::AlreadyExists { name });
    }

    let op = Operation::pending(name.clone());
    let (done, _) = watch::channel(false);
    registry.operations.insert(
      name.clone(),
      Entry {
        op: op.clone(),
        done,
      },
    );
    debug!(operation = %name, "operation_created");
    Ok(op)
  }

  /// Complete an operation with a response.
  pub fn set_result(&self, name: &str, response: serde_json::Value) -> Result<(), LroError> {
    self.finish(name, OperationResult::Response(response))
  }

  /// Complete an operation with an error.
  pub fn set_error(&self, name: &str, status: OperationStatus) -> Result<(), LroError> {
    self.finish(name, OperationResult::Error(status))
  }

  fn finish(&self, name: &str, result: OperationResult) -> Result<(), LroError> {
    let mut registry = self.registry();
    if registry.closed {
      return Err(LroError::Closed);
    }
    let entry = registry
      .operations
      .get_mut(name)
      .ok_or_else(|| LroError::NotFound {
        name: name.to_string(),
      })?;
    if entry.op.done {
      return Err(LroError::AlreadyDone {
        name: name.to_string(),
      });
    }

    let failed = matches!(result, OperationResult::Error(_));
    entry.op.result = Some(result);
    entry.op.finish_time = Some(Utc::now());
    entry.op.done = true;
    entry.done.send_replace(true);

    info!(operation = %name, failed, "operation_done");
    Ok(())
  }

  /// Replace the progress metadata of a pending operation.
  pub fn update_metadata(&self, name: &str, metadata: serde_json::Value) -> Result<(), LroError> {
    let mut registry = self.registry();
    if registry.closed {
      return Err(LroError::Closed);
    }
    let entry = registry
      .operations
      .get_mut(name)
      .ok_or_else(|| LroError::NotFound {
        name: name.to_string(),
      })?;
    if entry.op.done {
      return Err(LroError::AlreadyDone {
        name: name.to_string(),
      });
    }
    entry.op.metadata = Some(metadata);
    Ok(())
  }

  /// Snapshot of an operation.
  pub fn get_operation(&self, name: &str) -> Result<Operation, LroError> {
    let registry = self.registry();
    if registry.closed {
      return Err(LroError::Closed);
    }
    registry
      .operations
      .get(name)
      .map(|entry| entry.op.clone())
      .ok_or_else(|| LroError::NotFound {
        name: name.to_string(),
      })
  }

  /// Wait until the operation is done or `timeout` elapses.
  ///
  /// `None` or a zero timeout waits indefinitely. On timeout the current,
  /// possibly still pending, snapshot is returned. Dropping the returned
  /// future abandons the wait.
  pub async fn wait_operation(
    &self,
    name: &str,
    timeout: Option<Duration>,
  ) -> Result<Operation, LroError> {
    let mut done = {
      let registry = self.registry();
      if registry.closed {
        return Err(LroError::Closed);
      }
      let entry = registry
        .operations
        .get(name)
        .ok_or_else(|| LroError::NotFound {
          name: name.to_string(),
        })?;
      if entry.op.done {
        return Ok(entry.op.clone());
      }
      entry.done.subscribe()
    };

    // Err means the entry was removed; the snapshot below reports it.
    let signalled = done.wait_for(|done| *done);
    match timeout.filter(|t| !t.is_zero()) {
      Some(timeout) => {
        if tokio::time::timeout(timeout, signalled).await.is_err() {
          debug!(operation = %name, timeout_ms = timeout.as_millis() as u64, "wait_timed_out");
        }
      }
      None => {
        let _ = signalled.await;
      }
    }

    self.get_operation(name)
  }

  /// Remove an operation whether or not it is done.
  ///
  /// Pending waiters wake up and observe `NotFound`.
  pub fn delete_operation(&self, name: &str) -> Result<(), LroError> {
    let mut registry = self.registry();
    if registry.closed {
      return Err(LroError::Closed);
    }
    let entry = registry
      .operations
      .remove(name)
      .ok_or_else(|| LroError::NotFound {
        name: name.to_string(),
      })?;
    info!(operation = %name, done = entry.op.done, "operation_deleted");
    Ok(())
  }

  /// Remove done operations that finished longer ago than the expiry.
  ///
  /// Returns how many were removed. Pending operations are never removed.
  pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
    let Some(cutoff) = now.checked_sub_signed(self.inner.expiry) else {
      return 0;
    };
    let mut registry = self.registry();
    let before = registry.operations.len();
    registry.operations.retain(|_, entry| match entry.op.finish_time {
      Some(finished) if entry.op.done => finished >= cutoff,
      _ => true,
    });
    before - registry.operations.len()
  }

  /// Number of tracked operations.
  pub fn len(&self) -> usize {
    self.registry().operations.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Stop the expiry sweep and refuse further calls.
  ///
  /// Pending waiters wake up and observe `Closed`. Calling `close` again is a
  /// no-op.
  pub fn close(&self) {
    self.inner.sweep_cancel.cancel();
    let mut registry = self.registry();
    if registry.closed {
      return;
    }
    registry.closed = true;
    let dropped = registry.operations.len();
    registry.operations.clear();
    info!(dropped, "operation_manager_closed");
  }
}

async fn sweep_loop(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = tokio::time::sleep(interval) => {}
    }

    let Some(inner) = inner.upgrade() else {
      break;
    };
    let manager = OperationManager { inner };
    let removed = manager.sweep_expired_at(Utc::now());
    if removed > 0 {
      info!(removed, "expired_operations_swept");
    }
  }
  debug!("operation sweep stopped");
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_duplicate_name_is_rejected() {
    let manager = OperationManager::new(ManagerConfig::default());
    manager.create("operations/fixed".to_string()).unwrap();

    let err = manager.create("operations/fixed".to_string()).unwrap_err();
    assert_eq!(
      err,
      LroError::AlreadyExists {
        name: "operations/fixed".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_sweep_keeps_operations_within_expiry() {
    let manager = OperationManager::new(ManagerConfig::default());
    let op = manager.new_operation().unwrap();
    manager.set_result(&op.name, json!({})).unwrap();

    let finished = manager.get_operation(&op.name).unwrap().finish_time.unwrap();
    assert_eq!(manager.sweep_expired_at(finished + chrono::Duration::days(30)), 0);
    assert_eq!(manager.len(), 1);
  }

  #[tokio::test]
  async fn test_close_is_idempotent() {
    let manager = OperationManager::new(ManagerConfig::default());
    manager.new_operation().unwrap();
    manager.close();
    manager.close();

    assert!(manager.is_empty());
    assert_eq!(manager.new_operation().unwrap_err(), LroError::Closed);
  }

  #[tokio::test]
  async fn test_dropping_last_handle_stops_sweep() {
    let manager = OperationManager::new(ManagerConfig::default());
    let cancel = manager.inner.sweep_cancel.clone();
    drop(manager);
    assert!(cancel.is_cancelled());
  }
}
