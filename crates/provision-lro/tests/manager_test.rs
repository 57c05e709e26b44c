use std::collections::HashSet;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use provision_lro::{Code, LroError, ManagerConfig, OperationManager, OperationStatus};
use serde_json::json;

fn manager() -> OperationManager {
  OperationManager::new(ManagerConfig::default())
}

#[tokio::test]
async fn test_new_operation_is_pending_with_unique_name() {
  let manager = manager();
  let a = manager.new_operation().unwrap();
  let b = manager.new_operation().unwrap();

  assert!(a.name.starts_with("operations/"));
  assert_ne!(a.name, b.name);
  assert!(!a.done);
  assert!(a.result.is_none());
  assert!(a.finish_time.is_none());
}

#[tokio::test]
async fn test_second_completion_is_rejected_and_result_kept() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  manager.set_result(&op.name, json!({"status": "OK"})).unwrap();
  let first = manager.get_operation(&op.name).unwrap();

  let err = manager
    .set_error(&op.name, OperationStatus::new(Code::Aborted, "late"))
    .unwrap_err();
  assert_eq!(err, LroError::AlreadyDone { name: op.name.clone() });

  let err = manager.set_result(&op.name, json!({})).unwrap_err();
  assert!(matches!(err, LroError::AlreadyDone { .. }));

  assert_eq!(manager.get_operation(&op.name).unwrap(), first);
  assert_eq!(first.response(), Some(&json!({"status": "OK"})));
  assert!(first.done);
  assert!(first.finish_time.is_some());
}

#[tokio::test]
async fn test_unknown_name_is_not_found() {
  let manager = manager();
  let name = "operations/missing";

  assert!(matches!(manager.get_operation(name), Err(LroError::NotFound { .. })));
  assert!(matches!(manager.set_result(name, json!({})), Err(LroError::NotFound { .. })));
  assert!(matches!(
    manager.set_error(name, OperationStatus::new(Code::Aborted, "x")),
    Err(LroError::NotFound { .. })
  ));
  assert!(matches!(manager.delete_operation(name), Err(LroError::NotFound { .. })));
  assert!(matches!(
    manager.wait_operation(name, None).await,
    Err(LroError::NotFound { .. })
  ));
}

#[tokio::test]
async fn test_get_is_idempotent() {
  let manager = manager();
  let op = manager.new_operation().unwrap();
  assert_eq!(
    manager.get_operation(&op.name).unwrap(),
    manager.get_operation(&op.name).unwrap()
  );

  manager
    .set_error(&op.name, OperationStatus::new(Code::Aborted, "boom"))
    .unwrap();
  let first = manager.get_operation(&op.name).unwrap();
  let second = manager.get_operation(&op.name).unwrap();
  assert_eq!(first, second);
  assert_eq!(first.error().map(|e| e.message.as_str()), Some("boom"));
}

#[tokio::test]
async fn test_wait_without_timeout_returns_on_completion() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  let waiter = {
    let manager = manager.clone();
    let name = op.name.clone();
    tokio::spawn(async move { manager.wait_operation(&name, None).await })
  };

  tokio::time::sleep(Duration::from_millis(20)).await;
  manager.set_result(&op.name, json!({"ok": true})).unwrap();

  let done = waiter.await.unwrap().unwrap();
  assert!(done.done);
  assert_eq!(done.response(), Some(&json!({"ok": true})));
}

#[tokio::test]
async fn test_zero_timeout_waits_for_completion() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  let waiter = {
    let manager = manager.clone();
    let name = op.name.clone();
    tokio::spawn(async move { manager.wait_operation(&name, Some(Duration::ZERO)).await })
  };

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(!waiter.is_finished());
  manager.set_result(&op.name, json!({})).unwrap();

  assert!(waiter.await.unwrap().unwrap().done);
}

#[tokio::test]
async fn test_wait_timeout_returns_pending_snapshot() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  let snapshot = manager
    .wait_operation(&op.name, Some(Duration::from_millis(10)))
    .await
    .unwrap();

  assert!(!snapshot.done);
  assert_eq!(snapshot.name, op.name);
}

#[tokio::test]
async fn test_wait_on_done_operation_returns_immediately() {
  let manager = manager();
  let op = manager.new_operation().unwrap();
  manager.set_result(&op.name, json!({})).unwrap();

  let snapshot = manager.wait_operation(&op.name, None).await.unwrap();
  assert!(snapshot.done);
}

#[tokio::test]
async fn test_delete_wakes_pending_waiters() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  let waiter = {
    let manager = manager.clone();
    let name = op.name.clone();
    tokio::spawn(async move { manager.wait_operation(&name, None).await })
  };

  tokio::time::sleep(Duration::from_millis(20)).await;
  manager.delete_operation(&op.name).unwrap();

  let result = waiter.await.unwrap();
  assert!(matches!(result, Err(LroError::NotFound { .. })));
  assert!(matches!(manager.get_operation(&op.name), Err(LroError::NotFound { .. })));
}

#[tokio::test]
async fn test_expired_operations_are_swept() {
  let manager = manager();
  let done = manager.new_operation().unwrap();
  let pending = manager.new_operation().unwrap();
  manager.set_result(&done.name, json!({})).unwrap();
  let finished = manager.get_operation(&done.name).unwrap().finish_time.unwrap();

  assert_eq!(manager.sweep_expired_at(finished + ChronoDuration::days(29)), 0);
  assert!(manager.get_operation(&done.name).is_ok());

  assert_eq!(manager.sweep_expired_at(finished + ChronoDuration::days(31)), 1);
  assert!(matches!(manager.get_operation(&done.name), Err(LroError::NotFound { .. })));

  // Pending operations survive any sweep.
  assert_eq!(manager.sweep_expired_at(finished + ChronoDuration::days(3650)), 0);
  assert!(manager.get_operation(&pending.name).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_background_sweep_runs_on_interval() {
  let manager = OperationManager::new(ManagerConfig {
    sweep_interval: Duration::from_secs(60),
    expiry: Duration::ZERO,
  });
  let op = manager.new_operation().unwrap();
  manager.set_result(&op.name, json!({})).unwrap();

  // finish_time comes from the wall clock, so wait until it is strictly in
  // the past before letting the paused clock reach the next sweep.
  std::thread::sleep(Duration::from_millis(5));
  tokio::time::sleep(Duration::from_secs(61)).await;

  assert!(matches!(manager.get_operation(&op.name), Err(LroError::NotFound { .. })));
}

#[tokio::test]
async fn test_update_metadata_only_while_pending() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  manager
    .update_metadata(&op.name, json!({"state": "CrOS Install"}))
    .unwrap();
  assert_eq!(
    manager.get_operation(&op.name).unwrap().metadata,
    Some(json!({"state": "CrOS Install"}))
  );

  manager.set_result(&op.name, json!({})).unwrap();
  assert!(matches!(
    manager.update_metadata(&op.name, json!({})),
    Err(LroError::AlreadyDone { .. })
  ));
}

#[tokio::test]
async fn test_closed_manager_rejects_calls_and_wakes_waiters() {
  let manager = manager();
  let op = manager.new_operation().unwrap();

  let waiter = {
    let manager = manager.clone();
    let name = op.name.clone();
    tokio::spawn(async move { manager.wait_operation(&name, None).await })
  };
  tokio::time::sleep(Duration::from_millis(20)).await;

  manager.close();

  assert_eq!(waiter.await.unwrap().unwrap_err(), LroError::Closed);
  assert_eq!(manager.get_operation(&op.name).unwrap_err(), LroError::Closed);
  assert_eq!(manager.new_operation().unwrap_err(), LroError::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_do_not_lose_updates() {
  let manager = manager();

  let handles: Vec<_> = (0..64)
    .map(|i| {
      let manager = manager.clone();
      tokio::spawn(async move {
        let op = manager.new_operation().unwrap();
        let observer = {
          let manager = manager.clone();
          let name = op.name.clone();
          tokio::spawn(async move { manager.wait_operation(&name, None).await })
        };
        manager.get_operation(&op.name).unwrap();
        manager.set_result(&op.name, json!({ "i": i })).unwrap();
        let seen = observer.await.unwrap().unwrap();
        assert_eq!(seen.response(), Some(&json!({ "i": i })));
        if i % 2 == 0 {
          manager.delete_operation(&op.name).unwrap();
        }
        op.name
      })
    })
    .collect();

  let names: Vec<String> = futures::future::join_all(handles)
    .await
    .into_iter()
    .map(|r| r.unwrap())
    .collect();

  let unique: HashSet<_> = names.iter().collect();
  assert_eq!(unique.len(), 64);
  assert_eq!(manager.len(), 32);
  for (i, name) in names.iter().enumerate() {
    let op = manager.get_operation(name);
    if i % 2 == 0 {
      assert!(op.is_err());
    } else {
      assert_eq!(op.unwrap().response(), Some(&json!({ "i": i })));
    }
  }
}
