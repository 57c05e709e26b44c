//! Operation snapshots handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix every operation name carries.
pub const OPERATION_PREFIX: &str = "operations/";

/// Canonical status codes for a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
  Cancelled,
  Unknown,
  InvalidArgument,
  DeadlineExceeded,
  NotFound,
  AlreadyExists,
  FailedPrecondition,
  Aborted,
  Unavailable,
  Internal,
}

/// Error payload of a finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
  pub code: Code,
  pub message: String,
  /// Structured details, e.g. the install status and reason.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub details: Vec<serde_json::Value>,
}

impl OperationStatus {
  pub fn new(code: Code, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      details: Vec::new(),
    }
  }

  pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
    self.details.push(detail);
    self
  }
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
  Response(serde_json::Value),
  Error(OperationStatus),
}

/// Snapshot of an operation.
///
/// Callers always receive copies; mutating one has no effect on the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<serde_json::Value>,
  pub done: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<OperationResult>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finish_time: Option<DateTime<Utc>>,
}

impl Operation {
  pub(crate) fn pending(name: String) -> Self {
    Self {
      name,
      metadata: None,
      done: false,
      result: None,
      finish_time: None,
    }
  }

  /// The part of the name after `operations/`.
  pub fn id(&self) -> &str {
    self.name.strip_prefix(OPERATION_PREFIX).unwrap_or(&self.name)
  }

  pub fn response(&self) -> Option<&serde_json::Value> {
    match &self.result {
      Some(OperationResult::Response(response)) => Some(response),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&OperationStatus> {
    match &self.result {
      Some(OperationResult::Error(status)) => Some(status),
      _ => None,
    }
  }
}
