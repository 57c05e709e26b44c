//! Route handlers.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use provision_flows::InstallRequest;
use provision_lro::{OPERATION_PREFIX, Operation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WaitRequest {
  /// Zero or absent waits until the operation is done.
  #[serde(default)]
  pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
  pub status: String,
}

fn operation_name(id: &str) -> String {
  format!("{OPERATION_PREFIX}{id}")
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
  payload
    .map(|Json(value)| value)
    .map_err(|rejection| ApiError::MalformedBody {
      message: rejection.body_text(),
    })
}

pub async fn install(
  State(state): State<AppState>,
  payload: Result<Json<InstallRequest>, JsonRejection>,
) -> ApiResult<Json<Operation>> {
  let request = body(payload)?;
  let op = state.service.install(request)?;
  Ok(Json(op))
}

pub async fn get_operation(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
  let op = state.service.operations().get_operation(&operation_name(&id))?;
  Ok(Json(op))
}

pub async fn delete_operation(
  State(state): State<AppState>,
  Path(id): Path<String>,
) -> ApiResult<StatusCode> {
  state
    .service
    .operations()
    .delete_operation(&operation_name(&id))?;
  Ok(StatusCode::NO_CONTENT)
}

/// An empty body waits until the operation is done.
pub async fn wait_operation(
  State(state): State<AppState>,
  Path(id): Path<String>,
  payload: Bytes,
) -> ApiResult<Json<Operation>> {
  let wait = if payload.iter().all(u8::is_ascii_whitespace) {
    WaitRequest::default()
  } else {
    serde_json::from_slice(&payload).map_err(|e| ApiError::MalformedBody {
      message: e.to_string(),
    })?
  };
  let timeout = wait.timeout_ms.map(Duration::from_millis);
  debug!(operation = %id, timeout_ms = ?wait.timeout_ms, "wait_requested");
  let op = state
    .service
    .operations()
    .wait_operation(&operation_name(&id), timeout)
    .await?;
  Ok(Json(op))
}

pub async fn health() -> Json<HealthResponse> {
  Json(HealthResponse {
    status: "ok".to_string(),
  })
}
