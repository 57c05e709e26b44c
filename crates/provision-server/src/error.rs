use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provision_lro::LroError;
use provision_service::ServiceError;
use serde::{Deserialize, Serialize};

/// Errors a handler turns into an HTTP response.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  /// The body could not be read as the expected JSON document.
  #[error("malformed request body: {message}")]
  MalformedBody { message: String },

  #[error("{source}")]
  Service {
    #[from]
    source: ServiceError,
  },

  #[error("{source}")]
  Operation {
    #[from]
    source: LroError,
  },
}

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
  pub code: String,
}

impl ApiError {
  fn status(&self) -> (StatusCode, &'static str) {
    match self {
      ApiError::MalformedBody { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
      ApiError::Service {
        source: ServiceError::InvalidRequest { .. },
      } => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
      ApiError::Service {
        source: ServiceError::Operation { source },
      }
      | ApiError::Operation { source } => lro_status(source),
    }
  }
}

fn lro_status(err: &LroError) -> (StatusCode, &'static str) {
  match err {
    LroError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
    LroError::AlreadyExists { .. } => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
    LroError::AlreadyDone { .. } => (StatusCode::CONFLICT, "FAILED_PRECONDITION"),
    LroError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, code) = self.status();
    let body = ErrorResponse {
      error: self.to_string(),
      code: code.to_string(),
    };
    (status, Json(body)).into_response()
  }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lro_errors_map_to_status_codes() {
    let not_found = ApiError::from(LroError::NotFound {
      name: "operations/x".to_string(),
    });
    assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

    let closed = ApiError::from(ServiceError::from(LroError::Closed));
    assert_eq!(closed.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
  }

  #[test]
  fn test_malformed_body_is_bad_request() {
    let err = ApiError::MalformedBody {
      message: "expected value".to_string(),
    };
    assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
  }
}
