use provision_flows::RequestError;
use provision_lro::LroError;

/// Errors returned synchronously by the service.
///
/// Flow failures are never returned here; they end up in the operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  /// The request was rejected before any operation was created.
  #[error("invalid request: {source}")]
  InvalidRequest {
    #[from]
    source: RequestError,
  },

  #[error("operation error: {source}")]
  Operation {
    #[from]
    source: LroError,
  },
}
