/// Error type for operation registry calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LroError {
  #[error("operation '{name}' not found")]
  NotFound { name: String },

  #[error("operation '{name}' already exists")]
  AlreadyExists { name: String },

  #[error("operation '{name}' is already done")]
  AlreadyDone { name: String },

  /// The manager was closed.
  #[error("operation manager is closed")]
  Closed,
}
