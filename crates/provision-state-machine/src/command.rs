//! The reversible unit of work.

use async_trait::async_trait;

use crate::status::InstallStatus;

/// Errors returned by a command's `execute` or `revert`.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
  /// The command detected a failure on its own.
  #[error("{message}")]
  Failed { message: String },

  /// A collaborator (usually the device adapter) failed.
  #[error("{context}: {source}")]
  Source {
    context: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// The command observed the flow's cancellation token.
  #[error("command cancelled")]
  Cancelled,
}

impl CommandError {
  /// Create a failure without an underlying cause.
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
    }
  }

  /// Wrap an underlying error with context.
  pub fn context<E>(context: impl Into<String>, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Source {
      context: context.into(),
      source: Box::new(source),
    }
  }
}

/// Attach command context to any fallible result.
pub trait CommandResultExt<T> {
  fn command_context(self, context: impl Into<String>) -> Result<T, CommandError>;
}

impl<T, E> CommandResultExt<T> for Result<T, E>
where
  E: std::error::Error + Send + Sync + 'static,
{
  fn command_context(self, context: impl Into<String>) -> Result<T, CommandError> {
    self.map_err(|e| CommandError::context(context, e))
  }
}

/// A single reversible side effect against the device.
///
/// Commands are built fresh each time their state runs and close over the
/// flow context they need. Commands within one state run strictly in order,
/// and each may assume every earlier command of the state succeeded.
#[async_trait]
pub trait Command: Send + Sync {
  /// Short identifier used in logs and events.
  fn name(&self) -> &str;

  /// Perform the side effect.
  async fn execute(&self) -> Result<(), CommandError>;

  /// Best-effort undo of a successful `execute`.
  ///
  /// Only called after `execute` returned `Ok`. The default does nothing,
  /// which suits read-only checks.
  async fn revert(&self) -> Result<(), CommandError> {
    Ok(())
  }

  /// Human readable description of what failed, prefixed to the error.
  fn error_message(&self) -> &str;

  /// Status reported to the caller when this command fails.
  fn status(&self) -> InstallStatus;
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::error::Error;

  #[test]
  fn test_context_keeps_source() {
    let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
    let err: Result<(), _> = Err(io);
    let err = err.command_context("failed to run rootdev").unwrap_err();

    assert_eq!(err.to_string(), "failed to run rootdev: connection reset");
    assert!(err.source().is_some());
  }

  #[test]
  fn test_failed_has_no_source() {
    let err = CommandError::failed("image missing");
    assert_eq!(err.to_string(), "image missing");
    assert!(err.source().is_none());
  }
}
