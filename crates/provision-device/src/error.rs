use std::time::Duration;

/// Error type for device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
  /// The local transport process could not be started.
  #[error("failed to spawn '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  /// The remote command exited with a non-zero status.
  #[error("command '{command}' exited with {code:?}: {stderr}")]
  Exit {
    command: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The remote command succeeded but wrote to stderr.
  #[error("execution error running '{command}': {stderr}")]
  Stderr { command: String, stderr: String },

  #[error("{operation} timed out after {timeout:?}")]
  Timeout { operation: String, timeout: Duration },

  /// A scripted device rule rejected the call.
  #[error("scripted failure for '{command}': {message}")]
  Scripted { command: String, message: String },
}
