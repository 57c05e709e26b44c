//! In-memory device answering from scripted rules.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::DeviceError;
use crate::{DeviceAdapter, command_line};

#[derive(Debug, Clone)]
enum Reply {
  Stdout(String),
  Fail(String),
}

#[derive(Debug, Clone)]
struct Rule {
  prefix: String,
  reply: Reply,
}

/// A device that records every call and answers from prefix rules.
///
/// Each call is turned into one line:
///
/// - `run_cmd` → the joined command line, e.g. `rootdev -s`
/// - `copy_data` → `copy_data <url> <dest>`
/// - `pipe_data` → `pipe_data <url> | <command>`
/// - `restart` → `restart`
///
/// The most recently added rule whose prefix matches the line decides the
/// reply. Lines without a matching rule succeed with empty stdout.
#[derive(Debug, Default)]
pub struct ScriptedDevice {
  rules: Mutex<Vec<Rule>>,
  calls: Mutex<Vec<String>>,
}

impl ScriptedDevice {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer lines starting with `prefix` with `stdout`.
  pub fn respond(&self, prefix: impl Into<String>, stdout: impl Into<String>) -> &Self {
    self.push(prefix.into(), Reply::Stdout(stdout.into()))
  }

  /// Fail lines starting with `prefix`.
  pub fn fail(&self, prefix: impl Into<String>, message: impl Into<String>) -> &Self {
    self.push(prefix.into(), Reply::Fail(message.into()))
  }

  fn push(&self, prefix: String, reply: Reply) -> &Self {
    self
      .rules
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(Rule { prefix, reply });
    self
  }

  /// Every line seen so far, in call order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Whether any recorded line starts with `prefix`.
  pub fn was_called(&self, prefix: &str) -> bool {
    self.calls().iter().any(|line| line.starts_with(prefix))
  }

  /// Position of the first line starting with `prefix`.
  pub fn position(&self, prefix: &str) -> Option<usize> {
    self.calls().iter().position(|line| line.starts_with(prefix))
  }

  fn answer(&self, line: String) -> Result<String, DeviceError> {
    debug!(command = %line, "scripted_device_call");
    self
      .calls
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push(line.clone());

    let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
    match rules.iter().rev().find(|rule| line.starts_with(&rule.prefix)) {
      Some(Rule {
        reply: Reply::Stdout(stdout),
        ..
      }) => Ok(stdout.clone()),
      Some(Rule {
        reply: Reply::Fail(message),
        ..
      }) => Err(DeviceError::Scripted {
        command: line,
        message: message.clone(),
      }),
      None => Ok(String::new()),
    }
  }
}

#[async_trait]
impl DeviceAdapter for ScriptedDevice {
  async fn run_cmd(&self, cmd: &str, args: &[&str]) -> Result<String, DeviceError> {
    self.answer(command_line(cmd, args))
  }

  async fn restart(&self) -> Result<(), DeviceError> {
    self.answer("restart".to_string()).map(|_| ())
  }

  async fn copy_data(&self, source_url: &str, dest_path: &str) -> Result<(), DeviceError> {
    self
      .answer(format!("copy_data {} {}", source_url, dest_path))
      .map(|_| ())
  }

  async fn pipe_data(&self, source_url: &str, pipe_command: &str) -> Result<(), DeviceError> {
    self
      .answer(format!("pipe_data {} | {}", source_url, pipe_command))
      .map(|_| ())
  }
}
