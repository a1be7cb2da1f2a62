use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed classification attached to every batch or command failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
  /// The pending file could not be parsed as JSON.
  InvalidJson,
  /// Valid JSON with missing or illegal fields.
  InvalidFields,
  /// No handler is registered for the command type.
  UnknownType,
  /// A user-supplied pattern failed to compile.
  InvalidPattern,
  /// The command ran past its deadline.
  Timeout,
  /// The command never ran because the batch deadline had already passed.
  Skipped,
  RuntimeError,
}

impl ErrorKind {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::InvalidJson => "InvalidJson",
      Self::InvalidFields => "InvalidFields",
      Self::UnknownType => "UnknownType",
      Self::InvalidPattern => "InvalidPattern",
      Self::Timeout => "Timeout",
      Self::Skipped => "Skipped",
      Self::RuntimeError => "RuntimeError",
    }
  }

  /// Intake failures that may clear up once the writer finishes flushing the file.
  #[must_use]
  pub const fn is_transient_read_failure(self) -> bool {
    matches!(self, Self::InvalidJson)
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Error reported in a command slot or as an intake-level batch error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CommandError {
  pub code: ErrorKind,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

impl CommandError {
  pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
      detail: None,
    }
  }

  /// Attach a raw diagnostic string. Empty details are dropped.
  #[must_use]
  pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
    let detail = detail.into();
    self.detail = if detail.trim().is_empty() {
      None
    } else {
      Some(detail)
    };
    self
  }

  pub fn invalid_json(detail: impl Into<String>) -> Self {
    Self::new(
      ErrorKind::InvalidJson,
      "batch file is not valid JSON; check that it was written completely",
    )
    .with_detail(detail)
  }

  pub fn invalid_fields(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidFields, message)
  }

  pub fn unknown_type(kind: &str) -> Self {
    Self::new(ErrorKind::UnknownType, format!("unknown command type: {kind}"))
  }

  pub fn invalid_pattern(detail: impl Into<String>) -> Self {
    Self::new(ErrorKind::InvalidPattern, "pattern failed to compile").with_detail(detail)
  }

  pub fn timeout(elapsed_ms: u128, limit_ms: u128) -> Self {
    Self::new(
      ErrorKind::Timeout,
      format!("command exceeded its timeout of {limit_ms}ms"),
    )
    .with_detail(format!("ran for {elapsed_ms}ms, limit {limit_ms}ms"))
  }

  pub fn skipped(batch_timeout_ms: u128) -> Self {
    Self::new(
      ErrorKind::Skipped,
      format!("not executed: batch timeout of {batch_timeout_ms}ms exceeded"),
    )
  }

  pub fn runtime(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::RuntimeError, message)
  }
}
