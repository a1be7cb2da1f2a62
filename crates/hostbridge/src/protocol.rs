use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// Batch timeout applied when the pending file does not carry one.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 30_000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[must_use]
pub fn format_timestamp(at: DateTime<Local>) -> String {
  at.format(TIMESTAMP_FORMAT).to_string()
}

#[must_use]
pub fn timestamp_now() -> String {
  format_timestamp(Local::now())
}

/// A parsed and validated batch. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
  pub batch_id: String,
  pub timeout_ms: Option<u64>,
  pub commands: Vec<CommandRequest>,
}

impl BatchRequest {
  #[must_use]
  pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
    self.timeout_ms.unwrap_or(default_ms)
  }

  /// Number of commands in this batch whose type equals `kind` (ASCII case-insensitive).
  #[must_use]
  pub fn count_of_kind(&self, kind: &str) -> usize {
    self
      .commands
      .iter()
      .filter(|c| c.kind.eq_ignore_ascii_case(kind))
      .count()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
  pub id: String,
  pub kind: String,
  pub params: Value,
  pub timeout_ms: Option<u64>,
}

/// Per-command status. Empty until the command reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
  #[default]
  #[serde(rename = "")]
  Pending,
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub status: CommandStatus,
  #[serde(default)]
  pub started_at: String,
  #[serde(default)]
  pub finished_at: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<CommandError>,
}

impl CommandResult {
  #[must_use]
  pub fn placeholder(cmd: &CommandRequest) -> Self {
    Self {
      id: cmd.id.clone(),
      kind: cmd.kind.clone(),
      status: CommandStatus::Pending,
      started_at: String::new(),
      finished_at: String::new(),
      result: None,
      error: None,
    }
  }

  #[must_use]
  pub fn is_terminal(&self) -> bool {
    self.status != CommandStatus::Pending
  }

  pub fn mark_success(&mut self, payload: Value, at: String) {
    self.status = CommandStatus::Success;
    self.finished_at = at;
    self.result = Some(payload);
    self.error = None;
  }

  pub fn mark_error(&mut self, error: CommandError, at: String) {
    self.status = CommandStatus::Error;
    self.finished_at = at;
    self.result = None;
    self.error = Some(error);
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
  Processing,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
  pub batch_id: String,
  pub status: BatchStatus,
  pub started_at: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<String>,
  #[serde(default)]
  pub results: Vec<CommandResult>,
  #[serde(default)]
  pub total_commands: usize,
  #[serde(default)]
  pub success_count: usize,
  #[serde(default)]
  pub failed_count: usize,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<CommandError>,
}

impl BatchResult {
  /// Fresh `processing` result with one empty slot per command, index-aligned.
  #[must_use]
  pub fn processing(request: &BatchRequest, started_at: String) -> Self {
    Self {
      batch_id: request.batch_id.clone(),
      status: BatchStatus::Processing,
      started_at,
      finished_at: None,
      results: request
        .commands
        .iter()
        .map(CommandResult::placeholder)
        .collect(),
      total_commands: request.commands.len(),
      success_count: 0,
      failed_count: 0,
      error: None,
    }
  }

  /// Terminal result for a failure that happened before any command ran.
  #[must_use]
  pub fn intake_error(
    batch_id: impl Into<String>,
    started_at: String,
    finished_at: String,
    error: CommandError,
  ) -> Self {
    Self {
      batch_id: batch_id.into(),
      status: BatchStatus::Completed,
      started_at,
      finished_at: Some(finished_at),
      results: Vec::new(),
      total_commands: 0,
      success_count: 0,
      failed_count: 0,
      error: Some(error),
    }
  }

  #[must_use]
  pub fn is_terminal(&self) -> bool {
    self.status == BatchStatus::Completed
  }
}
