//! Common error messages used across the CLI.

use std::fmt::Display;

pub(crate) const STDIN_READ_FAILED: &str = "failed to read batch from stdin";
pub(crate) const SUBMIT_ID_UNSAFE: &str =
  "--id may only contain letters, digits, '-' and '_'";

pub(crate) fn result_id_unsafe(id: impl Display) -> String {
  format!("not a valid batch id: {id} (letters, digits, '-' and '_' only)")
}

pub(crate) fn invalid_batch(reason: impl Display) -> String {
  format!("Batch rejected: {reason}")
}

pub(crate) fn already_pending(id: impl Display) -> String {
  format!("a batch named {id} is already pending")
}

pub(crate) fn result_not_found(id: impl Display) -> String {
  format!("no result for batch {id}")
}

pub(crate) fn result_wait_timed_out(id: impl Display, timeout_ms: u64) -> String {
  format!("batch {id} did not complete within {timeout_ms}ms")
}

pub(crate) fn no_functional_commands(kind: impl Display) -> String {
  format!("{kind} is not registered; the host cannot answer log queries")
}
