use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::CommandError;
use crate::registry::{Completion, Invocation, PendingCompletion};

pub const KIND: &str = "artifact.wait";

/// Longest an artifact wait may run, whatever the command timeout says.
pub const WAIT_CAP: Duration = Duration::from_secs(5);

/// Completes once the file at `path` exists with at least `minBytes` bytes.
///
/// Relative paths resolve inside the results directory.
pub fn handle(inv: &Invocation<'_>) -> Result<Completion, CommandError> {
  let raw = inv
    .params
    .get("path")
    .and_then(Value::as_str)
    .filter(|p| !p.is_empty())
    .ok_or_else(|| CommandError::invalid_fields("missing required param: path"))?;
  let min_bytes = match inv.params.get("minBytes") {
    None | Some(Value::Null) => 1,
    Some(v) => v
      .as_u64()
      .ok_or_else(|| CommandError::invalid_fields("minBytes must be a non-negative integer"))?,
  };

  let path = resolve(raw, inv)?;
  let placeholder = json!({ "artifactPath": path.display().to_string() });
  let ready = move || {
    Ok(
      fs::metadata(&path)
        .map(|m| m.is_file() && m.len() >= min_bytes)
        .unwrap_or(false),
    )
  };
  Ok(Completion::WaitingOn(
    PendingCompletion::new(placeholder, ready).with_timeout_cap(WAIT_CAP),
  ))
}

fn resolve(raw: &str, inv: &Invocation<'_>) -> Result<PathBuf, CommandError> {
  let path = PathBuf::from(raw);
  if path.is_absolute() {
    return Ok(path);
  }
  inv.results_dir.map(|dir| dir.join(&path)).ok_or_else(|| {
    CommandError::invalid_fields(format!(
      "relative artifact path {raw} needs a results directory"
    ))
  })
}
