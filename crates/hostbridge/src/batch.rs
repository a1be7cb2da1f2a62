use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::CommandError;
use crate::protocol::{BatchRequest, CommandRequest};

static SAFE_ID_RE: OnceLock<Regex> = OnceLock::new();

/// True when `id` only uses `[A-Za-z0-9_-]` and is non-empty.
///
/// Batch ids become result file names, so anything else is rejected rather than escaped.
#[must_use]
pub fn is_safe_id(id: &str) -> bool {
  let re = SAFE_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));
  re.is_match(id)
}

/// Map an arbitrary file stem onto the safe id charset.
#[must_use]
pub fn sanitize_id(raw: &str) -> String {
  let out: String = raw
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
        c
      } else {
        '_'
      }
    })
    .collect();
  if out.is_empty() {
    "unnamed".to_string()
  } else {
    out
  }
}

/// Loosely decoded batch before validation; every field may still be missing.
#[derive(Debug, Default)]
struct RawBatch {
  batch_id: Option<String>,
  timeout_ms: Option<u64>,
  commands: Option<Vec<RawCommand>>,
}

#[derive(Debug, Default)]
struct RawCommand {
  id: Option<String>,
  kind: Option<String>,
  params: Option<Value>,
  timeout_ms: Option<u64>,
}

/// Decode and validate a pending batch file.
///
/// # Errors
/// `InvalidJson` for unparseable bytes or a non-object root, `InvalidFields` for the first
/// missing or illegal field in validation order.
pub fn parse_and_validate(bytes: &[u8]) -> Result<BatchRequest, CommandError> {
  let raw = parse(bytes)?;
  validate(raw)
}

fn parse(bytes: &[u8]) -> Result<RawBatch, CommandError> {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Err(CommandError::invalid_json("file is empty"));
  }
  let root: Value =
    serde_json::from_slice(bytes).map_err(|e| CommandError::invalid_json(e.to_string()))?;
  let Value::Object(root) = root else {
    return Err(CommandError::invalid_json("top-level value is not an object"));
  };

  let commands = root.get("commands").and_then(Value::as_array).map(|arr| {
    arr
      .iter()
      .map(|entry| match entry {
        Value::Object(obj) => parse_command(obj),
        _ => RawCommand::default(),
      })
      .collect()
  });

  Ok(RawBatch {
    batch_id: non_empty_str(&root, "batchId"),
    timeout_ms: timeout_field(&root),
    commands,
  })
}

fn parse_command(obj: &Map<String, Value>) -> RawCommand {
  RawCommand {
    id: non_empty_str(obj, "id"),
    kind: non_empty_str(obj, "type"),
    params: obj.get("params").filter(|v| !v.is_null()).cloned(),
    timeout_ms: timeout_field(obj),
  }
}

fn non_empty_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
  obj
    .get(key)
    .and_then(Value::as_str)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
}

// The wire format uses `timeout`; `timeoutMs` is accepted as an alias. Non-integers are ignored.
fn timeout_field(obj: &Map<String, Value>) -> Option<u64> {
  obj
    .get("timeout")
    .or_else(|| obj.get("timeoutMs"))
    .and_then(Value::as_u64)
}

fn validate(raw: RawBatch) -> Result<BatchRequest, CommandError> {
  let Some(batch_id) = raw.batch_id else {
    return Err(CommandError::invalid_fields(
      "missing required field: batchId",
    ));
  };
  if !is_safe_id(&batch_id) {
    return Err(
      CommandError::invalid_fields(
        "batchId may only contain letters, digits, '_' and '-'",
      )
      .with_detail(format!("batchId={batch_id}")),
    );
  }

  let raw_commands = raw.commands.unwrap_or_default();
  if raw_commands.is_empty() {
    return Err(CommandError::invalid_fields(
      "commands must be a non-empty array",
    ));
  }

  let mut commands = Vec::with_capacity(raw_commands.len());
  for (index, cmd) in raw_commands.into_iter().enumerate() {
    let position = index + 1;
    let Some(id) = cmd.id else {
      return Err(CommandError::invalid_fields(format!(
        "command #{position} is missing required field: id"
      )));
    };
    let Some(kind) = cmd.kind else {
      return Err(CommandError::invalid_fields(format!(
        "command {id} is missing required field: type"
      )));
    };
    let Some(params) = cmd.params else {
      return Err(CommandError::invalid_fields(format!(
        "command {id} is missing required field: params"
      )));
    };
    if !params.is_object() {
      return Err(CommandError::invalid_fields(format!(
        "command {id}: params must be an object"
      )));
    }
    commands.push(CommandRequest {
      id,
      kind,
      params,
      timeout_ms: cmd.timeout_ms,
    });
  }

  Ok(BatchRequest {
    batch_id,
    timeout_ms: raw.timeout_ms,
    commands,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use serde_json::json;

  fn code_of(input: &str) -> ErrorKind {
    parse_and_validate(input.as_bytes()).unwrap_err().code
  }

  #[test]
  fn parses_canonical_batch() {
    let req = parse_and_validate(
      br#"{"batchId":"b1","timeout":30000,"commands":[{"id":"c1","type":"log.query","params":{"n":10}}]}"#,
    )
    .unwrap();
    assert_eq!(req.batch_id, "b1");
    assert_eq!(req.timeout_ms, Some(30_000));
    assert_eq!(req.commands.len(), 1);
    assert_eq!(req.commands[0].kind, "log.query");
    assert_eq!(req.commands[0].params, json!({"n": 10}));
    assert_eq!(req.commands[0].timeout_ms, None);
  }

  #[test]
  fn accepts_timeout_ms_alias_and_command_timeout() {
    let req = parse_and_validate(
      br#"{"batchId":"b1","timeoutMs":500,"commands":[{"id":"c1","type":"t","params":{},"timeout":20}]}"#,
    )
    .unwrap();
    assert_eq!(req.timeout_ms, Some(500));
    assert_eq!(req.commands[0].timeout_ms, Some(20));
  }

  #[test]
  fn truncated_json_is_invalid_json() {
    assert_eq!(code_of(r#"{"batchId":"b1","comm"#), ErrorKind::InvalidJson);
    assert_eq!(code_of(""), ErrorKind::InvalidJson);
    assert_eq!(code_of("[1,2]"), ErrorKind::InvalidJson);
  }

  #[test]
  fn missing_batch_id_wins_over_other_violations() {
    let err = parse_and_validate(br#"{"commands":[]}"#).unwrap_err();
    assert_eq!(err.code, ErrorKind::InvalidFields);
    assert!(err.message.contains("batchId"));
  }

  #[test]
  fn rejects_unsafe_batch_ids() {
    for bad in ["../etc", "a/b", "..", "a b", "ü", "a.b", "x\\y"] {
      let input = json!({"batchId": bad, "commands": [{"id":"c","type":"t","params":{}}]});
      let err = parse_and_validate(input.to_string().as_bytes()).unwrap_err();
      assert_eq!(err.code, ErrorKind::InvalidFields, "batchId {bad:?}");
    }
  }

  #[test]
  fn empty_or_missing_commands_rejected() {
    assert_eq!(code_of(r#"{"batchId":"b"}"#), ErrorKind::InvalidFields);
    assert_eq!(code_of(r#"{"batchId":"b","commands":[]}"#), ErrorKind::InvalidFields);
    assert_eq!(code_of(r#"{"batchId":"b","commands":{}}"#), ErrorKind::InvalidFields);
  }

  #[test]
  fn command_fields_checked_in_order() {
    let err = parse_and_validate(br#"{"batchId":"b","commands":[{"type":"t"}]}"#).unwrap_err();
    assert!(err.message.contains("#1"));
    assert!(err.message.contains("id"));

    let err = parse_and_validate(br#"{"batchId":"b","commands":[{"id":"c1","params":{}}]}"#)
      .unwrap_err();
    assert!(err.message.contains("type"));

    let err =
      parse_and_validate(br#"{"batchId":"b","commands":[{"id":"c1","type":"t"}]}"#).unwrap_err();
    assert!(err.message.contains("params"));

    let err = parse_and_validate(
      br#"{"batchId":"b","commands":[{"id":"c1","type":"t","params":null}]}"#,
    )
    .unwrap_err();
    assert!(err.message.contains("params"));
  }

  #[test]
  fn non_object_command_entry_reports_missing_id() {
    let err = parse_and_validate(
      br#"{"batchId":"b","commands":[{"id":"a","type":"t","params":{}}, 5]}"#,
    )
    .unwrap_err();
    assert_eq!(err.code, ErrorKind::InvalidFields);
    assert!(err.message.contains("#2"));
  }

  #[test]
  fn sanitize_maps_to_safe_charset() {
    assert_eq!(sanitize_id("a.b c"), "a_b_c");
    assert_eq!(sanitize_id(""), "unnamed");
    assert!(is_safe_id(&sanitize_id("..")));
  }
}
