use std::str::FromStr as _;

use log::Level;
use serde_json::{Value, json};

use crate::error::CommandError;
use crate::logging::{LogBuffer, LogEntry, LogFilter, MatchMode};
use crate::registry::{Completion, Invocation};

pub const KIND: &str = "log.query";

pub fn handler(buffer: LogBuffer) -> impl Fn(&Invocation<'_>) -> Result<Completion, CommandError> {
  move |inv| {
    let filter = parse_filter(inv.params)?;
    let items: Vec<Value> = buffer
      .query(&filter)
      .iter()
      .map(|e| entry_json(e, filter.include_stack))
      .collect();
    Ok(Completion::Ready(json!({
      "returned": items.len(),
      "totalCaptured": buffer.len(),
      "items": items,
    })))
  }
}

fn entry_json(entry: &LogEntry, include_stack: bool) -> Value {
  let mut item = json!({
    "time": entry.time,
    "level": entry.level.as_str(),
    "message": entry.message,
  });
  if include_stack {
    item["stack"] = json!(entry.stack);
  }
  item
}

fn parse_filter(params: &Value) -> Result<LogFilter, CommandError> {
  let n = params
    .get("n")
    .and_then(Value::as_i64)
    .ok_or_else(|| CommandError::invalid_fields("missing required integer param: n"))?;

  let level = match str_param(params, "level") {
    Some(raw) => Some(parse_level(raw)?),
    None => None,
  };
  let keyword = str_param(params, "keyword").map(str::to_string);
  let mode = match str_param(params, "matchMode") {
    Some(raw) => Some(parse_mode(raw)?),
    None if keyword.is_some() => Some(MatchMode::Fuzzy),
    None => None,
  };
  let regex = match (&keyword, mode) {
    (Some(k), Some(MatchMode::Regex)) => {
      Some(regex::Regex::new(k).map_err(|e| CommandError::invalid_pattern(e.to_string()))?)
    }
    _ => None,
  };

  Ok(LogFilter {
    limit: usize::try_from(n).unwrap_or(0),
    level,
    keyword,
    regex,
    mode,
    include_stack: params
      .get("includeStack")
      .and_then(Value::as_bool)
      .unwrap_or(false),
  })
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
  params
    .get(key)
    .and_then(Value::as_str)
    .filter(|s| !s.is_empty())
}

fn parse_level(raw: &str) -> Result<Level, CommandError> {
  match raw.to_ascii_lowercase().as_str() {
    "warning" => Ok(Level::Warn),
    "log" => Ok(Level::Info),
    _ => Level::from_str(raw)
      .map_err(|_| CommandError::invalid_fields(format!("unknown log level: {raw}"))),
  }
}

fn parse_mode(raw: &str) -> Result<MatchMode, CommandError> {
  match raw.to_ascii_lowercase().as_str() {
    "strict" => Ok(MatchMode::Strict),
    "fuzzy" => Ok(MatchMode::Fuzzy),
    "regex" => Ok(MatchMode::Regex),
    _ => Err(CommandError::invalid_fields(format!(
      "unknown matchMode: {raw} (expected Strict, Fuzzy or Regex)"
    ))),
  }
}
