use std::collections::VecDeque;
use std::sync::Arc;

use log::{Level, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::protocol::timestamp_now;

/// Entries kept before the oldest are dropped.
pub const LOG_BUFFER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
  pub time: String,
  pub level: Level,
  pub message: String,
  /// Target and source location of the log call.
  pub stack: String,
}

/// How a keyword is matched against entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
  /// Case-sensitive substring.
  Strict,
  /// Case-insensitive substring.
  Fuzzy,
  Regex,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
  /// Newest entries to return; 0 returns everything that matches.
  pub limit: usize,
  pub level: Option<Level>,
  pub keyword: Option<String>,
  pub regex: Option<regex::Regex>,
  pub mode: Option<MatchMode>,
  /// Also match the keyword against `stack`.
  pub include_stack: bool,
}

impl LogFilter {
  fn matches(&self, entry: &LogEntry) -> bool {
    if self.level.is_some_and(|l| l != entry.level) {
      return false;
    }
    let Some(keyword) = self.keyword.as_deref().filter(|k| !k.is_empty()) else {
      return true;
    };
    let hit = |text: &str| match self.mode.unwrap_or(MatchMode::Strict) {
      MatchMode::Strict => text.contains(keyword),
      MatchMode::Fuzzy => text.to_lowercase().contains(&keyword.to_lowercase()),
      MatchMode::Regex => self.regex.as_ref().is_some_and(|re| re.is_match(text)),
    };
    hit(&entry.message) || (self.include_stack && hit(&entry.stack))
  }
}

/// Bounded in-memory copy of recent log records. Clones share storage.
#[derive(Debug, Clone)]
pub struct LogBuffer {
  entries: Arc<Mutex<VecDeque<LogEntry>>>,
  capacity: usize,
}

impl Default for LogBuffer {
  fn default() -> Self {
    Self::new(LOG_BUFFER_CAPACITY)
  }
}

impl LogBuffer {
  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
      capacity: capacity.max(1),
    }
  }

  pub fn push(&self, entry: LogEntry) {
    let mut entries = self.entries.lock();
    while entries.len() >= self.capacity {
      entries.pop_front();
    }
    entries.push_back(entry);
  }

  pub fn record(&self, record: &Record<'_>) {
    let location = match (record.file(), record.line()) {
      (Some(file), Some(line)) => format!("{} ({file}:{line})", record.target()),
      _ => record.target().to_string(),
    };
    self.push(LogEntry {
      time: timestamp_now(),
      level: record.level(),
      message: record.args().to_string(),
      stack: location,
    });
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.lock().is_empty()
  }

  /// Matching entries, newest `filter.limit` of them, oldest first.
  #[must_use]
  pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
    let entries = self.entries.lock();
    let mut hits: Vec<LogEntry> = entries
      .iter()
      .filter(|e| filter.matches(e))
      .cloned()
      .collect();
    if filter.limit > 0 && hits.len() > filter.limit {
      hits.drain(..hits.len() - filter.limit);
    }
    hits
  }
}

/// `env_logger` output plus a copy of every emitted record in a [`LogBuffer`].
pub struct CapturingLogger {
  inner: env_logger::Logger,
  buffer: LogBuffer,
}

impl Log for CapturingLogger {
  fn enabled(&self, metadata: &Metadata<'_>) -> bool {
    self.inner.enabled(metadata)
  }

  fn log(&self, record: &Record<'_>) {
    if self.inner.matches(record) {
      self.buffer.record(record);
      self.inner.log(record);
    }
  }

  fn flush(&self) {
    self.inner.flush();
  }
}

/// Install the process logger. `RUST_LOG` overrides the default `info` filter.
///
/// Returns false when a logger was already installed; the buffer then stays empty.
pub fn init_logging(buffer: &LogBuffer) -> bool {
  let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_secs()
    .build();
  let max_level = inner.filter();
  let logger = CapturingLogger {
    inner,
    buffer: buffer.clone(),
  };
  if log::set_boxed_logger(Box::new(logger)).is_err() {
    return false;
  }
  log::set_max_level(max_level);
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(level: Level, message: &str) -> LogEntry {
    LogEntry {
      time: timestamp_now(),
      level,
      message: message.to_string(),
      stack: "hostbridge::engine (src/engine.rs:1)".to_string(),
    }
  }

  fn filled() -> LogBuffer {
    let buf = LogBuffer::new(100);
    buf.push(entry(Level::Info, "Started batch b1"));
    buf.push(entry(Level::Warn, "Rejected batch B2"));
    buf.push(entry(Level::Error, "write failed"));
    buf.push(entry(Level::Info, "Completed batch b1"));
    buf
  }

  #[test]
  fn evicts_oldest_at_capacity() {
    let buf = LogBuffer::new(2);
    buf.push(entry(Level::Info, "a"));
    buf.push(entry(Level::Info, "b"));
    buf.push(entry(Level::Info, "c"));
    let all = buf.query(&LogFilter::default());
    let msgs: Vec<_> = all.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(msgs, vec!["b", "c"]);
  }

  #[test]
  fn limit_keeps_newest_in_old_to_new_order() {
    let got = filled().query(&LogFilter {
      limit: 2,
      ..Default::default()
    });
    let msgs: Vec<_> = got.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(msgs, vec!["write failed", "Completed batch b1"]);
  }

  #[test]
  fn strict_is_case_sensitive_fuzzy_is_not() {
    let buf = filled();
    let strict = buf.query(&LogFilter {
      keyword: Some("batch b".to_string()),
      mode: Some(MatchMode::Strict),
      ..Default::default()
    });
    assert_eq!(strict.len(), 2);
    let fuzzy = buf.query(&LogFilter {
      keyword: Some("batch b".to_string()),
      mode: Some(MatchMode::Fuzzy),
      ..Default::default()
    });
    assert_eq!(fuzzy.len(), 3);
  }

  #[test]
  fn level_and_stack_filters() {
    let buf = filled();
    let warn = buf.query(&LogFilter {
      level: Some(Level::Warn),
      ..Default::default()
    });
    assert_eq!(warn.len(), 1);

    let by_stack = buf.query(&LogFilter {
      keyword: Some("engine.rs".to_string()),
      mode: Some(MatchMode::Strict),
      include_stack: true,
      ..Default::default()
    });
    assert_eq!(by_stack.len(), 4);
  }

  #[test]
  fn regex_mode_uses_compiled_pattern() {
    let got = filled().query(&LogFilter {
      keyword: Some("^(Started|Completed)".to_string()),
      regex: Some(regex::Regex::new("^(Started|Completed)").unwrap()),
      mode: Some(MatchMode::Regex),
      ..Default::default()
    });
    assert_eq!(got.len(), 2);
  }
}
