/// Token styling for values embedded in CLI lines (ids, paths, counts).
pub mod t {
  use std::fmt::Display;

  use owo_colors::OwoColorize as _;

  pub fn id(value: impl Display) -> String {
    value.to_string().blue().to_string()
  }

  pub fn path(value: impl Display) -> String {
    value.to_string().cyan().to_string()
  }

  pub fn count(value: impl Display) -> String {
    value.to_string().magenta().to_string()
  }

  pub fn ok(line: impl Display) -> String {
    line.to_string().green().to_string()
  }

  pub fn warn(line: impl Display) -> String {
    line.to_string().yellow().to_string()
  }

  pub fn err(line: impl Display) -> String {
    line.to_string().red().to_string()
  }
}

// Human-facing CLI output. Diagnostics of the host loop go through the `log` facade instead.
// Info lines stay neutral; success, warn and error tint the whole line.

#[cfg(test)]
use crossbeam_channel::Sender;
#[cfg(test)]
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
  Info,
  Success,
  Warn,
  Error,
}

impl LogLevel {
  fn style(self, text: String) -> String {
    match self {
      Self::Info => text,
      Self::Success => t::ok(text),
      Self::Warn => t::warn(text),
      Self::Error => t::err(text),
    }
  }
}

/// One rendered CLI line, ANSI styling included.
#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CliLine {
  pub level: LogLevel,
  pub text: String,
}

#[cfg(test)]
static CAPTURE: Mutex<Option<Sender<CliLine>>> = Mutex::new(None);

/// Send CLI lines to `sender` instead of the terminal.
#[cfg(test)]
pub(crate) fn capture_output(sender: Sender<CliLine>) {
  *CAPTURE.lock() = Some(sender);
}

#[cfg(test)]
pub(crate) fn release_output() {
  *CAPTURE.lock() = None;
}

#[doc(hidden)]
pub fn emit(level: LogLevel, text: String) {
  let text = level.style(text);
  #[cfg(test)]
  if let Some(tx) = CAPTURE.lock().as_ref() {
    let _ = tx.send(CliLine { level, text });
    return;
  }
  // stdout carries results scripts read; warnings and errors stay out of it.
  match level {
    LogLevel::Info | LogLevel::Success => anstream::println!("{text}"),
    LogLevel::Warn | LogLevel::Error => anstream::eprintln!("{text}"),
  }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __cli_line {
  ($level:ident, $fmt:literal $(, $args:expr )* $(,)?) => {
    $crate::utils::log::emit(
      $crate::utils::log::LogLevel::$level,
      format!($fmt $(, $args )*),
    )
  };
}

#[macro_export]
macro_rules! log_info {
  ($($arg:tt)+) => { $crate::__cli_line!(Info, $($arg)+) };
}

#[macro_export]
macro_rules! log_success {
  ($($arg:tt)+) => { $crate::__cli_line!(Success, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
  ($($arg:tt)+) => { $crate::__cli_line!(Warn, $($arg)+) };
}

#[macro_export]
macro_rules! log_error {
  ($($arg:tt)+) => { $crate::__cli_line!(Error, $($arg)+) };
}

#[cfg(test)]
mod tests {
  use super::*;
  use crossbeam_channel::unbounded;
  use serial_test::serial;

  #[test]
  #[serial]
  fn captured_lines_keep_level_and_tint() {
    let (tx, rx) = unbounded();
    capture_output(tx);
    crate::log_info!("batch {}", t::id("b1"));
    crate::log_success!("done {}", 1);
    crate::log_warn!("careful");
    crate::log_error!("failed {}", "x");
    release_output();

    let lines: Vec<CliLine> = rx.try_iter().collect();
    let levels: Vec<LogLevel> = lines.iter().map(|l| l.level).collect();
    assert_eq!(
      levels,
      [
        LogLevel::Info,
        LogLevel::Success,
        LogLevel::Warn,
        LogLevel::Error
      ]
    );
    assert!(lines[0].text.starts_with("batch "));
    assert!(lines[0].text.contains("b1"));
    assert!(lines[1..].iter().all(|l| l.text.starts_with("\u{1b}[")));
  }

  #[test]
  #[serial]
  fn printing_without_capture_does_not_panic() {
    release_output();
    crate::log_info!("a");
    crate::log_success!("b");
    crate::log_warn!("c");
    crate::log_error!("d");
  }
}
