use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info};

use crate::clock::Clock;
use crate::error::CommandError;
use crate::plugins::panic_message;
use crate::protocol::{BatchRequest, BatchResult, BatchStatus, CommandStatus, timestamp_now};
use crate::registry::{CommandRegistry, Completion, Invocation, PendingCompletion};
use crate::writer::ResultWriter;

/// Where a batch is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  /// Command at this index has not been started.
  Running(usize),
  /// Command at this index started and waits on an external completion.
  Waiting(usize),
  Completed,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTick {
  /// A command reached a terminal state or started waiting.
  Progressed,
  /// Still waiting on an external completion; nothing was published.
  Waiting,
  Completed,
}

struct WaitingCommand {
  completion: PendingCompletion,
  started: Instant,
  limit: Duration,
}

/// One batch being executed, one step per tick.
///
/// Commands run strictly in input order. The batch deadline is checked at the start of every
/// tick; a handler that blocks is not interrupted, so the deadline can be overrun by at most one
/// handler call.
pub struct BatchSession {
  request: BatchRequest,
  source: PathBuf,
  result: BatchResult,
  state: SessionState,
  started: Instant,
  batch_timeout: Duration,
  waiting: Option<WaitingCommand>,
}

impl std::fmt::Debug for BatchSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BatchSession")
      .field("batch_id", &self.request.batch_id)
      .field("state", &self.state)
      .field("waiting", &self.waiting.as_ref().map(|w| &w.completion))
      .finish_non_exhaustive()
  }
}

impl BatchSession {
  /// Begin a batch. The caller publishes the initial snapshot from [`BatchSession::result`].
  #[must_use]
  pub fn start(
    request: BatchRequest,
    source: PathBuf,
    default_timeout_ms: u64,
    now: Instant,
  ) -> Self {
    let timeout_ms = request.effective_timeout_ms(default_timeout_ms);
    let result = BatchResult::processing(&request, timestamp_now());
    info!(
      "Started batch {} ({} command(s), timeout {timeout_ms}ms)",
      request.batch_id,
      request.commands.len()
    );
    Self {
      request,
      source,
      result,
      state: SessionState::Running(0),
      started: now,
      batch_timeout: Duration::from_millis(timeout_ms),
      waiting: None,
    }
  }

  #[must_use]
  pub fn batch_id(&self) -> &str {
    &self.request.batch_id
  }

  #[must_use]
  pub fn source(&self) -> &Path {
    &self.source
  }

  #[must_use]
  pub fn result(&self) -> &BatchResult {
    &self.result
  }

  #[must_use]
  pub fn state(&self) -> SessionState {
    self.state
  }

  /// Advance by at most one command step. Never blocks beyond a single handler call.
  ///
  /// # Errors
  /// Fails only when publishing to disk fails. Handler failures are recorded in the result.
  pub fn tick(
    &mut self,
    registry: &CommandRegistry,
    writer: &ResultWriter,
    clock: &dyn Clock,
  ) -> Result<SessionTick> {
    let index = match self.state {
      SessionState::Completed => return Ok(SessionTick::Completed),
      SessionState::Running(i) | SessionState::Waiting(i) => i,
    };

    if clock.now().saturating_duration_since(self.started) > self.batch_timeout {
      self.skip_from(index);
      self.finish(writer)?;
      return Ok(SessionTick::Completed);
    }
    if index >= self.request.commands.len() {
      self.finish(writer)?;
      return Ok(SessionTick::Completed);
    }

    let step = match self.state {
      SessionState::Waiting(i) => self.poll_waiting(i, clock),
      _ => self.run_command(index, registry, writer.paths().results_dir().as_path(), clock),
    };
    if step == SessionTick::Waiting {
      return Ok(step);
    }
    self.refresh_counts();
    writer.publish_processing(&self.result)?;
    Ok(step)
  }

  fn run_command(
    &mut self,
    index: usize,
    registry: &CommandRegistry,
    results_dir: &Path,
    clock: &dyn Clock,
  ) -> SessionTick {
    let cmd = &self.request.commands[index];
    let limit = cmd
      .timeout_ms
      .map_or(self.batch_timeout, Duration::from_millis);
    self.result.results[index].started_at = timestamp_now();
    let cmd_started = clock.now();
    debug!("Running {} ({}) in batch {}", cmd.id, cmd.kind, self.request.batch_id);

    let invocation = Invocation::new(&cmd.kind, &cmd.params)
      .in_batch(
        &self.request.batch_id,
        &cmd.id,
        self.request.count_of_kind(&cmd.kind),
      )
      .with_results_dir(results_dir);
    let outcome = catch_unwind(AssertUnwindSafe(|| registry.execute(&invocation)))
      .unwrap_or_else(|payload| Err(handler_panicked(payload.as_ref())));

    let slot = &mut self.result.results[index];
    match outcome {
      Ok(Completion::Ready(payload)) => {
        let elapsed = clock.now().saturating_duration_since(cmd_started);
        if elapsed > limit {
          slot.mark_error(
            CommandError::timeout(elapsed.as_millis(), limit.as_millis()),
            timestamp_now(),
          );
        } else {
          slot.mark_success(payload, timestamp_now());
        }
      }
      Ok(Completion::WaitingOn(pending)) => {
        let limit = pending.timeout_cap.map_or(limit, |cap| limit.min(cap));
        slot.result = Some(pending.placeholder.clone());
        self.waiting = Some(WaitingCommand {
          completion: pending,
          started: cmd_started,
          limit,
        });
        self.state = SessionState::Waiting(index);
        return SessionTick::Progressed;
      }
      Err(err) => slot.mark_error(err, timestamp_now()),
    }
    self.state = SessionState::Running(index + 1);
    SessionTick::Progressed
  }

  fn poll_waiting(&mut self, index: usize, clock: &dyn Clock) -> SessionTick {
    let slot = &mut self.result.results[index];
    let Some(waiting) = self.waiting.as_mut() else {
      slot.mark_error(
        CommandError::runtime("lost track of pending completion"),
        timestamp_now(),
      );
      self.state = SessionState::Running(index + 1);
      return SessionTick::Progressed;
    };

    let polled = catch_unwind(AssertUnwindSafe(|| waiting.completion.poll()))
      .unwrap_or_else(|payload| Err(handler_panicked(payload.as_ref())));
    match polled {
      Ok(true) => {
        let payload = waiting.completion.placeholder.clone();
        slot.mark_success(payload, timestamp_now());
      }
      Ok(false) => {
        let elapsed = clock.now().saturating_duration_since(waiting.started);
        if elapsed <= waiting.limit {
          return SessionTick::Waiting;
        }
        slot.mark_error(
          CommandError::timeout(elapsed.as_millis(), waiting.limit.as_millis()),
          timestamp_now(),
        );
      }
      Err(err) => slot.mark_error(err, timestamp_now()),
    }
    self.waiting = None;
    self.state = SessionState::Running(index + 1);
    SessionTick::Progressed
  }

  // Every command from `index` on that has no terminal status becomes Skipped.
  fn skip_from(&mut self, index: usize) {
    let limit_ms = self.batch_timeout.as_millis();
    info!(
      "Batch {} exceeded its timeout of {limit_ms}ms, skipping remaining commands",
      self.request.batch_id
    );
    self.waiting = None;
    let now = timestamp_now();
    for slot in self.result.results.iter_mut().skip(index) {
      if slot.is_terminal() {
        continue;
      }
      if slot.started_at.is_empty() {
        slot.started_at.clone_from(&now);
      }
      slot.mark_error(CommandError::skipped(limit_ms), now.clone());
    }
  }

  fn refresh_counts(&mut self) {
    let count = |status: CommandStatus| {
      self
        .result
        .results
        .iter()
        .filter(|r| r.status == status)
        .count()
    };
    let (ok, failed) = (count(CommandStatus::Success), count(CommandStatus::Error));
    self.result.success_count = ok;
    self.result.failed_count = failed;
  }

  fn finish(&mut self, writer: &ResultWriter) -> Result<()> {
    self.refresh_counts();
    self.result.status = BatchStatus::Completed;
    self.result.finished_at = Some(timestamp_now());
    self.state = SessionState::Completed;
    info!(
      "Completed batch {}: {} succeeded, {} failed",
      self.request.batch_id, self.result.success_count, self.result.failed_count
    );
    writer.publish_terminal(&self.result, &self.source)
  }

  /// Give up on the batch after a publishing failure and record it as an intake error.
  ///
  /// # Errors
  /// Fails when even the intake error cannot be published.
  pub fn abandon(self, writer: &ResultWriter, cause: &anyhow::Error) -> Result<()> {
    let error = CommandError::runtime("batch aborted by an internal failure")
      .with_detail(format!("{cause:#}"));
    writer.publish_intake_error(
      &self.request.batch_id,
      &self.source,
      self.result.started_at,
      error,
    )
  }
}

fn handler_panicked(payload: &(dyn std::any::Any + Send)) -> CommandError {
  CommandError::runtime(format!("handler panicked: {}", panic_message(payload)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::BridgePaths;
  use crate::error::ErrorKind;
  use crate::protocol::CommandRequest;
  use serde_json::json;
  use std::cell::Cell;
  use std::rc::Rc;
  use tempfile::TempDir;

  struct Fixture {
    _temp: TempDir,
    writer: ResultWriter,
    registry: CommandRegistry,
    clock: ManualClock,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let paths = BridgePaths::new(temp.path(), "data");
    paths.ensure_dirs().unwrap();
    let mut registry = CommandRegistry::new();
    registry
      .register("noop", |_| Ok(Completion::Ready(json!({"ok": true}))))
      .unwrap();
    registry
      .register("boom", |_| Err(CommandError::runtime("boom")))
      .unwrap();
    registry
      .register("panic", |_| panic!("handler blew up"))
      .unwrap();
    Fixture {
      _temp: temp,
      writer: ResultWriter::new(paths, 20, false),
      registry,
      clock: ManualClock::new(),
    }
  }

  fn cmd(id: &str, kind: &str) -> CommandRequest {
    CommandRequest {
      id: id.to_string(),
      kind: kind.to_string(),
      params: json!({}),
      timeout_ms: None,
    }
  }

  fn session(f: &Fixture, timeout_ms: Option<u64>, commands: Vec<CommandRequest>) -> BatchSession {
    let request = BatchRequest {
      batch_id: "b1".to_string(),
      timeout_ms,
      commands,
    };
    let source = f.writer.paths().pending_file("b1");
    std::fs::write(&source, "{}").unwrap();
    BatchSession::start(request, source, 30_000, f.clock.now())
  }

  fn drive(f: &Fixture, s: &mut BatchSession, max: usize) -> usize {
    for n in 1..=max {
      if s.tick(&f.registry, &f.writer, &f.clock).unwrap() == SessionTick::Completed {
        return n;
      }
    }
    panic!("batch did not complete in {max} ticks");
  }

  #[test]
  fn partial_failure_does_not_abort_siblings() {
    let f = fixture();
    let mut s = session(
      &f,
      None,
      vec![cmd("c1", "noop"), cmd("c2", "boom"), cmd("c3", "noop")],
    );
    drive(&f, &mut s, 10);
    let r = f.writer.read_result("b1").unwrap().unwrap();
    assert_eq!(r.status, BatchStatus::Completed);
    let statuses: Vec<_> = r.results.iter().map(|c| c.status).collect();
    assert_eq!(
      statuses,
      vec![CommandStatus::Success, CommandStatus::Error, CommandStatus::Success]
    );
    assert_eq!(r.results[1].error.as_ref().unwrap().code, ErrorKind::RuntimeError);
    assert_eq!((r.success_count, r.failed_count), (2, 1));
    assert!(f.writer.paths().done_file("b1").is_file());
  }

  #[test]
  fn one_command_per_tick_with_snapshots() {
    let f = fixture();
    let mut s = session(&f, None, vec![cmd("c1", "noop"), cmd("c2", "noop")]);
    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Progressed
    );
    let snap = f.writer.read_result("b1").unwrap().unwrap();
    assert_eq!(snap.status, BatchStatus::Processing);
    assert_eq!(snap.results[0].status, CommandStatus::Success);
    assert_eq!(snap.results[1].status, CommandStatus::Pending);
    assert_eq!(s.state(), SessionState::Running(1));
  }

  #[test]
  fn unknown_type_and_panics_are_recorded() {
    let f = fixture();
    let mut s = session(&f, None, vec![cmd("c1", "does.not.exist"), cmd("c2", "panic")]);
    drive(&f, &mut s, 5);
    let r = s.result();
    assert_eq!(r.results[0].error.as_ref().unwrap().code, ErrorKind::UnknownType);
    let panic_err = r.results[1].error.as_ref().unwrap();
    assert_eq!(panic_err.code, ErrorKind::RuntimeError);
    assert!(panic_err.message.contains("handler blew up"));
  }

  #[test]
  fn batch_timeout_skips_the_rest() {
    let f = fixture();
    let mut s = session(
      &f,
      Some(1_000),
      vec![cmd("c1", "noop"), cmd("c2", "noop"), cmd("c3", "noop")],
    );
    s.tick(&f.registry, &f.writer, &f.clock).unwrap();
    f.clock.advance(Duration::from_millis(1_001));
    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Completed
    );
    let r = f.writer.read_result("b1").unwrap().unwrap();
    assert_eq!(r.results[0].status, CommandStatus::Success);
    for slot in &r.results[1..] {
      let err = slot.error.as_ref().unwrap();
      assert_eq!(err.code, ErrorKind::Skipped);
      assert!(err.message.contains("1000ms"));
      assert!(!slot.started_at.is_empty(), "skipped slot has no startedAt");
      assert!(!slot.finished_at.is_empty());
    }
    assert!(r.results.iter().all(|c| c.is_terminal()));
  }

  #[test]
  fn slow_synchronous_handler_is_a_timeout() {
    let mut f = fixture();
    let clock = f.clock.clone();
    f.registry
      .register("slow", move |_| {
        clock.advance(Duration::from_millis(50));
        Ok(Completion::Ready(json!({})))
      })
      .unwrap();
    let mut slow = cmd("c1", "slow");
    slow.timeout_ms = Some(10);
    let mut s = session(&f, None, vec![slow]);
    drive(&f, &mut s, 3);
    let err = s.result().results[0].error.clone().unwrap();
    assert_eq!(err.code, ErrorKind::Timeout);
    assert!(s.result().results[0].result.is_none());
  }

  #[test]
  fn waiting_command_succeeds_only_when_ready() {
    let mut f = fixture();
    let flag = Rc::new(Cell::new(false));
    let seen = flag.clone();
    f.registry
      .register("wait", move |_| {
        let seen = seen.clone();
        Ok(Completion::WaitingOn(PendingCompletion::new(
          json!({"artifactPath": "x.png"}),
          move || Ok(seen.get()),
        )))
      })
      .unwrap();
    let mut s = session(&f, None, vec![cmd("c1", "wait"), cmd("c2", "noop")]);

    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Progressed
    );
    let snap = f.writer.read_result("b1").unwrap().unwrap();
    assert_eq!(snap.results[0].status, CommandStatus::Pending);
    assert_eq!(snap.results[0].result, Some(json!({"artifactPath": "x.png"})));
    assert_eq!(s.state(), SessionState::Waiting(0));

    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Waiting
    );
    flag.set(true);
    s.tick(&f.registry, &f.writer, &f.clock).unwrap();
    assert_eq!(s.result().results[0].status, CommandStatus::Success);
    drive(&f, &mut s, 3);
    assert_eq!(s.result().success_count, 2);
  }

  #[test]
  fn waiting_command_times_out_at_cap() {
    let mut f = fixture();
    f.registry
      .register("never", |_| {
        Ok(Completion::WaitingOn(
          PendingCompletion::new(json!({"artifactPath": "y"}), || Ok(false))
            .with_timeout_cap(Duration::from_millis(100)),
        ))
      })
      .unwrap();
    let mut s = session(&f, None, vec![cmd("c1", "never")]);
    s.tick(&f.registry, &f.writer, &f.clock).unwrap();
    f.clock.advance(Duration::from_millis(100));
    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Waiting
    );
    f.clock.advance(Duration::from_millis(1));
    s.tick(&f.registry, &f.writer, &f.clock).unwrap();
    let slot = &s.result().results[0];
    assert_eq!(slot.error.as_ref().unwrap().code, ErrorKind::Timeout);
    assert!(slot.result.is_none());
  }

  #[test]
  fn batch_timeout_while_waiting_skips_the_waiter() {
    let mut f = fixture();
    f.registry
      .register("never", |_| {
        Ok(Completion::WaitingOn(PendingCompletion::new(
          json!({"artifactPath": "z"}),
          || Ok(false),
        )))
      })
      .unwrap();
    let mut s = session(&f, Some(500), vec![cmd("c1", "never"), cmd("c2", "noop")]);
    s.tick(&f.registry, &f.writer, &f.clock).unwrap();
    f.clock.advance(Duration::from_millis(600));
    assert_eq!(
      s.tick(&f.registry, &f.writer, &f.clock).unwrap(),
      SessionTick::Completed
    );
    for slot in &s.result().results {
      assert_eq!(slot.error.as_ref().unwrap().code, ErrorKind::Skipped);
      assert!(slot.result.is_none());
    }
  }

  #[test]
  fn handler_sees_batch_context() {
    let mut f = fixture();
    let seen = Rc::new(Cell::new((0usize, false)));
    let sink = seen.clone();
    f.registry
      .register("ctx", move |inv| {
        sink.set((inv.same_kind_count, inv.batch_id == "b1" && inv.results_dir.is_some()));
        Ok(Completion::Ready(json!({})))
      })
      .unwrap();
    let mut s = session(&f, None, vec![cmd("c1", "ctx"), cmd("c2", "CTX")]);
    drive(&f, &mut s, 5);
    assert_eq!(seen.get(), (2, true));
  }
}
