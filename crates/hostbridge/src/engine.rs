use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::batch::parse_and_validate;
use crate::clock::{Clock, SystemClock};
use crate::config::{BridgeConfig, BridgePaths};
use crate::error::CommandError;
use crate::protocol::timestamp_now;
use crate::queue::{PendingItem, PendingQueue};
use crate::registry::CommandRegistry;
use crate::scheduler::{BatchSession, SessionTick};
use crate::watcher::PendingWatcher;
use crate::writer::ResultWriter;

/// Timing knobs for the engine, taken from [`BridgeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
  pub default_timeout_ms: u64,
  pub rescan_interval: Duration,
  pub read_retry_delays: Vec<Duration>,
  pub max_results: usize,
  pub pretty: bool,
}

impl From<&BridgeConfig> for EngineSettings {
  fn from(cfg: &BridgeConfig) -> Self {
    Self {
      default_timeout_ms: cfg.batch.default_timeout_ms,
      rescan_interval: cfg.queue.rescan_interval(),
      read_retry_delays: cfg.queue.read_retry_delays(),
      max_results: cfg.results.max_results,
      pretty: cfg.results.pretty,
    }
  }
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self::from(&BridgeConfig::default())
  }
}

/// What a single [`Engine::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
  /// Nothing to do.
  Idle,
  /// A batch was read, validated and its first snapshot published.
  Started(String),
  /// The active batch moved forward.
  Progressed(String),
  /// The active batch is waiting on an external completion.
  Waiting(String),
  /// The active batch finished and its result is terminal.
  Completed(String),
  /// A pending file was rejected with an intake-level error result.
  Rejected(String),
  /// A pending file could not be read yet and will be retried.
  Deferred(String),
  /// A pending file was dropped without publishing anything.
  Dropped(String),
}

/// Owns the queue, registry, writer and at most one active batch.
///
/// Everything here runs on the host thread. The only cross-thread input is the watcher inbox.
pub struct Engine {
  paths: BridgePaths,
  settings: EngineSettings,
  registry: CommandRegistry,
  writer: ResultWriter,
  queue: PendingQueue,
  clock: Arc<dyn Clock>,
  session: Option<BatchSession>,
  watcher: Option<PendingWatcher>,
  last_rescan: Instant,
}

impl std::fmt::Debug for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Engine")
      .field("paths", &self.paths)
      .field("queued", &self.queue.len())
      .field("session", &self.session)
      .field("watching", &self.watcher.is_some())
      .finish_non_exhaustive()
  }
}

impl Engine {
  /// Create the directories, clean stale temp files and run the initial scan.
  ///
  /// # Errors
  /// Fails when the data directories cannot be created or listed.
  pub fn new(paths: BridgePaths, settings: EngineSettings, registry: CommandRegistry) -> Result<Self> {
    Self::with_clock(paths, settings, registry, Arc::new(SystemClock))
  }

  /// Same as [`Engine::new`] with an explicit time source.
  ///
  /// # Errors
  /// Fails when the data directories cannot be created or listed.
  pub fn with_clock(
    paths: BridgePaths,
    settings: EngineSettings,
    registry: CommandRegistry,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    paths.ensure_dirs()?;
    let writer = ResultWriter::new(paths.clone(), settings.max_results, settings.pretty);
    let stale = writer.remove_stale_temp_files()?;
    if stale > 0 {
      info!("Removed {stale} stale temporary result file(s)");
    }
    let mut queue = PendingQueue::new();
    let found = queue.rescan_all(&paths.pending_dir())?;
    if found > 0 {
      info!("Found {found} pending batch(es)");
    }
    let last_rescan = clock.now();
    Ok(Self {
      paths,
      settings,
      registry,
      writer,
      queue,
      clock,
      session: None,
      watcher: None,
      last_rescan,
    })
  }

  /// Start watching `pending/` for new files.
  ///
  /// # Errors
  /// Fails when the platform watcher cannot be set up.
  pub fn watch(&mut self) -> Result<()> {
    self.watcher = Some(PendingWatcher::start(&self.paths.pending_dir())?);
    Ok(())
  }

  #[must_use]
  pub fn paths(&self) -> &BridgePaths {
    &self.paths
  }

  #[must_use]
  pub fn registry(&self) -> &CommandRegistry {
    &self.registry
  }

  #[must_use]
  pub fn writer(&self) -> &ResultWriter {
    &self.writer
  }

  #[must_use]
  pub fn queued(&self) -> usize {
    self.queue.len()
  }

  #[must_use]
  pub fn active_batch(&self) -> Option<&str> {
    self.session.as_ref().map(BatchSession::batch_id)
  }

  /// No active batch and nothing queued, including items waiting out a retry backoff.
  #[must_use]
  pub fn is_idle(&self) -> bool {
    self.session.is_none() && self.queue.is_empty()
  }

  /// Enqueue a path discovered outside the watcher, e.g. by `submit` in the same process.
  pub fn notify_path(&mut self, path: &Path) -> bool {
    self.admit(path)
  }

  /// Run one non-blocking step.
  pub fn tick(&mut self) -> TickOutcome {
    self.collect_discoveries();
    if self.session.is_some() {
      return self.tick_session();
    }
    let now = self.clock.now();
    match self.queue.dequeue(now) {
      Some(item) => self.intake(item),
      None => TickOutcome::Idle,
    }
  }

  /// Tick until idle or `max_ticks` is reached. Returns the number of ticks run.
  pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
    for n in 0..max_ticks {
      if self.is_idle() {
        return n;
      }
      self.tick();
    }
    max_ticks
  }

  fn collect_discoveries(&mut self) {
    let discovered = self
      .watcher
      .as_ref()
      .map(PendingWatcher::drain)
      .unwrap_or_default();
    for path in discovered {
      self.admit(&path);
    }

    let now = self.clock.now();
    if now.saturating_duration_since(self.last_rescan) >= self.settings.rescan_interval {
      self.last_rescan = now;
      self.rescan();
    }
  }

  fn rescan(&mut self) {
    let dir = self.paths.pending_dir();
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(err) => {
        warn!("Rescan of {} failed: {err}", dir.display());
        return;
      }
    };
    for entry in entries.flatten() {
      self.admit(&entry.path());
    }
  }

  // The active batch's own file stays in pending/ until it is archived; never queue it twice.
  fn admit(&mut self, path: &Path) -> bool {
    if self.session.as_ref().is_some_and(|s| s.source() == path) {
      return false;
    }
    self.queue.enqueue(path)
  }

  fn tick_session(&mut self) -> TickOutcome {
    let Some(session) = self.session.as_mut() else {
      return TickOutcome::Idle;
    };
    let id = session.batch_id().to_string();
    match session.tick(&self.registry, &self.writer, self.clock.as_ref()) {
      Ok(SessionTick::Progressed) => TickOutcome::Progressed(id),
      Ok(SessionTick::Waiting) => TickOutcome::Waiting(id),
      Ok(SessionTick::Completed) => {
        self.session = None;
        TickOutcome::Completed(id)
      }
      Err(err) => {
        self.abandon_session(&err);
        TickOutcome::Completed(id)
      }
    }
  }

  fn abandon_session(&mut self, cause: &anyhow::Error) {
    let Some(session) = self.session.take() else {
      return;
    };
    let id = session.batch_id().to_string();
    error!("Batch {id} failed: {cause:#}");
    if let Err(err) = session.abandon(&self.writer, cause) {
      error!("Could not record failure of batch {id}: {err:#}");
    }
  }

  fn intake(&mut self, item: PendingItem) -> TickOutcome {
    let started_at = timestamp_now();
    let bytes = match fs::read(&item.source_path) {
      Ok(bytes) => bytes,
      Err(err) if err.kind() == IoErrorKind::NotFound => {
        debug!("Pending file {} vanished", item.source_path.display());
        return TickOutcome::Dropped(item.id);
      }
      Err(err) => {
        let failure = CommandError::runtime("failed to read pending batch file")
          .with_detail(err.to_string());
        return self.retry_or_reject(item, started_at, failure);
      }
    };

    let request = match parse_and_validate(&bytes) {
      Ok(request) => request,
      Err(err) if err.code.is_transient_read_failure() => {
        return self.retry_or_reject(item, started_at, err);
      }
      Err(err) => return self.reject(&item, started_at, err),
    };

    let batch_id = request.batch_id.clone();
    if self.writer.has_terminal_result(&batch_id) {
      return self.drop_duplicate(&item.source_path, batch_id);
    }

    let session = BatchSession::start(
      request,
      item.source_path,
      self.settings.default_timeout_ms,
      self.clock.now(),
    );
    let published = self.writer.publish_processing(session.result());
    self.session = Some(session);
    if let Err(err) = published {
      self.abandon_session(&err);
      return TickOutcome::Completed(batch_id);
    }
    TickOutcome::Started(batch_id)
  }

  fn retry_or_reject(
    &mut self,
    item: PendingItem,
    started_at: String,
    failure: CommandError,
  ) -> TickOutcome {
    let now = self.clock.now();
    let id = item.id.clone();
    match self
      .queue
      .reschedule(item, &self.settings.read_retry_delays, now)
    {
      Ok(delay) => {
        debug!("Pending file {id} not readable yet ({failure}); retrying in {delay:?}");
        TickOutcome::Deferred(id)
      }
      Err(item) => self.reject(&item, started_at, failure),
    }
  }

  /// Archives an input whose id already has a completed result. The result stays as it is.
  fn drop_duplicate(&self, source: &Path, batch_id: String) -> TickOutcome {
    warn!("Batch {batch_id} already has a completed result; archiving duplicate input");
    if let Err(err) = self.writer.archive(source, &batch_id) {
      error!("Failed to archive duplicate batch {batch_id}: {err:#}");
    }
    TickOutcome::Dropped(batch_id)
  }

  fn reject(&mut self, item: &PendingItem, started_at: String, error: CommandError) -> TickOutcome {
    // An unreadable file named after a finished batch must not clobber that batch's result.
    if self.writer.has_terminal_result(&item.id) {
      return self.drop_duplicate(&item.source_path, item.id.clone());
    }
    if let Err(err) =
      self
        .writer
        .publish_intake_error(&item.id, &item.source_path, started_at, error)
    {
      error!("Failed to publish intake error for {}: {err:#}", item.id);
    }
    TickOutcome::Rejected(item.id.clone())
  }
}
