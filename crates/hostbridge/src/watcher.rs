use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::queue::is_pending_batch_file;

const INBOX_CAPACITY: usize = 1024;

/// Watches the pending directory on notify's own thread and forwards candidate paths.
///
/// The watcher thread only pushes into a bounded channel; the scheduler drains it. When the
/// channel is full the path is dropped and left to the periodic rescan.
pub struct PendingWatcher {
  _watcher: RecommendedWatcher,
  inbox: Receiver<PathBuf>,
}

impl std::fmt::Debug for PendingWatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingWatcher")
      .field("queued", &self.inbox.len())
      .finish_non_exhaustive()
  }
}

impl PendingWatcher {
  /// # Errors
  /// Fails when the platform watcher cannot be created or `dir` cannot be watched.
  pub fn start(dir: &Path) -> Result<Self> {
    let (tx, rx) = bounded(INBOX_CAPACITY);
    let mut watcher = build_notify_watcher(tx).context("failed to create file watcher")?;
    watcher
      .watch(dir, RecursiveMode::NonRecursive)
      .with_context(|| format!("failed to watch {}", dir.display()))?;
    debug!("Watching {}", dir.display());
    Ok(Self {
      _watcher: watcher,
      inbox: rx,
    })
  }

  /// Take every path reported since the last call.
  pub fn drain(&self) -> Vec<PathBuf> {
    self.inbox.try_iter().collect()
  }
}

fn build_notify_watcher(tx: Sender<PathBuf>) -> notify::Result<RecommendedWatcher> {
  notify::recommended_watcher(move |event: notify::Result<Event>| match event {
    Ok(event) => {
      for path in candidate_paths(event) {
        match tx.try_send(path) {
          Ok(()) => {}
          Err(TrySendError::Full(path)) => {
            debug!("Watch inbox full, leaving {} to rescan", path.display());
          }
          Err(TrySendError::Disconnected(_)) => return,
        }
      }
    }
    Err(err) => warn!("File watcher error: {err}"),
  })
}

/// Paths that may now hold a complete batch file.
fn candidate_paths(event: Event) -> Vec<PathBuf> {
  let Event { kind, paths, .. } = event;
  let paths = match kind {
    EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => paths.into_iter().skip(1).collect(),
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Vec::new(),
    EventKind::Create(_) | EventKind::Modify(_) => paths,
    _ => Vec::new(),
  };
  paths
    .into_iter()
    .filter(|p| is_pending_batch_file(p))
    .collect()
}
