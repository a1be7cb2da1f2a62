use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use log::debug;

use crate::batch::sanitize_id;

/// A discovered pending batch file waiting to be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
  /// File stem of the pending file, mapped onto the safe id charset.
  pub id: String,
  pub source_path: PathBuf,
  pub discovered_at: SystemTime,
  /// Number of failed read attempts so far.
  pub attempt: u32,
  pub not_before: Option<Instant>,
}

impl PendingItem {
  fn from_path(path: &Path) -> Option<Self> {
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() {
      return None;
    }
    let discovered_at = meta
      .created()
      .or_else(|_| meta.modified())
      .unwrap_or_else(|_| SystemTime::now());
    let stem = path.file_stem()?.to_string_lossy();
    Some(Self {
      id: sanitize_id(&stem),
      source_path: path.to_path_buf(),
      discovered_at,
      attempt: 0,
      not_before: None,
    })
  }

  fn is_due(&self, now: Instant) -> bool {
    self.not_before.is_none_or(|t| t <= now)
  }

  fn order_key(&self) -> (SystemTime, &str) {
    (self.discovered_at, self.id.as_str())
  }
}

/// Only `*.json` files are batches; `*.json.tmp` and anything else is ignored.
#[must_use]
pub fn is_pending_batch_file(path: &Path) -> bool {
  path.extension().is_some_and(|ext| ext == "json")
}

/// Ordered, deduplicated pending work owned by the scheduler thread.
///
/// Items are kept ascending by `(creation time, id)`. Items that failed a read sit pinned at the
/// front until they are retried, so everything discovered after them keeps its place.
#[derive(Debug, Default)]
pub struct PendingQueue {
  items: VecDeque<PendingItem>,
  known: HashSet<PathBuf>,
}

impl PendingQueue {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue `path` unless it is already queued. Returns whether a new item was added.
  pub fn enqueue(&mut self, path: &Path) -> bool {
    if !is_pending_batch_file(path) || self.known.contains(path) {
      return false;
    }
    let Some(item) = PendingItem::from_path(path) else {
      return false;
    };
    debug!("Queued pending batch {}", item.id);
    self.known.insert(item.source_path.clone());
    self.insert_sorted(item);
    true
  }

  fn insert_sorted(&mut self, item: PendingItem) {
    let pinned = self.items.iter().take_while(|i| i.attempt > 0).count();
    let pos = self
      .items
      .iter()
      .skip(pinned)
      .position(|i| i.order_key() > item.order_key())
      .map_or(self.items.len(), |p| p + pinned);
    self.items.insert(pos, item);
  }

  /// Pop the head item if its backoff has elapsed.
  ///
  /// Only the head is considered: a retrying item blocks everything behind it until it is due.
  pub fn dequeue(&mut self, now: Instant) -> Option<PendingItem> {
    if !self.items.front()?.is_due(now) {
      return None;
    }
    let item = self.items.pop_front()?;
    self.known.remove(&item.source_path);
    Some(item)
  }

  /// Put a failed item back at the front with the next backoff delay.
  ///
  /// # Errors
  /// Hands the item back when every delay in `delays` has been used.
  pub fn reschedule(
    &mut self,
    mut item: PendingItem,
    delays: &[Duration],
    now: Instant,
  ) -> Result<Duration, PendingItem> {
    let Some(delay) = usize::try_from(item.attempt)
      .ok()
      .and_then(|i| delays.get(i))
      .copied()
    else {
      return Err(item);
    };
    item.attempt += 1;
    item.not_before = Some(now + delay);
    self.known.insert(item.source_path.clone());
    self.items.push_front(item);
    Ok(delay)
  }

  /// Enqueue every batch file in `dir`. Returns the number of newly queued items.
  ///
  /// # Errors
  /// Fails when the directory cannot be listed.
  pub fn rescan_all(&mut self, dir: &Path) -> Result<usize> {
    let entries =
      fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
      .filter_map(|e| e.ok().map(|e| e.path()))
      .filter(|p| is_pending_batch_file(p))
      .collect();
    paths.sort();
    Ok(paths.into_iter().filter(|p| self.enqueue(p)).count())
  }

  #[must_use]
  pub fn contains(&self, path: &Path) -> bool {
    self.known.contains(path)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.items.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Ids in queue order.
  #[must_use]
  pub fn ids(&self) -> Vec<String> {
    self.items.iter().map(|i| i.id.clone()).collect()
  }
}
