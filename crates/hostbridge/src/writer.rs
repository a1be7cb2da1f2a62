use std::fs::{self, File};
use std::io::{ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::BridgePaths;
use crate::error::CommandError;
use crate::protocol::{BatchResult, CommandStatus, timestamp_now};

const TMP_SUFFIX: &str = ".json.tmp";

/// Publishes batch state into `results/` and archives consumed inputs into `done/`.
#[derive(Debug, Clone)]
pub struct ResultWriter {
  paths: BridgePaths,
  max_results: usize,
  pretty: bool,
}

impl ResultWriter {
  /// `max_results` is raised to 1 so a just-published result is never swept away.
  #[must_use]
  pub fn new(paths: BridgePaths, max_results: usize, pretty: bool) -> Self {
    Self {
      paths,
      max_results: max_results.max(1),
      pretty,
    }
  }

  #[must_use]
  pub fn paths(&self) -> &BridgePaths {
    &self.paths
  }

  /// Replace the result file with a `processing` snapshot.
  ///
  /// # Errors
  /// Fails when the snapshot cannot be written or renamed into place.
  pub fn publish_processing(&self, result: &BatchResult) -> Result<()> {
    self.write_atomic(&result.batch_id, result)
  }

  /// Write the terminal result, archive the source, then run retention.
  ///
  /// # Errors
  /// Fails when the result cannot be written or the source cannot be archived. Retention
  /// failures are logged and swallowed.
  pub fn publish_terminal(&self, result: &BatchResult, source: &Path) -> Result<()> {
    self.write_atomic(&result.batch_id, result)?;
    self.archive(source, &result.batch_id)?;
    if let Err(err) = self.sweep_retention() {
      debug!("Retention sweep failed: {err:#}");
    }
    Ok(())
  }

  /// Publish a terminal result for a batch that never reached the scheduler.
  ///
  /// # Errors
  /// Same as [`ResultWriter::publish_terminal`].
  pub fn publish_intake_error(
    &self,
    batch_id: &str,
    source: &Path,
    started_at: String,
    error: CommandError,
  ) -> Result<()> {
    warn!("Rejected batch {batch_id}: {error}");
    let result = BatchResult::intake_error(batch_id, started_at, timestamp_now(), error);
    self.publish_terminal(&result, source)
  }

  /// Move a consumed pending file into `done/{id}.json`. A missing source is not an error.
  ///
  /// When `done/{id}.json` is already taken the input lands in `done/{id}.{n}.json` instead, so
  /// an earlier archived input is never replaced.
  ///
  /// # Errors
  /// Fails when the file exists but can be neither renamed nor copied.
  pub fn archive(&self, source: &Path, id: &str) -> Result<PathBuf> {
    if !source.exists() {
      debug!("Nothing to archive at {}", source.display());
      return Ok(self.paths.done_file(id));
    }
    let dest = self.free_done_path(id);
    match fs::rename(source, &dest) {
      Ok(()) => {}
      Err(err) if err.kind() == IoErrorKind::NotFound => {
        debug!("Nothing to archive at {}", source.display());
        return Ok(dest);
      }
      Err(_) => {
        // rename can fail across devices; fall back to copy + remove
        fs::copy(source, &dest).with_context(|| {
          format!("failed to archive {} to {}", source.display(), dest.display())
        })?;
        fs::remove_file(source)
          .with_context(|| format!("failed to remove {}", source.display()))?;
      }
    }
    debug!("Archived {} to {}", source.display(), dest.display());
    Ok(dest)
  }

  // `.` is outside the safe id charset, so `{id}.{n}.json` never collides with another batch.
  fn free_done_path(&self, id: &str) -> PathBuf {
    let primary = self.paths.done_file(id);
    if !primary.exists() {
      return primary;
    }
    let done = self.paths.done_dir();
    (1u32..)
      .map(|n| done.join(format!("{id}.{n}.json")))
      .find(|p| !p.exists())
      .unwrap_or(primary)
  }

  /// Every archived input for `id`: `done/{id}.json` and its `done/{id}.{n}.json` siblings.
  #[must_use]
  pub fn archived_inputs(&self, id: &str) -> Vec<PathBuf> {
    let prefix = format!("{id}.");
    let Ok(entries) = fs::read_dir(self.paths.done_dir()) else {
      return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
      .flatten()
      .filter(|e| {
        let name = e.file_name();
        let name = name.to_string_lossy();
        name.strip_prefix(&prefix).is_some_and(|rest| {
          rest == "json"
            || rest
              .strip_suffix(".json")
              .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
      })
      .map(|e| e.path())
      .collect();
    found.sort();
    found
  }

  /// Read the current result for `id`, if any.
  ///
  /// # Errors
  /// Fails when the file exists but cannot be read or parsed.
  pub fn read_result(&self, id: &str) -> Result<Option<BatchResult>> {
    read_result_file(&self.paths.result_file(id))
  }

  /// True when a completed result for `id` is already published.
  #[must_use]
  pub fn has_terminal_result(&self, id: &str) -> bool {
    matches!(self.read_result(id), Ok(Some(r)) if r.is_terminal())
  }

  /// Remove `*.json.tmp` leftovers from interrupted writes. Returns how many were removed.
  ///
  /// # Errors
  /// Fails when the results directory cannot be listed.
  pub fn remove_stale_temp_files(&self) -> Result<usize> {
    let dir = self.paths.results_dir();
    let entries =
      fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
    let mut removed = 0;
    for entry in entries.flatten() {
      let path = entry.path();
      let is_tmp = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().ends_with(TMP_SUFFIX));
      if is_tmp && fs::remove_file(&path).is_ok() {
        debug!("Removed stale {}", path.display());
        removed += 1;
      }
    }
    Ok(removed)
  }

  /// Keep the newest `max_results` completed results; delete older ones with their archives.
  ///
  /// `processing` results and unreadable files are never deleted. Returns the number of results
  /// removed.
  ///
  /// # Errors
  /// Fails when the results directory cannot be listed. Per-file failures are skipped.
  pub fn sweep_retention(&self) -> Result<usize> {
    let dir = self.paths.results_dir();
    let entries =
      fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;

    let mut terminal: Vec<(SystemTime, String, BatchResult)> = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      let Some(id) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        continue;
      };
      let Ok(Some(result)) = read_result_file(&path) else {
        continue;
      };
      if !result.is_terminal() {
        continue;
      }
      let modified = entry
        .metadata()
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
      terminal.push((modified, id, result));
    }

    if terminal.len() <= self.max_results {
      return Ok(0);
    }
    terminal.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    let mut removed = 0;
    for (_, id, result) in terminal.into_iter().skip(self.max_results) {
      if fs::remove_file(self.paths.result_file(&id)).is_err() {
        continue;
      }
      removed += 1;
      for archived in self.archived_inputs(&id) {
        let _ = fs::remove_file(archived);
      }
      for artifact in self.owned_artifacts(&result) {
        if fs::remove_file(&artifact).is_ok() {
          debug!("Removed artifact {}", artifact.display());
        }
      }
    }
    if removed > 0 {
      info!("Retention removed {removed} old result(s)");
    }
    Ok(removed)
  }

  // Artifacts referenced by successful commands that live inside the results directory.
  fn owned_artifacts(&self, result: &BatchResult) -> Vec<PathBuf> {
    let Ok(root) = self.paths.results_dir().canonicalize() else {
      return Vec::new();
    };
    result
      .results
      .iter()
      .filter(|r| r.status == CommandStatus::Success)
      .filter_map(|r| r.result.as_ref()?.get("artifactPath")?.as_str())
      .filter_map(|p| Path::new(p).canonicalize().ok())
      .filter(|p| p.starts_with(&root) && p.is_file())
      .collect()
  }

  fn write_atomic(&self, id: &str, result: &BatchResult) -> Result<()> {
    let dest = self.paths.result_file(id);
    let tmp = self.paths.results_dir().join(format!("{id}{TMP_SUFFIX}"));
    if tmp.exists() {
      let _ = fs::remove_file(&tmp);
    }

    let bytes = if self.pretty {
      serde_json::to_vec_pretty(result)
    } else {
      serde_json::to_vec(result)
    }
    .context("failed to serialize batch result")?;

    let mut file =
      File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    file
      .write_all(&bytes)
      .and_then(|()| file.sync_all())
      .with_context(|| format!("failed to write {}", tmp.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, &dest) {
      let _ = fs::remove_file(&tmp);
      return Err(err).with_context(|| format!("failed to move result into {}", dest.display()));
    }
    Ok(())
  }
}

/// Parse a result file. `Ok(None)` when it does not exist.
///
/// # Errors
/// Fails when the file cannot be read or is not a valid batch result.
pub fn read_result_file(path: &Path) -> Result<Option<BatchResult>> {
  let data = match fs::read(path) {
    Ok(d) => d,
    Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
    Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
  };
  let result = serde_json::from_slice(&data)
    .with_context(|| format!("invalid batch result in {}", path.display()))?;
  Ok(Some(result))
}
