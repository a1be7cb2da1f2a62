use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::AppContext;
use crate::log_info;
use crate::queue::is_pending_batch_file;
use crate::utils::log::t;
use crate::writer::read_result_file;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusCounts {
  pub pending: usize,
  pub processing: usize,
  pub completed: usize,
  pub done: usize,
}

pub fn run(ctx: &AppContext) -> Result<()> {
  let counts = collect(ctx)?;
  log_info!("Data dir:   {}", t::path(ctx.paths.data_dir().display()));
  log_info!("Pending:    {}", t::count(counts.pending));
  log_info!("Processing: {}", t::count(counts.processing));
  log_info!("Completed:  {}", t::count(counts.completed));
  log_info!("Archived:   {}", t::count(counts.done));
  Ok(())
}

/// Count batch files per directory. Missing directories count as empty.
pub fn collect(ctx: &AppContext) -> Result<StatusCounts> {
  let mut counts = StatusCounts {
    pending: json_files(&ctx.paths.pending_dir())?.len(),
    done: json_files(&ctx.paths.done_dir())?.len(),
    ..StatusCounts::default()
  };
  for path in json_files(&ctx.paths.results_dir())? {
    match read_result_file(&path) {
      Ok(Some(r)) if r.is_terminal() => counts.completed += 1,
      Ok(Some(_)) => counts.processing += 1,
      Ok(None) | Err(_) => {}
    }
  }
  Ok(counts)
}

fn json_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
  if !dir.exists() {
    return Ok(Vec::new());
  }
  let entries = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
  Ok(
    entries
      .filter_map(|e| e.ok().map(|e| e.path()))
      .filter(|p| is_pending_batch_file(p))
      .collect(),
  )
}
