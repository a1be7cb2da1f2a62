use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::{self, AppContext};
use crate::log_info;
use crate::utils::log::t;

pub fn run(ctx: &AppContext) -> Result<()> {
  let root = ctx.paths.root();
  ctx.paths.ensure_dirs()?;

  let config_path = config::project_config_path(root);
  let created = ensure_file(&config_path, config::config_template())?;

  log_info!("Data directories ready under {}", t::path(ctx.paths.data_dir().display()));
  if created {
    log_info!("Created project config:");
    log_info!("  {}", t::path(display_relative(root, &config_path)));
  }
  Ok(())
}

/// Write `contents` unless the file exists. Returns true when it was created.
fn ensure_file(path: &Path, contents: &str) -> Result<bool> {
  if path.exists() {
    return Ok(false);
  }
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
  }
  fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
  Ok(true)
}

fn display_relative(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .display()
    .to_string()
}
