use std::fs;
use std::io::Read as _;

use anyhow::{Context, Result, bail};

use crate::batch::{is_safe_id, parse_and_validate};
use crate::config::AppContext;
use crate::log_info;
use crate::utils::error_messages;

/// Validate a batch and move it into `pending/` in one rename.
pub fn run(ctx: &AppContext, source: &str, id: Option<&str>) -> Result<()> {
  let bytes = read_source(source)?;
  let request = match parse_and_validate(&bytes) {
    Ok(request) => request,
    Err(err) => bail!(error_messages::invalid_batch(err)),
  };

  let file_id = id.unwrap_or(&request.batch_id);
  if !is_safe_id(file_id) {
    bail!(error_messages::SUBMIT_ID_UNSAFE);
  }

  ctx.paths.ensure_dirs()?;
  let dest = ctx.paths.pending_file(file_id);
  if dest.exists() {
    bail!(error_messages::already_pending(file_id));
  }
  let tmp = dest.with_extension("json.tmp");
  fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
  if let Err(err) = fs::rename(&tmp, &dest) {
    let _ = fs::remove_file(&tmp);
    return Err(err).with_context(|| format!("failed to move batch into {}", dest.display()));
  }

  // Plain id on stdout so scripts can pass it to `hostbridge result`.
  log_info!("{}", request.batch_id);
  Ok(())
}

fn read_source(source: &str) -> Result<Vec<u8>> {
  if source == "-" {
    let mut buf = Vec::new();
    std::io::stdin()
      .read_to_end(&mut buf)
      .context(error_messages::STDIN_READ_FAILED)?;
    return Ok(buf);
  }
  fs::read(source).with_context(|| format!("failed to read {source}"))
}
