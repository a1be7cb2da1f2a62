use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::batch::is_safe_id;
use crate::config::AppContext;
use crate::log_info;
use crate::protocol::BatchResult;
use crate::utils::error_messages;
use crate::writer::read_result_file;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Print a batch result. With `wait_ms`, poll until it is completed.
pub fn run(ctx: &AppContext, batch_id: &str, wait_ms: Option<u64>) -> Result<()> {
  if !is_safe_id(batch_id) {
    bail!(error_messages::result_id_unsafe(batch_id));
  }
  let path = ctx.paths.result_file(batch_id);
  let Some(timeout_ms) = wait_ms else {
    let Some(result) = read_result_file(&path)? else {
      bail!(error_messages::result_not_found(batch_id));
    };
    return print(&result);
  };

  let deadline = Instant::now() + Duration::from_millis(timeout_ms);
  loop {
    // A reader can race the writer's rename on some platforms; treat a failed parse as not ready.
    if let Ok(Some(result)) = read_result_file(&path)
      && result.is_terminal()
    {
      return print(&result);
    }
    if Instant::now() >= deadline {
      bail!(error_messages::result_wait_timed_out(batch_id, timeout_ms));
    }
    thread::sleep(POLL_INTERVAL);
  }
}

fn print(result: &BatchResult) -> Result<()> {
  log_info!("{}", serde_json::to_string_pretty(result)?);
  Ok(())
}
