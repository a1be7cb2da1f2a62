use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};

use crate::config::AppContext;
use crate::engine::{Engine, EngineSettings};
use crate::handlers::log_query;
use crate::logging::{LOG_BUFFER_CAPACITY, LogBuffer, init_logging};
use crate::plugins::PluginLoader;
use crate::registry::CommandRegistry;
use crate::utils::error_messages;
use crate::utils::log::t;
use crate::{log_info, log_warn};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub exit_when_idle: bool,
  pub max_ticks: Option<usize>,
}

pub fn run(ctx: &AppContext, opts: &RunOptions) -> Result<()> {
  let buffer = LogBuffer::new(LOG_BUFFER_CAPACITY);
  if !init_logging(&buffer) {
    log_warn!("A logger is already installed; log.query will see no entries");
  }

  let mut registry = CommandRegistry::new();
  registry.disable(&ctx.config.commands.disabled);
  let report = PluginLoader::new().load(&mut registry, &buffer, Vec::new());
  if !report.functional {
    log_warn!("{}", error_messages::no_functional_commands(log_query::KIND));
  }

  let mut engine = Engine::new(
    ctx.paths.clone(),
    EngineSettings::from(&ctx.config),
    registry,
  )?;
  if let Err(err) = engine.watch() {
    warn!("File watcher unavailable, relying on periodic rescans: {err:#}");
  }
  log_info!(
    "Watching {} for batches",
    t::path(ctx.paths.pending_dir().display())
  );

  let frame = Duration::from_millis(ctx.config.host.tick_interval_ms);
  let mut ticks = 0usize;
  loop {
    if opts.exit_when_idle && engine.is_idle() {
      break;
    }
    if opts.max_ticks.is_some_and(|max| ticks >= max) {
      break;
    }
    engine.tick();
    ticks += 1;
    thread::sleep(frame);
  }
  info!("Host loop stopped after {ticks} tick(s)");
  Ok(())
}
