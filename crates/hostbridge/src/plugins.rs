use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::{Result, anyhow};
use log::{info, warn};

use crate::handlers::{self, CommandCatalog, log_query};
use crate::logging::LogBuffer;
use crate::registry::{CommandRegistry, DEFAULT_PRIORITY, Registration};

/// A bundle of optional commands registered after the core set.
pub trait CommandPlugin {
  fn name(&self) -> &str;

  /// Load order; lower loads first. Does not affect handler priority.
  fn priority(&self) -> i32 {
    DEFAULT_PRIORITY
  }

  /// Register this plugin's commands.
  ///
  /// # Errors
  /// Any error marks the whole plugin as failed and none of its commands are kept.
  fn register(&self, registry: &mut CommandRegistry) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginLoadReport {
  pub core_loaded: usize,
  /// Plugin names that registered cleanly, in load order.
  pub loaded: Vec<String>,
  /// `(plugin name, reason)` for plugins that errored or panicked.
  pub failed: Vec<(String, String)>,
  /// True when the minimum command set (`log.query`) is available.
  pub functional: bool,
}

/// Builds the command registry at startup.
#[derive(Debug, Default)]
pub struct PluginLoader {
  catalog: CommandCatalog,
}

impl PluginLoader {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the core commands, then each plugin in ascending priority order.
  ///
  /// Each plugin registers into a scratch registry that is merged only on success, so a failing
  /// plugin leaves nothing behind.
  pub fn load(
    &self,
    registry: &mut CommandRegistry,
    buffer: &LogBuffer,
    mut plugins: Vec<Box<dyn CommandPlugin>>,
  ) -> PluginLoadReport {
    let mut report = PluginLoadReport::default();
    match handlers::register_core(registry, buffer, &self.catalog) {
      Ok(n) => report.core_loaded = n,
      Err(err) => warn!("Failed to register core commands: {err:#}"),
    }

    plugins.sort_by_key(|p| p.priority());
    for plugin in plugins {
      let name = plugin.name().to_string();
      let mut scratch = CommandRegistry::new();
      match register_isolated(plugin.as_ref(), &mut scratch) {
        Ok(()) => {
          for (kind, outcome) in registry.merge(scratch) {
            if outcome == Registration::Ignored {
              info!("Plugin {name}: {kind} is already provided, keeping existing handler");
            }
          }
          report.loaded.push(name);
        }
        Err(err) => {
          warn!("Plugin {name} failed to load: {err:#}");
          report.failed.push((name, format!("{err:#}")));
        }
      }
    }

    report.functional = registry.contains(log_query::KIND);
    let _ = self.catalog.set(registry.kinds());
    info!(
      "Registered {} command(s): {} core, {} plugin(s) loaded, {} failed",
      registry.len(),
      report.core_loaded,
      report.loaded.len(),
      report.failed.len()
    );
    report
  }
}

fn register_isolated(plugin: &dyn CommandPlugin, scratch: &mut CommandRegistry) -> Result<()> {
  match catch_unwind(AssertUnwindSafe(|| plugin.register(scratch))) {
    Ok(result) => result,
    Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
  }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
