//! Built-in commands, registered at core priority so plugins cannot shadow them.

pub mod artifact;
pub mod log_query;
pub mod system;

use anyhow::Result;

use crate::logging::LogBuffer;
use crate::registry::{CORE_PRIORITY, CommandRegistry, Registration};

pub use system::CommandCatalog;

/// Register the core commands. Returns how many ended up registered.
///
/// # Errors
/// Only on an invalid (empty) command type, which the built-ins never use.
pub fn register_core(
  registry: &mut CommandRegistry,
  buffer: &LogBuffer,
  catalog: &CommandCatalog,
) -> Result<usize> {
  let outcomes = [
    registry.register_with_priority(
      log_query::KIND,
      CORE_PRIORITY,
      log_query::handler(buffer.clone()),
    )?,
    registry.register_with_priority(artifact::KIND, CORE_PRIORITY, artifact::handle)?,
    registry.register_with_priority(system::PING, CORE_PRIORITY, system::ping)?,
    registry.register_with_priority(
      system::COMMANDS,
      CORE_PRIORITY,
      system::commands(catalog.clone()),
    )?,
  ];
  Ok(
    outcomes
      .iter()
      .filter(|o| matches!(o, Registration::Registered | Registration::Replaced))
      .count(),
  )
}
