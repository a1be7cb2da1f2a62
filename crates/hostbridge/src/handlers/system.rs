use std::cell::OnceCell;
use std::rc::Rc;

use serde_json::json;

use crate::error::CommandError;
use crate::protocol::timestamp_now;
use crate::registry::{Completion, Invocation};

pub const PING: &str = "system.ping";
pub const COMMANDS: &str = "system.commands";

/// Registered command types, filled once loading is finished.
pub type CommandCatalog = Rc<OnceCell<Vec<String>>>;

pub fn ping(_inv: &Invocation<'_>) -> Result<Completion, CommandError> {
  Ok(Completion::Ready(json!({ "pong": true, "at": timestamp_now() })))
}

pub fn commands(
  catalog: CommandCatalog,
) -> impl Fn(&Invocation<'_>) -> Result<Completion, CommandError> {
  move |_| {
    let kinds = catalog.get().cloned().unwrap_or_default();
    Ok(Completion::Ready(json!({ "commands": kinds })))
  }
}
