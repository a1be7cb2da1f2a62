use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use log::debug;
use serde_json::Value;

use crate::error::CommandError;

/// Priority used when a registration does not name one. Lower numbers win.
pub const DEFAULT_PRIORITY: i32 = 100;
/// Priority of the built-in commands, which plugins cannot shadow.
pub const CORE_PRIORITY: i32 = 0;

/// One handler call: the command plus the batch it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
  pub kind: &'a str,
  pub params: &'a Value,
  pub batch_id: &'a str,
  pub command_id: &'a str,
  /// Commands of this type in the whole batch, including this one.
  pub same_kind_count: usize,
  pub results_dir: Option<&'a Path>,
}

impl<'a> Invocation<'a> {
  #[must_use]
  pub fn new(kind: &'a str, params: &'a Value) -> Self {
    Self {
      kind,
      params,
      batch_id: "",
      command_id: "",
      same_kind_count: 1,
      results_dir: None,
    }
  }

  #[must_use]
  pub fn in_batch(mut self, batch_id: &'a str, command_id: &'a str, same_kind_count: usize) -> Self {
    self.batch_id = batch_id;
    self.command_id = command_id;
    self.same_kind_count = same_kind_count;
    self
  }

  #[must_use]
  pub fn with_results_dir(mut self, dir: &'a Path) -> Self {
    self.results_dir = Some(dir);
    self
  }
}

type ReadyCheck = Box<dyn FnMut() -> Result<bool, CommandError>>;

/// Work a handler started whose outcome becomes observable later.
pub struct PendingCompletion {
  pub placeholder: Value,
  /// Upper bound on the command timeout while waiting.
  pub timeout_cap: Option<Duration>,
  ready: ReadyCheck,
}

impl PendingCompletion {
  pub fn new(
    placeholder: Value,
    ready: impl FnMut() -> Result<bool, CommandError> + 'static,
  ) -> Self {
    Self {
      placeholder,
      timeout_cap: None,
      ready: Box::new(ready),
    }
  }

  #[must_use]
  pub fn with_timeout_cap(mut self, cap: Duration) -> Self {
    self.timeout_cap = Some(cap);
    self
  }

  /// Non-blocking readiness check.
  ///
  /// # Errors
  /// Whatever the handler's predicate reports.
  pub fn poll(&mut self) -> Result<bool, CommandError> {
    (self.ready)()
  }
}

impl fmt::Debug for PendingCompletion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingCompletion")
      .field("placeholder", &self.placeholder)
      .field("timeout_cap", &self.timeout_cap)
      .finish_non_exhaustive()
  }
}

/// What a handler returns on success.
#[derive(Debug)]
pub enum Completion {
  Ready(Value),
  WaitingOn(PendingCompletion),
}

pub type Handler = Box<dyn Fn(&Invocation<'_>) -> Result<Completion, CommandError>>;

struct RegistryEntry {
  kind: String,
  priority: i32,
  handler: Handler,
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
  Registered,
  /// A weaker (higher number) handler was replaced.
  Replaced,
  /// An equal or stronger handler already exists.
  Ignored,
  Disabled,
}

/// Command type to handler map. Type lookups ignore ASCII case.
///
/// Filled during startup and only read while batches run.
#[derive(Default)]
pub struct CommandRegistry {
  entries: HashMap<String, RegistryEntry>,
  disabled: HashSet<String>,
}

impl fmt::Debug for CommandRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CommandRegistry")
      .field("kinds", &self.kinds())
      .field("disabled", &self.disabled)
      .finish()
  }
}

fn key_of(kind: &str) -> String {
  kind.to_ascii_lowercase()
}

impl CommandRegistry {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Refuse future registrations of these types.
  pub fn disable<I, S>(&mut self, kinds: I)
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for kind in kinds {
      let key = key_of(kind.as_ref().trim());
      if !key.is_empty() {
        self.entries.remove(&key);
        self.disabled.insert(key);
      }
    }
  }

  /// Register with [`DEFAULT_PRIORITY`].
  ///
  /// # Errors
  /// Fails for an empty command type.
  pub fn register<F>(&mut self, kind: &str, handler: F) -> Result<Registration>
  where
    F: Fn(&Invocation<'_>) -> Result<Completion, CommandError> + 'static,
  {
    self.register_with_priority(kind, DEFAULT_PRIORITY, handler)
  }

  /// # Errors
  /// Fails for an empty command type.
  pub fn register_with_priority<F>(
    &mut self,
    kind: &str,
    priority: i32,
    handler: F,
  ) -> Result<Registration>
  where
    F: Fn(&Invocation<'_>) -> Result<Completion, CommandError> + 'static,
  {
    self.insert_entry(RegistryEntry {
      kind: kind.trim().to_string(),
      priority,
      handler: Box::new(handler),
    })
  }

  fn insert_entry(&mut self, entry: RegistryEntry) -> Result<Registration> {
    if entry.kind.is_empty() {
      bail!("command type must not be empty");
    }
    let key = key_of(&entry.kind);
    if self.disabled.contains(&key) {
      debug!("Command {} is disabled", entry.kind);
      return Ok(Registration::Disabled);
    }
    let outcome = match self.entries.get(&key) {
      None => Registration::Registered,
      Some(existing) if entry.priority < existing.priority => Registration::Replaced,
      Some(existing) => {
        debug!(
          "Ignoring {} at priority {}; priority {} already registered",
          entry.kind, entry.priority, existing.priority
        );
        return Ok(Registration::Ignored);
      }
    };
    self.entries.insert(key, entry);
    Ok(outcome)
  }

  /// Fold another registry's handlers into this one using the usual priority rules.
  pub fn merge(&mut self, other: CommandRegistry) -> Vec<(String, Registration)> {
    let mut entries: Vec<RegistryEntry> = other.entries.into_values().collect();
    entries.sort_by(|a, b| a.kind.cmp(&b.kind));
    entries
      .into_iter()
      .filter_map(|entry| {
        let kind = entry.kind.clone();
        self.insert_entry(entry).ok().map(|r| (kind, r))
      })
      .collect()
  }

  /// Dispatch to the handler for `invocation.kind`. Does not time or catch anything.
  ///
  /// # Errors
  /// `UnknownType` when nothing is registered, otherwise whatever the handler returns.
  pub fn execute(&self, invocation: &Invocation<'_>) -> Result<Completion, CommandError> {
    let entry = self
      .entries
      .get(&key_of(invocation.kind))
      .ok_or_else(|| CommandError::unknown_type(invocation.kind))?;
    (entry.handler)(invocation)
  }

  #[must_use]
  pub fn contains(&self, kind: &str) -> bool {
    self.entries.contains_key(&key_of(kind))
  }

  #[must_use]
  pub fn priority_of(&self, kind: &str) -> Option<i32> {
    self.entries.get(&key_of(kind)).map(|e| e.priority)
  }

  /// Registered types in their registered spelling, sorted.
  #[must_use]
  pub fn kinds(&self) -> Vec<String> {
    let mut kinds: Vec<String> = self.entries.values().map(|e| e.kind.clone()).collect();
    kinds.sort();
    kinds
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
