use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use owo_colors::OwoColorize as _;
use serde::Deserialize;
use toml::Value as TomlValue;

/// Environment override for `data_dir`.
pub const DATA_DIR_ENV: &str = "HOSTBRIDGE_DATA_DIR";

/// Directory (relative to the project root) holding the project config file.
pub const PROJECT_CONFIG_DIR: &str = ".hostbridge";
pub const CONFIG_FILE_NAME: &str = "hostbridge.toml";

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["data_dir", "queue", "batch", "results", "host", "commands"];

/// Known keys per section.
const KNOWN_SECTION_KEYS: &[(&str, &[&str])] = &[
  ("queue", &["rescan_interval_ms", "read_retry_delays_ms"]),
  ("batch", &["default_timeout_ms"]),
  ("results", &["max_results", "pretty"]),
  ("host", &["tick_interval_ms"]),
  ("commands", &["disabled"]),
];

const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/hostbridge.toml"));

/// Embedded config template with all options commented out for documentation.
const CONFIG_TEMPLATE: &str = include_str!(concat!(
  env!("CARGO_MANIFEST_DIR"),
  "/defaults/hostbridge.template.toml"
));

#[must_use]
pub fn config_template() -> &'static str {
  CONFIG_TEMPLATE
}

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix("hostbridge");
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join(CONFIG_FILE_NAME))
}

#[must_use]
pub fn project_config_path(root: &Path) -> PathBuf {
  root.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
  /// Fallback directory rescan period.
  pub rescan_interval_ms: u64,
  /// Backoff before each re-read of a pending file that failed to parse.
  pub read_retry_delays_ms: Vec<u64>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      rescan_interval_ms: 1000,
      read_retry_delays_ms: vec![1000, 2000, 4000],
    }
  }
}

impl QueueConfig {
  #[must_use]
  pub fn rescan_interval(&self) -> Duration {
    Duration::from_millis(self.rescan_interval_ms)
  }

  #[must_use]
  pub fn read_retry_delays(&self) -> Vec<Duration> {
    self
      .read_retry_delays_ms
      .iter()
      .copied()
      .map(Duration::from_millis)
      .collect()
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
  pub default_timeout_ms: u64,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      default_timeout_ms: crate::protocol::DEFAULT_BATCH_TIMEOUT_MS,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResultsConfig {
  /// Number of terminal results kept by the retention sweep.
  pub max_results: usize,
  pub pretty: bool,
}

impl Default for ResultsConfig {
  fn default() -> Self {
    Self {
      max_results: 20,
      pretty: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
  pub tick_interval_ms: u64,
}

impl Default for HostConfig {
  fn default() -> Self {
    Self {
      tick_interval_ms: 16,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandsConfig {
  /// Command types that are never registered.
  pub disabled: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
  /// Parent of `pending/`, `results/` and `done/`. Relative paths resolve against the project root.
  pub data_dir: String,
  pub queue: QueueConfig,
  pub batch: BatchConfig,
  pub results: ResultsConfig,
  pub host: HostConfig,
  pub commands: CommandsConfig,
}

impl Default for BridgeConfig {
  fn default() -> Self {
    Self {
      data_dir: PROJECT_CONFIG_DIR.to_string(),
      queue: QueueConfig::default(),
      batch: BatchConfig::default(),
      results: ResultsConfig::default(),
      host: HostConfig::default(),
      commands: CommandsConfig::default(),
    }
  }
}

/// Resolved on-disk layout for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePaths {
  root: PathBuf,
  data_dir: PathBuf,
}

impl BridgePaths {
  pub fn new(root: impl Into<PathBuf>, data_dir: impl AsRef<Path>) -> Self {
    let root = root.into();
    let data_dir = data_dir.as_ref();
    let data_dir = if data_dir.is_absolute() {
      data_dir.to_path_buf()
    } else {
      root.join(data_dir)
    };
    Self { root, data_dir }
  }

  #[must_use]
  pub fn from_config(root: impl Into<PathBuf>, cfg: &BridgeConfig) -> Self {
    Self::new(root, &cfg.data_dir)
  }

  #[must_use]
  pub fn root(&self) -> &Path {
    &self.root
  }

  #[must_use]
  pub fn data_dir(&self) -> &Path {
    &self.data_dir
  }

  #[must_use]
  pub fn pending_dir(&self) -> PathBuf {
    self.data_dir.join("pending")
  }

  #[must_use]
  pub fn results_dir(&self) -> PathBuf {
    self.data_dir.join("results")
  }

  #[must_use]
  pub fn done_dir(&self) -> PathBuf {
    self.data_dir.join("done")
  }

  #[must_use]
  pub fn pending_file(&self, id: &str) -> PathBuf {
    self.pending_dir().join(format!("{id}.json"))
  }

  #[must_use]
  pub fn result_file(&self, id: &str) -> PathBuf {
    self.results_dir().join(format!("{id}.json"))
  }

  #[must_use]
  pub fn done_file(&self, id: &str) -> PathBuf {
    self.done_dir().join(format!("{id}.json"))
  }

  /// Create `pending/`, `results/` and `done/` if missing.
  ///
  /// # Errors
  /// Fails when any directory cannot be created.
  pub fn ensure_dirs(&self) -> Result<()> {
    for dir in [self.pending_dir(), self.results_dir(), self.done_dir()] {
      fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct AppContext {
  pub paths: BridgePaths,
  pub config: BridgeConfig,
}

impl AppContext {
  /// Load config for `root` and resolve its paths.
  ///
  /// # Errors
  /// Propagates config loading failures.
  pub fn load(root: &Path) -> Result<Self> {
    let config = load_config(root)?;
    let paths = BridgePaths::from_config(root, &config);
    Ok(Self { paths, config })
  }
}

// Tables merge recursively; arrays and scalars replace, last wins.
fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (k, v) in overlay_tbl {
        match base_tbl.get_mut(&k) {
          Some(existing) => merge_values(existing, v),
          None => {
            base_tbl.insert(k, v);
          }
        }
      }
    }
    (base_slot, new_v) => *base_slot = new_v,
  }
}

/// Warn about unknown keys in a parsed TOML config file.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      eprintln!(
        "{}: unknown config key '{}' in {} (did you mean one of: {}?)",
        "warning".yellow(),
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  for (section, known) in KNOWN_SECTION_KEYS {
    let Some(TomlValue::Table(tbl)) = table.get(*section) else {
      continue;
    };
    for key in tbl.keys() {
      if !known.contains(&key.as_str()) {
        eprintln!(
          "{}: unknown config key '{}.{}' in {} (known keys: {})",
          "warning".yellow(),
          section,
          key,
          file_path.display(),
          known.join(", ")
        );
      }
    }
  }
}

fn read_toml(path: &Path) -> Result<TomlValue> {
  let data =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  toml::from_str(&data).with_context(|| format!("invalid TOML in {}", path.display()))
}

/// Load and merge configuration from defaults, global, and project files.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML, or if the merged config does not fit the expected shape.
pub fn load_config(root: &Path) -> Result<BridgeConfig> {
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  let xdg = xdg::BaseDirectories::with_prefix("hostbridge");
  if let Some(global_path) = xdg.find_config_file(CONFIG_FILE_NAME) {
    let val = read_toml(&global_path)?;
    warn_unknown_keys(&val, &global_path);
    merge_values(&mut merged, val);
  }

  let project_cfg = project_config_path(root);
  if project_cfg.exists() {
    let val = read_toml(&project_cfg)?;
    warn_unknown_keys(&val, &project_cfg);
    merge_values(&mut merged, val);
  }

  let mut cfg: BridgeConfig = merged
    .try_into()
    .context("failed to parse merged config")?;

  if let Ok(dir) = std::env::var(DATA_DIR_ENV)
    && !dir.trim().is_empty()
  {
    cfg.data_dir = dir;
  }
  Ok(cfg)
}

#[cfg(test)]
mod tests {
  use super::*;
  use temp_env::with_vars;

  fn isolated<R>(xdg: &Path, f: impl FnOnce() -> R) -> R {
    with_vars(
      [
        ("XDG_CONFIG_HOME", Some(xdg.display().to_string())),
        (DATA_DIR_ENV, None),
      ],
      f,
    )
  }

  #[test]
  fn embedded_defaults_match_default_impl() {
    let parsed: BridgeConfig = toml::from_str(DEFAULT_TOML).unwrap();
    assert_eq!(parsed, BridgeConfig::default());
  }

  #[test]
  fn template_parses_as_empty_config() {
    let parsed: BridgeConfig = toml::from_str(config_template()).unwrap();
    assert_eq!(parsed, BridgeConfig::default());
  }

  #[test]
  fn merge_values_replaces_scalar_and_arrays() {
    let mut base: TomlValue =
      toml::from_str("[queue]\nrescan_interval_ms = 1000\nread_retry_delays_ms = [1, 2]").unwrap();
    let overlay: TomlValue = toml::from_str("[queue]\nread_retry_delays_ms = [5]").unwrap();
    merge_values(&mut base, overlay);

    let cfg: BridgeConfig = base.try_into().unwrap();
    assert_eq!(cfg.queue.rescan_interval_ms, 1000);
    assert_eq!(cfg.queue.read_retry_delays_ms, vec![5]);
  }

  #[test]
  fn merge_values_merges_nested_tables() {
    let mut base: TomlValue = toml::from_str("[results]\nmax_results = 20\npretty = true").unwrap();
    let overlay: TomlValue = toml::from_str("[results]\npretty = false").unwrap();
    merge_values(&mut base, overlay);

    let cfg: BridgeConfig = base.try_into().unwrap();
    assert_eq!(cfg.results.max_results, 20);
    assert!(!cfg.results.pretty);
  }

  #[test]
  fn load_config_uses_defaults_without_files() {
    let temp = tempfile::tempdir().unwrap();
    let xdg = tempfile::tempdir().unwrap();
    let cfg = isolated(xdg.path(), || load_config(temp.path())).unwrap();
    assert_eq!(cfg, BridgeConfig::default());
  }

  #[test]
  fn load_config_merges_global_then_project() {
    let temp = tempfile::tempdir().unwrap();
    let xdg = tempfile::tempdir().unwrap();
    let global_dir = xdg.path().join("hostbridge");
    fs::create_dir_all(&global_dir).unwrap();
    fs::write(
      global_dir.join(CONFIG_FILE_NAME),
      "[results]\nmax_results = 5\n[batch]\ndefault_timeout_ms = 1000\n",
    )
    .unwrap();
    let project_dir = temp.path().join(PROJECT_CONFIG_DIR);
    fs::create_dir_all(&project_dir).unwrap();
    fs::write(
      project_dir.join(CONFIG_FILE_NAME),
      "[results]\nmax_results = 7\n[commands]\ndisabled = [\"system.ping\"]\n",
    )
    .unwrap();

    let cfg = isolated(xdg.path(), || load_config(temp.path())).unwrap();
    assert_eq!(cfg.results.max_results, 7);
    assert_eq!(cfg.batch.default_timeout_ms, 1000);
    assert_eq!(cfg.commands.disabled, vec!["system.ping"]);
  }

  #[test]
  fn load_config_rejects_invalid_toml() {
    let temp = tempfile::tempdir().unwrap();
    let xdg = tempfile::tempdir().unwrap();
    let project_dir = temp.path().join(PROJECT_CONFIG_DIR);
    fs::create_dir_all(&project_dir).unwrap();
    fs::write(project_dir.join(CONFIG_FILE_NAME), "[results\n").unwrap();

    let err = isolated(xdg.path(), || load_config(temp.path())).unwrap_err();
    assert!(format!("{err:#}").contains("invalid TOML"));
  }

  #[test]
  fn env_overrides_data_dir() {
    let temp = tempfile::tempdir().unwrap();
    let xdg = tempfile::tempdir().unwrap();
    let cfg = with_vars(
      [
        ("XDG_CONFIG_HOME", Some(xdg.path().display().to_string())),
        (DATA_DIR_ENV, Some("/var/tmp/bridge".to_string())),
      ],
      || load_config(temp.path()),
    )
    .unwrap();
    assert_eq!(cfg.data_dir, "/var/tmp/bridge");
    let paths = BridgePaths::from_config(temp.path(), &cfg);
    assert_eq!(paths.pending_dir(), PathBuf::from("/var/tmp/bridge/pending"));
  }

  #[test]
  fn relative_data_dir_resolves_against_root() {
    let paths = BridgePaths::new("/work/proj", ".hostbridge");
    assert_eq!(paths.results_dir(), PathBuf::from("/work/proj/.hostbridge/results"));
    assert_eq!(
      paths.done_file("b1"),
      PathBuf::from("/work/proj/.hostbridge/done/b1.json")
    );
  }
}
