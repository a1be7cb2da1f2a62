#![allow(dead_code)]
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use assert_cmd::Command;
use serde_json::Value;
use temp_env::with_vars;
use tempfile::{Builder, TempDir};

use hostbridge::config::BridgePaths;
use hostbridge::protocol::BatchResult;
use hostbridge::writer::read_result_file;

pub const DATA_DIR: &str = ".hostbridge";

#[derive(Debug)]
pub struct TestEnv {
  temp: TempDir,
  xdg_home: TempDir,
}

impl TestEnv {
  /// Run `f` with an isolated XDG config home and no data dir override.
  pub fn run<F, R>(f: F) -> R
  where
    F: FnOnce(&TestEnv) -> R,
  {
    let env = TestEnv::new();
    with_vars(
      [
        (
          "XDG_CONFIG_HOME",
          Some(env.xdg_home_dir().display().to_string()),
        ),
        ("HOSTBRIDGE_DATA_DIR", None),
      ],
      || f(&env),
    )
  }

  pub fn new() -> Self {
    let temp = Builder::new()
      .prefix("hostbridge-test-")
      .tempdir_in(tmp_root())
      .expect("temp dir");
    let xdg_home = Builder::new()
      .prefix("xdg-")
      .tempdir_in(tmp_root())
      .expect("xdg dir");
    Self { temp, xdg_home }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn xdg_home_dir(&self) -> &Path {
    self.xdg_home.path()
  }

  pub fn paths(&self) -> BridgePaths {
    BridgePaths::new(self.path(), DATA_DIR)
  }

  /// Write `body` as `pending/{name}.json`, creating the directories.
  pub fn write_pending(&self, name: &str, body: &Value) -> Result<PathBuf> {
    self.write_pending_raw(name, &body.to_string())
  }

  pub fn write_pending_raw(&self, name: &str, body: &str) -> Result<PathBuf> {
    let paths = self.paths();
    paths.ensure_dirs()?;
    let path = paths.pending_file(name);
    std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
  }

  pub fn read_result(&self, id: &str) -> Result<BatchResult> {
    read_result_file(&self.paths().result_file(id))?
      .with_context(|| format!("no result for {id}"))
  }

  pub fn result_ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = std::fs::read_dir(self.paths().results_dir())
      .map(|entries| {
        entries
          .filter_map(|e| e.ok())
          .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_suffix(".json").map(str::to_string)
          })
          .collect()
      })
      .unwrap_or_default();
    ids.sort();
    ids
  }

  pub fn bin_cmd(&self) -> Result<Command> {
    let mut cmd = Command::cargo_bin("hostbridge")?;
    cmd.current_dir(self.path());
    cmd.env("XDG_CONFIG_HOME", self.xdg_home_dir());
    cmd.env_remove("HOSTBRIDGE_DATA_DIR");
    cmd.env("RUST_LOG", "warn");
    Ok(cmd)
  }

  /// Write `.hostbridge/hostbridge.toml` for this project.
  pub fn write_project_config(&self, toml: &str) -> Result<()> {
    let dir = self.path().join(".hostbridge");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("hostbridge.toml"), toml)?;
    Ok(())
  }
}

/// Workspace-local temp root under `./target/test-tmp`.
pub fn tmp_root() -> PathBuf {
  let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
  // crates/hostbridge -> crates -> workspace root
  let workspace_root = manifest_dir
    .parent()
    .and_then(|p| p.parent())
    .unwrap_or(&manifest_dir)
    .to_path_buf();
  let root = workspace_root.join("target").join("test-tmp");
  let _ = std::fs::create_dir_all(&root);
  root
}
