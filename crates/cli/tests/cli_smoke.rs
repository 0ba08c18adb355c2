//! CLI smoke tests for nozem.
//!
//! These verify exit codes and user-facing messages end to end: a missing
//! workspace is a single-line error, an import produces `nozem.json`, and
//! a build over it succeeds with a summary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `nozem` command isolated from the invoking user's caches.
fn nozem(workspace: &TempDir) -> Command {
  let mut cmd = Command::cargo_bin("nozem").unwrap();
  cmd.current_dir(workspace.path());
  cmd.env("HOME", workspace.path().join("home"));
  cmd.env("XDG_CACHE_HOME", workspace.path().join("home/.cache"));
  cmd
}

fn write(path: &std::path::Path, contents: &str) {
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, contents).unwrap();
}

#[test]
fn build_without_workspace_fails_with_one_line() {
  let workspace = TempDir::new().unwrap();
  nozem(&workspace)
    .arg("build")
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("no nozem.json"));
}

#[test]
fn unknown_target_fails_with_identifier() {
  let workspace = TempDir::new().unwrap();
  write(
    &workspace.path().join("nozem.json"),
    r#"{"units": [{"type": "command", "identifier": "a", "root": "packages/a"}]}"#,
  );
  std::fs::create_dir_all(workspace.path().join("packages/a")).unwrap();

  nozem(&workspace)
    .args(["build", "no-such-unit"])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("no-such-unit"));
}

#[test]
fn from_lerna_then_build_succeeds() {
  let workspace = TempDir::new().unwrap();
  write(
    &workspace.path().join("lerna.json"),
    r#"{"packages": ["packages/*"]}"#,
  );
  write(
    &workspace.path().join("packages/hello/package.json"),
    r#"{"name": "hello", "version": "1.0.0", "scripts": {"build": "echo hi > out.txt"}}"#,
  );
  write(&workspace.path().join("packages/hello/.gitignore"), "out.txt\n");

  nozem(&workspace)
    .arg("from-lerna")
    .assert()
    .success()
    .stdout(predicate::str::contains("1 units"));

  assert!(workspace.path().join("nozem.json").is_file());

  nozem(&workspace)
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Build complete!"));
  assert!(workspace.path().join("packages/hello/out.txt").is_file());

  // A second build over the unchanged tree reports the unit unchanged.
  nozem(&workspace)
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Unchanged:      1"));
}

#[test]
fn no_bail_reports_failed_units_and_exits_nonzero() {
  let workspace = TempDir::new().unwrap();
  write(
    &workspace.path().join("nozem.json"),
    r#"{"units": [
      {"type": "command", "identifier": "bad", "root": "packages/bad",
       "buildCommand": "exit 1"},
      {"type": "command", "identifier": "good", "root": "packages/good",
       "buildCommand": "echo ok"}
    ]}"#,
  );
  for name in ["bad", "good"] {
    write(
      &workspace.path().join(format!("packages/{name}/package.json")),
      &format!(r#"{{"name": "{name}", "version": "1.0.0"}}"#),
    );
  }

  nozem(&workspace)
    .args(["build", "--no-bail"])
    .assert()
    .failure()
    .code(1)
    .stderr(predicate::str::contains("bad"));
}
