//! Test helpers.
//!
//! Builders for throwaway monorepo workspaces used by the build and
//! scheduler tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::unit::{BuildDepSpec, CommandUnit, Unit};

/// Create `packages/<name>` with a `package.json`, a trivial source file
/// and a `.gitignore` covering the conventional test output names.
pub fn scaffold_package(workspace: &Path, name: &str) -> PathBuf {
  let dir = workspace.join("packages").join(name);
  std::fs::create_dir_all(&dir).unwrap();
  std::fs::write(
    dir.join("package.json"),
    format!(r#"{{"name": "{name}", "version": "1.0.0"}}"#),
  )
  .unwrap();
  std::fs::write(dir.join("index.js"), format!("module.exports = '{name}';\n")).unwrap();
  std::fs::write(dir.join(".gitignore"), "out.txt\n*.marker\n").unwrap();
  dir
}

/// A command unit rooted at `packages/<name>` with `link-npm` edges to
/// the named producers.
pub fn command_unit(name: &str, build_command: &str, deps: &[&str]) -> Unit {
  Unit::Command(CommandUnit {
    identifier: name.to_string(),
    root: format!("packages/{name}"),
    non_sources: vec![],
    non_artifacts: vec![],
    build_command: Some(build_command.to_string()),
    dependencies: deps
      .iter()
      .map(|dep| BuildDepSpec::LinkNpm {
        node: dep.to_string(),
        executables: false,
      })
      .collect(),
    non_package_files: vec![],
    env: BTreeMap::new(),
    uncacheable: false,
  })
}
