//! Implementation of `nozem from-lerna`.
//!
//! Scans a Lerna-style workspace (a `lerna.json` with `packages` globs,
//! or a root `package.json` with `workspaces`) and emits `nozem.json`.
//! Workspace-internal dependencies become `link-npm` edges; everything
//! else is resolved through the enclosing `node_modules` trees into
//! pinned `npm` edges. The shared `node_modules` is expected to be
//! populated by the package manager before nozem runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use nozem_lib::consts::UNITS_FILE;
use nozem_lib::unit::{BuildDepSpec, CommandUnit, TypescriptBuildUnit, Unit, UnitsFile};

pub fn cmd_from_lerna() -> Result<()> {
  let current_dir = std::env::current_dir().context("cannot determine current directory")?;
  let Some((root, globs)) = find_workspace(&current_dir)? else {
    bail!("no lerna.json or package.json with workspaces found at or above {}", current_dir.display());
  };

  info!(root = %root.display(), "importing workspace");
  let members = expand_globs(&root, &globs);
  if members.is_empty() {
    bail!("workspace declares no resolvable packages");
  }

  // First pass: name every member, so internal deps can be told apart
  // from registry ones.
  let mut by_name: BTreeMap<String, (PathBuf, Value)> = BTreeMap::new();
  for dir in &members {
    let Ok(manifest) = read_json(&dir.join("package.json")) else {
      continue;
    };
    let Some(name) = manifest.get("name").and_then(Value::as_str) else {
      warn!(dir = %dir.display(), "package without a name, skipping");
      continue;
    };
    by_name.insert(name.to_string(), (dir.clone(), manifest));
  }

  let mut units = Vec::new();
  for (name, (dir, manifest)) in &by_name {
    units.push(import_unit(&root, name, dir, manifest, &by_name));
  }

  let out_path = root.join(UNITS_FILE);
  UnitsFile { units }.save(&out_path)?;
  println!("Wrote {} ({} units)", out_path.display(), by_name.len());
  Ok(())
}

/// The workspace root and its member globs.
fn find_workspace(start: &Path) -> Result<Option<(PathBuf, Vec<String>)>> {
  let mut dir = Some(start);
  while let Some(d) = dir {
    let lerna = d.join("lerna.json");
    if lerna.is_file() {
      let value = read_json(&lerna)?;
      let globs = string_array(value.get("packages")).unwrap_or_else(|| vec!["packages/*".to_string()]);
      return Ok(Some((d.to_path_buf(), globs)));
    }
    let manifest = d.join("package.json");
    if manifest.is_file() {
      let value = read_json(&manifest)?;
      // `workspaces` is either an array or `{ "packages": [...] }`.
      let globs = string_array(value.get("workspaces"))
        .or_else(|| string_array(value.get("workspaces").and_then(|w| w.get("packages"))));
      if let Some(globs) = globs {
        return Ok(Some((d.to_path_buf(), globs)));
      }
    }
    dir = d.parent();
  }
  Ok(None)
}

fn import_unit(
  root: &Path,
  name: &str,
  dir: &Path,
  manifest: &Value,
  by_name: &BTreeMap<String, (PathBuf, Value)>,
) -> Unit {
  let mut dependencies = Vec::new();

  for section in ["dependencies", "devDependencies"] {
    let Some(deps) = manifest.get(section).and_then(Value::as_object) else {
      continue;
    };
    for (dep_name, range) in deps {
      let range = range.as_str().unwrap_or("*").to_string();
      if let Some((_, dep_manifest)) = by_name.get(dep_name) {
        dependencies.push(BuildDepSpec::LinkNpm {
          node: dep_name.clone(),
          executables: dep_manifest.get("bin").is_some(),
        });
      } else if let Some((location, version)) = resolve_in_node_modules(root, dir, dep_name) {
        dependencies.push(BuildDepSpec::Npm {
          name: dep_name.clone(),
          version_range: range,
          version,
          resolved_location: location,
        });
      } else {
        debug!(package = name, dependency = %dep_name, "not installed, skipping");
      }
    }
  }

  let build_command = manifest
    .get("scripts")
    .and_then(|s| s.get("build"))
    .and_then(Value::as_str)
    .map(String::from);

  // Every build gets a shell; node only when something will invoke it.
  dependencies.push(BuildDepSpec::Os {
    executable: "sh".to_string(),
    rename: None,
  });
  let invokes_node = dir.join("tsconfig.json").is_file()
    || build_command
      .as_deref()
      .map(|cmd| ["node", "tsc", "npm", "npx"].iter().any(|tool| cmd.contains(tool)))
      .unwrap_or(false);
  if invokes_node {
    dependencies.push(BuildDepSpec::Os {
      executable: "node".to_string(),
      rename: None,
    });
  }

  let command = CommandUnit {
    identifier: name.to_string(),
    root: relative_to(root, dir),
    non_sources: vec![],
    non_artifacts: vec![],
    build_command,
    dependencies,
    non_package_files: vec![],
    env: BTreeMap::new(),
    uncacheable: manifest
      .get("nozem")
      .and_then(|n| n.get("cacheable"))
      .and_then(Value::as_bool)
      == Some(false),
  };

  if dir.join("tsconfig.json").is_file() {
    Unit::TypescriptBuild(TypescriptBuildUnit {
      command,
      patch_tsconfig: true,
    })
  } else {
    Unit::Command(command)
  }
}

/// Walk from the package directory up to the workspace root looking for
/// `node_modules/<name>`. Returns the location relative to the root and
/// the installed version.
fn resolve_in_node_modules(root: &Path, from: &Path, name: &str) -> Option<(String, String)> {
  let mut dir = Some(from);
  while let Some(d) = dir {
    let candidate = d.join("node_modules").join(name);
    if let Ok(manifest) = read_json(&candidate.join("package.json")) {
      let version = manifest
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or("0.0.0")
        .to_string();
      return Some((relative_to(root, &candidate), version));
    }
    if d == root {
      break;
    }
    dir = d.parent();
  }
  None
}

/// Expand workspace globs. Each `*` component matches one directory
/// level; literal components pass through.
fn expand_globs(root: &Path, globs: &[String]) -> Vec<PathBuf> {
  let mut out = Vec::new();
  for glob in globs {
    let mut candidates = vec![root.to_path_buf()];
    for component in glob.split('/') {
      let mut next = Vec::new();
      for candidate in &candidates {
        if component == "*" {
          if let Ok(entries) = std::fs::read_dir(candidate) {
            for entry in entries.flatten() {
              if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                next.push(entry.path());
              }
            }
          }
        } else {
          let path = candidate.join(component);
          if path.is_dir() {
            next.push(path);
          }
        }
      }
      candidates = next;
    }
    out.extend(candidates.into_iter().filter(|d| d.join("package.json").is_file()));
  }
  out.sort();
  out.dedup();
  out
}

/// A JSON array of strings, or `None` for anything else.
fn string_array(value: Option<&Value>) -> Option<Vec<String>> {
  let array = value?.as_array()?;
  Some(
    array
      .iter()
      .filter_map(Value::as_str)
      .map(String::from)
      .collect(),
  )
}

fn relative_to(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .replace('\\', "/")
}

fn read_json(path: &Path) -> Result<Value> {
  let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
  serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
  }

  #[test]
  fn expands_single_star_globs() {
    let tmp = TempDir::new().unwrap();
    write(&tmp.path().join("packages/a/package.json"), "{}");
    write(&tmp.path().join("packages/b/package.json"), "{}");
    write(&tmp.path().join("packages/b/no-manifest-here/.keep"), "");

    let members = expand_globs(tmp.path(), &["packages/*".to_string()]);
    assert_eq!(members.len(), 2);
  }

  #[test]
  fn finds_lerna_root_above_cwd() {
    let tmp = TempDir::new().unwrap();
    write(&tmp.path().join("lerna.json"), r#"{"packages": ["pkgs/*"]}"#);
    let nested = tmp.path().join("pkgs/deep");
    std::fs::create_dir_all(&nested).unwrap();

    let (root, globs) = find_workspace(&nested).unwrap().unwrap();
    assert_eq!(root, tmp.path());
    assert_eq!(globs, vec!["pkgs/*".to_string()]);
  }

  #[test]
  fn internal_deps_become_link_npm_and_externals_resolve() {
    let tmp = TempDir::new().unwrap();
    write(&tmp.path().join("lerna.json"), r#"{"packages": ["packages/*"]}"#);
    write(
      &tmp.path().join("packages/app/package.json"),
      r#"{"name": "app", "version": "1.0.0",
          "dependencies": {"lib": "^1.0.0", "leftpad": "^2.0.0", "ghost": "*"},
          "scripts": {"build": "node build.js"}}"#,
    );
    write(
      &tmp.path().join("packages/lib/package.json"),
      r#"{"name": "lib", "version": "1.0.0"}"#,
    );
    write(
      &tmp.path().join("node_modules/leftpad/package.json"),
      r#"{"name": "leftpad", "version": "2.3.4"}"#,
    );

    let app_manifest = read_json(&tmp.path().join("packages/app/package.json")).unwrap();
    let lib_manifest = read_json(&tmp.path().join("packages/lib/package.json")).unwrap();
    let by_name = BTreeMap::from([
      ("app".to_string(), (tmp.path().join("packages/app"), app_manifest.clone())),
      ("lib".to_string(), (tmp.path().join("packages/lib"), lib_manifest)),
    ]);

    let unit = import_unit(
      tmp.path(),
      "app",
      &tmp.path().join("packages/app"),
      &app_manifest,
      &by_name,
    );

    let deps = unit.dependencies();
    assert!(deps.iter().any(|d| matches!(d, BuildDepSpec::LinkNpm { node, .. } if node == "lib")));
    assert!(deps.iter().any(|d| matches!(
      d,
      BuildDepSpec::Npm { name, version, resolved_location, .. }
        if name == "leftpad" && version == "2.3.4" && resolved_location == "node_modules/leftpad"
    )));
    // The uninstalled dependency is skipped, the OS tools are present.
    assert!(!deps.iter().any(|d| matches!(d, BuildDepSpec::Npm { name, .. } if name == "ghost")));
    assert!(deps.iter().any(|d| matches!(d, BuildDepSpec::Os { executable, .. } if executable == "node")));
    assert_eq!(unit.root(), Some("packages/app"));
  }

  #[test]
  fn tsconfig_presence_selects_typescript_build() {
    let tmp = TempDir::new().unwrap();
    write(
      &tmp.path().join("packages/ts/package.json"),
      r#"{"name": "ts", "version": "1.0.0", "scripts": {"build": "tsc"}}"#,
    );
    write(&tmp.path().join("packages/ts/tsconfig.json"), "{}");

    let manifest = read_json(&tmp.path().join("packages/ts/package.json")).unwrap();
    let by_name = BTreeMap::from([(
      "ts".to_string(),
      (tmp.path().join("packages/ts"), manifest.clone()),
    )]);
    let unit = import_unit(tmp.path(), "ts", &tmp.path().join("packages/ts"), &manifest, &by_name);
    assert!(matches!(unit, Unit::TypescriptBuild(_)));
    assert!(unit.patch_tsconfig());
  }
}
