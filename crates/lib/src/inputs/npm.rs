//! npm dependency inputs.
//!
//! Three kinds of npm dependency feed a build:
//!
//! - **Registry** packages already materialized under some enclosing
//!   `node_modules/`. Their content identity is the declared version
//!   (unique by registry convention) and they are symlinked into the
//!   sandbox, so their own nested dependencies resolve through the real
//!   tree.
//! - **Monorepo builds**: other units built by nozem. Their identity is
//!   the produced artifact hash and their files are copied in, with
//!   `.ts` sources shadowed by a sibling `.d.ts` stripped (TypeScript
//!   would otherwise resolve the implementation instead of the
//!   declaration) and `tsconfig.json` removed.
//! - **Monorepo in-place** packages marked uncacheable. They have no
//!   content identity; anything depending on one builds outside the
//!   sandbox.
//!
//! The transitive relation between these packages is cyclic in the wild;
//! the tree builder breaks cycles with a seen-set on the descent path and
//! hands the hoister an acyclic tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::fileset::FileSet;
use crate::hoist::{NodeId, PackageTree};
use crate::sandbox::Sandbox;

use super::InputError;

/// The slice of `package.json` nozem cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageJson {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub dependencies: BTreeMap<String, String>,
  #[serde(default, rename = "devDependencies")]
  pub dev_dependencies: BTreeMap<String, String>,
  #[serde(default)]
  pub scripts: BTreeMap<String, String>,
  #[serde(default)]
  pub bin: Option<BinField>,
}

/// `bin` is either one path (named after the package) or a map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BinField {
  Single(String),
  Map(BTreeMap<String, String>),
}

impl PackageJson {
  pub fn load(dir: &Path) -> Result<PackageJson, InputError> {
    let path = dir.join("package.json");
    let text = std::fs::read_to_string(&path).map_err(|source| InputError::Manifest {
      path: path.clone(),
      source,
    })?;
    serde_json::from_str(&text).map_err(|source| InputError::ManifestParse { path, source })
  }

  /// Normalized bin entries: executable name → path relative to the
  /// package directory.
  pub fn bin_entries(&self) -> BTreeMap<String, String> {
    match &self.bin {
      None => BTreeMap::new(),
      Some(BinField::Single(path)) => {
        let name = self.name.rsplit('/').next().unwrap_or(&self.name);
        BTreeMap::from([(name.to_string(), path.clone())])
      }
      Some(BinField::Map(map)) => map.clone(),
    }
  }
}

#[derive(Debug, Clone)]
pub struct RegistryDependency {
  pub name: String,
  pub version: String,
  pub resolved_location: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MonoRepoBuildDependency {
  pub unit_identifier: String,
  pub name: String,
  /// Post-build artifact set of the producing unit.
  pub artifact: FileSet,
  pub artifact_hash: String,
  pub executables: bool,
}

#[derive(Debug, Clone)]
pub struct MonoRepoInPlaceDependency {
  pub unit_identifier: String,
  pub name: String,
  pub root: PathBuf,
}

/// One npm dependency of a package build.
#[derive(Debug, Clone)]
pub enum NpmDependencyInput {
  Registry(RegistryDependency),
  MonoRepoBuild(MonoRepoBuildDependency),
  MonoRepoInPlace(MonoRepoInPlaceDependency),
}

impl NpmDependencyInput {
  pub fn name(&self) -> &str {
    match self {
      NpmDependencyInput::Registry(dep) => &dep.name,
      NpmDependencyInput::MonoRepoBuild(dep) => &dep.name,
      NpmDependencyInput::MonoRepoInPlace(dep) => &dep.name,
    }
  }

  pub fn is_hashable(&self) -> bool {
    !matches!(self, NpmDependencyInput::MonoRepoInPlace(_))
  }

  /// Content identity used in the input Merkle and for version-conflict
  /// detection during hoisting. `None` for in-place packages.
  pub fn files_identifier(&self) -> Option<String> {
    match self {
      NpmDependencyInput::Registry(dep) => Some(dep.version.clone()),
      NpmDependencyInput::MonoRepoBuild(dep) => Some(dep.artifact_hash.clone()),
      NpmDependencyInput::MonoRepoInPlace(_) => None,
    }
  }

  /// Directory holding the dependency's `package.json`.
  pub fn package_dir(&self) -> &Path {
    match self {
      NpmDependencyInput::Registry(dep) => &dep.resolved_location,
      NpmDependencyInput::MonoRepoBuild(dep) => dep.artifact.root(),
      NpmDependencyInput::MonoRepoInPlace(dep) => &dep.root,
    }
  }
}

impl MonoRepoBuildDependency {
  /// The artifact with downstream-hostile files removed: `tsconfig.json`,
  /// and any `.ts` whose compiled `.d.ts` sits next to it.
  pub fn installable_files(&self) -> FileSet {
    self.artifact.filter(|rel| {
      let path = rel.to_string_lossy().replace('\\', "/");
      if path == "tsconfig.json" {
        return false;
      }
      if let Some(stem) = path.strip_suffix(".ts") {
        if !path.ends_with(".d.ts") && self.artifact.contains(Path::new(&format!("{stem}.d.ts"))) {
          return false;
        }
      }
      true
    })
  }
}

/// Build the nested dependency tree for one package.
///
/// `root_deps` are the names the package itself declares; `inputs` is the
/// flat closure of available dependency inputs, keyed by npm name. Each
/// monorepo dependency's own declarations (read from its `package.json`)
/// nest beneath it; registry packages stay leaves because they are
/// symlinked whole and resolve their dependencies through the real tree.
/// A name already on the descent path is skipped, which is what turns the
/// cyclic relation into a tree.
pub fn build_dependency_tree(
  root_deps: impl IntoIterator<Item = String>,
  inputs: &BTreeMap<String, NpmDependencyInput>,
) -> PackageTree<String> {
  let mut tree = PackageTree::new(String::new());
  let mut path = Vec::new();
  expand(
    &mut tree,
    PackageTree::<String>::ROOT,
    root_deps.into_iter().collect(),
    inputs,
    &mut path,
  );
  tree
}

fn expand(
  tree: &mut PackageTree<String>,
  parent: NodeId,
  names: Vec<String>,
  inputs: &BTreeMap<String, NpmDependencyInput>,
  path: &mut Vec<String>,
) {
  for name in names {
    if path.iter().any(|seen| *seen == name) {
      continue;
    }
    let Some(input) = inputs.get(&name) else {
      debug!(dependency = %name, "dependency not in input closure, skipping");
      continue;
    };
    let version = input
      .files_identifier()
      .unwrap_or_else(|| "<in-place>".to_string());
    let node = tree.add_child(parent, name.clone(), version, name.clone());

    if let NpmDependencyInput::MonoRepoBuild(_) = input {
      let child_names: Vec<String> = match PackageJson::load(input.package_dir()) {
        Ok(manifest) => manifest.dependencies.keys().cloned().collect(),
        Err(err) => {
          debug!(dependency = %name, error = %err, "no readable manifest, treating as leaf");
          Vec::new()
        }
      };
      path.push(name);
      expand(tree, node, child_names, inputs, path);
      path.pop();
    } else {
      tree.keep_subtree_intact(node);
    }
  }
}

/// Install a hoisted dependency tree into a sandbox's source directory.
///
/// Registry packages are symlinked at their hoisted position; monorepo
/// artifacts are copied. `bin` entries land in the sandbox `bin/`
/// directory (for monorepo dependencies only when the edge asked for
/// executables).
pub async fn install_dependency_tree(
  tree: &PackageTree<String>,
  inputs: &BTreeMap<String, NpmDependencyInput>,
  sandbox: &Sandbox,
) -> Result<(), InputError> {
  install_level(
    tree,
    PackageTree::<String>::ROOT,
    Path::new("node_modules"),
    inputs,
    sandbox,
  )
  .await
}

/// Iterative worker: recursion over async fns needs boxing, and the
/// nesting depth after hoisting is tiny anyway.
async fn install_level(
  tree: &PackageTree<String>,
  root: NodeId,
  root_prefix: &Path,
  inputs: &BTreeMap<String, NpmDependencyInput>,
  sandbox: &Sandbox,
) -> Result<(), InputError> {
  let mut queue: Vec<(NodeId, PathBuf)> = vec![(root, root_prefix.to_path_buf())];

  while let Some((node, prefix)) = queue.pop() {
    for (name, child) in tree.children(node) {
      let rel = prefix.join(name);
      let Some(input) = inputs.get(tree.payload(child)) else {
        continue;
      };

      match input {
        NpmDependencyInput::Registry(dep) => {
          sandbox.install_symlink(&rel, &dep.resolved_location)?;
          install_bins(sandbox, &dep.resolved_location)?;
        }
        NpmDependencyInput::MonoRepoBuild(dep) => {
          let files = dep.installable_files();
          let rel_str = rel.to_string_lossy().replace('\\', "/");
          sandbox.add_src_files(&files, Some(rel_str.as_str())).await?;
          if dep.executables {
            install_bins(sandbox, &sandbox.src_dir().join(&rel))?;
          }
          queue.push((child, rel.join("node_modules")));
        }
        NpmDependencyInput::MonoRepoInPlace(dep) => {
          debug!(
            dependency = %dep.name,
            "in-place dependency reached hermetic install, skipping"
          );
        }
      }
    }
  }
  Ok(())
}

fn install_bins(sandbox: &Sandbox, package_dir: &Path) -> Result<(), InputError> {
  let Ok(manifest) = PackageJson::load(package_dir) else {
    return Ok(());
  };
  for (bin_name, bin_path) in manifest.bin_entries() {
    let target = package_dir.join(bin_path);
    sandbox.install_executable(&target, Some(&bin_name))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn write_manifest(dir: &Path, name: &str, deps: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    let deps: BTreeMap<&str, &str> = deps.iter().copied().collect();
    let manifest = serde_json::json!({
      "name": name,
      "version": "1.0.0",
      "dependencies": deps,
    });
    fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
  }

  fn registry(name: &str, version: &str, location: &Path) -> NpmDependencyInput {
    NpmDependencyInput::Registry(RegistryDependency {
      name: name.to_string(),
      version: version.to_string(),
      resolved_location: location.to_path_buf(),
    })
  }

  fn monorepo(name: &str, dir: &Path, files: &[&str]) -> NpmDependencyInput {
    NpmDependencyInput::MonoRepoBuild(MonoRepoBuildDependency {
      unit_identifier: name.to_string(),
      name: name.to_string(),
      artifact: FileSet::from_relative_paths(dir, files.iter().map(PathBuf::from)),
      artifact_hash: format!("hash-of-{name}"),
      executables: false,
    })
  }

  #[test]
  fn monorepo_children_nest_registry_stays_leaf() {
    let tmp = TempDir::new().unwrap();
    let lib_dir = tmp.path().join("lib-artifact");
    write_manifest(&lib_dir, "lib", &[("leftpad", "^2.0.0")]);
    let leftpad_dir = tmp.path().join("node_modules/leftpad");
    write_manifest(&leftpad_dir, "leftpad", &[("spacemaker", "^1.0.0")]);

    let inputs = BTreeMap::from([
      ("lib".to_string(), monorepo("lib", &lib_dir, &["package.json"])),
      ("leftpad".to_string(), registry("leftpad", "2.0.0", &leftpad_dir)),
    ]);

    let mut tree = build_dependency_tree(["lib".to_string()], &inputs);
    tree.hoist();

    // leftpad hoists to the top; its own deps are not expanded.
    let rendered = tree.render();
    assert!(rendered.contains(&"lib=hash-of-lib".to_string()));
    assert!(rendered.contains(&"leftpad=2.0.0".to_string()));
    assert_eq!(rendered.len(), 2);
  }

  #[test]
  fn cycles_are_broken_on_the_descent_path() {
    let tmp = TempDir::new().unwrap();
    let a_dir = tmp.path().join("a");
    let b_dir = tmp.path().join("b");
    write_manifest(&a_dir, "a", &[("b", "*")]);
    write_manifest(&b_dir, "b", &[("a", "*")]);

    let inputs = BTreeMap::from([
      ("a".to_string(), monorepo("a", &a_dir, &["package.json"])),
      ("b".to_string(), monorepo("b", &b_dir, &["package.json"])),
    ]);

    // Must terminate; a's subtree contains b but not a again.
    let tree = build_dependency_tree(["a".to_string()], &inputs);
    let rendered = tree.render();
    assert!(rendered.contains(&"a=hash-of-a".to_string()));
    assert!(rendered.contains(&"a.b=hash-of-b".to_string()));
    assert_eq!(rendered.len(), 2);
  }

  #[test]
  fn installable_files_strip_shadowed_sources() {
    let tmp = TempDir::new().unwrap();
    let dep = MonoRepoBuildDependency {
      unit_identifier: "lib".to_string(),
      name: "lib".to_string(),
      artifact: FileSet::from_relative_paths(
        tmp.path(),
        [
          "index.ts",
          "index.d.ts",
          "index.js",
          "plain.ts",
          "tsconfig.json",
          "package.json",
        ]
        .map(PathBuf::from),
      ),
      artifact_hash: "h".to_string(),
      executables: false,
    };

    let names: Vec<String> = dep
      .installable_files()
      .relative_paths()
      .iter()
      .map(|p| p.to_string_lossy().to_string())
      .collect();

    // index.ts is shadowed by index.d.ts and dropped; plain.ts has no
    // declaration next to it and stays.
    assert_eq!(names, vec!["index.d.ts", "index.js", "package.json", "plain.ts"]);
  }

  #[tokio::test]
  async fn install_lays_out_hoisted_node_modules() {
    let tmp = TempDir::new().unwrap();

    let lib_dir = tmp.path().join("lib-artifact");
    write_manifest(&lib_dir, "lib", &[("leftpad", "^2.0.0")]);
    fs::write(lib_dir.join("index.js"), "x").unwrap();

    let leftpad_dir = tmp.path().join("real/node_modules/leftpad");
    write_manifest(&leftpad_dir, "leftpad", &[]);

    let inputs = BTreeMap::from([
      (
        "lib".to_string(),
        monorepo("lib", &lib_dir, &["package.json", "index.js"]),
      ),
      ("leftpad".to_string(), registry("leftpad", "2.0.0", &leftpad_dir)),
    ]);

    let mut tree = build_dependency_tree(["lib".to_string()], &inputs);
    tree.hoist();

    let sandbox = Sandbox::create().unwrap();
    install_dependency_tree(&tree, &inputs, &sandbox).await.unwrap();

    let lib_install = sandbox.src_dir().join("node_modules/lib");
    assert!(lib_install.join("index.js").is_file());

    let leftpad_install = sandbox.src_dir().join("node_modules/leftpad");
    let meta = fs::symlink_metadata(&leftpad_install).unwrap();
    assert!(meta.file_type().is_symlink());

    sandbox.remove();
  }

  #[test]
  fn bin_entries_normalize_single_and_map() {
    let single: PackageJson =
      serde_json::from_str(r#"{"name": "@scope/tool", "bin": "cli.js"}"#).unwrap();
    assert_eq!(single.bin_entries(), BTreeMap::from([("tool".to_string(), "cli.js".to_string())]));

    let map: PackageJson =
      serde_json::from_str(r#"{"name": "multi", "bin": {"a": "a.js", "b": "b.js"}}"#).unwrap();
    assert_eq!(map.bin_entries().len(), 2);
  }

  #[test]
  fn in_place_dependency_is_not_hashable() {
    let dep = NpmDependencyInput::MonoRepoInPlace(MonoRepoInPlaceDependency {
      unit_identifier: "u".to_string(),
      name: "u".to_string(),
      root: PathBuf::from("/src/u"),
    });
    assert!(!dep.is_hashable());
    assert!(dep.files_identifier().is_none());
  }
}
