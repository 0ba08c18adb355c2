//! Typed build inputs and the input Merkle.
//!
//! A package's inputs are its sources, its npm dependencies, the OS tools
//! it invokes, any declared out-of-package files, and its environment map.
//! They compose into one Merkle tree whose root hash transitively encodes
//! everything that can affect the build's output; that hash is the cache
//! key.

pub mod npm;
pub mod os_tool;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::consts::LOGIC_VERSION;
use crate::fileset::{FileSet, FileSetError};
use crate::hash::{file_hash, HashError, MerkleTree};

pub use npm::{NpmDependencyInput, PackageJson};
pub use os_tool::OsToolInput;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
  #[error("required tool '{name}' not found on PATH")]
  ToolNotFound { name: String },

  #[error("failed to read package manifest {path}: {source}")]
  Manifest {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid package manifest {path}: {source}")]
  ManifestParse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error(transparent)]
  FileSet(#[from] FileSetError),

  /// Laying a dependency out in the sandbox failed.
  #[error(transparent)]
  Sandbox(#[from] crate::sandbox::SandboxError),
}

/// Environment after applying the two prefix rules.
///
/// A value starting with `|` inherits the variable from the invoking
/// process, falling back to the remainder when unset. A key starting with
/// `&` is passed to the child (prefix stripped) but left out of the hash;
/// it marks values known to vary between machines without affecting the
/// output.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEnv {
  /// Key/value pairs that participate in the input hash.
  pub hashed: BTreeMap<String, String>,
  /// Everything the child process receives, prefixes stripped.
  pub runtime: BTreeMap<String, String>,
}

pub fn resolve_env(declared: &BTreeMap<String, String>) -> ResolvedEnv {
  let mut resolved = ResolvedEnv::default();
  for (key, value) in declared {
    let (unhashed, name) = match key.strip_prefix('&') {
      Some(rest) => (true, rest),
      None => (false, key.as_str()),
    };
    let value = match value.strip_prefix('|') {
      Some(default) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
      None => value.clone(),
    };
    if !unhashed {
      resolved.hashed.insert(name.to_string(), value.clone());
    }
    resolved.runtime.insert(name.to_string(), value);
  }
  resolved
}

impl ResolvedEnv {
  pub fn merkle(&self) -> MerkleTree {
    MerkleTree::from_entries(
      self
        .hashed
        .iter()
        .map(|(key, value)| (key.clone(), MerkleTree::of_value(value))),
    )
  }
}

/// The complete typed input set of one package.
pub struct PackageInputs {
  pub sources: FileSet,
  pub env: ResolvedEnv,
  /// npm name → dependency input.
  pub npm_deps: BTreeMap<String, NpmDependencyInput>,
  /// sandbox name → tool.
  pub os_tools: BTreeMap<String, OsToolInput>,
  /// declared path (relative to workspace root) → absolute location.
  pub external_files: BTreeMap<String, PathBuf>,
  /// copy-edge dependencies: producing unit identifier → artifact hash.
  pub copy_artifacts: BTreeMap<String, String>,
  /// copy-edge file sets to install, keyed like `copy_artifacts`, each
  /// with its optional target subdirectory.
  pub copied_sets: BTreeMap<String, (FileSet, Option<String>)>,
}

impl PackageInputs {
  /// The input Merkle. Shape:
  ///
  /// ```text
  /// { source, env, deps, osTools, externalFiles, v }
  /// ```
  pub fn merkle(&self) -> Result<MerkleTree, InputError> {
    let mut deps = BTreeMap::new();
    for (name, dep) in &self.npm_deps {
      let identifier = dep
        .files_identifier()
        .unwrap_or_else(|| "<unhashable>".to_string());
      deps.insert(name.clone(), MerkleTree::of_value(&identifier));
    }
    for (identifier, artifact_hash) in &self.copy_artifacts {
      deps.insert(identifier.clone(), MerkleTree::leaf(artifact_hash.clone()));
    }

    let mut tools = BTreeMap::new();
    for (name, tool) in &self.os_tools {
      tools.insert(name.clone(), MerkleTree::leaf(tool.hash()?));
    }

    let mut externals = BTreeMap::new();
    for (declared, location) in &self.external_files {
      externals.insert(declared.clone(), MerkleTree::leaf(file_hash(location)?));
    }

    Ok(MerkleTree::from_entries([
      ("source".to_string(), self.sources.merkle()?),
      ("env".to_string(), self.env.merkle()),
      ("deps".to_string(), MerkleTree::node(deps)),
      ("osTools".to_string(), MerkleTree::node(tools)),
      ("externalFiles".to_string(), MerkleTree::node(externals)),
      ("v".to_string(), MerkleTree::of_value(LOGIC_VERSION)),
    ]))
  }
}

/// Strip sandbox-hostile settings from a `tsconfig.json` value: project
/// references and composite mode reach outside the package, inline source
/// maps embed absolute paths.
pub fn patch_tsconfig(value: &mut Value) -> bool {
  let Some(object) = value.as_object_mut() else {
    return false;
  };
  let mut changed = object.remove("references").is_some();
  if let Some(options) = object.get_mut("compilerOptions").and_then(Value::as_object_mut) {
    for key in ["composite", "inlineSourceMap", "inlineSources"] {
      changed |= options.remove(key).is_some();
    }
  }
  changed
}
