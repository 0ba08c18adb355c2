//! Unit definitions.
//!
//! `nozem.json` is the static description of everything buildable: one
//! entry per unit, each with its dependency edges. The importer writes it;
//! the build graph loads it. Nothing in here executes anything.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::UNITS_FILE;

#[derive(Debug, thiserror::Error)]
pub enum UnitError {
  /// No `nozem.json` at or above the starting directory.
  #[error("no {UNITS_FILE} found at or above {0}")]
  NotFound(PathBuf),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to write {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// The unit definitions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsFile {
  pub units: Vec<Unit>,
}

impl UnitsFile {
  pub fn load(path: &Path) -> Result<UnitsFile, UnitError> {
    let text = std::fs::read_to_string(path).map_err(|source| UnitError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&text).map_err(|source| UnitError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), UnitError> {
    let text = serde_json::to_string_pretty(self).expect("units always serialize");
    std::fs::write(path, text).map_err(|source| UnitError::Write {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Search for `nozem.json` at `start` and every ancestor. Returns the
  /// directory holding the file (the workspace root) and the parsed file.
  pub fn find_upward(start: &Path) -> Result<(PathBuf, UnitsFile), UnitError> {
    let mut dir = Some(start);
    while let Some(d) = dir {
      let candidate = d.join(UNITS_FILE);
      if candidate.is_file() {
        return Ok((d.to_path_buf(), UnitsFile::load(&candidate)?));
      }
      dir = d.parent();
    }
    Err(UnitError::NotFound(start.to_path_buf()))
  }
}

/// One buildable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Unit {
  /// Runs an arbitrary build command over the package's sources.
  #[serde(rename = "command")]
  Command(CommandUnit),

  /// A command unit that additionally has its `tsconfig.json` made
  /// sandbox-safe before building.
  #[serde(rename = "typescript-build")]
  TypescriptBuild(TypescriptBuildUnit),

  /// Repackages a subset of its dependencies' outputs.
  #[serde(rename = "extract")]
  Extract(ExtractUnit),
}

impl Unit {
  pub fn identifier(&self) -> &str {
    match self {
      Unit::Command(u) => &u.identifier,
      Unit::TypescriptBuild(u) => &u.command.identifier,
      Unit::Extract(u) => &u.identifier,
    }
  }

  pub fn dependencies(&self) -> &[BuildDepSpec] {
    match self {
      Unit::Command(u) => &u.dependencies,
      Unit::TypescriptBuild(u) => &u.command.dependencies,
      Unit::Extract(u) => &u.dependencies,
    }
  }

  /// Monorepo-relative source root, absent for extract units.
  pub fn root(&self) -> Option<&str> {
    match self {
      Unit::Command(u) => Some(&u.root),
      Unit::TypescriptBuild(u) => Some(&u.command.root),
      Unit::Extract(_) => None,
    }
  }

  /// The command-shaped part of the unit, if any.
  pub fn as_command(&self) -> Option<&CommandUnit> {
    match self {
      Unit::Command(u) => Some(u),
      Unit::TypescriptBuild(u) => Some(&u.command),
      Unit::Extract(_) => None,
    }
  }

  pub fn patch_tsconfig(&self) -> bool {
    match self {
      Unit::TypescriptBuild(u) => u.patch_tsconfig,
      _ => false,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandUnit {
  pub identifier: String,

  /// Source directory, relative to the workspace root.
  pub root: String,

  /// Gitignore-style patterns excluded from the source set.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub non_sources: Vec<String>,

  /// Patterns excluded from the artifact snapshot after building.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub non_artifacts: Vec<String>,

  /// Shell command run in the sandbox; a unit without one only assembles
  /// its inputs.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_command: Option<String>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<BuildDepSpec>,

  /// Files outside the package that feed the build, as workspace-relative
  /// paths (a shared `tsconfig.base.json`, a license header).
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub non_package_files: Vec<String>,

  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,

  /// Marks a package whose build cannot be made hermetic; it runs in its
  /// source tree and poisons cacheability downstream.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub uncacheable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypescriptBuildUnit {
  #[serde(flatten)]
  pub command: CommandUnit,

  #[serde(default = "default_true", rename = "patchTsconfig")]
  pub patch_tsconfig: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractUnit {
  pub identifier: String,

  /// Include globs selecting the subset of the installed dependency
  /// closure that becomes this unit's artifact.
  pub extract_patterns: Vec<String>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub dependencies: Vec<BuildDepSpec>,
}

/// One dependency edge of a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildDepSpec {
  /// A registry package, already materialized somewhere under an
  /// enclosing `node_modules`.
  #[serde(rename = "npm", rename_all = "camelCase")]
  Npm {
    name: String,
    version_range: String,
    version: String,
    resolved_location: String,
  },

  /// Another monorepo unit, linked in as an npm dependency.
  #[serde(rename = "link-npm")]
  LinkNpm {
    node: String,
    /// Also expose the dependency's `bin` entries on the sandbox PATH.
    #[serde(default)]
    executables: bool,
  },

  /// An executable located through the invoking `$PATH`.
  #[serde(rename = "os")]
  Os {
    executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rename: Option<String>,
  },

  /// Another unit's artifact copied into the sandbox wholesale.
  #[serde(rename = "copy")]
  Copy {
    node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subdir: Option<String>,
  },
}

impl BuildDepSpec {
  /// Identifier of the producing unit, for graph edges.
  pub fn unit_dependency(&self) -> Option<&str> {
    match self {
      BuildDepSpec::LinkNpm { node, .. } | BuildDepSpec::Copy { node, .. } => Some(node),
      BuildDepSpec::Npm { .. } | BuildDepSpec::Os { .. } => None,
    }
  }
}
