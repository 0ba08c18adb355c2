//! Rooted sets of relative file paths.
//!
//! A `FileSet` is the unit of artifact bookkeeping: the walked sources of a
//! package, the files restored from a cache tier, the snapshot taken out of
//! a sandbox. Sets are immutable once built; every operation returns a new
//! set. Paths stay sorted, so two sets over the same files compare and hash
//! identically no matter how they were produced.

pub mod ignore;
pub mod walk;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hash::{file_hash, HashError, MerkleTree};

pub use ignore::{GitignoreMatcher, GlobPattern, InclusionMatcher, PatternSet, PatternSetMatcher};
pub use walk::{FileMatcher, MatchAll};

/// Errors from walking, copying and hashing file sets.
#[derive(Debug, thiserror::Error)]
pub enum FileSetError {
  #[error("failed to read directory {path}: {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to copy {from} to {to}: {source}")]
  Copy {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// An ordered collection of paths relative to one root directory.
#[derive(Debug, Clone)]
pub struct FileSet {
  root: PathBuf,
  rel_paths: Vec<PathBuf>,
}

impl FileSet {
  /// Build by walking `root` through a matcher.
  pub fn from_walk(root: &Path, matcher: &mut dyn FileMatcher) -> Result<FileSet, FileSetError> {
    let rel_paths = walk::walk_files(root, matcher)?;
    Ok(FileSet {
      root: root.to_path_buf(),
      rel_paths,
    })
  }

  /// Build from known relative paths; sorts and deduplicates.
  pub fn from_relative_paths(
    root: impl Into<PathBuf>,
    paths: impl IntoIterator<Item = PathBuf>,
  ) -> FileSet {
    let set: BTreeSet<PathBuf> = paths.into_iter().collect();
    FileSet {
      root: root.into(),
      rel_paths: set.into_iter().collect(),
    }
  }

  pub fn empty(root: impl Into<PathBuf>) -> FileSet {
    FileSet {
      root: root.into(),
      rel_paths: Vec::new(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn relative_paths(&self) -> &[PathBuf] {
    &self.rel_paths
  }

  pub fn len(&self) -> usize {
    self.rel_paths.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rel_paths.is_empty()
  }

  pub fn contains(&self, rel: &Path) -> bool {
    self.rel_paths.binary_search_by(|p| p.as_path().cmp(rel)).is_ok()
  }

  pub fn absolute(&self, rel: &Path) -> PathBuf {
    self.root.join(rel)
  }

  pub fn iter_absolute(&self) -> impl Iterator<Item = PathBuf> + '_ {
    self.rel_paths.iter().map(|rel| self.root.join(rel))
  }

  /// The same paths, considered relative to a different root.
  pub fn rebase(&self, new_root: impl Into<PathBuf>) -> FileSet {
    FileSet {
      root: new_root.into(),
      rel_paths: self.rel_paths.clone(),
    }
  }

  /// Paths present in `self` but not in `other` (compared by relative path).
  pub fn except(&self, other: &FileSet) -> FileSet {
    let exclude: BTreeSet<&PathBuf> = other.rel_paths.iter().collect();
    FileSet {
      root: self.root.clone(),
      rel_paths: self
        .rel_paths
        .iter()
        .filter(|p| !exclude.contains(p))
        .cloned()
        .collect(),
    }
  }

  pub fn filter(&self, mut keep: impl FnMut(&Path) -> bool) -> FileSet {
    FileSet {
      root: self.root.clone(),
      rel_paths: self.rel_paths.iter().filter(|p| keep(p)).cloned().collect(),
    }
  }

  /// Drop entries whose file no longer exists on disk.
  pub fn only_existing(&self) -> FileSet {
    self.filter(|rel| fs::symlink_metadata(self.root.join(rel)).is_ok())
  }

  /// Merge with another set sharing this set's root.
  pub fn union(&self, other: &FileSet) -> FileSet {
    let mut set: BTreeSet<PathBuf> = self.rel_paths.iter().cloned().collect();
    set.extend(other.rel_paths.iter().cloned());
    FileSet {
      root: self.root.clone(),
      rel_paths: set.into_iter().collect(),
    }
  }

  /// Copy every file into `dest_root`, preserving relative paths and
  /// symbolic links, creating parent directories as needed. Returns the
  /// set rebased onto the destination.
  pub fn copy_to(&self, dest_root: &Path) -> Result<FileSet, FileSetError> {
    for rel in &self.rel_paths {
      let from = self.root.join(rel);
      let to = dest_root.join(rel);
      copy_entry(&from, &to)?;
    }
    Ok(self.rebase(dest_root))
  }

  /// The set as a Merkle node: every relative path maps to its file's
  /// content hash, so the node hash commits to both names and contents.
  pub fn merkle(&self) -> Result<MerkleTree, FileSetError> {
    let mut elements = BTreeMap::new();
    for rel in &self.rel_paths {
      let hash = file_hash(&self.root.join(rel))?;
      elements.insert(rel.to_string_lossy().replace('\\', "/"), MerkleTree::leaf(hash));
    }
    Ok(MerkleTree::node(elements))
  }

  pub fn schema(&self) -> FileSetSchema {
    FileSetSchema {
      relative_paths: self
        .rel_paths
        .iter()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect(),
    }
  }

  pub fn from_schema(root: impl Into<PathBuf>, schema: &FileSetSchema) -> FileSet {
    FileSet::from_relative_paths(
      root,
      schema.relative_paths.iter().map(PathBuf::from),
    )
  }
}

fn copy_entry(from: &Path, to: &Path) -> Result<(), FileSetError> {
  let wrap = |source: io::Error| FileSetError::Copy {
    from: from.to_path_buf(),
    to: to.to_path_buf(),
    source,
  };

  if let Some(parent) = to.parent() {
    fs::create_dir_all(parent).map_err(wrap)?;
  }

  let meta = fs::symlink_metadata(from).map_err(wrap)?;
  if meta.file_type().is_symlink() {
    let target = fs::read_link(from).map_err(wrap)?;
    if to.symlink_metadata().is_ok() {
      fs::remove_file(to).map_err(wrap)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, to).map_err(wrap)?;
    #[cfg(not(unix))]
    fs::copy(from, to).map(|_| ()).map_err(wrap)?;
  } else {
    fs::copy(from, to).map_err(wrap)?;
  }
  Ok(())
}

/// On-disk shape of a file set (sidecar and cache index files).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSetSchema {
  pub relative_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn touch(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
  }

  fn set_of(root: &Path, paths: &[&str]) -> FileSet {
    FileSet::from_relative_paths(root, paths.iter().map(PathBuf::from))
  }

  #[test]
  fn paths_are_sorted_and_deduplicated() {
    let tmp = TempDir::new().unwrap();
    let set = set_of(tmp.path(), &["b", "a", "b"]);
    assert_eq!(
      set.relative_paths(),
      &[PathBuf::from("a"), PathBuf::from("b")]
    );
  }

  #[test]
  fn except_removes_by_relative_path() {
    let tmp = TempDir::new().unwrap();
    let all = set_of(tmp.path(), &["a", "b", "c"]);
    let drop = set_of(tmp.path(), &["b"]);
    assert_eq!(
      all.except(&drop).relative_paths(),
      &[PathBuf::from("a"), PathBuf::from("c")]
    );
  }

  #[test]
  fn only_existing_drops_missing_files() {
    let tmp = TempDir::new().unwrap();
    touch(&tmp.path().join("real.txt"), "x");
    let set = set_of(tmp.path(), &["real.txt", "ghost.txt"]);
    assert_eq!(
      set.only_existing().relative_paths(),
      &[PathBuf::from("real.txt")]
    );
  }

  #[test]
  fn copy_preserves_structure() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    touch(&src.path().join("a/deep/file.txt"), "hello");

    let set = set_of(src.path(), &["a/deep/file.txt"]);
    let copied = set.copy_to(dst.path()).unwrap();

    assert_eq!(copied.root(), dst.path());
    assert_eq!(
      fs::read_to_string(dst.path().join("a/deep/file.txt")).unwrap(),
      "hello"
    );
  }

  #[cfg(unix)]
  #[test]
  fn copy_preserves_symlinks_as_links() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    touch(&src.path().join("target.txt"), "x");
    std::os::unix::fs::symlink("target.txt", src.path().join("link")).unwrap();

    let set = set_of(src.path(), &["target.txt", "link"]);
    set.copy_to(dst.path()).unwrap();

    let copied_link = dst.path().join("link");
    assert!(fs::symlink_metadata(&copied_link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&copied_link).unwrap(), PathBuf::from("target.txt"));
  }

  #[test]
  fn merkle_commits_to_names_and_contents() {
    let tmp = TempDir::new().unwrap();
    touch(&tmp.path().join("a.txt"), "one");
    touch(&tmp.path().join("b.txt"), "two");

    let set = set_of(tmp.path(), &["a.txt", "b.txt"]);
    let h1 = set.merkle().unwrap().hash();

    // Renaming a file changes the hash even with identical contents.
    fs::rename(tmp.path().join("b.txt"), tmp.path().join("c.txt")).unwrap();
    let renamed = set_of(tmp.path(), &["a.txt", "c.txt"]);
    assert_ne!(renamed.merkle().unwrap().hash(), h1);
  }

  #[test]
  fn schema_round_trip() {
    let tmp = TempDir::new().unwrap();
    let set = set_of(tmp.path(), &["x/y.txt", "z.txt"]);
    let schema = set.schema();
    let back = FileSet::from_schema(tmp.path(), &schema);
    assert_eq!(back.relative_paths(), set.relative_paths());
  }

  #[test]
  fn rebase_keeps_relative_paths() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let set = set_of(a.path(), &["f.txt"]);
    let rebased = set.rebase(b.path());
    assert_eq!(rebased.root(), b.path());
    assert_eq!(rebased.relative_paths(), set.relative_paths());
  }
}
