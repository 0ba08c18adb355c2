//! Matcher-driven directory walking.
//!
//! `walkdir` is fine for flat scans, but source walks must prune whole
//! directories through the matcher before descending (a `node_modules` tree
//! can be six figures of files), so this walk recurses by hand.

use std::fs;
use std::path::{Path, PathBuf};

use super::FileSetError;

/// Admits or prunes paths during a walk. Implementations may carry state
/// (the gitignore matcher loads pattern files as directories are visited).
pub trait FileMatcher {
  /// Return false to prune the directory: nothing beneath it is visited.
  fn visit_directory(&mut self, path: &Path) -> bool;

  /// Return true to admit the file into the result set.
  fn visit_file(&mut self, path: &Path) -> bool;
}

/// A matcher admitting everything.
#[derive(Debug, Default)]
pub struct MatchAll;

impl FileMatcher for MatchAll {
  fn visit_directory(&mut self, _path: &Path) -> bool {
    true
  }

  fn visit_file(&mut self, _path: &Path) -> bool {
    true
  }
}

/// Enumerate files beneath `root`, filtered by `matcher`.
///
/// Returns paths relative to `root`, sorted lexicographically. Symbolic
/// links are treated as files, never followed as directories.
pub fn walk_files(root: &Path, matcher: &mut dyn FileMatcher) -> Result<Vec<PathBuf>, FileSetError> {
  let mut found = Vec::new();
  walk_into(root, root, matcher, &mut found)?;
  found.sort();
  Ok(found)
}

fn walk_into(
  root: &Path,
  dir: &Path,
  matcher: &mut dyn FileMatcher,
  found: &mut Vec<PathBuf>,
) -> Result<(), FileSetError> {
  let entries = fs::read_dir(dir).map_err(|source| FileSetError::ReadDir {
    path: dir.to_path_buf(),
    source,
  })?;

  for entry in entries {
    let entry = entry.map_err(|source| FileSetError::ReadDir {
      path: dir.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    let file_type = entry.file_type().map_err(|source| FileSetError::ReadDir {
      path: path.clone(),
      source,
    })?;

    // symlink_metadata semantics: a symlink to a directory is a file here.
    if file_type.is_dir() {
      if matcher.visit_directory(&path) {
        walk_into(root, &path, matcher, found)?;
      }
    } else if matcher.visit_file(&path) {
      let rel = path
        .strip_prefix(root)
        .expect("walked path is always under root")
        .to_path_buf();
      found.push(rel);
    }
  }
  Ok(())
}
