//! Content hashing.
//!
//! All hashes in nozem are lowercase-hex SHA-1. File hashes are memoized
//! process-wide by absolute path: a package graph hashes the same
//! `node_modules` trees over and over, and the cache turns those repeat
//! visits into map lookups.

pub mod merkle;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use sha1::{Digest, Sha1};
use thiserror::Error;

pub use merkle::{
  MerkleComparison, MerkleDifference, MerkleTree, SerializedMerkleTree,
};

/// Errors from hashing files and reconstructing serialized trees.
#[derive(Debug, Error)]
pub enum HashError {
  /// Reading a file or symlink for hashing failed.
  #[error("failed to hash {path}: {source}")]
  ReadFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// A serialized tree's recorded hash does not match its contents.
  #[error("corrupt serialized tree at '{path}': recorded {recorded}, computed {computed}")]
  CorruptTree {
    path: String,
    recorded: String,
    computed: String,
  },
}

/// SHA-1 of a byte string, lowercase hex.
pub fn sha1_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha1::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

static FILE_HASHES: OnceLock<Mutex<HashMap<PathBuf, String>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<PathBuf, String>> {
  FILE_HASHES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Hash a file on disk, memoized by absolute path.
///
/// Regular files hash their contents; symbolic links hash the link target
/// string, not the pointed-to file. Populating the cache twice for the same
/// path is harmless (both writers compute the same value).
pub fn file_hash(path: &Path) -> Result<String, HashError> {
  let key = if path.is_absolute() {
    path.to_path_buf()
  } else {
    std::env::current_dir().unwrap_or_default().join(path)
  };

  if let Some(hash) = cache().lock().expect("file hash cache poisoned").get(&key) {
    return Ok(hash.clone());
  }

  let hash = uncached_file_hash(&key)?;
  cache()
    .lock()
    .expect("file hash cache poisoned")
    .insert(key, hash.clone());
  Ok(hash)
}

fn uncached_file_hash(path: &Path) -> Result<String, HashError> {
  let meta = fs::symlink_metadata(path).map_err(|source| HashError::ReadFile {
    path: path.to_path_buf(),
    source,
  })?;

  if meta.file_type().is_symlink() {
    let target = fs::read_link(path).map_err(|source| HashError::ReadFile {
      path: path.to_path_buf(),
      source,
    })?;
    return Ok(sha1_hex(target.to_string_lossy().as_bytes()));
  }

  let contents = fs::read(path).map_err(|source| HashError::ReadFile {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(sha1_hex(&contents))
}

/// Drop all memoized file hashes.
///
/// Test hook: tests that rewrite a file in place and expect its hash to
/// change must clear the cache between passes.
pub fn clear_file_hash_cache() {
  cache().lock().expect("file hash cache poisoned").clear();
}

/// Forget the memoized hashes of specific files. Build steps that
/// overwrite files in place (copying artifacts back into the source tree)
/// call this so later hashing sees the new contents.
pub fn forget_file_hashes<'a>(paths: impl IntoIterator<Item = &'a Path>) {
  let mut cache = cache().lock().expect("file hash cache poisoned");
  for path in paths {
    cache.remove(path);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use tempfile::TempDir;

  #[test]
  fn sha1_of_known_input() {
    // sha1("abc")
    assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
  }

  #[test]
  #[serial]
  fn file_hash_is_content_hash() {
    clear_file_hash_cache();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("file.txt");
    fs::write(&path, "abc").unwrap();

    assert_eq!(file_hash(&path).unwrap(), sha1_hex(b"abc"));
  }

  #[test]
  #[serial]
  fn file_hash_is_memoized_until_cleared() {
    clear_file_hash_cache();
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("file.txt");
    fs::write(&path, "one").unwrap();

    let first = file_hash(&path).unwrap();
    fs::write(&path, "two").unwrap();

    // Stale by design: the cache is process-wide.
    assert_eq!(file_hash(&path).unwrap(), first);

    clear_file_hash_cache();
    assert_ne!(file_hash(&path).unwrap(), first);
  }

  #[cfg(unix)]
  #[test]
  #[serial]
  fn symlink_hashes_target_string() {
    clear_file_hash_cache();
    let tmp = TempDir::new().unwrap();
    let link = tmp.path().join("link");
    std::os::unix::fs::symlink("some/target", &link).unwrap();

    assert_eq!(file_hash(&link).unwrap(), sha1_hex(b"some/target"));
  }
}
