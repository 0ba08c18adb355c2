//! The in-place cache tier.
//!
//! A sidecar file (`.nzm-buildcache`) next to a package's sources records
//! the input tree, the artifact file list and the artifact hash of the
//! most recent build. When the recorded input hash matches the current one
//! and the files on disk still hash to the recorded artifact hash, those
//! files *are* the cached artifact and nothing is copied at all. This is
//! the tier that makes a no-change rebuild of a large monorepo nearly
//! instant.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{CHANGE_DETAIL_LEVELS, SIDECAR_FILE};
use crate::fileset::{FileSet, FileSetSchema};
use crate::hash::{MerkleComparison, MerkleTree, SerializedMerkleTree};
use crate::util::io::io_permit;

use super::{CacheError, CacheLocator, CacheTier, CachedArtifact};

/// On-disk shape of `.nzm-buildcache`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSchema {
  /// Input tree of the recorded build, truncated for readable diffs.
  pub input_tree: SerializedMerkleTree,
  /// Relative paths of the artifact files.
  pub artifacts: FileSetSchema,
  /// Hash of the artifact file set.
  pub artifact_hash: String,
  /// Full artifact tree, for per-file corruption reports.
  pub artifact_tree: SerializedMerkleTree,
}

/// Per-package tier backed by the sidecar file.
pub struct InPlaceCache {
  package_dir: PathBuf,
  /// The package's current full input tree; lookups compare against the
  /// recorded one to explain misses.
  input_tree: MerkleTree,
}

impl InPlaceCache {
  pub fn new(package_dir: impl Into<PathBuf>, input_tree: MerkleTree) -> Self {
    InPlaceCache {
      package_dir: package_dir.into(),
      input_tree,
    }
  }

  fn sidecar_path(&self) -> PathBuf {
    self.package_dir.join(SIDECAR_FILE)
  }

  fn read_sidecar(&self) -> Result<Option<SidecarSchema>, CacheError> {
    let path = self.sidecar_path();
    let text = match std::fs::read_to_string(&path) {
      Ok(text) => text,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(CacheError::Io { path, source }),
    };
    let schema = serde_json::from_str(&text).map_err(|source| CacheError::Corrupt { path, source })?;
    Ok(Some(schema))
  }
}

#[async_trait]
impl CacheTier for InPlaceCache {
  fn name(&self) -> &'static str {
    "in-place"
  }

  async fn lookup(&self, locator: &CacheLocator) -> Result<Option<CachedArtifact>, CacheError> {
    let Some(sidecar) = self.read_sidecar()? else {
      return Ok(None);
    };

    let recorded = MerkleTree::deserialize(&sidecar.input_tree)?;
    if recorded.hash() != locator.input_hash {
      if let MerkleComparison::Different(diffs) = recorded.compare(&self.input_tree) {
        for diff in diffs.iter().take(8) {
          debug!(unit = locator.display(), change = %diff, "input changed since last build");
        }
      }
      return Ok(None);
    }

    // Inputs unchanged; verify the recorded artifacts still exist intact.
    let files = FileSet::from_schema(&self.package_dir, &sidecar.artifacts);
    let _io = io_permit().await;
    let current_hash = files.merkle()?.hash();
    if current_hash != sidecar.artifact_hash {
      debug!(
        unit = locator.display(),
        recorded = %sidecar.artifact_hash,
        actual = %current_hash,
        "in-place artifacts no longer match, ignoring sidecar"
      );
      return Ok(None);
    }

    Ok(Some(CachedArtifact::in_place(
      self.name(),
      sidecar.artifact_hash,
      files,
    )))
  }

  async fn store(
    &self,
    _locator: &CacheLocator,
    files: &FileSet,
    artifact_hash: &str,
  ) -> Result<(), CacheError> {
    let _io = io_permit().await;
    let schema = SidecarSchema {
      input_tree: self.input_tree.serialize(Some(CHANGE_DETAIL_LEVELS)),
      artifacts: files.schema(),
      artifact_hash: artifact_hash.to_string(),
      artifact_tree: files.merkle()?.serialize(None),
    };
    write_atomically(&self.sidecar_path(), &schema)
  }
}

/// Write the sidecar via a temp file and rename, so a crash never leaves a
/// half-written cache record behind.
fn write_atomically(path: &Path, schema: &SidecarSchema) -> Result<(), CacheError> {
  let text = serde_json::to_string_pretty(schema).expect("sidecar always serializes");
  let tmp = path.with_extension("tmp");
  std::fs::write(&tmp, text).map_err(|source| CacheError::Io {
    path: tmp.clone(),
    source,
  })?;
  std::fs::rename(&tmp, path).map_err(|source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn input_tree(tag: &str) -> MerkleTree {
    MerkleTree::from_entries([
      ("source".to_string(), MerkleTree::of_value(tag)),
      ("v".to_string(), MerkleTree::of_value("3")),
    ])
  }

  fn artifact_files(dir: &Path) -> FileSet {
    fs::create_dir_all(dir.join("lib")).unwrap();
    fs::write(dir.join("lib/index.js"), "out").unwrap();
    FileSet::from_relative_paths(dir, [PathBuf::from("lib/index.js")])
  }

  #[tokio::test]
  async fn store_then_lookup_hits_without_copying() {
    let tmp = TempDir::new().unwrap();
    let tree = input_tree("a");
    let locator = CacheLocator::new(tree.hash());
    let cache = InPlaceCache::new(tmp.path(), tree);

    let files = artifact_files(tmp.path());
    let artifact_hash = files.merkle().unwrap().hash();
    cache.store(&locator, &files, &artifact_hash).await.unwrap();

    let hit = cache.lookup(&locator).await.unwrap().expect("should hit");
    assert_eq!(hit.artifact_hash, artifact_hash);

    // Fetch is a no-op: the files keep their original root.
    let fetched = hit.fetch(Path::new("/elsewhere")).await.unwrap();
    assert_eq!(fetched.root(), tmp.path());
  }

  #[tokio::test]
  async fn changed_inputs_miss() {
    let tmp = TempDir::new().unwrap();
    let old_tree = input_tree("a");
    let old_locator = CacheLocator::new(old_tree.hash());
    let cache = InPlaceCache::new(tmp.path(), old_tree);

    let files = artifact_files(tmp.path());
    let hash = files.merkle().unwrap().hash();
    cache.store(&old_locator, &files, &hash).await.unwrap();

    let new_tree = input_tree("b");
    let new_locator = CacheLocator::new(new_tree.hash());
    let cache = InPlaceCache::new(tmp.path(), new_tree);
    assert!(cache.lookup(&new_locator).await.unwrap().is_none());
  }

  #[tokio::test]
  #[serial_test::serial]
  async fn modified_artifacts_invalidate_the_sidecar() {
    let tmp = TempDir::new().unwrap();
    let tree = input_tree("a");
    let locator = CacheLocator::new(tree.hash());

    let files = artifact_files(tmp.path());
    let hash = files.merkle().unwrap().hash();
    {
      let cache = InPlaceCache::new(tmp.path(), tree.clone());
      cache.store(&locator, &files, &hash).await.unwrap();
    }

    fs::write(tmp.path().join("lib/index.js"), "tampered").unwrap();
    crate::hash::clear_file_hash_cache();

    let cache = InPlaceCache::new(tmp.path(), tree);
    assert!(cache.lookup(&locator).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn missing_sidecar_is_a_clean_miss() {
    let tmp = TempDir::new().unwrap();
    let tree = input_tree("a");
    let cache = InPlaceCache::new(tmp.path(), tree.clone());
    assert!(cache.lookup(&CacheLocator::new(tree.hash())).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn corrupt_sidecar_is_an_error_not_a_panic() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join(SIDECAR_FILE), "not json").unwrap();
    let tree = input_tree("a");
    let cache = InPlaceCache::new(tmp.path(), tree.clone());
    let err = cache.lookup(&CacheLocator::new(tree.hash())).await.unwrap_err();
    assert!(matches!(err, CacheError::Corrupt { .. }));
  }
}
