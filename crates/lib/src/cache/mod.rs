//! The multi-tier artifact cache.
//!
//! Three tiers compose into a chain, cheapest first: the in-place sidecar
//! next to a package's sources, the local directory cache under the user's
//! home, and a remote object store. Lookup returns the first hit; a
//! successful build stores through to every writable tier. Cache failures
//! are never fatal: they log, trip the offending tier's breaker where one
//! exists, and the build proceeds as if the cache were absent.

pub mod inplace;
pub mod local;
pub mod remote;
pub mod tarball;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fileset::{FileSet, FileSetError, FileSetSchema};
use crate::hash::HashError;

pub use inplace::InPlaceCache;
pub use local::LocalCache;
pub use remote::{MemoryStore, ObjectStore, RemoteCache, S3Store};

/// Errors inside a cache tier. Callers treat every one of these as a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache I/O failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("corrupt cache entry at {path}: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  FileSet(#[from] FileSetError),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("remote store: {0}")]
  Remote(String),

  /// The tier's circuit breaker is open.
  #[error("cache tier disabled after earlier failure")]
  Disabled,
}

/// Index record stored next to a tarball, in the local tier and the
/// remote object store alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactIndexSchema {
  pub artifact_hash: String,
  pub artifacts: FileSetSchema,
}

/// Identifies one cacheable build. Lookup keys on `input_hash` alone;
/// the display name only decorates log lines.
#[derive(Debug, Clone)]
pub struct CacheLocator {
  pub input_hash: String,
  pub display_name: Option<String>,
}

impl CacheLocator {
  pub fn new(input_hash: impl Into<String>) -> Self {
    CacheLocator {
      input_hash: input_hash.into(),
      display_name: None,
    }
  }

  pub fn named(input_hash: impl Into<String>, name: impl Into<String>) -> Self {
    CacheLocator {
      input_hash: input_hash.into(),
      display_name: Some(name.into()),
    }
  }

  pub fn display(&self) -> &str {
    self.display_name.as_deref().unwrap_or(&self.input_hash)
  }
}

/// A cache hit, not yet materialized.
#[derive(Debug)]
pub struct CachedArtifact {
  /// Name of the tier that produced the hit.
  pub source: &'static str,
  pub artifact_hash: String,
  payload: ArtifactPayload,
}

#[derive(Debug)]
enum ArtifactPayload {
  /// The files already sit in their final location.
  InPlace(FileSet),
  /// A tarball plus its index, to be unpacked on fetch.
  Tarball {
    bytes: Vec<u8>,
    index: FileSetSchema,
  },
}

impl CachedArtifact {
  pub fn in_place(source: &'static str, artifact_hash: String, files: FileSet) -> Self {
    CachedArtifact {
      source,
      artifact_hash,
      payload: ArtifactPayload::InPlace(files),
    }
  }

  pub fn tarball(
    source: &'static str,
    artifact_hash: String,
    bytes: Vec<u8>,
    index: FileSetSchema,
  ) -> Self {
    CachedArtifact {
      source,
      artifact_hash,
      payload: ArtifactPayload::Tarball { bytes, index },
    }
  }

  /// Materialize the artifact under `target_dir`. A no-op for in-place
  /// hits (the returned set keeps its original root).
  pub async fn fetch(&self, target_dir: &Path) -> Result<FileSet, CacheError> {
    match &self.payload {
      ArtifactPayload::InPlace(files) => Ok(files.clone()),
      ArtifactPayload::Tarball { bytes, .. } => {
        let _io = crate::util::io::io_permit().await;
        let files = tarball::unpack(bytes, target_dir).map_err(|source| CacheError::Io {
          path: target_dir.to_path_buf(),
          source,
        })?;
        Ok(files)
      }
    }
  }

  /// The artifact's file list without materializing anything.
  pub fn file_names(&self) -> FileSetSchema {
    match &self.payload {
      ArtifactPayload::InPlace(files) => files.schema(),
      ArtifactPayload::Tarball { index, .. } => index.clone(),
    }
  }
}

/// One storage tier in the chain.
#[async_trait]
pub trait CacheTier: Send + Sync {
  fn name(&self) -> &'static str;

  async fn lookup(&self, locator: &CacheLocator) -> Result<Option<CachedArtifact>, CacheError>;

  async fn store(
    &self,
    locator: &CacheLocator,
    files: &FileSet,
    artifact_hash: &str,
  ) -> Result<(), CacheError>;
}

/// Session-wide hit/miss counters, reported at the end of a run.
#[derive(Debug, Default)]
pub struct CacheStats {
  hits: Mutex<BTreeMap<&'static str, u64>>,
  misses: Mutex<u64>,
}

impl CacheStats {
  pub fn record_hit(&self, tier: &'static str) {
    *self.hits.lock().expect("stats lock").entry(tier).or_insert(0) += 1;
  }

  pub fn record_miss(&self) {
    *self.misses.lock().expect("stats lock") += 1;
  }

  pub fn hit_counts(&self) -> BTreeMap<&'static str, u64> {
    self.hits.lock().expect("stats lock").clone()
  }

  pub fn miss_count(&self) -> u64 {
    *self.misses.lock().expect("stats lock")
  }
}

/// The tier chain for one package build.
///
/// The in-place tier is package-specific; the local and remote tiers are
/// shared across the whole run, so a chain is assembled per package from
/// the shared tail.
pub struct BuildCache {
  tiers: Vec<Arc<dyn CacheTier>>,
  stats: Arc<CacheStats>,
}

impl BuildCache {
  pub fn new(tiers: Vec<Arc<dyn CacheTier>>, stats: Arc<CacheStats>) -> Self {
    BuildCache { tiers, stats }
  }

  /// First hit through the chain, together with the index of the tier
  /// that produced it. Tier errors count as misses.
  pub async fn lookup(&self, locator: &CacheLocator) -> Option<(usize, CachedArtifact)> {
    for (idx, tier) in self.tiers.iter().enumerate() {
      match tier.lookup(locator).await {
        Ok(Some(artifact)) => {
          debug!(
            unit = locator.display(),
            tier = tier.name(),
            artifact_hash = %artifact.artifact_hash,
            "cache hit"
          );
          self.stats.record_hit(artifact.source);
          return Some((idx, artifact));
        }
        Ok(None) => {}
        Err(CacheError::Disabled) => {}
        Err(err) => {
          warn!(
            unit = locator.display(),
            tier = tier.name(),
            error = %err,
            "cache lookup failed, treating as miss"
          );
        }
      }
    }
    self.stats.record_miss();
    None
  }

  /// Store into every tier. Failures log and continue; they never
  /// propagate to the caller.
  pub async fn store_everywhere(&self, locator: &CacheLocator, files: &FileSet, artifact_hash: &str) {
    self.store_into(self.tiers.len(), locator, files, artifact_hash).await;
  }

  /// Store into the tiers above `below_tier` (exclusive). Used to promote
  /// an artifact fetched from a slow tier into the faster ones, so the
  /// next run does not reach out again.
  pub async fn store_into(
    &self,
    below_tier: usize,
    locator: &CacheLocator,
    files: &FileSet,
    artifact_hash: &str,
  ) {
    for tier in &self.tiers[..below_tier.min(self.tiers.len())] {
      match tier.store(locator, files, artifact_hash).await {
        Ok(()) => debug!(
          unit = locator.display(),
          tier = tier.name(),
          "artifact stored"
        ),
        Err(CacheError::Disabled) => {}
        Err(err) => warn!(
          unit = locator.display(),
          tier = tier.name(),
          error = %err,
          "cache store failed, continuing"
        ),
      }
    }
  }

  /// Enqueue an asynchronous store-through. The caller does not await the
  /// result and cannot be failed by it.
  pub fn queue_for_storing(
    self: &Arc<Self>,
    locator: CacheLocator,
    files: FileSet,
    artifact_hash: String,
  ) -> tokio::task::JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      cache.store_everywhere(&locator, &files, &artifact_hash).await;
    })
  }

  /// Store into the first `sync_tiers` tiers before returning; the rest
  /// (typically the remote store) are written from a detached task the
  /// caller never awaits.
  pub async fn store_deferring(
    self: &Arc<Self>,
    sync_tiers: usize,
    locator: &CacheLocator,
    files: &FileSet,
    artifact_hash: &str,
  ) {
    let sync_tiers = sync_tiers.min(self.tiers.len());
    self.store_into(sync_tiers, locator, files, artifact_hash).await;

    if sync_tiers < self.tiers.len() {
      let cache = Arc::clone(self);
      let locator = locator.clone();
      let files = files.clone();
      let artifact_hash = artifact_hash.to_string();
      tokio::spawn(async move {
        for tier in &cache.tiers[sync_tiers..] {
          match tier.store(&locator, &files, &artifact_hash).await {
            Ok(()) => debug!(
              unit = locator.display(),
              tier = tier.name(),
              "artifact stored"
            ),
            Err(CacheError::Disabled) => {}
            Err(err) => warn!(
              unit = locator.display(),
              tier = tier.name(),
              error = %err,
              "cache store failed, continuing"
            ),
          }
        }
      });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct StaticTier {
    name: &'static str,
    artifact: Option<(String, FileSet)>,
    fail: bool,
  }

  #[async_trait]
  impl CacheTier for StaticTier {
    fn name(&self) -> &'static str {
      self.name
    }

    async fn lookup(&self, _locator: &CacheLocator) -> Result<Option<CachedArtifact>, CacheError> {
      if self.fail {
        return Err(CacheError::Remote("synthetic failure".to_string()));
      }
      Ok(
        self
          .artifact
          .as_ref()
          .map(|(hash, files)| CachedArtifact::in_place(self.name, hash.clone(), files.clone())),
      )
    }

    async fn store(
      &self,
      _locator: &CacheLocator,
      _files: &FileSet,
      _artifact_hash: &str,
    ) -> Result<(), CacheError> {
      Ok(())
    }
  }

  fn empty_files() -> FileSet {
    FileSet::empty("/nonexistent")
  }

  #[tokio::test]
  async fn lookup_returns_first_hit() {
    let stats = Arc::new(CacheStats::default());
    let cache = BuildCache::new(
      vec![
        Arc::new(StaticTier {
          name: "first",
          artifact: None,
          fail: false,
        }),
        Arc::new(StaticTier {
          name: "second",
          artifact: Some(("abc".to_string(), empty_files())),
          fail: false,
        }),
      ],
      Arc::clone(&stats),
    );

    let (idx, artifact) = cache.lookup(&CacheLocator::new("x")).await.unwrap();
    assert_eq!(idx, 1);
    assert_eq!(artifact.source, "second");
    assert_eq!(stats.hit_counts()["second"], 1);
  }

  #[tokio::test]
  async fn tier_failure_is_a_miss_not_an_error() {
    let stats = Arc::new(CacheStats::default());
    let cache = BuildCache::new(
      vec![
        Arc::new(StaticTier {
          name: "broken",
          artifact: Some(("zzz".to_string(), empty_files())),
          fail: true,
        }),
        Arc::new(StaticTier {
          name: "healthy",
          artifact: Some(("abc".to_string(), empty_files())),
          fail: false,
        }),
      ],
      stats,
    );

    let (idx, artifact) = cache.lookup(&CacheLocator::new("x")).await.unwrap();
    assert_eq!(idx, 1);
    assert_eq!(artifact.artifact_hash, "abc");
  }

  #[tokio::test]
  async fn full_miss_is_counted() {
    let stats = Arc::new(CacheStats::default());
    let cache = BuildCache::new(
      vec![Arc::new(StaticTier {
        name: "only",
        artifact: None,
        fail: false,
      })],
      Arc::clone(&stats),
    );

    assert!(cache.lookup(&CacheLocator::new("x")).await.is_none());
    assert_eq!(stats.miss_count(), 1);
  }
}
