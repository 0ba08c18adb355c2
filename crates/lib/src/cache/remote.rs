//! The remote object-store cache tier.
//!
//! Keys are `nozem/index/<hash>.json` and `nozem/data/<hash>.tar.gz`. On
//! startup a background scan mirrors index objects into a local directory
//! so repeated lookups do not round-trip to the store. Two circuit
//! breakers guard the tier: any read failure disables reads, any write
//! failure disables writes only. A missing or unauthorized remote is the
//! common case, not an error; once a breaker trips the tier goes quiet for
//! the rest of the run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info, warn};

use crate::config::BucketConfig;
use crate::consts::{REMOTE_DATA_PREFIX, REMOTE_INDEX_PREFIX};
use crate::fileset::FileSet;

use super::{tarball, ArtifactIndexSchema, CacheError, CacheLocator, CacheTier, CachedArtifact};

/// Minimal object-store contract the remote tier needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// `Ok(None)` for a missing key.
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

  async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError>;

  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// S3-compatible backend.
pub struct S3Store {
  client: aws_sdk_s3::Client,
  bucket: String,
}

impl S3Store {
  /// Build a client from the workspace's bucket settings. Region and
  /// profile fall back to the ambient AWS environment when unset.
  pub async fn from_config(config: &BucketConfig) -> S3Store {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
      loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(profile) = &config.profile_name {
      loader = loader.profile_name(profile);
    }
    let shared = loader.load().await;
    S3Store {
      client: aws_sdk_s3::Client::new(&shared),
      bucket: config.bucket_name.clone(),
    }
  }
}

#[async_trait]
impl ObjectStore for S3Store {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let response = self
      .client
      .get_object()
      .bucket(&self.bucket)
      .key(key)
      .send()
      .await;
    match response {
      Ok(output) => {
        let bytes = output
          .body
          .collect()
          .await
          .map_err(|err| CacheError::Remote(err.to_string()))?;
        Ok(Some(bytes.into_bytes().to_vec()))
      }
      Err(err) => {
        if err
          .as_service_error()
          .map(|service| service.is_no_such_key())
          .unwrap_or(false)
        {
          return Ok(None);
        }
        Err(CacheError::Remote(err.to_string()))
      }
    }
  }

  async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError> {
    self
      .client
      .put_object()
      .bucket(&self.bucket)
      .key(key)
      .body(ByteStream::from(body))
      .send()
      .await
      .map_err(|err| CacheError::Remote(err.to_string()))?;
    Ok(())
  }

  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
    let mut keys = Vec::new();
    let mut pages = self
      .client
      .list_objects_v2()
      .bucket(&self.bucket)
      .prefix(prefix)
      .into_paginator()
      .send();
    while let Some(page) = pages.next().await {
      let page = page.map_err(|err| CacheError::Remote(err.to_string()))?;
      for object in page.contents() {
        if let Some(key) = object.key() {
          keys.push(key.to_string());
        }
      }
    }
    Ok(keys)
  }
}

/// In-memory store, for tests and for running without credentials.
#[derive(Default)]
pub struct MemoryStore {
  objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
    Ok(self.objects.lock().expect("memory store lock").get(key).cloned())
  }

  async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), CacheError> {
    self
      .objects
      .lock()
      .expect("memory store lock")
      .insert(key.to_string(), body);
    Ok(())
  }

  async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
    Ok(
      self
        .objects
        .lock()
        .expect("memory store lock")
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}

/// The remote tier proper.
pub struct RemoteCache {
  store: Arc<dyn ObjectStore>,
  mirror_dir: PathBuf,
  mirror_complete: AtomicBool,
  read_disabled: AtomicBool,
  write_disabled: AtomicBool,
}

impl RemoteCache {
  pub fn new(store: Arc<dyn ObjectStore>, mirror_dir: impl Into<PathBuf>) -> Self {
    RemoteCache {
      store,
      mirror_dir: mirror_dir.into(),
      mirror_complete: AtomicBool::new(false),
      read_disabled: AtomicBool::new(false),
      write_disabled: AtomicBool::new(false),
    }
  }

  /// Start the background index mirror. Returns immediately; once the
  /// scan completes, negative lookups stop hitting the network.
  pub fn start_index_mirror(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(err) = cache.mirror_indexes().await {
        warn!(error = %err, "remote index scan failed, disabling remote reads");
        cache.read_disabled.store(true, Ordering::Relaxed);
      }
    })
  }

  async fn mirror_indexes(&self) -> Result<(), CacheError> {
    std::fs::create_dir_all(&self.mirror_dir).map_err(|source| CacheError::Io {
      path: self.mirror_dir.clone(),
      source,
    })?;

    let keys = self.store.list_keys(REMOTE_INDEX_PREFIX).await?;
    let mut fetched = 0usize;
    for key in &keys {
      let Some(name) = key.strip_prefix(REMOTE_INDEX_PREFIX) else {
        continue;
      };
      let local = self.mirror_dir.join(name);
      if local.exists() {
        continue;
      }
      if let Some(bytes) = self.store.get(key).await? {
        std::fs::write(&local, bytes).map_err(|source| CacheError::Io {
          path: local.clone(),
          source,
        })?;
        fetched += 1;
      }
    }
    self.mirror_complete.store(true, Ordering::Relaxed);
    info!(total = keys.len(), fetched, "remote index mirror complete");
    Ok(())
  }

  fn index_key(hash: &str) -> String {
    format!("{REMOTE_INDEX_PREFIX}{hash}.json")
  }

  fn data_key(hash: &str) -> String {
    format!("{REMOTE_DATA_PREFIX}{hash}.tar.gz")
  }

  fn mirror_path(&self, hash: &str) -> PathBuf {
    self.mirror_dir.join(format!("{hash}.json"))
  }

  fn trip_read(&self, err: &CacheError) {
    warn!(error = %err, "remote cache read failed, disabling remote reads");
    self.read_disabled.store(true, Ordering::Relaxed);
  }

  fn trip_write(&self, err: &CacheError) {
    warn!(error = %err, "remote cache write failed, disabling remote writes");
    self.write_disabled.store(true, Ordering::Relaxed);
  }

  pub fn reads_disabled(&self) -> bool {
    self.read_disabled.load(Ordering::Relaxed)
  }

  pub fn writes_disabled(&self) -> bool {
    self.write_disabled.load(Ordering::Relaxed)
  }

  /// Load the index record, preferring the mirror.
  async fn load_index(&self, hash: &str) -> Result<Option<ArtifactIndexSchema>, CacheError> {
    let mirror = self.mirror_path(hash);
    let bytes = if mirror.is_file() {
      Some(std::fs::read(&mirror).map_err(|source| CacheError::Io {
        path: mirror.clone(),
        source,
      })?)
    } else if self.mirror_complete.load(Ordering::Relaxed) {
      // The scan saw everything; absence from the mirror is a miss.
      None
    } else {
      let fetched = self.store.get(&Self::index_key(hash)).await?;
      if let Some(bytes) = &fetched {
        let _ = std::fs::create_dir_all(&self.mirror_dir);
        let _ = std::fs::write(&mirror, bytes);
      }
      fetched
    };

    match bytes {
      None => Ok(None),
      Some(bytes) => {
        let index = serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
          path: mirror,
          source,
        })?;
        Ok(Some(index))
      }
    }
  }
}

#[async_trait]
impl CacheTier for RemoteCache {
  fn name(&self) -> &'static str {
    "remote"
  }

  async fn lookup(&self, locator: &CacheLocator) -> Result<Option<CachedArtifact>, CacheError> {
    if self.reads_disabled() {
      return Err(CacheError::Disabled);
    }

    let index = match self.load_index(&locator.input_hash).await {
      Ok(index) => index,
      Err(err) => {
        self.trip_read(&err);
        return Err(err);
      }
    };
    let Some(index) = index else {
      return Ok(None);
    };

    let data = match self.store.get(&Self::data_key(&locator.input_hash)).await {
      Ok(data) => data,
      Err(err) => {
        self.trip_read(&err);
        return Err(err);
      }
    };
    let Some(bytes) = data else {
      debug!(unit = locator.display(), "remote index without data object");
      return Ok(None);
    };

    Ok(Some(CachedArtifact::tarball(
      self.name(),
      index.artifact_hash,
      bytes,
      index.artifacts,
    )))
  }

  async fn store(
    &self,
    locator: &CacheLocator,
    files: &FileSet,
    artifact_hash: &str,
  ) -> Result<(), CacheError> {
    if self.writes_disabled() {
      return Err(CacheError::Disabled);
    }

    let bytes = {
      let _io = crate::util::io::io_permit().await;
      tarball::pack(files).map_err(|source| CacheError::Io {
        path: files.root().to_path_buf(),
        source,
      })?
    };
    let index = ArtifactIndexSchema {
      artifact_hash: artifact_hash.to_string(),
      artifacts: files.schema(),
    };
    let index_bytes = serde_json::to_vec(&index).expect("index always serializes");

    // Data first: an index object never points at a missing tarball.
    let result = async {
      self
        .store
        .put(&Self::data_key(&locator.input_hash), bytes)
        .await?;
      self
        .store
        .put(&Self::index_key(&locator.input_hash), index_bytes.clone())
        .await
    }
    .await;

    if let Err(err) = result {
      self.trip_write(&err);
      return Err(err);
    }

    // Keep the mirror coherent for this process's later lookups.
    let _ = std::fs::create_dir_all(&self.mirror_dir);
    let _ = std::fs::write(self.mirror_path(&locator.input_hash), index_bytes);
    Ok(())
  }
}
