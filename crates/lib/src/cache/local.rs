//! The local directory cache tier.
//!
//! Artifacts live under `$HOME/.cache/nozem/local` as
//! `<hh>/<hash>.tar.gz` plus `<hh>/<hash>.json`, where `<hh>` is the first
//! four hex characters of the input hash. A size-capped cleaner drops the
//! oldest tarballs first; cleaning runs one at a time, and requests that
//! arrive while one is running collapse into at most one follow-on pass.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::consts::DEFAULT_LOCAL_CACHE_MB;
use crate::fileset::FileSet;
use crate::util::io::io_permit;

use super::{tarball, ArtifactIndexSchema, CacheError, CacheLocator, CacheTier, CachedArtifact};

#[derive(Default)]
struct CleanState {
  running: bool,
  rerun: bool,
}

/// Directory-backed cache shared by every package in a run.
pub struct LocalCache {
  dir: PathBuf,
  max_size_bytes: u64,
  clean_state: Arc<Mutex<CleanState>>,
}

impl LocalCache {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self::with_max_size_mb(dir, DEFAULT_LOCAL_CACHE_MB)
  }

  pub fn with_max_size_mb(dir: impl Into<PathBuf>, max_size_mb: u64) -> Self {
    LocalCache {
      dir: dir.into(),
      max_size_bytes: max_size_mb * 1_000_000,
      clean_state: Arc::new(Mutex::new(CleanState::default())),
    }
  }

  fn shard_dir(&self, hash: &str) -> PathBuf {
    self.dir.join(&hash[..4.min(hash.len())])
  }

  fn tarball_path(&self, hash: &str) -> PathBuf {
    self.shard_dir(hash).join(format!("{hash}.tar.gz"))
  }

  fn index_path(&self, hash: &str) -> PathBuf {
    self.shard_dir(hash).join(format!("{hash}.json"))
  }

  /// Kick the cleaner. One cleanup runs at a time; concurrent requests
  /// fold into a single follow-on pass.
  fn request_clean(&self) {
    {
      let mut state = self.clean_state.lock().expect("clean state lock");
      if state.running {
        state.rerun = true;
        return;
      }
      state.running = true;
    }

    let dir = self.dir.clone();
    let max = self.max_size_bytes;
    let clean_state = Arc::clone(&self.clean_state);
    tokio::task::spawn_blocking(move || loop {
      if let Err(err) = clean_once(&dir, max) {
        warn!(cache_dir = %dir.display(), error = %err, "cache cleanup failed");
      }
      let mut state = clean_state.lock().expect("clean state lock");
      if state.rerun {
        state.rerun = false;
        continue;
      }
      state.running = false;
      break;
    });
  }
}

fn clean_once(dir: &Path, max_size_bytes: u64) -> io::Result<()> {
  let mut tarballs: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();
  for entry in WalkDir::new(dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
    if entry.file_type().is_file()
      && entry.path().to_string_lossy().ends_with(".tar.gz")
    {
      let meta = entry.metadata().map_err(io::Error::other)?;
      let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
      tarballs.push((entry.path().to_path_buf(), mtime, meta.len()));
    }
  }

  let mut total: u64 = tarballs.iter().map(|(_, _, len)| len).sum();
  if total <= max_size_bytes {
    return Ok(());
  }

  // Oldest first.
  tarballs.sort_by_key(|(_, mtime, _)| *mtime);
  for (path, _, len) in tarballs {
    if total <= max_size_bytes {
      break;
    }
    debug!(tarball = %path.display(), "evicting from local cache");
    std::fs::remove_file(&path)?;
    let index = path_with_json_extension(&path);
    let _ = std::fs::remove_file(index);
    total = total.saturating_sub(len);
  }
  Ok(())
}

fn path_with_json_extension(tarball: &Path) -> PathBuf {
  let name = tarball.file_name().unwrap_or_default().to_string_lossy();
  let stem = name.strip_suffix(".tar.gz").unwrap_or(&name);
  tarball.with_file_name(format!("{stem}.json"))
}

#[async_trait]
impl CacheTier for LocalCache {
  fn name(&self) -> &'static str {
    "local"
  }

  async fn lookup(&self, locator: &CacheLocator) -> Result<Option<CachedArtifact>, CacheError> {
    let index_path = self.index_path(&locator.input_hash);
    let text = match std::fs::read_to_string(&index_path) {
      Ok(text) => text,
      Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => {
        return Err(CacheError::Io {
          path: index_path,
          source,
        })
      }
    };
    let index: ArtifactIndexSchema = serde_json::from_str(&text).map_err(|source| CacheError::Corrupt {
      path: index_path,
      source,
    })?;

    let tarball_path = self.tarball_path(&locator.input_hash);
    let _io = io_permit().await;
    let bytes = std::fs::read(&tarball_path).map_err(|source| CacheError::Io {
      path: tarball_path,
      source,
    })?;

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
    let shard = self.shard_dir(&locator.input_hash);
    std::fs::create_dir_all(&shard).map_err(|source| CacheError::Io {
      path: shard.clone(),
      source,
    })?;

    let _io = io_permit().await;
    let bytes = tarball::pack(files).map_err(|source| CacheError::Io {
      path: files.root().to_path_buf(),
      source,
    })?;

    let tarball_path = self.tarball_path(&locator.input_hash);
    write_file_atomically(&tarball_path, &bytes)?;

    let index = ArtifactIndexSchema {
      artifact_hash: artifact_hash.to_string(),
      artifacts: files.schema(),
    };
    let index_text = serde_json::to_string_pretty(&index).expect("index always serializes");
    write_file_atomically(&self.index_path(&locator.input_hash), index_text.as_bytes())?;

    self.request_clean();
    Ok(())
  }
}

fn write_file_atomically(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
  let tmp = path.with_extension("tmp");
  std::fs::write(&tmp, bytes).map_err(|source| CacheError::Io {
    path: tmp.clone(),
    source,
  })?;
  std::fs::rename(&tmp, path).map_err(|source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  })
}
