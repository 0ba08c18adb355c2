//! Cache configuration.
//!
//! `nozem-cache.json` is optional and searched upward from the invocation
//! directory. Absent settings fall back to a local cache under the user's
//! home and no remote tier.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::CACHE_CONFIG_FILE;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
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
}

/// Contents of `nozem-cache.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
  /// Overrides the local directory cache location.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_dir: Option<PathBuf>,

  /// Remote object-store settings; no remote tier when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cache_bucket: Option<BucketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
  pub bucket_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub profile_name: Option<String>,
}

impl CacheConfig {
  /// Search upward from `start`; returns the default config when no file
  /// exists anywhere on the path.
  pub fn find_upward(start: &Path) -> Result<CacheConfig, ConfigError> {
    let mut dir = Some(start);
    while let Some(d) = dir {
      let candidate = d.join(CACHE_CONFIG_FILE);
      if candidate.is_file() {
        return CacheConfig::load(&candidate);
      }
      dir = d.parent();
    }
    Ok(CacheConfig::default())
  }

  pub fn load(path: &Path) -> Result<CacheConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Effective local cache directory: the configured one, or
  /// `$HOME/.cache/nozem/local`.
  pub fn local_cache_dir(&self) -> PathBuf {
    if let Some(dir) = &self.cache_dir {
      return dir.clone();
    }
    dirs::home_dir()
      .unwrap_or_else(std::env::temp_dir)
      .join(".cache")
      .join("nozem")
      .join("local")
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn defaults_when_no_file_found() {
    let tmp = TempDir::new().unwrap();
    let config = CacheConfig::find_upward(tmp.path()).unwrap();
    assert!(config.cache_bucket.is_none());
    assert!(config.cache_dir.is_none());
    assert!(config.local_cache_dir().ends_with("nozem/local"));
  }

  #[test]
  fn loads_bucket_settings() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(
      tmp.path().join(CACHE_CONFIG_FILE),
      r#"{
        "cacheDir": "/var/cache/nozem",
        "cacheBucket": {"bucketName": "builds", "region": "eu-west-1", "profileName": "ci"}
      }"#,
    )
    .unwrap();
    let nested = tmp.path().join("deep/dir");
    std::fs::create_dir_all(&nested).unwrap();

    let config = CacheConfig::find_upward(&nested).unwrap();
    assert_eq!(config.local_cache_dir(), PathBuf::from("/var/cache/nozem"));
    let bucket = config.cache_bucket.unwrap();
    assert_eq!(bucket.bucket_name, "builds");
    assert_eq!(bucket.region.as_deref(), Some("eu-west-1"));
    assert_eq!(bucket.profile_name.as_deref(), Some("ci"));
  }
}
