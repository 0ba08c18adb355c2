//! Artifact tarballs.
//!
//! The local and remote tiers both store artifacts as gzipped tarballs of
//! the file set, with paths relative to the set's root and symlinks kept
//! as links.

use std::fs::File;
use std::io::{self, Cursor};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::fileset::FileSet;

/// Pack a file set into gzipped tar bytes.
pub fn pack(files: &FileSet) -> io::Result<Vec<u8>> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = Builder::new(encoder);
  builder.follow_symlinks(false);

  for rel in files.relative_paths() {
    builder.append_path_with_name(files.absolute(rel), rel)?;
  }

  builder.into_inner()?.finish()
}

/// Unpack gzipped tar bytes beneath `dest_root`, returning the restored
/// file set.
pub fn unpack(bytes: &[u8], dest_root: &Path) -> io::Result<FileSet> {
  std::fs::create_dir_all(dest_root)?;
  let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
  let mut rel_paths = Vec::new();

  for entry in archive.entries()? {
    let mut entry = entry?;
    let rel = entry.path()?.to_path_buf();
    entry.unpack(dest_root.join(&rel))?;
    rel_paths.push(rel);
  }

  Ok(FileSet::from_relative_paths(dest_root, rel_paths))
}

/// Unpack a tarball file beneath `dest_root`.
pub fn unpack_file(tarball: &Path, dest_root: &Path) -> io::Result<FileSet> {
  std::fs::create_dir_all(dest_root)?;
  let mut archive = Archive::new(GzDecoder::new(File::open(tarball)?));
  let mut rel_paths = Vec::new();

  for entry in archive.entries()? {
    let mut entry = entry?;
    let rel = entry.path()?.to_path_buf();
    entry.unpack(dest_root.join(&rel))?;
    rel_paths.push(rel);
  }

  Ok(FileSet::from_relative_paths(dest_root, rel_paths))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn pack_unpack_round_trip() {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("lib")).unwrap();
    fs::write(src.path().join("lib/index.js"), "module.exports = 1;").unwrap();
    fs::write(src.path().join("package.json"), "{}").unwrap();

    let files = FileSet::from_relative_paths(
      src.path(),
      ["lib/index.js", "package.json"].map(std::path::PathBuf::from),
    );
    let bytes = pack(&files).unwrap();

    let dst = TempDir::new().unwrap();
    let restored = unpack(&bytes, dst.path()).unwrap();

    assert_eq!(restored.relative_paths(), files.relative_paths());
    assert_eq!(
      fs::read_to_string(dst.path().join("lib/index.js")).unwrap(),
      "module.exports = 1;"
    );
  }

  #[cfg(unix)]
  #[test]
  fn symlinks_survive_the_round_trip() {
    let src = TempDir::new().unwrap();
    fs::write(src.path().join("real.js"), "x").unwrap();
    std::os::unix::fs::symlink("real.js", src.path().join("alias.js")).unwrap();

    let files = FileSet::from_relative_paths(
      src.path(),
      ["real.js", "alias.js"].map(std::path::PathBuf::from),
    );
    let bytes = pack(&files).unwrap();

    let dst = TempDir::new().unwrap();
    unpack(&bytes, dst.path()).unwrap();

    let link = dst.path().join("alias.js");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap().to_str(), Some("real.js"));
  }
}
