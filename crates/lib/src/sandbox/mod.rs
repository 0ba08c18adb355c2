//! The hermetic build sandbox.
//!
//! A sandbox is a throwaway directory with two children: `bin/`, holding
//! symlinks to the only executables the build may use, and `src/`, where
//! the command runs. The command gets `PATH=<sandbox>/bin` and exactly the
//! environment the caller passes; nothing else leaks in from the invoking
//! process.
//!
//! On success the directory is deleted; on failure it is left in place and
//! its path logged, so the wreckage can be inspected.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::Builder;
use tracing::{debug, error, info};

use crate::fileset::{FileMatcher, FileSet, FileSetError};

/// Output larger than this is truncated in the failure report written to
/// stderr; verbose test runners routinely exceed smaller limits.
const MAX_REPORTED_OUTPUT: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
  #[error("failed to set up sandbox at {path}: {source}")]
  Setup {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The build command exited non-zero. The single line here is what
  /// callers propagate; the full transcript already went to stderr.
  #[error("command failed with exit code {exit_code}: {command}")]
  CommandFailed { command: String, exit_code: i32 },

  #[error("failed to spawn '{command}': {source}")]
  Spawn {
    command: String,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  FileSet(#[from] FileSetError),
}

/// Result of a sandboxed command.
#[derive(Debug)]
pub struct ExecutionOutput {
  pub stdout: String,
  pub stderr: String,
}

/// A throwaway `{bin/, src/}` directory.
pub struct Sandbox {
  root: PathBuf,
  bin_dir: PathBuf,
  src_dir: PathBuf,
}

impl Sandbox {
  /// Create a fresh sandbox under the system temp directory.
  pub fn create() -> Result<Sandbox, SandboxError> {
    let root = Builder::new()
      .prefix("nzm-build-")
      .tempdir()
      .map_err(|source| SandboxError::Setup {
        path: std::env::temp_dir(),
        source,
      })?
      // Deletion is explicit: a failed build keeps its sandbox.
      .keep();

    let bin_dir = root.join("bin");
    let src_dir = root.join("src");
    for dir in [&bin_dir, &src_dir] {
      std::fs::create_dir_all(dir).map_err(|source| SandboxError::Setup {
        path: dir.clone(),
        source,
      })?;
    }

    debug!(sandbox = %root.display(), "sandbox created");
    Ok(Sandbox {
      root,
      bin_dir,
      src_dir,
    })
  }

  /// Run `f` inside a fresh sandbox. On success the sandbox is deleted;
  /// on error it is kept for post-mortem and its path logged.
  pub async fn with<T, E, F>(f: F) -> Result<T, E>
  where
    E: From<SandboxError> + std::fmt::Display,
    F: for<'a> FnOnce(&'a mut Sandbox) -> futures::future::BoxFuture<'a, Result<T, E>>,
  {
    let mut sandbox = Sandbox::create()?;
    match f(&mut sandbox).await {
      Ok(value) => {
        sandbox.remove();
        Ok(value)
      }
      Err(err) => {
        info!(sandbox = %sandbox.root.display(), "build failed, sandbox kept for inspection");
        Err(err)
      }
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn src_dir(&self) -> &Path {
    &self.src_dir
  }

  pub fn bin_dir(&self) -> &Path {
    &self.bin_dir
  }

  /// Point `src_dir` at a subdirectory, mirroring the monorepo layout so
  /// relative paths (`../../lerna.json`, sibling packages) resolve the
  /// same way they do in the real tree.
  pub fn move_src_dir(&mut self, relative: &str) -> Result<(), SandboxError> {
    let new_src = self.src_dir.join(relative);
    std::fs::create_dir_all(&new_src).map_err(|source| SandboxError::Setup {
      path: new_src.clone(),
      source,
    })?;
    self.src_dir = new_src;
    Ok(())
  }

  /// Symlink an executable into `bin/`. An existing link is replaced.
  pub fn install_executable(
    &self,
    target: &Path,
    name: Option<&str>,
  ) -> Result<(), SandboxError> {
    let name = match name {
      Some(name) => name.to_string(),
      None => target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default(),
    };
    let link = self.bin_dir.join(&name);
    if link.symlink_metadata().is_ok() {
      std::fs::remove_file(&link).map_err(|source| SandboxError::Setup {
        path: link.clone(),
        source,
      })?;
    }
    symlink(target, &link)
  }

  /// Symlink an absolute target to a path relative to the sandbox source
  /// tree (dependency layout uses this for registry packages).
  pub fn install_symlink(&self, rel_source: &Path, target: &Path) -> Result<(), SandboxError> {
    let link = self.src_dir.join(rel_source);
    if let Some(parent) = link.parent() {
      std::fs::create_dir_all(parent).map_err(|source| SandboxError::Setup {
        path: parent.to_path_buf(),
        source,
      })?;
    }
    if link.symlink_metadata().is_ok() {
      std::fs::remove_file(&link).map_err(|source| SandboxError::Setup {
        path: link.clone(),
        source,
      })?;
    }
    symlink(target, &link)
  }

  /// Copy a file set into the source tree, preserving symlinks.
  pub async fn add_src_files(
    &self,
    files: &FileSet,
    subdir: Option<&str>,
  ) -> Result<FileSet, SandboxError> {
    let dest = match subdir {
      Some(subdir) => self.src_dir.join(subdir),
      None => self.src_dir.clone(),
    };
    let _io = crate::util::io::io_permit().await;
    Ok(files.copy_to(&dest)?)
  }

  /// Ensure a zero-byte file exists at `rel` under the source tree.
  pub fn touch_file(&self, rel: &str) -> Result<(), SandboxError> {
    let path = self.src_dir.join(rel);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| SandboxError::Setup {
        path: parent.to_path_buf(),
        source,
      })?;
    }
    if !path.exists() {
      std::fs::write(&path, b"").map_err(|source| SandboxError::Setup { path, source })?;
    }
    Ok(())
  }

  /// Run a shell command with `PATH=bin/` and exactly `env` merged on
  /// top, cwd at the source directory.
  ///
  /// On failure the command, cwd, environment, exit code and both output
  /// streams are written to stderr; the returned error is the concise
  /// single-line form.
  pub async fn execute(
    &self,
    command: &str,
    env: &BTreeMap<String, String>,
  ) -> Result<ExecutionOutput, SandboxError> {
    debug!(command, cwd = %self.src_dir.display(), "executing in sandbox");

    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd
      .arg("-c")
      .arg(command)
      .current_dir(&self.src_dir)
      .env_clear()
      .env("PATH", &self.bin_dir)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    for (key, value) in env {
      cmd.env(key, value);
    }

    let output = cmd.output().await.map_err(|source| SandboxError::Spawn {
      command: command.to_string(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
      let exit_code = output.status.code().unwrap_or(-1);
      error!(
        command,
        cwd = %self.src_dir.display(),
        exit_code,
        env = ?env,
        "build command failed"
      );
      eprintln!("--- stdout ---\n{}", truncated(&stdout));
      eprintln!("--- stderr ---\n{}", truncated(&stderr));
      return Err(SandboxError::CommandFailed {
        command: command.to_string(),
        exit_code,
      });
    }

    Ok(ExecutionOutput { stdout, stderr })
  }

  /// Everything still in the source tree that the matcher admits.
  pub fn in_source_artifacts(
    &self,
    matcher: &mut dyn FileMatcher,
  ) -> Result<FileSet, SandboxError> {
    Ok(FileSet::from_walk(&self.src_dir, matcher)?)
  }

  /// Delete the sandbox directory. Errors are ignored; temp reapers get
  /// anything we miss.
  pub fn remove(self) {
    let _ = std::fs::remove_dir_all(&self.root);
  }
}

/// The tail of `text`, at most `MAX_REPORTED_OUTPUT` bytes. The cut point
/// moves forward to the next char boundary so multi-byte output near the
/// limit cannot panic the failure report.
fn truncated(text: &str) -> &str {
  if text.len() <= MAX_REPORTED_OUTPUT {
    return text;
  }
  let mut cut = text.len() - MAX_REPORTED_OUTPUT;
  while !text.is_char_boundary(cut) {
    cut += 1;
  }
  &text[cut..]
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<(), SandboxError> {
  std::os::unix::fs::symlink(target, link).map_err(|source| SandboxError::Setup {
    path: link.to_path_buf(),
    source,
  })
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> Result<(), SandboxError> {
  std::fs::copy(target, link)
    .map(|_| ())
    .map_err(|source| SandboxError::Setup {
      path: link.to_path_buf(),
      source,
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fileset::MatchAll;
  use std::path::PathBuf;

  fn no_env() -> BTreeMap<String, String> {
    BTreeMap::new()
  }

  #[tokio::test]
  async fn executes_with_restricted_path() {
    let sandbox = Sandbox::create().unwrap();
    // `echo` is a shell builtin, so it works without any bin/ entries,
    // but external tools must not resolve.
    let out = sandbox.execute("echo hello && printf '%s' \"$PATH\"", &no_env()).await.unwrap();
    assert!(out.stdout.contains("hello"));
    assert!(out.stdout.trim_end().ends_with("/bin"));
    sandbox.remove();
  }

  #[tokio::test]
  async fn environment_is_cleared_and_merged() {
    let sandbox = Sandbox::create().unwrap();
    let mut env = no_env();
    env.insert("NZM_TEST_VALUE".to_string(), "forty-two".to_string());
    let out = sandbox
      .execute("printf '%s/%s' \"$NZM_TEST_VALUE\" \"${HOME:-unset}\"", &env)
      .await
      .unwrap();
    assert_eq!(out.stdout, "forty-two/unset");
    sandbox.remove();
  }

  #[tokio::test]
  async fn failure_yields_single_line_error() {
    let sandbox = Sandbox::create().unwrap();
    let err = sandbox.execute("exit 3", &no_env()).await.unwrap_err();
    match err {
      SandboxError::CommandFailed { exit_code, .. } => assert_eq!(exit_code, 3),
      other => panic!("unexpected error: {other}"),
    }
    sandbox.remove();
  }

  #[tokio::test]
  async fn installed_executables_resolve_on_path() {
    let sandbox = Sandbox::create().unwrap();
    sandbox
      .install_executable(Path::new("/bin/sh"), Some("mysh"))
      .unwrap();
    // Replacing an existing link must not fail.
    sandbox
      .install_executable(Path::new("/bin/sh"), Some("mysh"))
      .unwrap();
    let out = sandbox.execute("mysh -c 'echo via-link'", &no_env()).await.unwrap();
    assert!(out.stdout.contains("via-link"));
    sandbox.remove();
  }

  #[tokio::test]
  async fn move_src_dir_mirrors_monorepo_layout() {
    let mut sandbox = Sandbox::create().unwrap();
    let root = sandbox.root().to_path_buf();
    sandbox.move_src_dir("packages/pkg-a").unwrap();
    assert_eq!(sandbox.src_dir(), root.join("src/packages/pkg-a"));

    sandbox.touch_file(".nzmroot").unwrap();
    assert!(root.join("src/packages/pkg-a/.nzmroot").is_file());
    sandbox.remove();
  }

  #[tokio::test]
  async fn in_source_artifacts_sees_command_output() {
    let sandbox = Sandbox::create().unwrap();
    sandbox.execute("echo out > produced.txt", &no_env()).await.unwrap();
    let files = sandbox.in_source_artifacts(&mut MatchAll).unwrap();
    assert_eq!(files.relative_paths(), &[PathBuf::from("produced.txt")]);
    sandbox.remove();
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    // Three-byte chars, sized so the cut lands mid-character.
    let text = "€".repeat(MAX_REPORTED_OUTPUT);
    let tail = truncated(&text);
    assert!(tail.len() <= MAX_REPORTED_OUTPUT);
    assert!(tail.chars().all(|c| c == '€'));

    let short = "short output";
    assert_eq!(truncated(short), short);
  }

  #[tokio::test]
  async fn with_removes_sandbox_on_success() {
    let result: Result<PathBuf, SandboxError> = Sandbox::with(|sb| {
      let root = sb.root().to_path_buf();
      Box::pin(async move { Ok(root) })
    })
    .await;
    let root = result.unwrap();
    assert!(!root.exists(), "successful sandbox should be removed");
  }

  #[tokio::test]
  async fn with_keeps_sandbox_on_failure() {
    let remembered = std::sync::Arc::new(std::sync::Mutex::new(PathBuf::new()));
    let seen = std::sync::Arc::clone(&remembered);
    let failing: Result<(), SandboxError> = Sandbox::with(move |sb| {
      *seen.lock().unwrap() = sb.root().to_path_buf();
      Box::pin(async move {
        Err(SandboxError::CommandFailed {
          command: "false".to_string(),
          exit_code: 1,
        })
      })
    })
    .await;
    assert!(failing.is_err());

    let kept = remembered.lock().unwrap().clone();
    assert!(kept.exists(), "failed sandbox should be kept for inspection");
    let _ = std::fs::remove_dir_all(kept);
  }
}
