//! OS tool inputs.
//!
//! A unit may depend on executables from the host (`node`, `sh`, `docker`).
//! The tool is located through the invoking `$PATH` once, up front; inside
//! the sandbox it is reachable only through the `bin/` symlink. The input
//! hash commits to the binary's contents, so a toolchain upgrade changes
//! every dependent package's input hash even though the path stayed the
//! same.

use std::path::{Path, PathBuf};

use crate::hash::{file_hash, HashError};
use crate::sandbox::{Sandbox, SandboxError};

use super::InputError;

#[derive(Debug, Clone)]
pub struct OsToolInput {
  pub executable: String,
  /// Name exposed inside the sandbox; defaults to the executable name.
  pub rename: Option<String>,
  pub resolved: PathBuf,
}

impl OsToolInput {
  /// Find `executable` on the invoking `$PATH`.
  pub fn locate(executable: &str, rename: Option<String>) -> Result<OsToolInput, InputError> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
      let candidate = dir.join(executable);
      if is_executable_file(&candidate) {
        return Ok(OsToolInput {
          executable: executable.to_string(),
          rename,
          resolved: candidate,
        });
      }
    }
    Err(InputError::ToolNotFound {
      name: executable.to_string(),
    })
  }

  /// Name under which the tool appears in `bin/`.
  pub fn sandbox_name(&self) -> &str {
    self.rename.as_deref().unwrap_or(&self.executable)
  }

  pub fn hash(&self) -> Result<String, HashError> {
    file_hash(&self.resolved)
  }

  pub fn install(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
    sandbox.install_executable(&self.resolved, Some(self.sandbox_name()))
  }
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  path
    .metadata()
    .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
  path.is_file()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(unix)]
  #[test]
  fn locates_sh_on_path() {
    let tool = OsToolInput::locate("sh", None).unwrap();
    assert!(tool.resolved.ends_with("sh"));
    assert_eq!(tool.sandbox_name(), "sh");
    assert_eq!(tool.hash().unwrap().len(), 40);
  }

  #[test]
  fn missing_tool_is_an_error() {
    let err = OsToolInput::locate("definitely-not-a-real-tool-xyz", None).unwrap_err();
    assert!(matches!(err, InputError::ToolNotFound { .. }));
  }

  #[test]
  fn rename_changes_sandbox_name() {
    let tool = OsToolInput {
      executable: "python3".to_string(),
      rename: Some("python".to_string()),
      resolved: PathBuf::from("/usr/bin/python3"),
    };
    assert_eq!(tool.sandbox_name(), "python");
  }
}
