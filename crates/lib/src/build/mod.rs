//! Building one unit.
//!
//! The hermetic path: compute the input hash, ask the cache chain, and
//! only when every tier misses open a sandbox, lay out sources and
//! dependencies, run the build command, snapshot the artifacts, copy them
//! back into the source tree and store them under the input hash.
//!
//! A package whose dependency closure contains an uncacheable package
//! cannot be hashed, so it skips all of that and runs its build command
//! directly in the source tree.

pub mod extract;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{BuildCache, CacheLocator, CacheStats, CacheTier, InPlaceCache};
use crate::consts::{NZM_FILE_PATTERN, ROOT_MARKER_FILE};
use crate::fileset::{FileSet, FileSetError, GitignoreMatcher, PatternSet, PatternSetMatcher};
use crate::hash::HashError;
use crate::inputs::npm::{
  build_dependency_tree, install_dependency_tree, MonoRepoBuildDependency,
  MonoRepoInPlaceDependency, RegistryDependency,
};
use crate::inputs::{
  patch_tsconfig, resolve_env, InputError, NpmDependencyInput, OsToolInput, PackageInputs,
  PackageJson,
};
use crate::sandbox::{Sandbox, SandboxError};
use crate::unit::{BuildDepSpec, CommandUnit, Unit};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  #[error(transparent)]
  Input(#[from] InputError),

  #[error(transparent)]
  Sandbox(#[from] SandboxError),

  #[error(transparent)]
  FileSet(#[from] FileSetError),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("missing artifact for dependency '{dependency}' of '{unit}'")]
  MissingDependency { unit: String, dependency: String },

  #[error("failed to access {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Non-hermetic build command failure (the sandboxed variant carries
  /// its own error).
  #[error("command failed with exit code {exit_code}: {command}")]
  CommandFailed { command: String, exit_code: i32 },
}

/// Session-wide state shared by every unit build.
pub struct BuildContext {
  pub workspace_root: PathBuf,
  /// Shared cache tail (local directory, then remote when configured);
  /// the in-place tier is prepended per package.
  pub shared_tiers: Vec<Arc<dyn CacheTier>>,
  pub stats: Arc<CacheStats>,
  /// Also run each package's test script inside the sandbox.
  pub run_tests: bool,
}

impl BuildContext {
  pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
    BuildContext {
      workspace_root: workspace_root.into(),
      shared_tiers: Vec::new(),
      stats: Arc::new(CacheStats::default()),
      run_tests: false,
    }
  }
}

/// The realized output of one unit.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
  pub identifier: String,
  /// Artifact files, rooted where they were materialized (the package's
  /// source directory for command units).
  pub files: FileSet,
  /// Empty for non-hermetic builds.
  pub artifact_hash: String,
  /// Served from a cache tier instead of being rebuilt.
  pub from_cache: bool,
  /// False when the unit (or anything below it) is uncacheable.
  pub hashable: bool,
}

/// Build a unit, given its dependencies' realized artifacts.
pub async fn build_unit(
  ctx: &BuildContext,
  unit: &Unit,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> Result<BuiltArtifact, BuildError> {
  match unit {
    Unit::Command(command) => build_command_unit(ctx, unit, command, dep_artifacts).await,
    Unit::TypescriptBuild(ts) => build_command_unit(ctx, unit, &ts.command, dep_artifacts).await,
    Unit::Extract(extract_unit) => {
      extract::build_extract_unit(ctx, extract_unit, dep_artifacts).await
    }
  }
}

async fn build_command_unit(
  ctx: &BuildContext,
  unit: &Unit,
  command: &CommandUnit,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> Result<BuiltArtifact, BuildError> {
  let identifier = command.identifier.clone();
  let package_dir = ctx.workspace_root.join(&command.root);

  // Decide hermeticity before any hermetic bookkeeping: the in-place
  // path never hashes sources or resolves OS tools, so it must not be
  // able to fail on them either.
  if command.uncacheable || !dependencies_hashable(command, dep_artifacts) {
    return build_in_place(command, &package_dir).await;
  }

  let sources = collect_sources(&package_dir, &command.non_sources)?;
  let inputs = collect_inputs(ctx, command, sources, dep_artifacts)?;

  let input_tree = {
    let _io = crate::util::io::io_permit().await;
    inputs.merkle()?
  };
  let input_hash = input_tree.hash();
  let locator = CacheLocator::named(input_hash, identifier.clone());

  let mut tiers: Vec<Arc<dyn CacheTier>> =
    vec![Arc::new(InPlaceCache::new(&package_dir, input_tree))];
  tiers.extend(ctx.shared_tiers.iter().cloned());
  let cache = Arc::new(BuildCache::new(tiers, Arc::clone(&ctx.stats)));

  if let Some((tier_idx, hit)) = cache.lookup(&locator).await {
    match hit.fetch(&package_dir).await {
      Ok(files) => {
        info!(unit = %identifier, source = hit.source, "unchanged, using cached artifact");
        let absolute: Vec<PathBuf> = files.iter_absolute().collect();
        crate::hash::forget_file_hashes(absolute.iter().map(PathBuf::as_path));

        // Promote into the faster tiers so the next run stops earlier.
        cache
          .store_into(tier_idx, &locator, &files, &hit.artifact_hash)
          .await;
        return Ok(BuiltArtifact {
          identifier,
          files,
          artifact_hash: hit.artifact_hash.clone(),
          from_cache: true,
          hashable: true,
        });
      }
      Err(err) => {
        warn!(unit = %identifier, error = %err, "cache fetch failed, rebuilding");
      }
    }
  }

  let built = run_sandboxed_build(ctx, unit, command, inputs, &package_dir).await?;

  // Sidecar and local tier synchronously; the remote store is detached
  // and can never fail the build.
  cache
    .store_deferring(2, &locator, &built.files, &built.artifact_hash)
    .await;

  Ok(built)
}

/// The hermetic build proper: sandbox in, artifacts out. Everything the
/// closure needs is moved in as owned data, so the sandbox scope owns its
/// whole world.
async fn run_sandboxed_build(
  ctx: &BuildContext,
  unit: &Unit,
  command: &CommandUnit,
  inputs: PackageInputs,
  package_dir: &Path,
) -> Result<BuiltArtifact, BuildError> {
  let identifier = command.identifier.clone();
  info!(unit = %identifier, "building in sandbox");

  let run_tests = ctx.run_tests;
  let patch = unit.patch_tsconfig();
  let root_rel = command.root.clone();
  let build_command = command.build_command.clone();
  let non_artifacts = command.non_artifacts.clone();
  let package_dir = package_dir.to_path_buf();

  // The manifest seeds the dependency tree and names the test script; a
  // package that cannot be read must fail loudly, not build with an
  // empty dependency list. Read it before a sandbox exists to keep.
  let manifest = PackageJson::load(&package_dir)?;

  Sandbox::with(move |sandbox| {
    Box::pin(async move {
      sandbox.touch_file(ROOT_MARKER_FILE)?;
      sandbox.move_src_dir(&root_rel)?;
      sandbox.add_src_files(&inputs.sources, None).await?;

      // Dependencies: hoist, then symlink registry packages and copy
      // monorepo artifacts into a flat node_modules.
      let root_dep_names: Vec<String> = manifest
        .dependencies
        .keys()
        .chain(manifest.dev_dependencies.keys())
        .cloned()
        .collect();
      let mut tree = build_dependency_tree(root_dep_names, &inputs.npm_deps);
      tree.hoist();
      install_dependency_tree(&tree, &inputs.npm_deps, sandbox).await?;

      for tool in inputs.os_tools.values() {
        tool.install(sandbox)?;
      }

      for (declared, location) in &inputs.external_files {
        let Some(file_name) = location.file_name() else {
          continue;
        };
        let files = FileSet::from_relative_paths(
          location.parent().unwrap_or(Path::new("/")),
          [PathBuf::from(file_name)],
        );
        let subdir = Path::new(declared)
          .parent()
          .filter(|p| !p.as_os_str().is_empty())
          .map(|p| p.to_string_lossy().to_string());
        sandbox.add_src_files(&files, subdir.as_deref()).await?;
      }

      for (files, subdir) in inputs.copied_sets.values() {
        sandbox.add_src_files(files, subdir.as_deref()).await?;
      }

      if patch {
        patch_tsconfig_file(&sandbox.src_dir().join("tsconfig.json"))?;
      }

      if let Some(build_command) = &build_command {
        sandbox.execute(build_command, &inputs.env.runtime).await?;
      }

      // The artifact is what the build left in the source tree, minus
      // dependencies, incremental-compile state and our own marker.
      let mut exclusions: Vec<String> = vec![
        "node_modules/".to_string(),
        "*.tsbuildinfo".to_string(),
        ROOT_MARKER_FILE.to_string(),
      ];
      exclusions.extend(non_artifacts.iter().cloned());
      let lines: Vec<&str> = exclusions.iter().map(String::as_str).collect();
      let mut matcher = PatternSetMatcher::new(
        sandbox.src_dir(),
        PatternSet::from_lines(lines.iter().copied()),
      );
      let sandbox_artifacts = sandbox.in_source_artifacts(&mut matcher)?;

      if run_tests {
        if let Some(test_command) = manifest.scripts.get("test") {
          info!(unit = %identifier, "running tests");
          sandbox.execute(test_command, &inputs.env.runtime).await?;
        }
      }

      // Copy outputs back into the real source tree. After tests the
      // tree may hold extra files (coverage, reports); they come along
      // but are not part of the artifact.
      let mut post_test_matcher = PatternSetMatcher::new(
        sandbox.src_dir(),
        PatternSet::from_lines(lines.iter().copied()),
      );
      let copy_back = sandbox.in_source_artifacts(&mut post_test_matcher)?;
      {
        let _io = crate::util::io::io_permit().await;
        copy_back.copy_to(&package_dir)?;
      }

      let files = sandbox_artifacts.rebase(&package_dir);
      let absolute: Vec<PathBuf> = files.iter_absolute().collect();
      crate::hash::forget_file_hashes(absolute.iter().map(PathBuf::as_path));
      let artifact_hash = {
        let _io = crate::util::io::io_permit().await;
        files.merkle()?.hash()
      };

      info!(unit = %identifier, artifact_hash = %artifact_hash, "build complete");
      Ok(BuiltArtifact {
        identifier,
        files,
        artifact_hash,
        from_cache: false,
        hashable: true,
      })
    })
  })
  .await
}

/// Non-hermetic fallback: run the command in the real source tree, with
/// the invoking environment underneath the unit's own.
async fn build_in_place(
  command: &CommandUnit,
  package_dir: &Path,
) -> Result<BuiltArtifact, BuildError> {
  info!(unit = %command.identifier, "uncacheable, building in source tree");

  if let Some(build_command) = &command.build_command {
    let env = resolve_env(&command.env);
    let output = tokio::process::Command::new("/bin/sh")
      .arg("-c")
      .arg(build_command)
      .current_dir(package_dir)
      .envs(&env.runtime)
      .output()
      .await
      .map_err(|source| BuildError::Io {
        path: package_dir.to_path_buf(),
        source,
      })?;
    if !output.status.success() {
      let exit_code = output.status.code().unwrap_or(-1);
      eprintln!("{}", String::from_utf8_lossy(&output.stderr));
      return Err(BuildError::CommandFailed {
        command: build_command.clone(),
        exit_code,
      });
    }
  }

  Ok(BuiltArtifact {
    identifier: command.identifier.clone(),
    files: FileSet::empty(package_dir),
    artifact_hash: String::new(),
    from_cache: false,
    hashable: false,
  })
}

/// A package builds hermetically only when every monorepo dependency
/// produced a hashable artifact; one in-place dependency anywhere below
/// poisons everything downstream of it. Dependencies with no artifact yet
/// are left for `collect_inputs` to report properly.
fn dependencies_hashable(
  command: &CommandUnit,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> bool {
  command.dependencies.iter().all(|dep| match dep {
    BuildDepSpec::LinkNpm { node, .. } => dep_artifacts
      .get(node)
      .map(|artifact| artifact.hashable)
      .unwrap_or(true),
    _ => true,
  })
}

fn collect_sources(package_dir: &Path, non_sources: &[String]) -> Result<FileSet, BuildError> {
  let mut extra: Vec<&str> = vec![NZM_FILE_PATTERN];
  extra.extend(non_sources.iter().map(String::as_str));
  let mut matcher = GitignoreMatcher::new(package_dir).with_extra_patterns(extra);
  Ok(FileSet::from_walk(package_dir, &mut matcher)?)
}

fn collect_inputs(
  ctx: &BuildContext,
  command: &CommandUnit,
  sources: FileSet,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> Result<PackageInputs, BuildError> {
  let mut npm_deps = BTreeMap::new();
  let mut os_tools = BTreeMap::new();
  let mut copy_artifacts = BTreeMap::new();
  let mut copied_sets = BTreeMap::new();

  let external_files: BTreeMap<String, PathBuf> = command
    .non_package_files
    .iter()
    .map(|declared| (declared.clone(), ctx.workspace_root.join(declared)))
    .collect();

  for dep in &command.dependencies {
    match dep {
      BuildDepSpec::Npm {
        name,
        version,
        resolved_location,
        ..
      } => {
        npm_deps.insert(
          name.clone(),
          NpmDependencyInput::Registry(RegistryDependency {
            name: name.clone(),
            version: version.clone(),
            resolved_location: ctx.workspace_root.join(resolved_location),
          }),
        );
      }
      BuildDepSpec::LinkNpm { node, executables } => {
        let artifact = dep_artifacts
          .get(node)
          .ok_or_else(|| BuildError::MissingDependency {
            unit: command.identifier.clone(),
            dependency: node.clone(),
          })?;
        let npm_name = PackageJson::load(artifact.files.root())
          .map(|m| if m.name.is_empty() { node.clone() } else { m.name })
          .unwrap_or_else(|_| node.clone());
        let input = if artifact.hashable {
          NpmDependencyInput::MonoRepoBuild(MonoRepoBuildDependency {
            unit_identifier: node.clone(),
            name: npm_name.clone(),
            artifact: artifact.files.clone(),
            artifact_hash: artifact.artifact_hash.clone(),
            executables: *executables,
          })
        } else {
          NpmDependencyInput::MonoRepoInPlace(MonoRepoInPlaceDependency {
            unit_identifier: node.clone(),
            name: npm_name.clone(),
            root: artifact.files.root().to_path_buf(),
          })
        };
        npm_deps.insert(npm_name, input);
      }
      BuildDepSpec::Os { executable, rename } => {
        let tool = OsToolInput::locate(executable, rename.clone())?;
        os_tools.insert(tool.sandbox_name().to_string(), tool);
      }
      BuildDepSpec::Copy { node, subdir } => {
        let artifact = dep_artifacts
          .get(node)
          .ok_or_else(|| BuildError::MissingDependency {
            unit: command.identifier.clone(),
            dependency: node.clone(),
          })?;
        copy_artifacts.insert(node.clone(), artifact.artifact_hash.clone());
        copied_sets.insert(node.clone(), (artifact.files.clone(), subdir.clone()));
      }
    }
  }

  Ok(PackageInputs {
    sources,
    env: resolve_env(&command.env),
    npm_deps,
    os_tools,
    external_files,
    copy_artifacts,
    copied_sets,
  })
}

fn patch_tsconfig_file(path: &Path) -> Result<(), BuildError> {
  let text = match std::fs::read_to_string(path) {
    Ok(text) => text,
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
    Err(source) => {
      return Err(BuildError::Io {
        path: path.to_path_buf(),
        source,
      })
    }
  };
  let mut value: serde_json::Value = match serde_json::from_str(&text) {
    Ok(value) => value,
    Err(err) => {
      debug!(path = %path.display(), error = %err, "unparseable tsconfig left as-is");
      return Ok(());
    }
  };
  if patch_tsconfig(&mut value) {
    let patched = serde_json::to_string_pretty(&value).expect("tsconfig reserializes");
    std::fs::write(path, patched).map_err(|source| BuildError::Io {
      path: path.to_path_buf(),
      source,
    })?;
  }
  Ok(())
}
