//! Extract units.
//!
//! An extract unit repackages a subset of its dependencies' outputs: the
//! dependencies are installed into a sandbox exactly as they would be for
//! a build, and the files matching the include patterns become the
//! artifact. The classic use is an API-only unit (`**/*.d.ts`) that
//! downstream packages can depend on without rebuilding whenever the
//! implementation changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{BuildCache, CacheLocator};
use crate::fileset::InclusionMatcher;
use crate::hash::MerkleTree;
use crate::inputs::npm::{
  build_dependency_tree, install_dependency_tree, MonoRepoBuildDependency, RegistryDependency,
};
use crate::inputs::NpmDependencyInput;
use crate::sandbox::Sandbox;
use crate::unit::{BuildDepSpec, ExtractUnit};

use super::{BuildContext, BuildError, BuiltArtifact};

/// Where extract artifacts are materialized for the current process.
fn extract_target_dir(ctx: &BuildContext, identifier: &str) -> PathBuf {
  ctx
    .workspace_root
    .join(".nzm-extract")
    .join(identifier.replace('/', "_"))
}

pub async fn build_extract_unit(
  ctx: &BuildContext,
  unit: &ExtractUnit,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> Result<BuiltArtifact, BuildError> {
  let identifier = unit.identifier.clone();
  let (npm_deps, input_tree) = collect_extract_inputs(ctx, unit, dep_artifacts)?;

  let input_hash = input_tree.hash();
  let locator = CacheLocator::named(input_hash, identifier.clone());
  let cache = Arc::new(BuildCache::new(
    ctx.shared_tiers.clone(),
    Arc::clone(&ctx.stats),
  ));

  let target = extract_target_dir(ctx, &identifier);
  if let Some((_, hit)) = cache.lookup(&locator).await {
    match prepare_target(&target) {
      Ok(()) => match hit.fetch(&target).await {
        Ok(files) => {
          info!(unit = %identifier, source = hit.source, "unchanged, using cached extract");
          return Ok(BuiltArtifact {
            identifier,
            files,
            artifact_hash: hit.artifact_hash.clone(),
            from_cache: true,
            hashable: true,
          });
        }
        Err(err) => warn!(unit = %identifier, error = %err, "extract fetch failed, rebuilding"),
      },
      Err(err) => warn!(unit = %identifier, error = %err, "extract target unusable, rebuilding"),
    }
  }

  info!(unit = %identifier, "extracting in sandbox");
  let patterns = unit.extract_patterns.clone();
  let target_clone = target.clone();
  let identifier_clone = identifier.clone();

  let built: BuiltArtifact = Sandbox::with(|sandbox| {
    Box::pin(async move {
      let mut tree = build_dependency_tree(npm_deps.keys().cloned(), &npm_deps);
      tree.hoist();
      install_dependency_tree(&tree, &npm_deps, sandbox).await?;

      let lines: Vec<&str> = patterns.iter().map(String::as_str).collect();
      let mut matcher = InclusionMatcher::new(sandbox.src_dir(), lines);
      let selected = sandbox.in_source_artifacts(&mut matcher)?;

      prepare_target(&target_clone)?;
      let files = {
        let _io = crate::util::io::io_permit().await;
        selected.copy_to(&target_clone)?
      };
      let artifact_hash = files.merkle()?.hash();

      Ok::<_, BuildError>(BuiltArtifact {
        identifier: identifier_clone,
        files,
        artifact_hash,
        from_cache: false,
        hashable: true,
      })
    })
  })
  .await?;

  cache
    .store_deferring(1, &locator, &built.files, &built.artifact_hash)
    .await;

  Ok(built)
}

fn prepare_target(target: &PathBuf) -> Result<(), BuildError> {
  if target.exists() {
    std::fs::remove_dir_all(target).map_err(|source| BuildError::Io {
      path: target.clone(),
      source,
    })?;
  }
  std::fs::create_dir_all(target).map_err(|source| BuildError::Io {
    path: target.clone(),
    source,
  })
}

/// Inputs of an extract unit: its dependency identities plus the pattern
/// list (changing what is extracted must change the hash).
fn collect_extract_inputs(
  ctx: &BuildContext,
  unit: &ExtractUnit,
  dep_artifacts: &BTreeMap<String, BuiltArtifact>,
) -> Result<(BTreeMap<String, NpmDependencyInput>, MerkleTree), BuildError> {
  let mut npm_deps = BTreeMap::new();
  let mut dep_elements = BTreeMap::new();

  for dep in &unit.dependencies {
    match dep {
      BuildDepSpec::LinkNpm { node, executables } => {
        let artifact = dep_artifacts
          .get(node)
          .ok_or_else(|| BuildError::MissingDependency {
            unit: unit.identifier.clone(),
            dependency: node.clone(),
          })?;
        if !artifact.hashable {
          return Err(BuildError::MissingDependency {
            unit: unit.identifier.clone(),
            dependency: format!("{node} (uncacheable, cannot extract)"),
          });
        }
        let npm_name = crate::inputs::PackageJson::load(artifact.files.root())
          .map(|m| if m.name.is_empty() { node.clone() } else { m.name })
          .unwrap_or_else(|_| node.clone());
        dep_elements.insert(node.clone(), MerkleTree::leaf(artifact.artifact_hash.clone()));
        npm_deps.insert(
          npm_name.clone(),
          NpmDependencyInput::MonoRepoBuild(MonoRepoBuildDependency {
            unit_identifier: node.clone(),
            name: npm_name,
            artifact: artifact.files.clone(),
            artifact_hash: artifact.artifact_hash.clone(),
            executables: *executables,
          }),
        );
      }
      BuildDepSpec::Npm {
        name,
        version,
        resolved_location,
        ..
      } => {
        dep_elements.insert(name.clone(), MerkleTree::of_value(version));
        npm_deps.insert(
          name.clone(),
          NpmDependencyInput::Registry(RegistryDependency {
            name: name.clone(),
            version: version.clone(),
            resolved_location: ctx.workspace_root.join(resolved_location),
          }),
        );
      }
      BuildDepSpec::Os { .. } | BuildDepSpec::Copy { .. } => {
        // Extract units consume npm-shaped outputs only.
      }
    }
  }

  let patterns = MerkleTree::from_entries(
    unit
      .extract_patterns
      .iter()
      .enumerate()
      .map(|(i, pattern)| (i.to_string(), MerkleTree::of_value(pattern))),
  );

  let tree = MerkleTree::from_entries([
    ("deps".to_string(), MerkleTree::node(dep_elements)),
    ("patterns".to_string(), patterns),
    (
      "v".to_string(),
      MerkleTree::of_value(crate::consts::LOGIC_VERSION),
    ),
  ]);
  Ok((npm_deps, tree))
}
