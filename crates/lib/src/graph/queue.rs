//! The build queue.
//!
//! A readiness-driven DAG executor: a node becomes buildable the moment
//! every dependency has reported its artifact, tasks run under a bounded
//! semaphore, and completion of one node immediately re-checks its
//! dependents. Failure handling is either bail (default: the run rejects,
//! in-flight tasks drain to completion) or continue (the failed node's
//! reachable dependents are pruned and everything else proceeds).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use petgraph::graph::NodeIndex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::build::{build_unit, BuildContext, BuildError, BuiltArtifact};
use crate::consts::DEFAULT_CONCURRENCY;

use super::BuildGraph;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// Bail mode: the first failure rejects the whole run.
  #[error("build of '{identifier}' failed: {source}")]
  BuildFailed {
    identifier: String,
    #[source]
    source: BuildError,
  },
}

/// Outcome of a full queue run.
#[derive(Debug, Default)]
pub struct BuildSummary {
  /// Units actually built in a sandbox (or in place).
  pub built: usize,
  /// Units served unchanged from a cache tier.
  pub cached: usize,
  /// Identifiers that failed (continue mode only).
  pub failed: Vec<String>,
  /// Units never scheduled because a dependency failed.
  pub pruned: usize,
}

impl BuildSummary {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.pruned == 0
  }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct BuildQueue {
  pub concurrency: usize,
  pub bail: bool,
}

impl Default for BuildQueue {
  fn default() -> Self {
    BuildQueue {
      concurrency: DEFAULT_CONCURRENCY,
      bail: true,
    }
  }
}

impl BuildQueue {
  /// Run the selected portion of the graph to completion.
  ///
  /// A node's build never starts before all of its dependencies have
  /// completed (built or served from cache); siblings run concurrently up
  /// to the configured limit.
  pub async fn execute(
    &self,
    graph: &BuildGraph,
    selection: &HashSet<NodeIndex>,
    ctx: Arc<BuildContext>,
  ) -> Result<BuildSummary, QueueError> {
    if selection.is_empty() {
      return Ok(BuildSummary::default());
    }

    info!(
      units = selection.len(),
      concurrency = self.concurrency,
      bail = self.bail,
      "starting build"
    );

    let artifacts: Arc<Mutex<BTreeMap<String, BuiltArtifact>>> =
      Arc::new(Mutex::new(BTreeMap::new()));
    let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));

    // Unmet dependency counts within the selection.
    let mut unmet: HashMap<NodeIndex, usize> = HashMap::new();
    for &idx in selection {
      unmet.insert(idx, graph.dependencies_of(idx).len());
    }

    let mut enqueued: HashSet<NodeIndex> = HashSet::new();
    let mut failed: Vec<String> = Vec::new();
    let mut pruned = 0usize;
    let mut first_failure: Option<QueueError> = None;

    let mut join_set: JoinSet<(NodeIndex, Result<BuiltArtifact, BuildError>)> = JoinSet::new();

    let spawn = |idx: NodeIndex,
                 join_set: &mut JoinSet<(NodeIndex, Result<BuiltArtifact, BuildError>)>,
                 enqueued: &mut HashSet<NodeIndex>| {
      enqueued.insert(idx);
      let unit = graph.unit(idx).clone();
      let ctx = Arc::clone(&ctx);
      let semaphore = Arc::clone(&semaphore);
      let artifacts = Arc::clone(&artifacts);
      join_set.spawn(async move {
        let _permit = semaphore.acquire().await.expect("queue semaphore closed");
        let deps = artifacts.lock().expect("artifact map lock").clone();
        let result = build_unit(&ctx, &unit, &deps).await;
        (idx, result)
      });
    };

    for &idx in selection {
      if unmet[&idx] == 0 {
        spawn(idx, &mut join_set, &mut enqueued);
      }
    }

    while let Some(joined) = join_set.join_next().await {
      let (idx, result) = match joined {
        Ok(pair) => pair,
        Err(err) => {
          error!(error = %err, "build task panicked");
          continue;
        }
      };
      let identifier = graph.unit(idx).identifier().to_string();

      match result {
        Ok(artifact) => {
          debug!(unit = %identifier, cached = artifact.from_cache, "unit complete");
          artifacts
            .lock()
            .expect("artifact map lock")
            .insert(identifier, artifact);

          if first_failure.is_some() {
            // Bail already triggered: drain without scheduling more.
            continue;
          }
          for dependent in graph.dependents_of(idx) {
            if !selection.contains(&dependent) || enqueued.contains(&dependent) {
              continue;
            }
            let count = unmet.get_mut(&dependent).expect("selected node has a count");
            *count -= 1;
            if *count == 0 {
              spawn(dependent, &mut join_set, &mut enqueued);
            }
          }
        }
        Err(err) => {
          error!(unit = %identifier, error = %err, "unit failed");
          if self.bail {
            if first_failure.is_none() {
              first_failure = Some(QueueError::BuildFailed {
                identifier,
                source: err,
              });
            }
            // In-flight tasks run to completion; nothing new starts.
            continue;
          }

          // Continue mode: mark the whole downstream cone as never
          // schedulable.
          failed.push(identifier);
          let mut cone: HashSet<NodeIndex> = HashSet::new();
          let mut stack = vec![idx];
          while let Some(at) = stack.pop() {
            for dependent in graph.dependents_of(at) {
              if selection.contains(&dependent) && cone.insert(dependent) {
                stack.push(dependent);
              }
            }
          }
          for dependent in cone {
            if enqueued.insert(dependent) {
              debug!(
                unit = graph.unit(dependent).identifier(),
                "pruned: dependency failed"
              );
              pruned += 1;
            }
          }
        }
      }
    }

    if let Some(err) = first_failure {
      return Err(err);
    }

    // Anything selected but never enqueued is stuck; say why.
    if enqueued.len() < selection.len() {
      let done = artifacts.lock().expect("artifact map lock");
      for &idx in selection {
        if enqueued.contains(&idx) {
          continue;
        }
        let missing: Vec<String> = graph
          .dependencies_of(idx)
          .into_iter()
          .map(|d| graph.unit(d).identifier().to_string())
          .filter(|id| !done.contains_key(id))
          .collect();
        warn!(
          unit = graph.unit(idx).identifier(),
          waiting_on = ?missing,
          "unit was never buildable"
        );
      }
    }

    let done = artifacts.lock().expect("artifact map lock");
    let cached = done.values().filter(|a| a.from_cache).count();
    let summary = BuildSummary {
      built: done.len() - cached,
      cached,
      failed,
      pruned,
    };
    info!(
      built = summary.built,
      cached = summary.cached,
      failed = summary.failed.len(),
      pruned = summary.pruned,
      "build finished"
    );
    Ok(summary)
  }
}
