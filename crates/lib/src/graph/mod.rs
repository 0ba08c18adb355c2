//! The build graph.
//!
//! One node per unit from `nozem.json`; an edge from every producer to
//! each unit that depends on it. Loading validates that every referenced
//! producer exists and that the graph is acyclic. Target selection turns
//! the command line into a node set: named units or directories, always
//! closed over dependencies, optionally closed over dependents.

pub mod queue;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::unit::{Unit, UnitError, UnitsFile};

pub use queue::{BuildQueue, BuildSummary, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
  #[error(transparent)]
  Units(#[from] UnitError),

  #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
  DependencyNotFound { unit: String, dependency: String },

  #[error("dependency cycle detected involving '{0}'")]
  Cycle(String),

  #[error("unknown build target '{0}'")]
  UnknownTarget(String),

  #[error("no units found under {0}")]
  EmptySelection(PathBuf),

  #[error("no nodes are buildable (empty graph)")]
  EmptyGraph,
}

/// The loaded, validated unit graph.
#[derive(Debug)]
pub struct BuildGraph {
  workspace_root: PathBuf,
  graph: DiGraph<Unit, ()>,
  by_identifier: HashMap<String, NodeIndex>,
}

impl BuildGraph {
  /// Find `nozem.json` at or above `start_dir` and build the graph.
  pub fn load(start_dir: &Path) -> Result<BuildGraph, GraphError> {
    let (workspace_root, units) = UnitsFile::find_upward(start_dir)?;
    BuildGraph::from_units(workspace_root, units.units)
  }

  pub fn from_units(
    workspace_root: impl Into<PathBuf>,
    units: Vec<Unit>,
  ) -> Result<BuildGraph, GraphError> {
    if units.is_empty() {
      return Err(GraphError::EmptyGraph);
    }

    let mut graph = DiGraph::new();
    let mut by_identifier = HashMap::new();
    for unit in units {
      let identifier = unit.identifier().to_string();
      let idx = graph.add_node(unit);
      by_identifier.insert(identifier, idx);
    }

    for idx in graph.node_indices().collect::<Vec<_>>() {
      let deps: Vec<String> = graph[idx]
        .dependencies()
        .iter()
        .filter_map(|d| d.unit_dependency())
        .map(String::from)
        .collect();
      for dep in deps {
        let Some(&producer) = by_identifier.get(&dep) else {
          return Err(GraphError::DependencyNotFound {
            unit: graph[idx].identifier().to_string(),
            dependency: dep,
          });
        };
        graph.add_edge(producer, idx, ());
      }
    }

    if let Err(cycle) = toposort(&graph, None) {
      return Err(GraphError::Cycle(
        graph[cycle.node_id()].identifier().to_string(),
      ));
    }

    Ok(BuildGraph {
      workspace_root: workspace_root.into(),
      graph,
      by_identifier,
    })
  }

  pub fn workspace_root(&self) -> &Path {
    &self.workspace_root
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn unit(&self, idx: NodeIndex) -> &Unit {
    &self.graph[idx]
  }

  pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
    self.graph.node_indices()
  }

  pub fn dependencies_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
    self
      .graph
      .neighbors_directed(idx, Direction::Incoming)
      .collect()
  }

  pub fn dependents_of(&self, idx: NodeIndex) -> Vec<NodeIndex> {
    self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .collect()
  }

  /// Everything reachable following edges in `direction` from `seeds`
  /// (seeds included).
  fn closure(&self, seeds: &HashSet<NodeIndex>, direction: Direction) -> HashSet<NodeIndex> {
    let mut seen: HashSet<NodeIndex> = seeds.clone();
    let mut stack: Vec<NodeIndex> = seeds.iter().copied().collect();
    while let Some(idx) = stack.pop() {
      for next in self.graph.neighbors_directed(idx, direction) {
        if seen.insert(next) {
          stack.push(next);
        }
      }
    }
    seen
  }

  /// Resolve command-line targets into the set of nodes to build.
  ///
  /// - no targets, invoked at the workspace root: the whole graph;
  /// - no targets elsewhere: units rooted under the current directory;
  /// - explicit targets: unit identifiers, or directories selecting every
  ///   unit rooted beneath them;
  /// - `downstream`: additionally everything reachable from the selection;
  /// - always: the dependency closure, so selected units can build.
  pub fn select_targets(
    &self,
    targets: &[String],
    current_dir: &Path,
    downstream: bool,
  ) -> Result<HashSet<NodeIndex>, GraphError> {
    let mut selected: HashSet<NodeIndex> = HashSet::new();

    if targets.is_empty() {
      if current_dir == self.workspace_root {
        selected.extend(self.graph.node_indices());
      } else {
        let under = self.units_under(current_dir);
        if under.is_empty() {
          return Err(GraphError::EmptySelection(current_dir.to_path_buf()));
        }
        selected.extend(under);
      }
    } else {
      for target in targets {
        if let Some(&idx) = self.by_identifier.get(target) {
          selected.insert(idx);
          continue;
        }
        let as_dir = if Path::new(target).is_absolute() {
          PathBuf::from(target)
        } else {
          current_dir.join(target)
        };
        let under = self.units_under(&as_dir);
        if under.is_empty() {
          return Err(GraphError::UnknownTarget(target.clone()));
        }
        selected.extend(under);
      }
    }

    if downstream {
      selected = self.closure(&selected, Direction::Outgoing);
    }
    Ok(self.closure(&selected, Direction::Incoming))
  }

  fn units_under(&self, dir: &Path) -> Vec<NodeIndex> {
    self
      .graph
      .node_indices()
      .filter(|&idx| {
        self.graph[idx]
          .root()
          .map(|root| self.workspace_root.join(root).starts_with(dir))
          .unwrap_or(false)
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::unit::{BuildDepSpec, CommandUnit};
  use std::collections::BTreeMap;

  fn unit(identifier: &str, root: &str, deps: &[&str]) -> Unit {
    Unit::Command(CommandUnit {
      identifier: identifier.to_string(),
      root: root.to_string(),
      non_sources: vec![],
      non_artifacts: vec![],
      build_command: None,
      dependencies: deps
        .iter()
        .map(|d| BuildDepSpec::LinkNpm {
          node: d.to_string(),
          executables: false,
        })
        .collect(),
      non_package_files: vec![],
      env: BTreeMap::new(),
      uncacheable: false,
    })
  }

  fn diamond() -> BuildGraph {
    // a -> b, a -> c, b -> d, c -> d
    BuildGraph::from_units(
      "/ws",
      vec![
        unit("a", "packages/a", &[]),
        unit("b", "packages/b", &["a"]),
        unit("c", "packages/c", &["a"]),
        unit("d", "packages/d", &["b", "c"]),
      ],
    )
    .unwrap()
  }

  fn ids(graph: &BuildGraph, set: &HashSet<NodeIndex>) -> Vec<String> {
    let mut v: Vec<String> = set
      .iter()
      .map(|&i| graph.unit(i).identifier().to_string())
      .collect();
    v.sort();
    v
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let err = BuildGraph::from_units("/ws", vec![unit("a", "packages/a", &["ghost"])]).unwrap_err();
    assert!(matches!(err, GraphError::DependencyNotFound { .. }));
  }

  #[test]
  fn cycle_is_rejected() {
    let err = BuildGraph::from_units(
      "/ws",
      vec![unit("a", "pa", &["b"]), unit("b", "pb", &["a"])],
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::Cycle(_)));
  }

  #[test]
  fn empty_graph_is_rejected() {
    let err = BuildGraph::from_units("/ws", vec![]).unwrap_err();
    assert!(matches!(err, GraphError::EmptyGraph));
  }

  #[test]
  fn root_invocation_selects_everything() {
    let graph = diamond();
    let selected = graph
      .select_targets(&[], Path::new("/ws"), false)
      .unwrap();
    assert_eq!(selected.len(), 4);
  }

  #[test]
  fn named_target_pulls_in_dependency_closure() {
    let graph = diamond();
    let selected = graph
      .select_targets(&["b".to_string()], Path::new("/ws"), false)
      .unwrap();
    assert_eq!(ids(&graph, &selected), vec!["a", "b"]);
  }

  #[test]
  fn downstream_adds_reverse_closure() {
    let graph = diamond();
    let selected = graph
      .select_targets(&["b".to_string()], Path::new("/ws"), true)
      .unwrap();
    // b's dependents (d) plus everyone's dependency closure (a, c feeds d).
    assert_eq!(ids(&graph, &selected), vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn directory_target_selects_units_beneath() {
    let graph = diamond();
    let selected = graph
      .select_targets(&["/ws/packages/c".to_string()], Path::new("/ws"), false)
      .unwrap();
    assert_eq!(ids(&graph, &selected), vec!["a", "c"]);
  }

  #[test]
  fn subdirectory_invocation_selects_local_units() {
    let graph = diamond();
    let selected = graph
      .select_targets(&[], Path::new("/ws/packages/d"), false)
      .unwrap();
    assert_eq!(ids(&graph, &selected), vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn unknown_target_is_an_error() {
    let graph = diamond();
    let err = graph
      .select_targets(&["nope".to_string()], Path::new("/ws"), false)
      .unwrap_err();
    assert!(matches!(err, GraphError::UnknownTarget(_)));
  }
}
