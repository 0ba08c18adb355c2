//! Dependency tree hoisting.
//!
//! Turns a nested npm-style dependency tree into the flattest layout that
//! still resolves every package to the version it asked for, the way a
//! package manager lays out `node_modules`.
//!
//! The algorithm is monotone and runs in two phases over an arena of nodes
//! (cycles are broken by the tree builder before hoisting, see
//! `inputs::npm`):
//!
//! 1. **Move up** — walk the tree in declaration order and copy every
//!    dependency into the topmost ancestor whose slot for that name is
//!    still vacant. A slot holding a different version is skipped over
//!    (the scan continues below it); one holding the same version ends the
//!    scan. The original entry stays in place for now. Declaration order
//!    matters: the first package to claim a top-level slot wins, and a
//!    conflicting version further down stays nested.
//! 2. **Cleanup** — first delete entries an ancestor already provides at
//!    the same version (the leftover copies from phase 1), then delete
//!    entries that nothing in the subtree below their holder originally
//!    depended on. Usefulness is judged against per-node snapshots of the
//!    dependency declarations taken before any mutation; judging against
//!    the mutated tree would let a hoisted package shadow the version a
//!    neighbour actually needs.

use std::collections::BTreeSet;
use std::collections::HashSet;

/// Index of a node within its [`PackageTree`] arena.
pub type NodeId = usize;

#[derive(Debug)]
struct NodeData<T> {
  version: String,
  payload: T,
  /// Children in declaration order. Multiple parents may reference one
  /// node after phase 1; entries are owned per-parent.
  children: Vec<(String, NodeId)>,
  /// `(name, version)` pairs this node declared before hoisting.
  original: BTreeSet<(String, String)>,
  /// When false, the node's own subtree is left untouched (its internal
  /// layout is already correct, e.g. a registry package's bundled deps).
  hoist_inside: bool,
}

/// An npm-style dependency tree in arena storage.
///
/// Node 0 is the root (the package whose `node_modules` is being laid
/// out); it has a version only for uniformity.
#[derive(Debug)]
pub struct PackageTree<T> {
  nodes: Vec<NodeData<T>>,
}

impl<T> PackageTree<T> {
  pub fn new(root_payload: T) -> Self {
    PackageTree {
      nodes: vec![NodeData {
        version: String::new(),
        payload: root_payload,
        children: Vec::new(),
        original: BTreeSet::new(),
        hoist_inside: true,
      }],
    }
  }

  pub const ROOT: NodeId = 0;

  /// Add a dependency node under `parent`. Returns the new node's id.
  pub fn add_child(
    &mut self,
    parent: NodeId,
    name: impl Into<String>,
    version: impl Into<String>,
    payload: T,
  ) -> NodeId {
    let id = self.nodes.len();
    self.nodes.push(NodeData {
      version: version.into(),
      payload,
      children: Vec::new(),
      original: BTreeSet::new(),
      hoist_inside: true,
    });
    self.nodes[parent].children.push((name.into(), id));
    id
  }

  /// Mark a node's subtree as off-limits for hoisting.
  pub fn keep_subtree_intact(&mut self, node: NodeId) {
    self.nodes[node].hoist_inside = false;
  }

  pub fn version(&self, node: NodeId) -> &str {
    &self.nodes[node].version
  }

  pub fn payload(&self, node: NodeId) -> &T {
    &self.nodes[node].payload
  }

  /// Children of a node in declaration order.
  pub fn children(&self, node: NodeId) -> impl Iterator<Item = (&str, NodeId)> {
    self.nodes[node].children.iter().map(|(n, id)| (n.as_str(), *id))
  }

  fn child_named(&self, node: NodeId, name: &str) -> Option<NodeId> {
    self
      .nodes[node]
      .children
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, id)| *id)
  }

  /// Flatten the tree in place.
  pub fn hoist(&mut self) {
    self.snapshot_originals();
    loop {
      if !self.move_up() {
        break;
      }
    }
    self.remove_duplicates(Self::ROOT, &mut Vec::new());
    loop {
      if !self.remove_useless(Self::ROOT) {
        break;
      }
    }
  }

  fn snapshot_originals(&mut self) {
    for id in 0..self.nodes.len() {
      let declared: BTreeSet<(String, String)> = self.nodes[id]
        .children
        .iter()
        .map(|(name, child)| (name.clone(), self.nodes[*child].version.clone()))
        .collect();
      self.nodes[id].original = declared;
    }
  }

  /// Phase 1. Returns whether anything moved.
  fn move_up(&mut self) -> bool {
    let mut visited = HashSet::new();
    let mut chain = vec![Self::ROOT];
    self.move_up_node(Self::ROOT, &mut chain, &mut visited)
  }

  fn move_up_node(
    &mut self,
    node: NodeId,
    chain: &mut Vec<NodeId>,
    visited: &mut HashSet<NodeId>,
  ) -> bool {
    if !visited.insert(node) {
      return false;
    }
    let mut changed = false;

    let mut i = 0;
    while i < self.nodes[node].children.len() {
      let (name, child) = self.nodes[node].children[i].clone();

      // Topmost proper ancestor with a vacant slot for this name. A slot
      // occupied by the same version means an equivalent copy is already
      // at least as high as we could go; one occupied by a different
      // version is skipped over and the scan continues below it.
      let mut target = None;
      for ancestor in chain[..chain.len() - 1].iter().copied() {
        match self.child_named(ancestor, &name) {
          None => {
            target = Some(ancestor);
            break;
          }
          Some(existing) => {
            if self.nodes[existing].version == self.nodes[child].version {
              break;
            }
          }
        }
      }
      if let Some(target) = target {
        self.nodes[target].children.push((name.clone(), child));
        changed = true;
      }

      if self.nodes[child].hoist_inside {
        chain.push(child);
        changed |= self.move_up_node(child, chain, visited);
        chain.pop();
      }
      i += 1;
    }
    changed
  }

  /// Phase 2a: drop entries an ancestor provides at the same version.
  /// Top-down, so a parent is canonical before its children are judged.
  fn remove_duplicates(&mut self, node: NodeId, provided: &mut Vec<(String, String)>) {
    let mut kept = Vec::new();
    for (name, child) in self.nodes[node].children.clone() {
      let version = self.nodes[child].version.clone();
      let duplicate = provided.iter().any(|(n, v)| *n == name && *v == version);
      if !duplicate {
        kept.push((name, child));
      }
    }
    self.nodes[node].children = kept;

    let added: Vec<(String, String)> = self.nodes[node]
      .children
      .iter()
      .map(|(name, child)| (name.clone(), self.nodes[*child].version.clone()))
      .collect();
    let base = provided.len();
    provided.extend(added);
    for (name, child) in self.nodes[node].children.clone() {
      let _ = name;
      if self.nodes[child].hoist_inside {
        self.remove_duplicates(child, provided);
      }
    }
    provided.truncate(base);
  }

  /// Phase 2b: drop entries nothing below their holder originally asked
  /// for. Returns whether anything was removed (removals can expose more).
  fn remove_useless(&mut self, node: NodeId) -> bool {
    let mut changed = false;
    let children = self.nodes[node].children.clone();
    let mut kept = Vec::with_capacity(children.len());
    for (name, child) in &children {
      let version = self.nodes[*child].version.clone();
      if self.subtree_originally_requires(node, name, &version) {
        kept.push((name.clone(), *child));
      } else {
        changed = true;
      }
    }
    self.nodes[node].children = kept;

    for (_, child) in self.nodes[node].children.clone() {
      if self.nodes[child].hoist_inside {
        changed |= self.remove_useless(child);
      }
    }
    changed
  }

  /// Does any node in the subtree rooted at `node` (itself included) have
  /// `name@version` in its pre-hoist declarations?
  fn subtree_originally_requires(&self, node: NodeId, name: &str, version: &str) -> bool {
    let mut stack = vec![node];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
      if !seen.insert(id) {
        continue;
      }
      if self.nodes[id]
        .original
        .contains(&(name.to_string(), version.to_string()))
      {
        return true;
      }
      stack.extend(self.nodes[id].children.iter().map(|(_, c)| *c));
    }
    false
  }

  /// Render as `path=version` lines for inspection and tests: root
  /// children appear bare, nested entries joined with `.`.
  pub fn render(&self) -> Vec<String> {
    let mut out = Vec::new();
    self.render_node(Self::ROOT, "", &mut out);
    out.sort();
    out
  }

  fn render_node(&self, node: NodeId, prefix: &str, out: &mut Vec<String>) {
    for (name, child) in &self.nodes[node].children {
      let path = if prefix.is_empty() {
        name.clone()
      } else {
        format!("{prefix}.{name}")
      };
      out.push(format!("{path}={}", self.nodes[*child].version));
      self.render_node(*child, &path, out);
    }
  }
}
