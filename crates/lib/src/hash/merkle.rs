//! Merkle trees over heterogeneous inputs.
//!
//! A tree is either a leaf (a precomputed digest) or a node mapping names to
//! subtrees. A node's hash is the digest of `"{name}={child_hash}\n"`
//! concatenated over names in ascending order, which makes the hash
//! independent of construction order and free of prefix ambiguity.
//!
//! Trees serialize to a JSON shape that survives a round trip:
//! `{"hash": ..., "elements": {name: subtree-or-hash-string}}`, truncated at
//! a caller-chosen depth (deeper subtrees collapse to their hash string).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::{sha1_hex, HashError};

/// A hash tree committing to every leaf digest and every path to it.
#[derive(Debug, Clone)]
pub enum MerkleTree {
  /// A precomputed digest (file contents, artifact hash, constant, ...).
  Leaf(String),
  /// Named children; the node commits to all of them.
  Node {
    elements: BTreeMap<String, MerkleTree>,
    cached_hash: OnceLock<String>,
  },
}

impl MerkleTree {
  pub fn leaf(hash: impl Into<String>) -> Self {
    MerkleTree::Leaf(hash.into())
  }

  /// Leaf committing to an arbitrary string value.
  pub fn of_value(value: &str) -> Self {
    MerkleTree::Leaf(sha1_hex(value.as_bytes()))
  }

  pub fn node(elements: BTreeMap<String, MerkleTree>) -> Self {
    MerkleTree::Node {
      elements,
      cached_hash: OnceLock::new(),
    }
  }

  pub fn from_entries(entries: impl IntoIterator<Item = (String, MerkleTree)>) -> Self {
    Self::node(entries.into_iter().collect())
  }

  /// The tree's digest. Node hashes are memoized per instance; a tree built
  /// once and hashed from several places pays for the traversal once.
  pub fn hash(&self) -> String {
    match self {
      MerkleTree::Leaf(hash) => hash.clone(),
      MerkleTree::Node {
        elements,
        cached_hash,
      } => cached_hash
        .get_or_init(|| {
          let mut buf = String::new();
          for (name, child) in elements {
            buf.push_str(name);
            buf.push('=');
            buf.push_str(&child.hash());
            buf.push('\n');
          }
          sha1_hex(buf.as_bytes())
        })
        .clone(),
    }
  }

  pub fn elements(&self) -> Option<&BTreeMap<String, MerkleTree>> {
    match self {
      MerkleTree::Leaf(_) => None,
      MerkleTree::Node { elements, .. } => Some(elements),
    }
  }

  /// Compare against `other`, reporting the differences that turn `self`
  /// into `other`.
  ///
  /// Recursion only descends where both sides are nodes; as soon as either
  /// side is a leaf, the difference is reported at that path.
  pub fn compare(&self, other: &MerkleTree) -> MerkleComparison {
    if self.hash() == other.hash() {
      return MerkleComparison::Same;
    }
    let mut diffs = Vec::new();
    collect_differences(self, other, "", &mut diffs);
    MerkleComparison::Different(diffs)
  }

  /// Serialize, collapsing subtrees below `depth` to their hash string.
  /// `None` serializes the full tree.
  pub fn serialize(&self, depth: Option<usize>) -> SerializedMerkleTree {
    match self {
      MerkleTree::Leaf(hash) => SerializedMerkleTree::Hash(hash.clone()),
      MerkleTree::Node { elements, .. } => {
        if depth == Some(0) {
          return SerializedMerkleTree::Hash(self.hash());
        }
        let child_depth = depth.map(|d| d - 1);
        SerializedMerkleTree::Node {
          hash: self.hash(),
          elements: elements
            .iter()
            .map(|(name, child)| (name.clone(), child.serialize(child_depth)))
            .collect(),
        }
      }
    }
  }

  /// Rebuild a tree from its serialized form.
  ///
  /// Every node's recorded hash is validated against the hash recomputed
  /// from its children; a mismatch rejects the whole tree. A successful
  /// round trip therefore yields a tree whose `hash()` equals the
  /// original's, even when the serialization was depth-truncated.
  pub fn deserialize(value: &SerializedMerkleTree) -> Result<MerkleTree, HashError> {
    deserialize_at(value, "")
  }
}

fn deserialize_at(value: &SerializedMerkleTree, path: &str) -> Result<MerkleTree, HashError> {
  match value {
    SerializedMerkleTree::Hash(hash) => Ok(MerkleTree::Leaf(hash.clone())),
    SerializedMerkleTree::Node { hash, elements } => {
      let mut children = BTreeMap::new();
      for (name, child) in elements {
        let child_path = join_path(path, name);
        children.insert(name.clone(), deserialize_at(child, &child_path)?);
      }
      let tree = MerkleTree::node(children);
      let computed = tree.hash();
      if computed != *hash {
        return Err(HashError::CorruptTree {
          path: path.to_string(),
          recorded: hash.clone(),
          computed,
        });
      }
      Ok(tree)
    }
  }
}

fn join_path(prefix: &str, name: &str) -> String {
  if prefix.is_empty() {
    name.to_string()
  } else {
    format!("{prefix}/{name}")
  }
}

fn collect_differences(a: &MerkleTree, b: &MerkleTree, path: &str, out: &mut Vec<MerkleDifference>) {
  match (a.elements(), b.elements()) {
    (Some(a_elems), Some(b_elems)) => {
      for (name, a_child) in a_elems {
        let child_path = join_path(path, name);
        match b_elems.get(name) {
          None => out.push(MerkleDifference::Remove {
            path: child_path,
            old_hash: a_child.hash(),
          }),
          Some(b_child) => {
            if a_child.hash() != b_child.hash() {
              collect_differences(a_child, b_child, &child_path, out);
            }
          }
        }
      }
      for (name, b_child) in b_elems {
        if !a_elems.contains_key(name) {
          out.push(MerkleDifference::Add {
            path: join_path(path, name),
            new_hash: b_child.hash(),
          });
        }
      }
    }
    // A leaf on either side stops the descent.
    _ => out.push(MerkleDifference::Change {
      path: path.to_string(),
      old_hash: a.hash(),
      new_hash: b.hash(),
    }),
  }
}

/// Outcome of comparing two trees.
#[derive(Debug)]
pub enum MerkleComparison {
  Same,
  Different(Vec<MerkleDifference>),
}

impl MerkleComparison {
  pub fn is_same(&self) -> bool {
    matches!(self, MerkleComparison::Same)
  }
}

/// One reason two trees differ, used to explain cache misses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleDifference {
  Add { path: String, new_hash: String },
  Remove { path: String, old_hash: String },
  Change {
    path: String,
    old_hash: String,
    new_hash: String,
  },
}

impl std::fmt::Display for MerkleDifference {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      MerkleDifference::Add { path, .. } => write!(f, "added {path}"),
      MerkleDifference::Remove { path, .. } => write!(f, "removed {path}"),
      MerkleDifference::Change { path, .. } => write!(f, "changed {path}"),
    }
  }
}

/// JSON shape of a serialized tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedMerkleTree {
  /// A collapsed subtree or leaf: just its digest.
  Hash(String),
  /// An expanded node.
  Node {
    hash: String,
    elements: BTreeMap<String, SerializedMerkleTree>,
  },
}
