//! nozem-lib: hermetic, content-addressed builds for JS/TS monorepos.
//!
//! The pieces, bottom up:
//! - `hash`: SHA-1 digests, the memoized file-hash cache, Merkle trees
//! - `fileset`: rooted relative path sets, gitignore-style matching
//! - `hoist`: flattening npm dependency trees without breaking resolution
//! - `cache`: the in-place / local / remote artifact cache chain
//! - `sandbox`: throwaway `{bin/, src/}` build directories
//! - `inputs`: typed build inputs and the input Merkle
//! - `build`: the hermetic build of one unit
//! - `graph`: the unit graph and the bounded-parallel build queue
//! - `unit`, `config`: the on-disk schemas (`nozem.json`,
//!   `nozem-cache.json`)
//!
//! The CLI crate wires these together; nothing in here parses arguments
//! or configures logging.

pub mod build;
pub mod cache;
pub mod config;
pub mod consts;
pub mod fileset;
pub mod graph;
pub mod hash;
pub mod hoist;
pub mod inputs;
pub mod sandbox;
pub mod unit;
pub mod util;

pub use build::{build_unit, BuildContext, BuildError, BuiltArtifact};
pub use cache::{BuildCache, CacheLocator, CacheStats, CacheTier};
pub use config::CacheConfig;
pub use fileset::FileSet;
pub use graph::{BuildGraph, BuildQueue, BuildSummary, GraphError, QueueError};
pub use hash::MerkleTree;
pub use unit::{BuildDepSpec, Unit, UnitsFile};
