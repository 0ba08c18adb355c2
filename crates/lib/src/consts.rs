//! Shared constants.

/// Version tag mixed into every input hash. Bumping it invalidates all
/// caches after a change to the hashing or build logic itself.
pub const LOGIC_VERSION: &str = "3";

/// Per-package sidecar recording the most recent build (in-place cache tier).
pub const SIDECAR_FILE: &str = ".nzm-buildcache";

/// Marker file touched at the sandbox source root so build scripts can
/// detect they are running under nozem.
pub const ROOT_MARKER_FILE: &str = ".nzmroot";

/// Glob excluding nozem's own bookkeeping files from source sets.
pub const NZM_FILE_PATTERN: &str = ".nzm-*";

/// Unit definitions file, searched upward from the invocation directory.
pub const UNITS_FILE: &str = "nozem.json";

/// Optional cache configuration file, searched upward.
pub const CACHE_CONFIG_FILE: &str = "nozem-cache.json";

/// Depth at which the sidecar's input tree is truncated. Three levels is
/// enough to tell `source` from `deps` from a single file when explaining
/// a cache miss, without serializing every leaf.
pub const CHANGE_DETAIL_LEVELS: usize = 3;

/// Key prefix under the remote object store for index objects.
pub const REMOTE_INDEX_PREFIX: &str = "nozem/index/";

/// Key prefix under the remote object store for artifact tarballs.
pub const REMOTE_DATA_PREFIX: &str = "nozem/data/";

/// Default number of package builds running at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default cap on concurrent filesystem-heavy operations (hashing, copies,
/// tarball packing). Keeps descriptor usage bounded on large graphs.
pub const DEFAULT_IO_BUDGET: usize = 4;

/// Default size cap for the local directory cache, in megabytes.
pub const DEFAULT_LOCAL_CACHE_MB: u64 = 5000;
