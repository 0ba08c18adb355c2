//! Implementation of `nozem build`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use nozem_lib::build::BuildContext;
use nozem_lib::cache::{CacheTier, LocalCache, RemoteCache, S3Store};
use nozem_lib::config::CacheConfig;
use nozem_lib::graph::{BuildGraph, BuildQueue};

/// Load the graph, resolve targets, assemble the cache chain and run the
/// queue. Prints a summary; a failed or partially-pruned run is an error
/// (exit code 1).
pub fn cmd_build(
  targets: &[String],
  concurrency: usize,
  bail_mode: bool,
  down: bool,
  run_tests: bool,
) -> Result<()> {
  let current_dir = std::env::current_dir().context("cannot determine current directory")?;

  let graph = BuildGraph::load(&current_dir)?;
  let selection = graph.select_targets(targets, &current_dir, down)?;
  let config = CacheConfig::find_upward(&current_dir)?;

  let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
  runtime.block_on(async {
    let mut ctx = BuildContext::new(graph.workspace_root());
    ctx.run_tests = run_tests;

    let local_dir = config.local_cache_dir();
    let mut tiers: Vec<Arc<dyn CacheTier>> = vec![Arc::new(LocalCache::new(&local_dir))];

    if let Some(bucket) = &config.cache_bucket {
      info!(bucket = %bucket.bucket_name, "remote cache configured");
      let store = S3Store::from_config(bucket).await;
      let remote = Arc::new(RemoteCache::new(
        Arc::new(store),
        local_dir.join("remote-index"),
      ));
      // Background scan; lookups get cheaper as it fills in.
      let _ = remote.start_index_mirror();
      tiers.push(remote);
    }
    ctx.shared_tiers = tiers;

    let ctx = Arc::new(ctx);
    let queue = BuildQueue {
      concurrency,
      bail: bail_mode,
    };
    let summary = queue.execute(&graph, &selection, Arc::clone(&ctx)).await?;

    info!(
      hits = ?ctx.stats.hit_counts(),
      misses = ctx.stats.miss_count(),
      "cache statistics"
    );

    println!();
    println!("Build complete!");
    println!("  Units selected: {}", selection.len());
    println!("  Built:          {}", summary.built);
    println!("  Unchanged:      {}", summary.cached);
    if !summary.failed.is_empty() || summary.pruned > 0 {
      println!("  Failed:         {}", summary.failed.len());
      println!("  Pruned:         {}", summary.pruned);
      bail!("{} unit(s) failed: {}", summary.failed.len(), summary.failed.join(", "));
    }
    Ok(())
  })
}
