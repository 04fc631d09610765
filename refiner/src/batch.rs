//! Concurrent refinement of independent work items.
//!
//! Items share nothing: each worker builds its own broker, agent and scratch
//! directory inside the per-item closure. Results come back in input order.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::Result;
use rayon::ThreadPoolBuilder;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, info, warn};

/// Outcome of one work item.
#[derive(Debug)]
pub struct BatchEntry<T> {
    pub item: PathBuf,
    pub result: Result<T>,
}

/// Default worker count: available parallelism, capped by the number of items.
pub fn default_jobs(items: usize) -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(items)
        .max(1)
}

/// Run `process` over `items` on a pool of at most `jobs` threads.
///
/// Entries come back in input order. If the pool cannot be built the items
/// run sequentially on the calling thread.
pub fn run_batch<T, F>(items: &[PathBuf], jobs: usize, process: F) -> Vec<BatchEntry<T>>
where
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync,
{
    let workers = jobs.clamp(1, items.len().max(1));
    info!(items = items.len(), workers, "starting batch");
    let run_one = |item: &PathBuf| {
        debug!(item = %item.display(), "processing item");
        BatchEntry {
            item: item.clone(),
            result: process(item),
        }
    };

    match ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(|| items.par_iter().map(run_one).collect()),
        Err(err) => {
            warn!(err = %err, "could not build worker pool, running sequentially");
            items.iter().map(run_one).collect()
        }
    }
}
