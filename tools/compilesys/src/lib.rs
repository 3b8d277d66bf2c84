/*!
Package compilation.

Compiles every package reachable from a set of selected instance groups,
in an order respecting the package dependency graph, across a fixed pool
of worker threads, with durable on-disk caching keyed by package
fingerprint. Two packages sharing a fingerprint are compiled once; a
package whose compile fails poisons its transitive dependents without
stopping unrelated work; a cancelled run stops dispatching, kills the
in-flight containers, and leaves no partial artifacts behind.
*/

mod cache;
mod error;
mod scheduler;

pub use cache::{clean_cache, CompilationCache};
pub use error::Error;
pub use scheduler::{compile, CompileOptions, CompileReport, Outcome, PackageReport};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, error::Error>;

/// The number of workers to use when the caller has no opinion.
pub fn default_worker_count() -> usize {
    num_cpus::get()
}

/// A cancel signal threaded from the top-level driver into the scheduler
/// and the image planner. Cancelling stops new work from being issued and
/// aborts in-flight container operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
