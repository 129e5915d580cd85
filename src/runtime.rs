//! Global tokio runtime management.
//!
//! Provides a shared tokio multi-threaded runtime for callers that want to
//! drive [`crate::async_engine::AsyncCluster`] from synchronous code without
//! building their own executor.

use std::sync::OnceLock;
use tokio::runtime::Runtime;

/// Global tokio runtime, initialized once on first use.
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Get (or initialize) the global tokio runtime.
///
/// The runtime is multi-threaded with the default number of worker threads
/// (typically equal to the number of CPU cores). Override with the
/// `VALKEY_CLUSTER_ROUTER_RUNTIME_THREADS` environment variable.
pub fn get_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        // Allow overriding thread count
        if let Ok(threads) = std::env::var("VALKEY_CLUSTER_ROUTER_RUNTIME_THREADS") {
            if let Ok(n) = threads.parse::<usize>() {
                if n > 0 {
                    builder.worker_threads(n);
                }
            }
        }

        match builder.thread_name("valkey-cluster-rt").build() {
            Ok(rt) => rt,
            Err(e) => {
                // Cannot return an error from OnceLock::get_or_init, so we
                // must panic here; runtime creation failure (e.g. ulimit too
                // low) is unrecoverable.
                panic!("failed to create tokio runtime: {e}");
            }
        }
    })
}

/// Block on a future using the global runtime.
///
/// This is the bridge for synchronous callers that need to drive the async
/// engine. Must NOT be called from within an async context (will panic).
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    get_runtime().block_on(future)
}

/// Spawn a future on the global runtime.
///
/// Returns a `JoinHandle` that can be awaited.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    get_runtime().spawn(future)
}

// ── Tests ──────────────────────────────────────────────────────────
