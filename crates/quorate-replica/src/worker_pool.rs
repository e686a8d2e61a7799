//! Worker pool for asynchronous message validation and speculative
//! execution (`spec.md` §4.3 `shouldValidateAsync`, §5 "Scheduling
//! model" item (c)).
//!
//! A dedicated `rayon::ThreadPool` rather than the global rayon pool, so
//! that a slow speculative execution never competes with unrelated
//! `rayon` work elsewhere in the process for the same threads.

use rayon::{ThreadPool, ThreadPoolBuilder};

/// Wraps a dedicated `rayon` thread pool sized from configuration
/// (`spec.md` §5: "a worker pool performs asynchronous message
/// validation and speculative execution").
pub struct ValidationWorkerPool {
    pool: ThreadPool,
}

impl ValidationWorkerPool {
    /// Builds a pool with `threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0 or the underlying `rayon` pool fails to
    /// start (thread spawn failure, which is itself unrecoverable here).
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "validation worker pool needs at least one thread");
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("quorate-validate-{i}"))
            .build()
            .expect("failed to build validation worker pool");
        Self { pool }
    }

    /// Runs `job` on the pool without blocking the caller.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    pub fn current_num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn spawned_jobs_all_run() {
        let pool = ValidationWorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.spawn(move || {
                tx.send(i).unwrap();
            });
        }
        drop(tx);
        let received: Vec<_> = rx.into_iter().collect();
        assert_eq!(received.len(), 16);
    }

    #[test]
    #[should_panic(expected = "at least one thread")]
    fn zero_threads_panics() {
        let _pool = ValidationWorkerPool::new(0);
    }
}
