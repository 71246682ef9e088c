//! Fork-join worker pools for particle batches.
//!
//! The unit of work is a batch, never a single particle. `run` dispatches
//! every batch, blocks until all of them finish, and returns results in batch
//! order so the coordinator can scatter them back by index. A panicking or
//! failing batch fails the whole round; callers fall back to the sequential
//! path.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use rayon::ThreadPool;
use rayon::prelude::*;

use crate::error::{Result, SamplerError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// Scoped threads sharing borrowed state such as one model handle.
    SharedMemory,
    /// A dedicated rayon pool; each task owns the batch moved into it.
    IsolatedMemory,
}

/// Long-lived pool reused across rounds. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    strategy: ExecutionStrategy,
    num_workers: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl WorkerPool {
    pub fn new(strategy: ExecutionStrategy, num_workers: usize) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let pool = match strategy {
            ExecutionStrategy::SharedMemory => None,
            ExecutionStrategy::IsolatedMemory => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .thread_name(|i| format!("smc-worker-{i}"))
                    .build()
                    .map_err(|e| {
                        SamplerError::Execution(format!("failed to build worker pool: {e}"))
                    })?;
                Some(Arc::new(pool))
            }
        };
        Ok(Self {
            strategy,
            num_workers,
            pool,
        })
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Run `task(batch_index, batch)` for every batch and join.
    pub fn run<I, O, F>(&self, batches: Vec<I>, task: F) -> Result<Vec<O>>
    where
        I: Send,
        O: Send,
        F: Fn(usize, I) -> Result<O> + Sync,
    {
        match (&self.pool, self.strategy) {
            (Some(pool), ExecutionStrategy::IsolatedMemory) => run_isolated(pool, batches, &task),
            _ => run_shared(batches, &task),
        }
    }
}

fn run_isolated<I, O, F>(pool: &ThreadPool, batches: Vec<I>, task: &F) -> Result<Vec<O>>
where
    I: Send,
    O: Send,
    F: Fn(usize, I) -> Result<O> + Sync,
{
    let joined = panic::catch_unwind(AssertUnwindSafe(|| {
        pool.install(|| {
            batches
                .into_par_iter()
                .enumerate()
                .map(|(i, batch)| task(i, batch))
                .collect::<Vec<Result<O>>>()
        })
    }));

    match joined {
        Ok(results) => results.into_iter().collect(),
        Err(payload) => Err(SamplerError::Execution(format!(
            "worker panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn run_shared<I, O, F>(batches: Vec<I>, task: &F) -> Result<Vec<O>>
where
    I: Send,
    O: Send,
    F: Fn(usize, I) -> Result<O> + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = batches
            .into_iter()
            .enumerate()
            .map(|(i, batch)| scope.spawn(move || task(i, batch)))
            .collect();

        // Join every handle before reporting so no batch is left running.
        let mut results = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(out)) => results.push(out),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(payload) => {
                    failure.get_or_insert(SamplerError::Execution(format!(
                        "worker panicked: {}",
                        panic_message(payload.as_ref())
                    )));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    })
}

/// Run `f` on the calling thread, turning a panic into an `Execution` error.
pub(crate) fn catch_panics<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(SamplerError::Execution(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Split `items` into at most `num_batches` contiguous, near-equal batches.
/// Concatenating the batches restores the original order.
pub fn partition_batches<T>(items: Vec<T>, num_batches: usize) -> Vec<Vec<T>> {
    let len = items.len();
    if len == 0 {
        return Vec::new();
    }
    let num_batches = num_batches.clamp(1, len);
    let base = len / num_batches;
    let extra = len % num_batches;

    let mut batches = Vec::with_capacity(num_batches);
    let mut iter = items.into_iter();
    for i in 0..num_batches {
        let size = base + usize::from(i < extra);
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}
