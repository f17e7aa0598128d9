//! The shared parallel runtime.
//!
//! A fixed pool of workers executes one job at a time; the caller's thread
//! participates as team member 0. On top of the pool sit four primitives:
//! `parallel_region`, `parallel_for_static`, `parallel_for_dynamic` and
//! `parallel_for_ordered`. Cancellation is cooperative: a monitor thread
//! converts SIGINT into an interrupt flag that workers poll at loop
//! boundaries.

pub mod monitor;
pub mod ordered;
pub mod pool;
pub mod progress;
pub mod shared_mutex;

pub use monitor::{clear_interrupt, interrupt_requested};
pub use ordered::{OrderedContext, parallel_for_ordered};
pub use pool::{Task, ThreadJob, ThreadPool, num_threads_in_pool, this_thread_index, thread_pool};
pub use shared_mutex::{SharedLock, SharedMutex};

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{DtError, DtResult};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_MIN_ITERS_PER_THREAD: usize = 1000;

/// Requested team size, clamped to the pool.
#[derive(Clone, Copy)]
pub struct NThreads(usize);

impl NThreads {
    pub fn new(nth: usize) -> Self {
        let pool_size = num_threads_in_pool();
        NThreads(if nth == 0 || nth >= pool_size {
            pool_size
        } else {
            nth
        })
    }

    pub fn all() -> Self {
        NThreads(num_threads_in_pool())
    }

    /// Team size derived from the iteration count, so that tiny workloads
    /// don't pay the fan-out cost.
    pub fn from_niters(niters: usize, min_iters_per_thread: usize) -> Self {
        let min_iters = min_iters_per_thread.max(1);
        NThreads::new((niters / min_iters).max(1))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Clone, Copy)]
pub struct ChunkSize(usize);

impl ChunkSize {
    pub fn new(sz: usize) -> Self {
        ChunkSize(sz.max(1))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize(DEFAULT_CHUNK_SIZE)
    }
}

/// First-error-wins capture slot shared by a job's team.
pub(crate) struct ErrorSlot {
    error: Mutex<Option<DtError>>,
    stopped: AtomicBool,
}

impl ErrorSlot {
    pub fn new() -> Self {
        ErrorSlot {
            error: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn capture(&self, e: DtError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn take(&self) -> Option<DtError> {
        self.error.lock().unwrap().take()
    }

    /// Poll the interrupt flag; on interrupt, capture it and report stop.
    pub fn check_interrupt(&self) -> bool {
        if interrupt_requested() {
            self.capture(DtError::KeyboardInterrupt);
        }
        self.stopped()
    }
}

struct RegionJob<'a> {
    f: &'a (dyn Fn(usize) + Sync),
    started: Vec<AtomicBool>,
    slot: ErrorSlot,
}

impl ThreadJob for RegionJob<'_> {
    fn next_task(&self, thread_idx: usize) -> Option<Task<'_>> {
        if thread_idx >= self.started.len() {
            return None;
        }
        if self.started[thread_idx].swap(true, Ordering::SeqCst) {
            return None;
        }
        if self.slot.check_interrupt() {
            return None;
        }
        Some(Task::new(move || (self.f)(thread_idx)))
    }
}

/// Run `f(thread_index)` once on every thread of the team.
pub fn parallel_region(f: impl Fn(usize) + Sync) -> DtResult<()> {
    parallel_region_nthreads(NThreads::all(), f)
}

pub fn parallel_region_nthreads(nthreads: NThreads, f: impl Fn(usize) + Sync) -> DtResult<()> {
    let job = RegionJob {
        f: &f,
        started: (0..nthreads.get()).map(|_| AtomicBool::new(false)).collect(),
        slot: ErrorSlot::new(),
    };
    thread_pool().execute_job(&job);
    match job.slot.take() {
        Some(e) => {
            if e.is_interrupt() {
                clear_interrupt();
            }
            Err(e)
        }
        None => Ok(()),
    }
}

/// Partition `[0, n)` into chunks of `chunk_size` and hand them out
/// round-robin by thread index. The mapping from chunk to thread is
/// deterministic. May be called from inside a parallel region, in which case
/// the calling thread runs its own share.
pub fn parallel_for_static(
    n: usize,
    chunk_size: ChunkSize,
    f: impl Fn(usize, usize) + Sync,
) -> DtResult<()> {
    if n == 0 {
        return Ok(());
    }
    let k = n / chunk_size.get();
    if let Some(ith) = this_thread_index() {
        // Nested inside a region: run this thread's share only.
        if k == 0 {
            if ith == 0 {
                f(0, n);
            }
            return Ok(());
        }
        let nth = num_threads_in_pool();
        let chunksize = n / k;
        let nchunks = n / chunksize;
        let mut j = ith;
        while j < nchunks {
            let i0 = j * chunksize;
            let i1 = if j == nchunks - 1 { n } else { i0 + chunksize };
            f(i0, i1);
            j += nth;
        }
        return Ok(());
    }
    if k == 0 {
        f(0, n);
        return Ok(());
    }
    let nth = num_threads_in_pool();
    let chunksize = n / k;
    let nchunks = n / chunksize;
    parallel_region(|ith| {
        let mut j = ith;
        while j < nchunks {
            let i0 = j * chunksize;
            let i1 = if j == nchunks - 1 { n } else { i0 + chunksize };
            f(i0, i1);
            j += nth;
        }
    })
}

struct DynamicJob<'a> {
    f: &'a (dyn Fn(usize) + Sync),
    n: usize,
    counter: AtomicUsize,
    started: Vec<AtomicBool>,
    slot: ErrorSlot,
}

impl ThreadJob for DynamicJob<'_> {
    fn next_task(&self, thread_idx: usize) -> Option<Task<'_>> {
        if thread_idx >= self.started.len()
            || self.started[thread_idx].swap(true, Ordering::SeqCst)
        {
            return None;
        }
        Some(Task::new(move || {
            loop {
                if self.slot.check_interrupt() {
                    return;
                }
                let i = self.counter.fetch_add(1, Ordering::SeqCst);
                if i >= self.n {
                    return;
                }
                (self.f)(i);
            }
        }))
    }
}

/// Iterations of `[0, n)` doled out by an atomic counter.
pub fn parallel_for_dynamic(n: usize, f: impl Fn(usize) + Sync) -> DtResult<()> {
    parallel_for_dynamic_nthreads(n, NThreads::all(), f)
}

pub fn parallel_for_dynamic_nthreads(
    n: usize,
    nthreads: NThreads,
    f: impl Fn(usize) + Sync,
) -> DtResult<()> {
    let job = DynamicJob {
        f: &f,
        n,
        counter: AtomicUsize::new(0),
        started: (0..nthreads.get()).map(|_| AtomicBool::new(false)).collect(),
        slot: ErrorSlot::new(),
    };
    thread_pool().execute_job(&job);
    match job.slot.take() {
        Some(e) => {
            if e.is_interrupt() {
                clear_interrupt();
            }
            Err(e)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_parallel_region_covers_team() {
        let n = num_threads_in_pool();
        let seen: Vec<AtomicBool> = (0..n).map(|_| AtomicBool::new(false)).collect();
        parallel_region(|ith| {
            seen[ith].store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(seen.iter().all(|b| b.load(Ordering::SeqCst)));
    }

    #[test]
    fn test_for_static_sums() {
        let total = AtomicU64::new(0);
        parallel_for_static(10_000, ChunkSize::new(64), |i0, i1| {
            let mut s = 0u64;
            for i in i0..i1 {
                s += i as u64;
            }
            total.fetch_add(s, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 10_000 * 9_999 / 2);
    }

    #[test]
    fn test_for_static_small_n() {
        let total = AtomicU64::new(0);
        parallel_for_static(3, ChunkSize::new(1000), |i0, i1| {
            total.fetch_add((i1 - i0) as u64, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_for_dynamic_visits_every_index() {
        let n = 2500;
        let hits: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(0)).collect();
        parallel_for_dynamic(n, |i| {
            hits[i].fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_nthreads_clamps_to_pool() {
        let pool_size = num_threads_in_pool();
        assert_eq!(NThreads::new(0).get(), pool_size);
        assert_eq!(NThreads::new(usize::MAX).get(), pool_size);
        assert_eq!(NThreads::new(1).get(), 1);
    }
}
