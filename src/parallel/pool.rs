//! The process-wide worker pool.
//!
//! The pool owns `team_size - 1` spawned workers; the caller's thread acts as
//! team member 0 during a job. Between jobs, workers park on a condition
//! variable. `execute_job` publishes one job at a time: it swaps the workers'
//! current assignment, wakes them, participates as worker 0, and then blocks
//! until every worker has drained the job and returned to sleep. Shrinking
//! the pool publishes a shutdown assignment that terminates the excess
//! workers while the rest go back to sleep.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use once_cell::sync::Lazy;

use crate::parallel::monitor;

thread_local! {
    static THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the current thread within the running team, if any.
pub fn this_thread_index() -> Option<usize> {
    THREAD_INDEX.with(|c| c.get())
}

fn set_thread_index(idx: Option<usize>) {
    THREAD_INDEX.with(|c| c.set(idx));
}

/// One unit of work handed to a worker.
pub struct Task<'a> {
    f: Box<dyn FnOnce() + Send + 'a>,
}

impl<'a> Task<'a> {
    pub fn new(f: impl FnOnce() + Send + 'a) -> Self {
        Task { f: Box::new(f) }
    }

    fn run(self) {
        (self.f)()
    }
}

/// A job polled by every team member. Returning `None` sends the worker back
/// to the sleep assignment.
pub trait ThreadJob: Sync {
    fn next_task(&self, thread_idx: usize) -> Option<Task<'_>>;
}

#[derive(Clone, Copy)]
enum Assignment {
    Idle,
    User(&'static dyn ThreadJob),
    Shutdown { keep: usize },
}

struct SleepState {
    generation: u64,
    assignment: Assignment,
    /// Workers that have not yet finished the current assignment.
    remaining: usize,
    nworkers: usize,
}

struct Shared {
    state: Mutex<SleepState>,
    /// Workers sleep here between jobs.
    alarm: Condvar,
    /// `execute_job` waits here for workers to return to sleep.
    done: Condvar,
    poisoned: AtomicBool,
}

struct ExecState {
    handles: Vec<std::thread::JoinHandle<()>>,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    /// Serializes job execution and pool resizing: one user job at a time.
    exec: Mutex<ExecState>,
}

impl ThreadPool {
    pub fn new(team_size: usize) -> Self {
        let team_size = team_size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(SleepState {
                generation: 0,
                assignment: Assignment::Idle,
                remaining: 0,
                nworkers: 0,
            }),
            alarm: Condvar::new(),
            done: Condvar::new(),
            poisoned: AtomicBool::new(false),
        });
        let pool = ThreadPool {
            shared,
            exec: Mutex::new(ExecState {
                handles: Vec::new(),
            }),
        };
        pool.spawn_workers(team_size - 1);
        pool
    }

    fn spawn_workers(&self, target_nworkers: usize) {
        let mut exec = self.exec.lock().unwrap();
        let current = exec.handles.len();
        for i in current..target_nworkers {
            let shared = Arc::clone(&self.shared);
            let worker_index = i + 1; // team index; 0 is the caller
            let handle = std::thread::Builder::new()
                .name(format!("dtab-worker-{worker_index}"))
                .spawn(move || worker_loop(worker_index, shared))
                .expect("spawn worker thread");
            exec.handles.push(handle);
        }
        self.shared.state.lock().unwrap().nworkers = exec.handles.len();
    }

    /// Number of threads in the team, including the caller's thread.
    pub fn team_size(&self) -> usize {
        self.shared.state.lock().unwrap().nworkers + 1
    }

    /// Grow or shrink the pool to `team_size` threads.
    pub fn resize(&self, team_size: usize) {
        let team_size = team_size.max(1);
        let current = self.team_size();
        if team_size > current {
            self.spawn_workers(team_size - 1);
            return;
        }
        if team_size == current {
            return;
        }
        let keep = team_size - 1;
        {
            let _exec = self.exec.lock().unwrap();
            let mut st = self.shared.state.lock().unwrap();
            let nworkers = st.nworkers;
            st.generation += 1;
            st.assignment = Assignment::Shutdown { keep };
            st.remaining = nworkers;
            drop(st);
            self.shared.alarm.notify_all();
            let mut st = self.shared.state.lock().unwrap();
            while st.remaining > 0 {
                st = self.shared.done.wait(st).unwrap();
            }
            st.assignment = Assignment::Idle;
            st.nworkers = keep;
        }
        let mut exec = self.exec.lock().unwrap();
        for handle in exec.handles.drain(keep..) {
            let _ = handle.join();
        }
    }

    /// Run `job` on the whole team. Blocks until every worker is back asleep.
    ///
    /// Panics if called from inside a running team (nested parallelism is
    /// rejected) or if a previous job poisoned the pool.
    pub fn execute_job(&self, job: &dyn ThreadJob) {
        assert!(
            this_thread_index().is_none(),
            "nested parallel regions are not allowed"
        );
        let _exec = self.exec.lock().unwrap();
        assert!(
            !self.shared.poisoned.load(Ordering::Relaxed),
            "attempting to use a thread pool whose worker panicked"
        );
        monitor::set_active(true);

        // SAFETY: the JobGuard below does not release until every worker has
        // finished with this assignment, so the reference cannot dangle even
        // though its lifetime is erased for storage in the shared state.
        let job_static: &'static dyn ThreadJob = unsafe { std::mem::transmute(job) };
        {
            let mut st = self.shared.state.lock().unwrap();
            let nworkers = st.nworkers;
            st.generation += 1;
            st.assignment = Assignment::User(job_static);
            st.remaining = nworkers;
        }
        self.shared.alarm.notify_all();

        // Joins on drop, so the job outlives all worker references even if
        // the caller's own share of the work panics.
        let guard = JobGuard { shared: &self.shared };

        set_thread_index(Some(0));
        let main_guard = MainIndexGuard;
        while let Some(task) = job.next_task(0) {
            task.run();
        }
        drop(main_guard);

        drop(guard);
        monitor::set_active(false);
        assert!(
            !self.shared.poisoned.load(Ordering::Relaxed),
            "a worker thread panicked"
        );
    }
}

struct MainIndexGuard;

impl Drop for MainIndexGuard {
    fn drop(&mut self) {
        set_thread_index(None);
    }
}

struct JobGuard<'a> {
    shared: &'a Shared,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        while st.remaining > 0 {
            st = self.shared.done.wait(st).unwrap();
        }
        st.assignment = Assignment::Idle;
    }
}

fn worker_loop(thread_index: usize, shared: Arc<Shared>) {
    let mut seen_generation = 0u64;
    loop {
        let assignment = {
            let mut st = shared.state.lock().unwrap();
            loop {
                if st.generation != seen_generation {
                    seen_generation = st.generation;
                    break st.assignment;
                }
                st = shared.alarm.wait(st).unwrap();
            }
        };
        match assignment {
            Assignment::Idle => finish_assignment(&shared),
            Assignment::User(job) => {
                set_thread_index(Some(thread_index));
                {
                    // Poisons the pool if the task unwinds, so the master
                    // does not wait forever on a dead worker.
                    let poison = PoisonGuard { shared: &shared };
                    while let Some(task) = job.next_task(thread_index) {
                        task.run();
                    }
                    std::mem::forget(poison);
                }
                set_thread_index(None);
                finish_assignment(&shared);
            }
            Assignment::Shutdown { keep } => {
                let quit = thread_index > keep;
                finish_assignment(&shared);
                if quit {
                    return;
                }
            }
        }
    }
}

fn finish_assignment(shared: &Shared) {
    let mut st = shared.state.lock().unwrap();
    st.remaining -= 1;
    if st.remaining == 0 {
        shared.done.notify_all();
    }
}

struct PoisonGuard<'a> {
    shared: &'a Shared,
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        self.shared.poisoned.store(true, Ordering::Relaxed);
        set_thread_index(None);
        finish_assignment(self.shared);
    }
}

fn default_team_size() -> usize {
    if let Ok(v) = std::env::var("DTAB_NTHREADS")
        && let Ok(n) = v.parse::<usize>()
        && n > 0
    {
        return n;
    }
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

static POOL: Lazy<ThreadPool> = Lazy::new(|| ThreadPool::new(default_team_size()));

/// The process-wide pool.
pub fn thread_pool() -> &'static ThreadPool {
    &POOL
}

pub fn num_threads_in_pool() -> usize {
    thread_pool().team_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct OncePerThread {
        hits: Vec<AtomicUsize>,
    }

    impl ThreadJob for OncePerThread {
        fn next_task(&self, thread_idx: usize) -> Option<Task<'_>> {
            let hits = &self.hits[thread_idx];
            if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                Some(Task::new(move || {
                    std::thread::yield_now();
                }))
            } else {
                None
            }
        }
    }

    #[test]
    fn test_every_team_member_polls() {
        let pool = thread_pool();
        let n = pool.team_size();
        let job = OncePerThread {
            hits: (0..n).map(|_| AtomicUsize::new(0)).collect(),
        };
        pool.execute_job(&job);
        for h in &job.hits {
            // one Some + at least one None poll
            assert!(h.load(Ordering::SeqCst) >= 2);
        }
    }

    #[test]
    fn test_sequential_jobs_reuse_workers() {
        let pool = thread_pool();
        let counter = AtomicUsize::new(0);
        struct CountJob<'a> {
            counter: &'a AtomicUsize,
            given: AtomicUsize,
        }
        impl ThreadJob for CountJob<'_> {
            fn next_task(&self, _idx: usize) -> Option<Task<'_>> {
                if self.given.fetch_add(1, Ordering::SeqCst) < 7 {
                    let c = self.counter;
                    Some(Task::new(move || {
                        c.fetch_add(1, Ordering::SeqCst);
                    }))
                } else {
                    None
                }
            }
        }
        for round in 1..=3 {
            let job = CountJob {
                counter: &counter,
                given: AtomicUsize::new(0),
            };
            pool.execute_job(&job);
            assert_eq!(counter.load(Ordering::SeqCst), 7 * round);
        }
    }
}
