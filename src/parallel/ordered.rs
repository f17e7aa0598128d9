//! The ordered parallel loop.
//!
//! Each team member runs a user-provided per-thread body once; inside it, the
//! body drives the iteration loop through [`OrderedContext::exec`], which
//! exposes three phases per iteration:
//!
//! - *parallel*: executed concurrently;
//! - *ordered*: executed under a global mutex in strictly increasing
//!   iteration order, even when parallel phases complete out of order;
//! - *finalize*: executed concurrently after the ordered phase.
//!
//! The ordered phase may call `set_n_iterations(k)` to truncate the loop;
//! iterations at or beyond `k` that are already in flight are discarded.
//! The ordered phase is where shared state (e.g. output allocations) is
//! mutated, which is why later parallel phases may rely on anything an
//! earlier ordered phase published.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::DtResult;
use crate::parallel::pool::{Task, ThreadJob, thread_pool};
use crate::parallel::{ErrorSlot, NThreads, clear_interrupt};

struct OrderedState {
    /// Next iteration index to claim. Claims are handed out densely; every
    /// claim below the original iteration count passes through the turn
    /// protocol exactly once, which is what makes early stopping safe.
    next_iter: AtomicUsize,
    /// Original iteration count; never changes.
    total_iters: usize,
    /// Effective iteration count; only shrinks (via `set_n_iterations`).
    n_iters: AtomicUsize,
    turn: Mutex<usize>,
    turn_cv: Condvar,
    slot: ErrorSlot,
}

pub struct OrderedContext<'a> {
    state: &'a OrderedState,
}

impl OrderedContext<'_> {
    /// Run the three-phase loop on the calling thread. Each closure receives
    /// the iteration index. Closures typically share a thread-local context
    /// through a `RefCell`.
    pub fn exec(
        &self,
        mut parallel: impl FnMut(usize) -> DtResult<()>,
        mut ordered: impl FnMut(usize, &OrderedContext<'_>) -> DtResult<()>,
        mut finalize: impl FnMut(usize) -> DtResult<()>,
    ) {
        let st = self.state;
        loop {
            let i = st.next_iter.fetch_add(1, Ordering::SeqCst);
            if i >= st.total_iters {
                // Unclaimed indices never enter the turn protocol, so this
                // exit cannot starve a waiter below.
                return;
            }
            st.slot.check_interrupt();

            // Speculative skip: n_iters and the stop flag only ever go down
            // or up respectively, so a skip decided here is always confirmed
            // by the authoritative re-check in the ordered phase.
            let mut discarded = st.slot.stopped() || i >= st.n_iters.load(Ordering::SeqCst);

            if !discarded && let Err(e) = parallel(i) {
                st.slot.capture(e);
                discarded = true;
            }

            // Take the turn; the ordered body runs while holding the mutex.
            {
                let mut turn = st.turn.lock().unwrap();
                while *turn != i {
                    turn = st.turn_cv.wait(turn).unwrap();
                }
                discarded = discarded
                    || st.slot.stopped()
                    || i >= st.n_iters.load(Ordering::SeqCst);
                if !discarded && let Err(e) = ordered(i, self) {
                    st.slot.capture(e);
                    discarded = true;
                }
                *turn += 1;
                st.turn_cv.notify_all();
            }

            if !discarded && let Err(e) = finalize(i) {
                st.slot.capture(e);
            }
        }
    }

    /// Truncate the loop at iteration boundary `k`. Must be called from the
    /// ordered phase.
    pub fn set_n_iterations(&self, k: usize) {
        self.state.n_iters.fetch_min(k, Ordering::SeqCst);
    }

    /// Effective number of iterations after any truncation.
    pub fn n_iterations(&self) -> usize {
        self.state.n_iters.load(Ordering::SeqCst)
    }
}

struct OrderedJob<'a> {
    thread_fn: &'a (dyn Fn(&OrderedContext<'_>) + Sync),
    state: OrderedState,
    started: Vec<AtomicBool>,
}

impl ThreadJob for OrderedJob<'_> {
    fn next_task(&self, thread_idx: usize) -> Option<Task<'_>> {
        if thread_idx >= self.started.len()
            || self.started[thread_idx].swap(true, Ordering::SeqCst)
        {
            return None;
        }
        Some(Task::new(move || {
            let ctx = OrderedContext { state: &self.state };
            (self.thread_fn)(&ctx);
        }))
    }
}

/// Run `thread_fn` once on each of `nthreads` team members; inside,
/// `OrderedContext::exec` drives iterations `0..n_iterations`.
pub fn parallel_for_ordered(
    n_iterations: usize,
    nthreads: NThreads,
    thread_fn: impl Fn(&OrderedContext<'_>) + Sync,
) -> DtResult<()> {
    if n_iterations == 0 {
        return Ok(());
    }
    let job = OrderedJob {
        thread_fn: &thread_fn,
        state: OrderedState {
            next_iter: AtomicUsize::new(0),
            total_iters: n_iterations,
            n_iters: AtomicUsize::new(n_iterations),
            turn: Mutex::new(0),
            turn_cv: Condvar::new(),
            slot: ErrorSlot::new(),
        },
        started: (0..nthreads.get()).map(|_| AtomicBool::new(false)).collect(),
    };
    thread_pool().execute_job(&job);
    match job.state.slot.take() {
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
    use crate::error::DtError;
    use std::cell::RefCell;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_ordered_phase_runs_in_order() {
        let order = StdMutex::new(Vec::new());
        parallel_for_ordered(100, NThreads::all(), |ctx| {
            ctx.exec(
                |_i| Ok(()),
                |i, _| {
                    order.lock().unwrap().push(i);
                    Ok(())
                },
                |_i| Ok(()),
            );
        })
        .unwrap();
        let order = order.into_inner().unwrap();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_phases_see_thread_local_state() {
        let committed = StdMutex::new(Vec::new());
        parallel_for_ordered(40, NThreads::all(), |ctx| {
            let local = RefCell::new(0usize);
            ctx.exec(
                |i| {
                    *local.borrow_mut() = i * i;
                    Ok(())
                },
                |i, _| {
                    committed.lock().unwrap().push((i, *local.borrow()));
                    Ok(())
                },
                |_i| Ok(()),
            );
        })
        .unwrap();
        let committed = committed.into_inner().unwrap();
        for (i, sq) in committed {
            assert_eq!(sq, i * i);
        }
    }

    #[test]
    fn test_set_n_iterations_truncates() {
        let done = StdMutex::new(Vec::new());
        parallel_for_ordered(1000, NThreads::all(), |ctx| {
            ctx.exec(
                |_i| Ok(()),
                |i, o| {
                    if i == 7 {
                        o.set_n_iterations(8);
                    }
                    done.lock().unwrap().push(i);
                    Ok(())
                },
                |_i| Ok(()),
            );
        })
        .unwrap();
        let done = done.into_inner().unwrap();
        // iterations beyond the truncation point were discarded
        assert_eq!(done, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_error_terminates_and_propagates() {
        let res = parallel_for_ordered(500, NThreads::all(), |ctx| {
            ctx.exec(
                |i| {
                    if i == 13 {
                        Err(DtError::value_error("boom"))
                    } else {
                        Ok(())
                    }
                },
                |_i, _| Ok(()),
                |_i| Ok(()),
            );
        });
        match res {
            Err(DtError::ValueError(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_finalize_runs_after_ordered() {
        let log = StdMutex::new(Vec::new());
        parallel_for_ordered(50, NThreads::new(4), |ctx| {
            ctx.exec(
                |_i| Ok(()),
                |i, _| {
                    log.lock().unwrap().push((i, 'o'));
                    Ok(())
                },
                |i| {
                    log.lock().unwrap().push((i, 'f'));
                    Ok(())
                },
            );
        })
        .unwrap();
        let log = log.into_inner().unwrap();
        for i in 0..50 {
            let o_pos = log.iter().position(|&e| e == (i, 'o')).unwrap();
            let f_pos = log.iter().position(|&e| e == (i, 'f')).unwrap();
            assert!(o_pos < f_pos);
        }
    }
}
