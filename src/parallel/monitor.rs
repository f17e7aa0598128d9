//! Background monitor thread and the interrupt flag.
//!
//! The monitor is a lazily-started singleton. While a job is active it wakes
//! every ~20 ms, refreshes the progress display, and drains the SIGINT flag
//! set by the signal handler into the engine's interrupt flag. Workers poll
//! the interrupt flag at loop boundaries; the signal handler itself does
//! nothing beyond setting a flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::parallel::progress;

const WAKE_INTERVAL: Duration = Duration::from_millis(20);

/// Set by the SIGINT handler, drained by the monitor.
static SIGINT_CAUGHT: AtomicBool = AtomicBool::new(false);

/// Engine-visible cooperative-cancellation flag.
static INTERRUPT: AtomicBool = AtomicBool::new(false);

pub fn interrupt_requested() -> bool {
    INTERRUPT.load(Ordering::SeqCst)
}

pub fn clear_interrupt() {
    INTERRUPT.store(false, Ordering::SeqCst);
    SIGINT_CAUGHT.store(false, Ordering::SeqCst);
}

struct MonitorState {
    active_jobs: usize,
}

struct Monitor {
    state: Mutex<MonitorState>,
    alarm: Condvar,
}

impl Monitor {
    fn run(&self) {
        loop {
            let mut state = self.state.lock().unwrap();
            while state.active_jobs == 0 {
                state = self.alarm.wait(state).unwrap();
            }
            while state.active_jobs > 0 {
                drop(state);
                if SIGINT_CAUGHT.swap(false, Ordering::SeqCst) {
                    INTERRUPT.store(true, Ordering::SeqCst);
                }
                progress::refresh();
                state = self.state.lock().unwrap();
                if state.active_jobs == 0 {
                    break;
                }
                let (st, _timeout) = self
                    .alarm
                    .wait_timeout(state, WAKE_INTERVAL)
                    .unwrap();
                state = st;
            }
        }
    }
}

static MONITOR: Lazy<&'static Monitor> = Lazy::new(|| {
    if let Err(e) = ctrlc::set_handler(|| {
        SIGINT_CAUGHT.store(true, Ordering::SeqCst);
    }) {
        warn!("could not install SIGINT handler: {e}");
    }
    let monitor: &'static Monitor = Box::leak(Box::new(Monitor {
        state: Mutex::new(MonitorState { active_jobs: 0 }),
        alarm: Condvar::new(),
    }));
    std::thread::Builder::new()
        .name("dtab-monitor".into())
        .spawn(move || monitor.run())
        .expect("spawn monitor thread");
    monitor
});

/// Called by the pool when a job starts (`true`) and finishes (`false`).
pub(crate) fn set_active(active: bool) {
    let monitor = *MONITOR;
    let mut state = monitor.state.lock().unwrap();
    if active {
        state.active_jobs += 1;
    } else {
        state.active_jobs -= 1;
    }
    drop(state);
    monitor.alarm.notify_one();
}
