//! Progress reporting for long-running jobs.
//!
//! A job registers a unit of work and updates its completed fraction; the
//! monitor thread calls `refresh` periodically to redraw the bar. Rendering
//! is disabled by default and turned on by the CLI (or `DTAB_PROGRESS=1`).

use std::io::{IsTerminal, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

static ENABLED: AtomicBool = AtomicBool::new(false);

struct WorkState {
    label: String,
    fraction: f64,
    drawn: bool,
}

static WORK: Lazy<Mutex<Option<WorkState>>> = Lazy::new(|| Mutex::new(None));

pub fn enable(on: bool) {
    ENABLED.store(on && std::io::stderr().is_terminal(), Ordering::SeqCst);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
        || std::env::var("DTAB_PROGRESS").is_ok_and(|v| v == "1")
}

/// Register a new unit of work.
pub fn start_work(label: impl Into<String>) {
    let mut work = WORK.lock().unwrap();
    *work = Some(WorkState {
        label: label.into(),
        fraction: 0.0,
        drawn: false,
    });
}

/// Update the completed fraction, in `[0, 1]`.
pub fn set_fraction(fraction: f64) {
    if let Some(w) = WORK.lock().unwrap().as_mut() {
        w.fraction = fraction.clamp(0.0, 1.0);
    }
}

/// Finish the current unit of work and clear the bar.
pub fn finish() {
    let mut work = WORK.lock().unwrap();
    if let Some(w) = work.take()
        && w.drawn
    {
        eprint!("\r\x1b[K");
        let _ = std::io::stderr().flush();
    }
}

/// Redraw the bar; called from the monitor thread.
pub(crate) fn refresh() {
    if !enabled() {
        return;
    }
    let mut work = WORK.lock().unwrap();
    let Some(w) = work.as_mut() else { return };
    let width = crossterm::terminal::size().map_or(80, |(c, _)| c as usize);
    let label = &w.label;
    let pct = (w.fraction * 100.0) as usize;
    // leave room for "label [bar] 100%"
    let bar_width = width.saturating_sub(label.len() + 10).clamp(10, 60);
    let filled = (w.fraction * bar_width as f64) as usize;
    let bar: String = std::iter::repeat_n('=', filled)
        .chain(std::iter::repeat_n(' ', bar_width - filled))
        .collect();
    eprint!("\r{label} [{bar}] {pct:3}%");
    let _ = std::io::stderr().flush();
    w.drawn = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_is_clamped() {
        start_work("t");
        set_fraction(3.5);
        {
            let work = WORK.lock().unwrap();
            assert_eq!(work.as_ref().unwrap().fraction, 1.0);
        }
        set_fraction(-1.0);
        {
            let work = WORK.lock().unwrap();
            assert_eq!(work.as_ref().unwrap().fraction, 0.0);
        }
        finish();
        assert!(WORK.lock().unwrap().is_none());
    }
}
