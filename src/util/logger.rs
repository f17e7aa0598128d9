//! Logging for the read pipeline.
//!
//! By default, trace messages go through `tracing::debug!` and warnings are
//! buffered during the parallel read (worker threads must not talk to the
//! outside world mid-job) and emitted once at end-of-read. A user-supplied
//! callback sink receives both kinds immediately instead.

use std::sync::{Arc, Mutex};

type LogCallback = dyn Fn(&str, bool) + Send + Sync;

enum Sink {
    Tracing,
    Callback(Box<LogCallback>),
}

struct LoggerInner {
    sink: Sink,
    indent: Mutex<usize>,
    buffered_warnings: Mutex<Vec<String>>,
}

#[derive(Clone)]
pub struct ReadLogger {
    inner: Arc<LoggerInner>,
}

impl Default for ReadLogger {
    fn default() -> Self {
        ReadLogger::new()
    }
}

impl ReadLogger {
    pub fn new() -> Self {
        ReadLogger {
            inner: Arc::new(LoggerInner {
                sink: Sink::Tracing,
                indent: Mutex::new(0),
                buffered_warnings: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Route all messages to `f(message, is_warning)`.
    pub fn with_callback(f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        ReadLogger {
            inner: Arc::new(LoggerInner {
                sink: Sink::Callback(Box::new(f)),
                indent: Mutex::new(0),
                buffered_warnings: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Start an indented section; dedents when the guard drops.
    pub fn section(&self, title: &str) -> LogSection<'_> {
        self.info(title);
        *self.inner.indent.lock().unwrap() += 1;
        LogSection { logger: self }
    }

    pub fn info(&self, msg: &str) {
        let indent = *self.inner.indent.lock().unwrap();
        let padded = format!("{}{}", "  ".repeat(indent), msg);
        match &self.inner.sink {
            Sink::Tracing => tracing::debug!(target: "dtab::read", "{padded}"),
            Sink::Callback(f) => f(&padded, false),
        }
    }

    /// Report a warning. With the default sink, warnings are buffered until
    /// `emit_buffered` so worker threads never block on I/O.
    pub fn warn(&self, msg: &str) {
        match &self.inner.sink {
            Sink::Tracing => self.inner.buffered_warnings.lock().unwrap().push(msg.to_string()),
            Sink::Callback(f) => f(msg, true),
        }
    }

    /// Flush buffered warnings; called once at end-of-read.
    pub fn emit_buffered(&self) {
        let warnings: Vec<String> =
            std::mem::take(&mut self.inner.buffered_warnings.lock().unwrap());
        for w in warnings {
            tracing::warn!(target: "dtab::read", "{w}");
        }
    }
}

pub struct LogSection<'a> {
    logger: &'a ReadLogger,
}

impl Drop for LogSection<'_> {
    fn drop(&mut self) {
        *self.logger.inner.indent.lock().unwrap() -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_receives_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let logger = ReadLogger::with_callback(move |msg, warn| {
            seen2.lock().unwrap().push((msg.to_string(), warn));
        });
        {
            let _s = logger.section("reading");
            logger.info("step");
            logger.warn("careful");
        }
        logger.info("done");
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("reading".to_string(), false));
        assert_eq!(seen[1], ("  step".to_string(), false));
        assert_eq!(seen[2], ("careful".to_string(), true));
        assert_eq!(seen[3], ("done".to_string(), false));
    }

    #[test]
    fn test_default_sink_buffers_warnings() {
        let logger = ReadLogger::new();
        logger.warn("w1");
        logger.warn("w2");
        assert_eq!(logger.inner.buffered_warnings.lock().unwrap().len(), 2);
        logger.emit_buffered();
        assert!(logger.inner.buffered_warnings.lock().unwrap().is_empty());
    }
}
