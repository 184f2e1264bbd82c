//! Log sinks and the per-handle logging context.
//!
//! Logged events are the failures a caller should hear about exactly once:
//! a wrong hash function at open, corruption found by the checker, a fatal
//! transaction failure. Lock contention under a non-blocking request is
//! never logged. Engine diagnostics (open, growth, recovery) go straight to
//! `tracing` and never reach the sink.

use crate::error::ErrorKind;
use std::fmt;
use std::sync::Arc;

/// Severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// The engine or the file failed.
    Error,
    /// The caller misused the API.
    UseError,
    /// Something unusual happened but the operation went on.
    Warning,
}

/// Receives every logged event of a handle.
///
/// Implemented for any `Fn(LogLevel, ErrorKind, &str)` closure.
pub trait LogSink: Send + Sync {
    /// Handles one event.
    fn log(&self, level: LogLevel, kind: ErrorKind, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(LogLevel, ErrorKind, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, kind: ErrorKind, message: &str) {
        self(level, kind, message);
    }
}

/// Default sink: forwards events to `tracing` under the `htdb` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, kind: ErrorKind, message: &str) {
        match level {
            LogLevel::Error => tracing::error!(target: "htdb", %kind, "{message}"),
            LogLevel::UseError => tracing::warn!(target: "htdb", %kind, "{message}"),
            LogLevel::Warning => tracing::warn!(target: "htdb", %kind, "{message}"),
        }
    }
}

/// Logging state owned by one handle.
pub(crate) struct LogContext {
    sink: Arc<dyn LogSink>,
    name: String,
    last: Option<String>,
    suppressed: bool,
}

impl LogContext {
    pub(crate) fn new(sink: Option<Arc<dyn LogSink>>, name: impl Into<String>) -> Self {
        Self {
            sink: sink.unwrap_or_else(|| Arc::new(TracingSink)),
            name: name.into(),
            last: None,
            suppressed: false,
        }
    }

    pub(crate) fn log(&mut self, level: LogLevel, kind: ErrorKind, message: &str) {
        if self.suppressed {
            return;
        }
        let line = format!("{}: {message}", self.name);
        self.sink.log(level, kind, &line);
        self.last = Some(line);
    }

    pub(crate) fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub(crate) fn set_suppressed(&mut self, suppressed: bool) {
        self.suppressed = suppressed;
    }
}

impl fmt::Debug for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogContext")
            .field("name", &self.name)
            .field("last", &self.last)
            .field("suppressed", &self.suppressed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn closure_sink_receives_prefixed_message() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: Arc<dyn LogSink> =
            Arc::new(move |level: LogLevel, kind: ErrorKind, msg: &str| {
                sink_seen.lock().push((level, kind, msg.to_string()));
            });

        let mut ctx = LogContext::new(Some(sink), "test.htdb");
        ctx.log(LogLevel::Error, ErrorKind::Corrupt, "bad magic");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, LogLevel::Error);
        assert_eq!(seen[0].1, ErrorKind::Corrupt);
        assert_eq!(seen[0].2, "test.htdb: bad magic");
        assert_eq!(ctx.last(), Some("test.htdb: bad magic"));
    }

    #[test]
    fn suppressed_context_drops_events() {
        let count = Arc::new(Mutex::new(0usize));
        let sink_count = Arc::clone(&count);
        let sink: Arc<dyn LogSink> =
            Arc::new(move |_: LogLevel, _: ErrorKind, _: &str| *sink_count.lock() += 1);

        let mut ctx = LogContext::new(Some(sink), "db");
        ctx.set_suppressed(true);
        ctx.log(LogLevel::Warning, ErrorKind::Io, "ignored");
        assert_eq!(*count.lock(), 0);
        assert!(ctx.last().is_none());

        ctx.set_suppressed(false);
        ctx.log(LogLevel::Warning, ErrorKind::Io, "kept");
        assert_eq!(*count.lock(), 1);
    }
}
