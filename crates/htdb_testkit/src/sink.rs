//! A log sink that keeps every message.

use htdb_core::{ErrorKind, LogLevel, LogSink};
use parking_lot::Mutex;
use std::sync::Arc;

/// One captured log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Severity.
    pub level: LogLevel,
    /// Error classification.
    pub kind: ErrorKind,
    /// Message, prefixed with the database name.
    pub message: String,
}

/// Records every event a handle logs.
///
/// # Example
///
/// ```rust
/// use htdb_core::{Config, Database};
/// use htdb_testkit::CapturingSink;
///
/// let sink = CapturingSink::new();
/// let config = Config::new().log_sink(sink.clone());
/// let _db = Database::open_in_memory(&config).unwrap();
/// assert_eq!(sink.count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct CapturingSink {
    events: Mutex<Vec<LogEvent>>,
}

impl CapturingSink {
    /// Creates an empty sink, shared so it can be handed to a [`htdb_core::Config`].
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the number of events captured.
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns a copy of every captured event.
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    /// Returns the messages only.
    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Returns the number of messages containing `needle`.
    pub fn count_containing(&self, needle: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }

    /// Forgets everything captured so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LogSink for CapturingSink {
    fn log(&self, level: LogLevel, kind: ErrorKind, message: &str) {
        self.events.lock().push(LogEvent {
            level,
            kind,
            message: message.to_string(),
        });
    }
}
