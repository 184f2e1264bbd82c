//! Database configuration.

use crate::error::{CoreError, CoreResult};
use crate::hash::HashFunction;
use crate::layout::FORMAT_VERSION;
use crate::log::LogSink;
use std::fmt;
use std::sync::Arc;

/// Configuration for opening a database.
///
/// Only `hash_table_size_hint` and `hash_function_override` affect what is
/// written to a new file; everything else is per-handle behavior.
#[derive(Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to error if the database already exists.
    pub error_if_exists: bool,

    /// Whether to discard existing content on open.
    pub truncate: bool,

    /// Open without write access.
    pub read_only: bool,

    /// Never memory map the file.
    pub disable_mmap: bool,

    /// Skip `fsync` during transaction commit.
    pub disable_auto_fsync: bool,

    /// Keep the database in memory only. The path is ignored.
    pub volatile: bool,

    /// Wipe the file if no other process has it open.
    pub clear_if_first: bool,

    /// Allow `transaction_start` inside an active transaction.
    pub allow_nesting: bool,

    /// Bump the sequence number on every modification, not just commits.
    pub sequence_tracking: bool,

    /// Number of hash buckets for a new file.
    pub hash_table_size_hint: Option<u32>,

    /// Hash function to use. Must match the file's on reopen.
    pub hash_function_override: Option<HashFunction>,

    /// Receives logged events. Defaults to [`crate::TracingSink`].
    pub log_sink: Option<Arc<dyn LogSink>>,

    /// Unix permission bits for a new file.
    pub permissions: u32,

    /// Format version the caller expects.
    pub format_version: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            truncate: false,
            read_only: false,
            disable_mmap: false,
            disable_auto_fsync: false,
            volatile: false,
            clear_if_first: false,
            allow_nesting: false,
            sequence_tracking: false,
            hash_table_size_hint: None,
            hash_function_override: None,
            log_sink: None,
            permissions: 0o600,
            format_version: FORMAT_VERSION,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to error if database exists.
    #[must_use]
    pub const fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets whether existing content is discarded on open.
    #[must_use]
    pub const fn truncate(mut self, value: bool) -> Self {
        self.truncate = value;
        self
    }

    /// Sets read-only access.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets whether memory mapping is disabled.
    #[must_use]
    pub const fn disable_mmap(mut self, value: bool) -> Self {
        self.disable_mmap = value;
        self
    }

    /// Sets whether commits skip `fsync`.
    #[must_use]
    pub const fn disable_auto_fsync(mut self, value: bool) -> Self {
        self.disable_auto_fsync = value;
        self
    }

    /// Sets whether the database lives in memory only.
    #[must_use]
    pub const fn volatile(mut self, value: bool) -> Self {
        self.volatile = value;
        self
    }

    /// Sets whether the first opener wipes the file.
    #[must_use]
    pub const fn clear_if_first(mut self, value: bool) -> Self {
        self.clear_if_first = value;
        self
    }

    /// Sets whether nested transactions are allowed.
    #[must_use]
    pub const fn allow_nesting(mut self, value: bool) -> Self {
        self.allow_nesting = value;
        self
    }

    /// Sets whether every modification bumps the sequence number.
    #[must_use]
    pub const fn sequence_tracking(mut self, value: bool) -> Self {
        self.sequence_tracking = value;
        self
    }

    /// Sets the hash-table size used when creating a file.
    #[must_use]
    pub const fn hash_table_size_hint(mut self, buckets: u32) -> Self {
        self.hash_table_size_hint = Some(buckets);
        self
    }

    /// Sets the hash function.
    #[must_use]
    pub fn hash_function_override(mut self, hash: HashFunction) -> Self {
        self.hash_function_override = Some(hash);
        self
    }

    /// Sets the log sink.
    #[must_use]
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Sets permission bits for new files.
    #[must_use]
    pub const fn permissions(mut self, mode: u32) -> Self {
        self.permissions = mode;
        self
    }

    /// Rejects configurations that can never open.
    pub(crate) fn validate(&self) -> CoreResult<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(CoreError::invalid_argument(format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                self.format_version
            )));
        }
        if self.hash_table_size_hint == Some(0) {
            return Err(CoreError::invalid_argument("hash table size must be positive"));
        }
        if self.read_only && (self.truncate || self.clear_if_first) {
            return Err(CoreError::invalid_argument(
                "read-only open cannot truncate or clear the file",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("truncate", &self.truncate)
            .field("read_only", &self.read_only)
            .field("disable_mmap", &self.disable_mmap)
            .field("disable_auto_fsync", &self.disable_auto_fsync)
            .field("volatile", &self.volatile)
            .field("clear_if_first", &self.clear_if_first)
            .field("allow_nesting", &self.allow_nesting)
            .field("sequence_tracking", &self.sequence_tracking)
            .field("hash_table_size_hint", &self.hash_table_size_hint)
            .field("hash_function_override", &self.hash_function_override)
            .field("log_sink", &self.log_sink.as_ref().map(|_| "<sink>"))
            .field("permissions", &format_args!("{:o}", self.permissions))
            .field("format_version", &self.format_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashFamily;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(!config.error_if_exists);
        assert!(!config.read_only);
        assert!(config.hash_function_override.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .disable_mmap(true)
            .hash_table_size_hint(2)
            .hash_function_override(HashFunction::legacy());

        assert!(!config.create_if_missing);
        assert!(config.disable_mmap);
        assert_eq!(config.hash_table_size_hint, Some(2));
        assert_eq!(
            config.hash_function_override.as_ref().map(HashFunction::family),
            Some(HashFamily::Legacy)
        );
    }

    #[test]
    fn invalid_configs_rejected() {
        assert!(Config::new().hash_table_size_hint(0).validate().is_err());
        assert!(Config::new().read_only(true).truncate(true).validate().is_err());

        let mut config = Config::new();
        config.format_version = FORMAT_VERSION + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_hides_sink() {
        let config = Config::new().log_sink(Arc::new(crate::log::TracingSink));
        let text = format!("{config:?}");
        assert!(text.contains("<sink>"));
        assert!(text.contains("600"));
    }
}
