//! Database handle: open, close and the locking glue every operation uses.

use crate::config::Config;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::hash::{HashFamily, HashFunction};
use crate::layout::{
    field, get_u64, Header, ALIGNMENT, BUCKET_TOP, DEFAULT_HASH_SIZE, FORMAT_VERSION,
    FREELIST_TOP, HEADER_SIZE,
};
use crate::lock::{bucket_lock, LockManager, ACTIVE_LOCK, OPEN_LOCK, TRANSACTION_LOCK};
use crate::log::{LogContext, LogLevel};
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::transaction::Transaction;
use htdb_storage::{
    FileBackend, FileIdentity, FileOptions, InMemoryBackend, LockKind, LockWait, StorageBackend,
};
use parking_lot::Mutex;
use rand::RngCore;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Files open in this process. `fcntl` locks are per process, so a second
/// handle on the same file would silently share the first one's locks.
static OPEN_FILES: Mutex<Vec<FileIdentity>> = parking_lot::const_mutex(Vec::new());

/// Claim on a file in [`OPEN_FILES`], released on drop.
#[derive(Debug)]
struct Registration(FileIdentity);

impl Registration {
    fn claim(identity: FileIdentity) -> CoreResult<Self> {
        let mut open = OPEN_FILES.lock();
        if open.contains(&identity) {
            return Err(CoreError::AlreadyOpen);
        }
        open.push(identity.clone());
        Ok(Self(identity))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_FILES.lock().retain(|identity| identity != &self.0);
    }
}

/// A handle on one database file.
///
/// Every operation is synchronous. Several processes can open the same
/// file at once; they coordinate through advisory byte-range locks on the
/// file itself. Within one process a file can only be open once.
///
/// # Example
///
/// ```rust,no_run
/// use htdb_core::{Config, Database, StoreMode};
///
/// let mut db = Database::open("users.htdb", &Config::default())?;
/// db.store(b"alice", b"admin", StoreMode::Insert)?;
/// assert_eq!(db.fetch(b"alice")?, b"admin");
///
/// db.transaction_start()?;
/// db.delete(b"alice")?;
/// db.store(b"bob", b"admin", StoreMode::Insert)?;
/// db.transaction_commit()?;
///
/// db.close()?;
/// # Ok::<(), htdb_core::CoreError>(())
/// ```
pub struct Database {
    pub(crate) io: Box<dyn StorageBackend>,
    name: String,
    path: Option<PathBuf>,
    pub(crate) hash: HashFunction,
    /// Header as read at open. Only the fields fixed at creation are
    /// trusted; everything else is re-read from the file.
    pub(crate) header: Header,
    pub(crate) locks: LockManager,
    pub(crate) transaction: Option<Transaction>,
    pub(crate) traverse_depth: u32,
    pub(crate) traverse_read_depth: u32,
    /// Bumped whenever this handle relinks a chain.
    pub(crate) generation: u64,
    pub(crate) log: LogContext,
    last_error: Option<ErrorKind>,
    pub(crate) disabled: Option<ErrorKind>,
    opened_read_only: bool,
    pub(crate) read_only: bool,
    pub(crate) disable_auto_fsync: bool,
    pub(crate) allow_nesting: bool,
    pub(crate) sequence_tracking: bool,
    pub(crate) stats: DatabaseStats,
    shut_down: bool,
    _registration: Option<Registration>,
}

impl Database {
    // ========================================================================
    // Opening
    // ========================================================================

    /// Opens or creates the database file at `path`.
    ///
    /// # Errors
    ///
    /// - `NotADatabase` if the file exists but is not an htdb file
    /// - `WrongHashFunction` if the configured hash does not match the file
    /// - `AlreadyOpen` if this process already has the file open
    /// - `InvalidArgument` for an unusable configuration
    pub fn open(path: impl AsRef<Path>, config: &Config) -> CoreResult<Self> {
        config.validate()?;
        let path = path.as_ref();
        let name = path.display().to_string();
        let mut log = LogContext::new(config.log_sink.clone(), name.clone());

        if config.volatile {
            let io = Box::new(InMemoryBackend::new());
            return Self::open_backend(io, None, name, log, None, config);
        }

        // Claimed before opening a descriptor: closing a second descriptor
        // on a file this process has open would drop its locks.
        let registration = match FileIdentity::of_path(path).map(Registration::claim).transpose() {
            Ok(registration) => registration,
            Err(err) => {
                log.log(LogLevel::UseError, err.kind(), &err.to_string());
                return Err(err);
            }
        };

        let options = FileOptions::new()
            .read_only(config.read_only)
            .create(config.create_if_missing)
            .create_new(config.error_if_exists)
            .use_mmap(!config.disable_mmap)
            .mode(config.permissions);
        let backend = match FileBackend::open_with(path, &options) {
            Ok(backend) => backend,
            Err(err) => {
                let err = CoreError::from(err);
                log.log(LogLevel::Error, err.kind(), &format!("cannot open file: {err}"));
                return Err(err);
            }
        };
        let path = Some(path.to_path_buf());
        Self::open_backend(Box::new(backend), path, name, log, registration, config)
    }

    /// Opens a database that lives in memory only.
    pub fn open_in_memory(config: &Config) -> CoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), config)
    }

    /// Opens a database on a caller-supplied backend.
    ///
    /// An empty backend gets a fresh database, as with a new file.
    pub fn open_with_backend(backend: Box<dyn StorageBackend>, config: &Config) -> CoreResult<Self> {
        config.validate()?;
        let name = ":memory:".to_string();
        let log = LogContext::new(config.log_sink.clone(), name.clone());
        Self::open_backend(backend, None, name, log, None, config)
    }

    fn open_backend(
        io: Box<dyn StorageBackend>,
        path: Option<PathBuf>,
        name: String,
        mut log: LogContext,
        registration: Option<Registration>,
        config: &Config,
    ) -> CoreResult<Self> {
        let registration = match registration {
            Some(registration) => Some(registration),
            None => match io.identity().map(Registration::claim).transpose() {
                Ok(registration) => registration,
                Err(err) => {
                    log.log(LogLevel::UseError, err.kind(), &err.to_string());
                    return Err(err);
                }
            },
        };
        let read_only = config.read_only || io.is_read_only();

        let mut db = Self {
            io,
            name,
            path,
            hash: HashFunction::default(),
            header: Header::default(),
            locks: LockManager::new(),
            transaction: None,
            traverse_depth: 0,
            traverse_read_depth: 0,
            generation: 0,
            log,
            last_error: None,
            disabled: None,
            opened_read_only: read_only,
            read_only,
            disable_auto_fsync: config.disable_auto_fsync,
            allow_nesting: config.allow_nesting,
            sequence_tracking: config.sequence_tracking,
            stats: DatabaseStats::new(),
            shut_down: false,
            _registration: registration,
        };

        let kind = if read_only { LockKind::Read } else { LockKind::Write };
        db.lock_offset(OPEN_LOCK, kind, LockWait::Wait)?;
        let result = db.initialize(config);
        let unlocked = db.unlock_offset(OPEN_LOCK);
        result.and(unlocked)?;

        debug!(
            name = %db.name,
            hash_size = db.header.hash_size,
            mapped = db.io.is_mapped(),
            read_only,
            "opened database"
        );
        Ok(db)
    }

    /// Runs under the open lock.
    fn initialize(&mut self, config: &Config) -> CoreResult<()> {
        if config.truncate {
            self.io.truncate(0)?;
        }
        if config.clear_if_first && !self.opened_read_only {
            match self.lock_offset(ACTIVE_LOCK, LockKind::Write, LockWait::NoWait) {
                Ok(_) => {
                    self.io.truncate(0)?;
                    self.unlock_offset(ACTIVE_LOCK)?;
                }
                Err(CoreError::WouldBlock) => {}
                Err(err) => return Err(err),
            }
        }

        if self.io.size()? == 0 {
            if self.opened_read_only {
                let err = CoreError::not_a_database("file is empty");
                self.log.log(LogLevel::Error, err.kind(), &err.to_string());
                return Err(err);
            }
            // The file has no content to protect yet, so a failure here
            // is returned unlogged.
            self.create(config)?;
        } else if let Err(err) = self.load(config) {
            self.log.log(LogLevel::Error, err.kind(), &err.to_string());
            return Err(err);
        }

        self.lock_offset(ACTIVE_LOCK, LockKind::Read, LockWait::Wait)?;
        if !self.opened_read_only {
            self.recover_at_open()?;
        }
        Ok(())
    }

    fn create(&mut self, config: &Config) -> CoreResult<()> {
        let hash = config.hash_function_override.clone().unwrap_or_default();
        let hash_size = config.hash_table_size_hint.unwrap_or(DEFAULT_HASH_SIZE);
        let seed = random_seed();
        let header = Header::new(hash_size, hash.family().to_raw(), seed, hash.check_value(seed));

        self.io.grow(header.data_start())?;
        self.io.write_at(0, &header.encode())?;
        self.sync_file()?;

        info!(name = %self.name, hash_size, family = %hash.family(), "created database");
        self.hash = hash;
        self.header = header;
        Ok(())
    }

    fn load(&mut self, config: &Config) -> CoreResult<()> {
        let bytes = self
            .io
            .read_at(0, HEADER_SIZE as usize)
            .map_err(|_| CoreError::not_a_database("file is shorter than a header"))?;
        let header = Header::decode(&bytes)?;
        validate_header(&header, self.io.size()?)?;
        self.hash = negotiate_hash(&header, config)?;
        self.header = header;
        Ok(())
    }

    fn recover_at_open(&mut self) -> CoreResult<()> {
        if !self.recovery_pending()? {
            return Ok(());
        }
        match self.lock_offset(TRANSACTION_LOCK, LockKind::Write, LockWait::NoWait) {
            Ok(_) => {}
            // A live transaction in another process owns the journal.
            Err(CoreError::WouldBlock) => return Ok(()),
            Err(err) => return Err(err),
        }
        let result = self.recover_locked();
        let unlocked = self.unlock_offset(TRANSACTION_LOCK);
        result.and(unlocked)
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Closes the handle, cancelling any active transaction.
    pub fn close(mut self) -> CoreResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> CoreResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        if self.transaction.is_some() {
            self.log.log(
                LogLevel::Warning,
                ErrorKind::InvalidArgument,
                "closed with a transaction active; cancelling it",
            );
            if let Err(err) = self.abandon_transaction() {
                warn!(name = %self.name, error = %err, "cancelling transaction at close failed");
            }
        }
        self.locks.release_everything(&*self.io)
    }

    // ========================================================================
    // Handle state
    // ========================================================================

    /// Returns the name used in log messages: the path, or `:memory:`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the file, if the database has one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the number of hash buckets.
    #[must_use]
    pub fn hash_size(&self) -> u32 {
        self.header.hash_size
    }

    /// Returns the hash function in use.
    #[must_use]
    pub fn hash_function(&self) -> &HashFunction {
        &self.hash
    }

    /// Returns true if the file is accessed through a memory map.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.io.is_mapped()
    }

    /// Returns true if writes are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Refuses or allows writes through this handle.
    ///
    /// # Errors
    ///
    /// `ReadOnly` when trying to allow writes on a handle opened read-only.
    pub fn set_read_only(&mut self, read_only: bool) -> CoreResult<()> {
        if !read_only && self.opened_read_only {
            return self.track(Err(CoreError::ReadOnly));
        }
        self.read_only = read_only;
        Ok(())
    }

    /// Returns the kind of the last error any call on this handle returned.
    #[must_use]
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Returns the last message sent to the log sink.
    #[must_use]
    pub fn last_log_message(&self) -> Option<&str> {
        self.log.last()
    }

    /// Stops or resumes delivery of log events.
    pub fn set_logging_suppressed(&mut self, suppressed: bool) {
        self.log.set_suppressed(suppressed);
    }

    /// Returns a snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Records a failed call.
    pub(crate) fn track<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err) = &result {
            self.last_error = Some(err.kind());
            self.stats.record_error();
        }
        result
    }

    pub(crate) fn ensure_usable(&self) -> CoreResult<()> {
        match self.disabled {
            Some(kind) => Err(CoreError::Disabled { kind }),
            None => Ok(()),
        }
    }

    pub(crate) fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.read_only || self.traverse_read_depth > 0 {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    /// Stops writes after a failed write outside a transaction, so a
    /// half-done update is not built upon.
    pub(crate) fn note_write_failure(&mut self, err: &CoreError) {
        if self.transaction.is_some() || err.kind() != ErrorKind::Io || self.read_only {
            return;
        }
        self.read_only = true;
        self.log.log(
            LogLevel::Error,
            ErrorKind::Io,
            &format!("write failed, handle is now read-only: {err}"),
        );
    }

    /// Refuses everything but close from now on.
    pub(crate) fn disable(&mut self, err: &CoreError) {
        self.disabled = Some(err.kind());
        self.log.log(
            LogLevel::Error,
            err.kind(),
            &format!("fatal failure, handle disabled: {err}"),
        );
    }

    pub(crate) fn sync_file(&mut self) -> CoreResult<()> {
        if !self.disable_auto_fsync {
            self.io.sync()?;
        }
        Ok(())
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub(crate) fn lock_offset(
        &mut self,
        offset: u64,
        kind: LockKind,
        wait: LockWait,
    ) -> CoreResult<bool> {
        if kind == LockKind::Write && self.opened_read_only {
            return Err(CoreError::ReadOnly);
        }
        let in_transaction = self.transaction.is_some();
        let result = self.locks.lock(&*self.io, offset, kind, wait, in_transaction);
        self.log_lock_error(result)
    }

    pub(crate) fn unlock_offset(&mut self, offset: u64) -> CoreResult<()> {
        let result = self.locks.unlock(&*self.io, offset);
        self.log_lock_error(result)
    }

    pub(crate) fn lock_all_raw(&mut self, kind: LockKind, wait: LockWait) -> CoreResult<()> {
        if kind == LockKind::Write && self.opened_read_only {
            return Err(CoreError::ReadOnly);
        }
        let result = self.locks.lock_all(&*self.io, kind, wait);
        self.log_lock_error(result)
    }

    pub(crate) fn unlock_all_raw(&mut self, force: bool) -> CoreResult<()> {
        let result = self.locks.unlock_all(&*self.io, force);
        self.log_lock_error(result)
    }

    pub(crate) fn upgrade_all_raw(&mut self) -> CoreResult<()> {
        let result = self.locks.upgrade_all(&*self.io);
        self.log_lock_error(result)
    }

    pub(crate) fn downgrade_all_raw(&mut self) -> CoreResult<()> {
        let result = self.locks.downgrade_all(&*self.io);
        self.log_lock_error(result)
    }

    /// Contention is an expected outcome, everything else is logged.
    fn log_lock_error<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err @ CoreError::Lock { .. }) = &result {
            let message = err.to_string();
            self.log.log(LogLevel::Error, ErrorKind::Lock, &message);
        }
        result
    }

    /// Locks a bucket, first replaying a crashed commit if one is pending.
    pub(crate) fn lock_bucket(&mut self, bucket: u32, kind: LockKind) -> CoreResult<()> {
        loop {
            let fresh = self.lock_offset(bucket_lock(bucket), kind, LockWait::Wait)?;
            if !fresh
                || self.locks.held(TRANSACTION_LOCK).is_some()
                || self.locks.allrecord().is_some()
            {
                return Ok(());
            }
            match self.recovery_pending() {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    self.unlock_offset(bucket_lock(bucket))?;
                    self.lock_and_recover()?;
                }
                Err(err) => {
                    self.unlock_offset(bucket_lock(bucket))?;
                    return Err(err);
                }
            }
        }
    }

    pub(crate) fn unlock_bucket(&mut self, bucket: u32) -> CoreResult<()> {
        self.unlock_offset(bucket_lock(bucket))
    }

    /// Takes the all-record lock, replaying a crashed commit if needed.
    pub(crate) fn lock_all_checked(&mut self, kind: LockKind) -> CoreResult<()> {
        let fresh = self.locks.allrecord().is_none();
        self.lock_all_raw(kind, LockWait::Wait)?;
        if !fresh || self.locks.held(TRANSACTION_LOCK).is_some() {
            return Ok(());
        }
        match self.recovery_pending() {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.unlock_all_raw(false)?;
                self.lock_and_recover()?;
                self.lock_all_raw(kind, LockWait::Wait)
            }
            Err(err) => {
                self.unlock_all_raw(false)?;
                Err(err)
            }
        }
    }

    /// Returns true if the file on disk carries an unfinished commit.
    pub(crate) fn recovery_pending(&self) -> CoreResult<bool> {
        let bytes = self.io.read_at(field::RECOVERY, 8)?;
        Ok(get_u64(&bytes, 0) != 0)
    }

    /// Takes the transaction and all-record locks and replays the journal.
    pub(crate) fn lock_and_recover(&mut self) -> CoreResult<()> {
        if self.read_only {
            return Err(CoreError::ReadOnly);
        }
        self.lock_offset(TRANSACTION_LOCK, LockKind::Write, LockWait::Wait)?;
        let result = self.recover_locked();
        let unlocked = self.unlock_offset(TRANSACTION_LOCK);
        result.and(unlocked)
    }

    /// Runs with the transaction lock held.
    fn recover_locked(&mut self) -> CoreResult<()> {
        self.lock_all_raw(LockKind::Write, LockWait::Wait)?;
        let result = self.recover().map(|_| ());
        let unlocked = self.unlock_all_raw(false);
        result.and(unlocked)
    }

    /// Locks the chain `key` hashes to, for writing, until
    /// [`chain_unlock`](Self::chain_unlock).
    pub fn chain_lock(&mut self, key: &[u8]) -> CoreResult<()> {
        let result = self.chain_lock_kind(key, LockKind::Write);
        self.track(result)
    }

    /// Releases a lock taken with [`chain_lock`](Self::chain_lock).
    pub fn chain_unlock(&mut self, key: &[u8]) -> CoreResult<()> {
        let result = self.unlock_bucket(self.bucket_of(key));
        self.track(result)
    }

    /// Locks the chain `key` hashes to, for reading.
    pub fn chain_lock_read(&mut self, key: &[u8]) -> CoreResult<()> {
        let result = self.chain_lock_kind(key, LockKind::Read);
        self.track(result)
    }

    /// Releases a lock taken with [`chain_lock_read`](Self::chain_lock_read).
    pub fn chain_unlock_read(&mut self, key: &[u8]) -> CoreResult<()> {
        self.chain_unlock(key)
    }

    fn chain_lock_kind(&mut self, key: &[u8], kind: LockKind) -> CoreResult<()> {
        self.ensure_usable()?;
        if kind == LockKind::Write && self.traverse_read_depth > 0 {
            return Err(CoreError::ReadOnly);
        }
        self.lock_bucket(self.bucket_of(key), kind)
    }

    /// Locks every record for writing, until [`unlock_all`](Self::unlock_all).
    pub fn lock_all(&mut self) -> CoreResult<()> {
        let result = self
            .ensure_usable()
            .and_then(|()| self.lock_all_checked(LockKind::Write));
        self.track(result)
    }

    /// Releases [`lock_all`](Self::lock_all).
    pub fn unlock_all(&mut self) -> CoreResult<()> {
        let result = self.unlock_all_raw(false);
        self.track(result)
    }

    /// Locks every record for reading.
    pub fn lock_all_read(&mut self) -> CoreResult<()> {
        let result = self
            .ensure_usable()
            .and_then(|()| self.lock_all_checked(LockKind::Read));
        self.track(result)
    }

    /// Releases [`lock_all_read`](Self::lock_all_read).
    pub fn unlock_all_read(&mut self) -> CoreResult<()> {
        self.unlock_all()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(name = %self.name, error = %err, "releasing locks at close failed");
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("hash_size", &self.header.hash_size)
            .field("hash", &self.hash)
            .field("read_only", &self.read_only)
            .field("transaction", &self.transaction.is_some())
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

fn validate_header(header: &Header, file_size: u64) -> CoreResult<()> {
    if header.version != FORMAT_VERSION {
        return Err(CoreError::not_a_database(format!(
            "unsupported format version {}",
            header.version
        )));
    }
    if header.flags != 0 {
        return Err(CoreError::not_a_database(format!(
            "unknown compatibility flags {:#x}",
            header.flags
        )));
    }
    if header.freelist_top != FREELIST_TOP || header.bucket_top != BUCKET_TOP {
        return Err(CoreError::not_a_database("unexpected table layout"));
    }
    if header.hash_size == 0 {
        return Err(CoreError::not_a_database("hash table has no buckets"));
    }
    if header.data_end < header.data_start()
        || header.data_end % ALIGNMENT != 0
        || header.data_end > file_size
    {
        return Err(CoreError::not_a_database(format!(
            "data end {} out of range",
            header.data_end
        )));
    }
    Ok(())
}

/// Picks the hash function for an existing file.
fn negotiate_hash(header: &Header, config: &Config) -> CoreResult<HashFunction> {
    let recorded = HashFamily::from_raw(header.hash_family);
    let hash = match &config.hash_function_override {
        Some(hash) => {
            if recorded != Some(hash.family()) {
                let recorded = recorded.map_or_else(
                    || format!("unknown ({:#x})", header.hash_family),
                    |family| family.to_string(),
                );
                return Err(CoreError::wrong_hash(format!(
                    "file was created with the {recorded} hash, not {}",
                    hash.family()
                )));
            }
            hash.clone()
        }
        None => {
            let family = recorded.ok_or_else(|| {
                CoreError::wrong_hash(format!("unknown hash family {:#x}", header.hash_family))
            })?;
            HashFunction::for_family(family).ok_or_else(|| {
                CoreError::wrong_hash(format!(
                    "file uses the {family} hash; supply it as the hash function override"
                ))
            })?
        }
    };
    if hash.check_value(header.hash_seed) != header.hash_check {
        return Err(CoreError::wrong_hash(format!(
            "the {} hash does not reproduce the file's check value",
            hash.family()
        )));
    }
    Ok(hash)
}

/// Seed for a new file's hash. A failing entropy source falls back to
/// the clock.
fn random_seed() -> u64 {
    let mut bytes = [0u8; 8];
    match rand::rngs::OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(_) => {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_nanos() as u64);
            nanos ^ (u64::from(std::process::id()) << 32)
        }
    }
}
