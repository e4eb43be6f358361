
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Absolute byte offset within the environment's main file.
///
/// Page addresses are always multiples of the page size; blob addresses
/// are chunk-aligned and may point into the middle of a page.
pub type Address = u64;

/// The freelist's unit of sub-page allocation, in bytes.
pub const CHUNK_SIZE: usize = 32;

/// On-disk header carried by typed pages (`{type, flags, reserved, lsn}`).
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page size used when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Smallest page size accepted at create time.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Cache budget used when the caller does not specify one, in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

/// Records below this size are kept inline by the record directory and
/// never reach the blob manager.
pub const BLOB_INLINE_THRESHOLD: usize = 32;

/// Identifier of a database inside an environment.
///
/// This is the caller-chosen name recorded in the header page's name
/// table; zero marks an empty slot and is never a valid id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DbId(pub u32);

/// A transaction handle.
///
/// `last_lsn` threads the per-transaction back-chain through the
/// journal: every record a transaction emits carries the LSN of the
/// previous one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Txn {
    pub id: u64,
    pub last_lsn: u64,
}

impl Txn {
    pub fn new(id: u64) -> Self {
        Self { id, last_lsn: 0 }
    }
}

/// Canonical error type shared across the storage subsystems.
///
/// Each variant maps to a stable integer visible to callers via
/// [`DbError::code`]; success is 0.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("integrity violated: {0}")]
    IntegrityViolated(String),
    #[error("invalid log file header")]
    LogInvalidFileHeader,
    #[error("recovery required")]
    NeedRecovery,
    #[error("database not found")]
    DatabaseNotFound,
}

impl DbError {
    /// Stable integer code for this error; part of the public contract.
    pub fn code(&self) -> i32 {
        match self {
            DbError::Io(e) if e.kind() == io::ErrorKind::NotFound => 2,
            DbError::Io(_) => 1,
            DbError::FileNotFound(_) => 2,
            DbError::KeyNotFound => 3,
            DbError::DuplicateKey => 4,
            DbError::InvalidParameter(_) => 5,
            DbError::OutOfMemory => 6,
            DbError::IntegrityViolated(_) => 7,
            DbError::LogInvalidFileHeader => 8,
            DbError::NeedRecovery => 9,
            DbError::DatabaseNotFound => 10,
        }
    }
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Parameters accepted when opening or creating an environment.
///
/// # Example
/// ```
/// use common::EnvOptions;
///
/// let opts = EnvOptions::builder()
///     .page_size(1024)
///     .cache_size(100 * 1024)
///     .enable_recovery(true)
///     .build();
/// assert!(opts.validate().is_ok());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct EnvOptions {
    /// Page size in bytes; fixed at create time, immutable thereafter.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Soft cache bound in bytes; exceeding it triggers a purge pass.
    #[builder(default = DEFAULT_CACHE_SIZE)]
    pub cache_size: usize,
    /// Capacity of the per-environment database name table.
    #[builder(default = 16)]
    pub max_databases: usize,
    /// Open the environment without write access.
    #[builder(default = false)]
    pub read_only: bool,
    /// Back the environment by a memory arena instead of a file.
    #[builder(default = false)]
    pub in_memory: bool,
    /// Create/open the write-ahead log and replay it after a crash.
    #[builder(default = false)]
    pub enable_recovery: bool,
    /// Force plain read/write I/O even where mapping is available.
    #[builder(default = false)]
    pub disable_mmap: bool,
    /// Skip end-of-file reclaim on close.
    #[builder(default = false)]
    pub disable_reclaim: bool,
    /// Allow explicit transaction handles.
    #[builder(default = false)]
    pub enable_transactions: bool,
    /// Close open databases automatically when the environment closes.
    #[builder(default = true)]
    pub auto_cleanup: bool,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: 16,
            read_only: false,
            in_memory: false,
            enable_recovery: false,
            disable_mmap: false,
            disable_reclaim: false,
            enable_transactions: false,
            auto_cleanup: true,
        }
    }
}

impl EnvOptions {
    /// Check flag compatibility and parameter ranges.
    pub fn validate(&self) -> DbResult<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(DbError::InvalidParameter(format!(
                "page_size must be a power of two >= {MIN_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.page_size % CHUNK_SIZE != 0 {
            return Err(DbError::InvalidParameter(
                "page_size must be a multiple of the chunk size".into(),
            ));
        }
        if self.max_databases == 0 {
            return Err(DbError::InvalidParameter("max_databases must be > 0".into()));
        }
        if self.in_memory && self.enable_recovery {
            return Err(DbError::InvalidParameter(
                "in_memory and enable_recovery are mutually exclusive".into(),
            ));
        }
        if self.read_only && self.enable_recovery {
            return Err(DbError::InvalidParameter(
                "read_only and enable_recovery are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

/// Counters exposed by `Environment::get_metrics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnvMetrics {
    pub page_count_fetched: u64,
    pub page_count_flushed: u64,
    pub page_count_type_index: u64,
    pub page_count_type_blob: u64,
    pub page_count_type_freelist: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub freelist_pages: u64,
    pub freelist_free_bytes: u64,
}
