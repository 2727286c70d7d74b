//! Error type for archive engine operations.

use packstore_common::Error;

/// Error type for archive engine operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive {path} still held open after {attempts} attempts")]
    AlreadyOpen { path: String, attempts: u32 },
    #[error("archive not found: {0}")]
    ArchiveNotFound(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("index maps {key} to missing bucket {bucket}")]
    MissingBucket { key: String, bucket: String },
    #[error("timed out acquiring lock on {path}")]
    LockTimeout { path: String },

    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("unsupported record: {0}")]
    UnsupportedRecord(String),
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("range not satisfiable for record of {size} bytes")]
    RangeNotSatisfiable { size: u64 },
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(io) => Self::Io(io),
            StoreError::ArchiveNotFound(what) | StoreError::KeyNotFound(what) => {
                Self::NotFound(what)
            }
            StoreError::LockTimeout { path } => Self::LockTimeout { path },
            StoreError::MalformedRecord(msg) => Self::MalformedRecord(msg),
            StoreError::UnsupportedRecord(msg) => Self::UnsupportedRecord(msg),
            StoreError::ChecksumMismatch { expected, actual } => {
                Self::ChecksumMismatch { expected, actual }
            }
            StoreError::RangeNotSatisfiable { size } => Self::RangeNotSatisfiable { size },
            other => Self::Store(other.to_string()),
        }
    }
}
