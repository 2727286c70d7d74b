//! packstore Archive - per-directory archive storage engine
//!
//! This crate implements the storage core:
//! - Record codec (fixed 32-byte header + payload, CRC-32 integrity)
//! - Bucket allocation and rotation inside an archive
//! - Path-level mutual exclusion shared by every operation
//! - Compaction bookkeeping and the background compaction scheduler

pub mod allocator;
pub mod archive;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod tables;

// Re-exports
pub use allocator::{Assignment, BUCKET_BYTE_CEILING, capacity_tier};
pub use archive::{Archive, DeleteOutcome, OpenPolicy};
pub use coordinator::{CompactionCoordinator, CompactionTask, RedbCoordinator};
pub use error::{StoreError, StoreResult};
pub use lock::{LockPolicy, PathGuard, PathLocks};
pub use record::{HEADER_SIZE, RecordHeader, RecordMeta, decode_record, encode_record};
pub use scheduler::{CompactionOutcome, CompactionScheduler, PassReport, compact_task};
pub use service::{ArchiveRead, ArchiveStore, PutOutcome, ReadPlan, RemoveOutcome, unix_now};
pub use tables::{ARCHIVE_EXTENSION, archive_path_for, is_archive_name};
