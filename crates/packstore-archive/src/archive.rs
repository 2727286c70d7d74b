//! One archive file: a redb database multiplexing the small objects of a
//! single directory.
//!
//! An `Archive` is only used while holding the archive's path lock. Between
//! requests the handle may be parked in the store's handle cache; a file is
//! never open twice inside one process.

use crate::allocator::{Assignment, assign_bucket};
use crate::error::{StoreError, StoreResult};
use crate::record::{HEADER_SIZE, RecordHeader, RecordMeta, decode_record, encode_record};
use crate::tables::{COUNT, COUNTER_KEY, INDEX, bucket_ordinal, bucket_table};
use redb::{
    Database, DatabaseError, ReadOnlyTable, ReadTransaction, ReadableTable,
    ReadableTableMetadata, TableDefinition, TableError, TableHandle,
};
use std::fs::Permissions;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for opening an archive that another process holds open
#[derive(Clone, Copy, Debug)]
pub struct OpenPolicy {
    pub attempts: u32,
    pub sleep: Duration,
}

impl Default for OpenPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            sleep: Duration::from_millis(20),
        }
    }
}

/// Result of removing a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The key's bucket became empty and was dropped
    pub bucket_dropped: bool,
    /// No keys remain; the archive file should be removed
    pub now_empty: bool,
}

/// Handle on one archive file
pub struct Archive {
    db: Database,
    path: PathBuf,
    /// Device and inode the handle was opened on
    identity: (u64, u64),
}

impl Archive {
    /// Open an existing archive
    pub fn open(path: impl AsRef<Path>, policy: &OpenPolicy) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::ArchiveNotFound(path.display().to_string()));
        }
        let db = open_with_retry(path, policy, |p| Database::open(p))?;
        Ok(Self {
            db,
            path: path.to_path_buf(),
            identity: file_identity(path)?,
        })
    }

    /// Open an archive, creating it with `mode` permission bits if missing
    pub fn open_or_create(
        path: impl AsRef<Path>,
        policy: &OpenPolicy,
        mode: u32,
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        let existed = path.exists();
        let db = open_with_retry(path, policy, |p| Database::create(p))?;
        if !existed {
            std::fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?;
            debug!("Created archive {}", path.display());
        }
        Ok(Self {
            db,
            path: path.to_path_buf(),
            identity: file_identity(path)?,
        })
    }

    /// Whether the file at `path` is still the one this handle has open.
    /// False once it was removed or replaced behind our back.
    #[must_use]
    pub fn is_current(&self) -> bool {
        file_identity(&self.path).is_ok_and(|identity| identity == self.identity)
    }

    /// Archive file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bucket holding `key`, if present
    pub fn lookup(&self, key: &str) -> StoreResult<Option<String>> {
        let txn = self.db.begin_read()?;
        let Some(index) = open_existing(&txn, INDEX)? else {
            return Ok(None);
        };
        Ok(index.get(key)?.map(|v| v.value().to_string()))
    }

    /// Whether `key` is stored in this archive
    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Decode only the header of `key`'s record
    pub fn header(&self, key: &str) -> StoreResult<RecordHeader> {
        self.with_record(key, RecordHeader::decode)
    }

    /// Read the full payload of `key`, verifying its checksum when asked
    pub fn get(&self, key: &str, verify: bool) -> StoreResult<(RecordHeader, Vec<u8>)> {
        self.with_record(key, |raw| {
            let (header, payload) = decode_record(raw)?;
            if verify {
                header.verify(payload)?;
            }
            Ok((header, payload.to_vec()))
        })
    }

    /// Read payload bytes `start..=end` of `key` without copying the rest of
    /// the payload. No checksum is verified on partial reads.
    pub fn get_range(
        &self,
        key: &str,
        start: u64,
        end: u64,
    ) -> StoreResult<(RecordHeader, Vec<u8>)> {
        self.with_record(key, |raw| {
            let header = RecordHeader::decode(raw)?;
            if start > end || end >= header.size {
                return Err(StoreError::RangeNotSatisfiable { size: header.size });
            }
            let from = HEADER_SIZE + usize::try_from(start).unwrap_or(usize::MAX);
            let to = HEADER_SIZE + usize::try_from(end).unwrap_or(usize::MAX);
            let slice = raw.get(from..=to).ok_or_else(|| {
                StoreError::MalformedRecord(format!(
                    "record of {} bytes cannot serve {start}-{end}",
                    raw.len()
                ))
            })?;
            Ok((header, slice.to_vec()))
        })
    }

    /// Write `payload` under `key`. Bucket assignment, record and index entry
    /// commit in one transaction.
    pub fn put(
        &self,
        key: &str,
        payload: &[u8],
        meta: &RecordMeta,
        crc: u32,
    ) -> StoreResult<Assignment> {
        let record = encode_record(payload, meta, crc);
        let txn = self.db.begin_write()?;
        let assignment = assign_bucket(&txn, key, payload.len() as u64)?;
        {
            let mut bucket = txn.open_table(bucket_table(&assignment.bucket))?;
            bucket.insert(key, record.as_slice())?;
            let mut index = txn.open_table(INDEX)?;
            index.insert(key, assignment.bucket.as_str())?;
        }
        txn.commit()?;
        Ok(assignment)
    }

    /// Remove `key`, dropping its bucket when it empties
    pub fn delete(&self, key: &str) -> StoreResult<DeleteOutcome> {
        let txn = self.db.begin_write()?;
        let bucket = {
            let mut index = txn.open_table(INDEX)?;
            let removed = index.remove(key)?.map(|v| v.value().to_string());
            removed
        };
        let Some(bucket) = bucket else {
            txn.abort()?;
            return Err(StoreError::KeyNotFound(key.to_string()));
        };

        let remaining = {
            let mut table = txn.open_table(bucket_table(&bucket))?;
            if table.remove(key)?.is_none() {
                warn!(
                    "Index of {} mapped {} to {} but the bucket had no record",
                    self.path.display(),
                    key,
                    bucket
                );
            }
            table.len()?
        };
        let bucket_dropped = remaining == 0 && txn.delete_table(bucket_table(&bucket))?;
        let now_empty = txn.open_table(INDEX)?.is_empty()?;
        txn.commit()?;

        Ok(DeleteOutcome {
            bucket_dropped,
            now_empty,
        })
    }

    /// All keys, in index order
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let Some(index) = open_existing(&txn, INDEX)? else {
            return Ok(Vec::new());
        };
        let mut keys = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Number of keys
    pub fn count(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read()?;
        match open_existing(&txn, INDEX)? {
            Some(index) => Ok(index.len()?),
            None => Ok(0),
        }
    }

    /// Highest allocated bucket ordinal
    pub fn bucket_counter(&self) -> StoreResult<u64> {
        let txn = self.db.begin_read()?;
        let Some(count) = open_existing(&txn, COUNT)? else {
            return Ok(0);
        };
        Ok(count.get(COUNTER_KEY)?.map_or(0, |v| v.value()))
    }

    /// Names of the data buckets present, by ordinal
    pub fn buckets(&self) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let mut names: Vec<(u64, String)> = txn
            .list_tables()?
            .filter_map(|handle| {
                let name = handle.name().to_string();
                bucket_ordinal(&name).map(|ordinal| (ordinal, name))
            })
            .collect();
        names.sort_unstable();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }

    /// Rewrite the file without the space left by overwritten and deleted
    /// records, keeping its permission bits. Returns whether anything was
    /// reclaimed.
    pub fn compact(&mut self) -> StoreResult<bool> {
        let permissions = std::fs::metadata(&self.path)?.permissions();
        let reclaimed = self.db.compact()?;
        std::fs::set_permissions(&self.path, permissions)?;
        Ok(reclaimed)
    }

    fn with_record<T>(
        &self,
        key: &str,
        f: impl FnOnce(&[u8]) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let txn = self.db.begin_read()?;
        let Some(index) = open_existing(&txn, INDEX)? else {
            return Err(StoreError::KeyNotFound(key.to_string()));
        };
        let Some(bucket) = index.get(key)?.map(|v| v.value().to_string()) else {
            return Err(StoreError::KeyNotFound(key.to_string()));
        };
        let Some(table) = open_existing(&txn, bucket_table(&bucket))? else {
            return Err(StoreError::MissingBucket {
                key: key.to_string(),
                bucket,
            });
        };
        let Some(value) = table.get(key)? else {
            return Err(StoreError::MissingBucket {
                key: key.to_string(),
                bucket,
            });
        };
        f(value.value())
    }
}

/// Open a table for reading; a table that was never created reads as absent
fn open_existing<K: redb::Key + 'static, V: redb::Value + 'static>(
    txn: &ReadTransaction,
    def: TableDefinition<K, V>,
) -> StoreResult<Option<ReadOnlyTable<K, V>>> {
    match txn.open_table(def) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn file_identity(path: &Path) -> StoreResult<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

fn open_with_retry(
    path: &Path,
    policy: &OpenPolicy,
    open: impl Fn(&Path) -> Result<Database, DatabaseError>,
) -> StoreResult<Database> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if attempt < attempts => {
                debug!(
                    "Archive {} busy (attempt {}/{})",
                    path.display(),
                    attempt,
                    attempts
                );
                std::thread::sleep(policy.sleep);
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                return Err(StoreError::AlreadyOpen {
                    path: path.display().to_string(),
                    attempts,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}
