//! Bucket allocation inside an archive.
//!
//! Small payloads share buckets densely so the index stays cheap to scan;
//! large payloads get small buckets so an overwrite does not drag many
//! unrelated large records through compaction. A bucket is closed once it
//! reaches its key ceiling or [`BUCKET_BYTE_CEILING`] stored bytes, and the
//! next new key opens `wzd<counter + 1>`.
//!
//! Callers hold the archive's path lock, and the counter update commits in
//! the same write transaction as the record, so allocation is linear.

use crate::error::StoreResult;
use crate::tables::{COUNT, COUNTER_KEY, INDEX, bucket_name, bucket_ordinal, bucket_table};
use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};

/// Stored bytes after which a bucket stops accepting new keys (512 MiB)
pub const BUCKET_BYTE_CEILING: u64 = 512 * 1024 * 1024;

/// `(largest payload size, keys per bucket)`, smallest class first
const CAPACITY_TIERS: [(u64, u64); 5] = [
    (4 * 1024, 1024),
    (16 * 1024, 512),
    (64 * 1024, 256),
    (256 * 1024, 128),
    (1024 * 1024, 64),
];

/// Keys per bucket for payloads above the last tier
const LARGE_PAYLOAD_KEYS: u64 = 32;

/// Key ceiling of a bucket receiving payloads of `payload_size` bytes
#[must_use]
pub fn capacity_tier(payload_size: u64) -> u64 {
    CAPACITY_TIERS
        .iter()
        .find(|(max_size, _)| payload_size <= *max_size)
        .map_or(LARGE_PAYLOAD_KEYS, |(_, keys)| *keys)
}

/// Where a key is written
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Data table name
    pub bucket: String,
    /// Data table ordinal
    pub ordinal: u64,
    /// The key already existed and is overwritten in place
    pub existing: bool,
}

/// Pick the bucket for `key`, advancing the bucket counter when the most
/// recent bucket is full. The counter change is part of `txn`.
pub fn assign_bucket(
    txn: &WriteTransaction,
    key: &str,
    payload_size: u64,
) -> StoreResult<Assignment> {
    {
        let index = txn.open_table(INDEX)?;
        if let Some(bucket) = index.get(key)? {
            let bucket = bucket.value().to_string();
            let ordinal = bucket_ordinal(&bucket).unwrap_or_default();
            return Ok(Assignment {
                bucket,
                ordinal,
                existing: true,
            });
        }
    }

    let ceiling = capacity_tier(payload_size);
    let mut count = txn.open_table(COUNT)?;
    let counter = count.get(COUNTER_KEY)?.map_or(0, |v| v.value());

    let ordinal = if counter == 0 {
        1
    } else {
        let (keys, bytes) = bucket_usage(txn, &bucket_name(counter))?;
        if keys >= ceiling || bytes >= BUCKET_BYTE_CEILING {
            counter + 1
        } else {
            counter
        }
    };

    if ordinal != counter {
        count.insert(COUNTER_KEY, ordinal)?;
    }

    Ok(Assignment {
        bucket: bucket_name(ordinal),
        ordinal,
        existing: false,
    })
}

/// `(key count, stored bytes)` of a data table
fn bucket_usage(txn: &WriteTransaction, name: &str) -> StoreResult<(u64, u64)> {
    let table = txn.open_table(bucket_table(name))?;
    let keys = table.len()?;
    let bytes = table.stats()?.stored_bytes();
    Ok((keys, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::create(dir.path().join("t.bolt")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_capacity_tiers() {
        assert_eq!(capacity_tier(0), 1024);
        assert_eq!(capacity_tier(4 * 1024), 1024);
        assert_eq!(capacity_tier(4 * 1024 + 1), 512);
        assert_eq!(capacity_tier(64 * 1024), 256);
        assert_eq!(capacity_tier(200 * 1024), 128);
        assert_eq!(capacity_tier(1024 * 1024), 64);
        assert_eq!(capacity_tier(8 * 1024 * 1024), 32);
    }

    #[test]
    fn test_first_key_opens_wzd1() {
        let (_dir, db) = open_db();
        let txn = db.begin_write().unwrap();
        let assignment = assign_bucket(&txn, "c.txt", 5).unwrap();
        assert_eq!(assignment.bucket, "wzd1");
        assert!(!assignment.existing);
        txn.commit().unwrap();

        let txn = db.begin_read().unwrap();
        let count = txn.open_table(COUNT).unwrap();
        assert_eq!(count.get(COUNTER_KEY).unwrap().unwrap().value(), 1);
    }

    #[test]
    fn test_existing_key_keeps_bucket() {
        let (_dir, db) = open_db();
        let txn = db.begin_write().unwrap();
        {
            let mut index = txn.open_table(INDEX).unwrap();
            index.insert("c.txt", "wzd3").unwrap();
        }
        let assignment = assign_bucket(&txn, "c.txt", 10 * 1024 * 1024).unwrap();
        assert_eq!(
            assignment,
            Assignment {
                bucket: "wzd3".into(),
                ordinal: 3,
                existing: true
            }
        );
    }

    #[test]
    fn test_full_bucket_rotates() {
        let (_dir, db) = open_db();
        let size = 8 * 1024 * 1024; // 32 keys per bucket
        let txn = db.begin_write().unwrap();
        {
            let mut count = txn.open_table(COUNT).unwrap();
            count.insert(COUNTER_KEY, 1u64).unwrap();
            let mut bucket = txn.open_table(bucket_table("wzd1")).unwrap();
            for i in 0..32 {
                bucket.insert(format!("k{i}").as_str(), &b"x"[..]).unwrap();
            }
        }
        let assignment = assign_bucket(&txn, "new", size).unwrap();
        assert_eq!(assignment.bucket, "wzd2");

        // A small payload still fits: its ceiling is 1024
        let assignment = assign_bucket(&txn, "small", 10).unwrap();
        assert_eq!(assignment.bucket, "wzd2");
    }
}
