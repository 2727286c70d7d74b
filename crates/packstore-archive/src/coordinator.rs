//! Compaction bookkeeping.
//!
//! A compaction task marks an archive as holding dead space. PUT and DELETE
//! upsert a task whenever they overwrite or remove an existing archive key;
//! the scheduler of the owning host consumes it once it is old enough.

use crate::error::StoreResult;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

// Key: archive path, Value: bincode-encoded CompactionTask
const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("compaction");

/// A dirty archive waiting for compaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionTask {
    /// Archive file path
    pub path: String,
    /// Host that dirtied the archive and compacts it
    pub owner: String,
    /// Unix seconds of the most recent mutation
    pub dirty_since: u64,
    /// Failed compaction passes since the last mutation
    pub attempts: u32,
}

/// Persistent store of compaction tasks keyed by archive path
pub trait CompactionCoordinator: Send + Sync {
    /// Create the task for `path`, or refresh its owner and timestamp
    fn upsert(&self, path: &str, host: &str, now: u64) -> StoreResult<()>;

    /// Forget the task for `path`; a missing task is not an error
    fn remove(&self, path: &str) -> StoreResult<()>;

    fn get(&self, path: &str) -> StoreResult<Option<CompactionTask>>;

    /// Tasks owned by `host` whose `dirty_since` is at or before `cutoff`
    fn due(&self, host: &str, cutoff: u64) -> StoreResult<Vec<CompactionTask>>;

    /// Count one failed pass and return the updated attempt count
    fn record_failure(&self, path: &str) -> StoreResult<u32>;

    fn list(&self) -> StoreResult<Vec<CompactionTask>>;
}

/// Coordinator backed by a redb file
pub struct RedbCoordinator {
    db: Database,
}

impl RedbCoordinator {
    /// Open (or create) the task store at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(TASKS)?;
        }
        write_txn.commit()?;

        debug!("Compaction coordinator at {}", path.display());
        Ok(Self { db })
    }

    fn update(
        &self,
        path: &str,
        f: impl FnOnce(Option<CompactionTask>) -> Option<CompactionTask>,
    ) -> StoreResult<Option<CompactionTask>> {
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut table = write_txn.open_table(TASKS)?;
            let current = match table.get(path)? {
                Some(bytes) => Some(bincode::deserialize::<CompactionTask>(bytes.value())?),
                None => None,
            };
            let updated = f(current);
            if let Some(task) = &updated {
                let bytes = bincode::serialize(task)?;
                table.insert(path, bytes.as_slice())?;
            }
            updated
        };
        write_txn.commit()?;
        Ok(updated)
    }

    fn scan(&self, mut keep: impl FnMut(&CompactionTask) -> bool) -> StoreResult<Vec<CompactionTask>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let task: CompactionTask = bincode::deserialize(entry.1.value())?;
            if keep(&task) {
                result.push(task);
            }
        }
        Ok(result)
    }
}

impl CompactionCoordinator for RedbCoordinator {
    fn upsert(&self, path: &str, host: &str, now: u64) -> StoreResult<()> {
        self.update(path, |_| {
            Some(CompactionTask {
                path: path.to_string(),
                owner: host.to_string(),
                dirty_since: now,
                attempts: 0,
            })
        })?;
        Ok(())
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TASKS)?;
            table.remove(path)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, path: &str) -> StoreResult<Option<CompactionTask>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS)?;
        match table.get(path)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn due(&self, host: &str, cutoff: u64) -> StoreResult<Vec<CompactionTask>> {
        self.scan(|task| task.owner == host && task.dirty_since <= cutoff)
    }

    fn record_failure(&self, path: &str) -> StoreResult<u32> {
        let updated = self.update(path, |current| {
            current.map(|mut task| {
                task.attempts = task.attempts.saturating_add(1);
                task
            })
        })?;
        Ok(updated.map_or(0, |task| task.attempts))
    }

    fn list(&self) -> StoreResult<Vec<CompactionTask>> {
        self.scan(|_| true)
    }
}
