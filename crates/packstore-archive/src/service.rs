//! Locked archive operations.
//!
//! `ArchiveStore` composes the path locks, the archive handles and the
//! compaction coordinator. Every method takes the archive's path lock, checks
//! out the archive handle, does its work and parks the handle again before
//! the lock is released. All methods block; async callers run them on
//! `tokio::task::spawn_blocking`.
//!
//! Open handles are kept in a bounded cache keyed by archive path, so a busy
//! archive is not reopened for every request. A cached handle is only reused
//! while the file on disk is still the one it was opened on.

use crate::archive::{Archive, OpenPolicy};
use crate::coordinator::CompactionCoordinator;
use crate::error::{StoreError, StoreResult};
use crate::lock::{PathGuard, PathLocks};
use crate::record::{RecordHeader, RecordMeta};
use chrono::Utc;
use dashmap::DashMap;
use packstore_common::checksum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of an archived PUT
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    /// Bucket holding the key
    pub bucket: String,
    /// An existing key was overwritten
    pub overwritten: bool,
}

/// Result of an archived DELETE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The last key was removed together with the archive file
    ArchiveRemoved,
    /// Other keys remain; the archive was marked for compaction
    Remaining,
}

/// What to fetch once the record header is known
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadPlan {
    HeaderOnly,
    Full,
    /// Inclusive payload byte range
    Range { start: u64, end: u64 },
}

/// Result of an archive read
#[derive(Clone, Debug)]
pub struct ArchiveRead {
    pub header: RecordHeader,
    pub plan: ReadPlan,
    /// Bytes selected by `plan`; empty for [`ReadPlan::HeaderOnly`]
    pub body: Vec<u8>,
}

/// Open archive handles kept by default
pub const DEFAULT_CACHED_HANDLES: usize = 64;

/// Archive operations shared by the HTTP handlers and the scheduler
pub struct ArchiveStore {
    locks: PathLocks,
    coordinator: Arc<dyn CompactionCoordinator>,
    host_id: String,
    open_policy: OpenPolicy,
    /// Idle handles; a handle is removed while a lock holder uses it
    handles: DashMap<PathBuf, Archive>,
    cached_handles: usize,
}

impl ArchiveStore {
    pub fn new(
        locks: PathLocks,
        coordinator: Arc<dyn CompactionCoordinator>,
        host_id: impl Into<String>,
        open_policy: OpenPolicy,
    ) -> Self {
        Self {
            locks,
            coordinator,
            host_id: host_id.into(),
            open_policy,
            handles: DashMap::new(),
            cached_handles: DEFAULT_CACHED_HANDLES,
        }
    }

    /// Keep at most `capacity` idle archive handles open. Zero reopens the
    /// archive on every call and never holds a file open between requests.
    #[must_use]
    pub fn with_cached_handles(mut self, capacity: usize) -> Self {
        self.cached_handles = capacity;
        self
    }

    #[must_use]
    pub const fn locks(&self) -> &PathLocks {
        &self.locks
    }

    #[must_use]
    pub fn coordinator(&self) -> &dyn CompactionCoordinator {
        self.coordinator.as_ref()
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Lock `archive_path`, open the archive and run `f` on it
    pub fn with_archive<T>(
        &self,
        archive_path: &Path,
        f: impl FnOnce(&mut Archive) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.lock(archive_path)?;
        let mut archive = self.checkout(archive_path, None)?;
        let result = f(&mut archive);
        self.checkin(archive);
        result
    }

    /// Read `key`. `plan` sees the record header and decides what to fetch.
    /// Full reads are checksum-verified when `verify` is set; range reads
    /// never are.
    pub fn read(
        &self,
        archive_path: &Path,
        key: &str,
        verify: bool,
        plan: impl FnOnce(&RecordHeader) -> StoreResult<ReadPlan>,
    ) -> StoreResult<ArchiveRead> {
        self.with_archive(archive_path, |archive| {
            let header = archive.header(key)?;
            let plan = plan(&header)?;
            let (header, body) = match plan {
                ReadPlan::HeaderOnly => (header, Vec::new()),
                ReadPlan::Full => archive.get(key, verify)?,
                ReadPlan::Range { start, end } => archive.get_range(key, start, end)?,
            };
            Ok(ArchiveRead { header, plan, body })
        })
    }

    /// Whether the archive holds `key`; a missing archive holds nothing
    pub fn contains(&self, archive_path: &Path, key: &str) -> StoreResult<bool> {
        match self.with_archive(archive_path, |archive| archive.contains(key)) {
            Err(StoreError::ArchiveNotFound(_)) => Ok(false),
            other => other,
        }
    }

    /// Keys of the archive, empty when it does not exist
    pub fn keys(&self, archive_path: &Path) -> StoreResult<Vec<String>> {
        match self.with_archive(archive_path, |archive| archive.keys()) {
            Err(StoreError::ArchiveNotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Key count of the archive, 0 when it does not exist
    pub fn count(&self, archive_path: &Path) -> StoreResult<u64> {
        match self.with_archive(archive_path, |archive| archive.count()) {
            Err(StoreError::ArchiveNotFound(_)) => Ok(0),
            other => other,
        }
    }

    /// Write `payload` under `key`, creating the archive with `file_mode`
    /// when needed. With `integrity` the payload checksum is stored and the
    /// record is read back and verified before returning; a failed read-back
    /// removes the key again.
    pub fn put(
        &self,
        archive_path: &Path,
        key: &str,
        payload: &[u8],
        file_mode: u32,
        integrity: bool,
    ) -> StoreResult<PutOutcome> {
        let _guard = self.lock(archive_path)?;
        let mut archive = self.checkout(archive_path, Some(file_mode))?;

        let crc = if integrity { checksum(payload) } else { 0 };
        let meta = RecordMeta::now(file_mode);
        let assignment = archive.put(key, payload, &meta, crc)?;

        if integrity {
            if let Err(e) = archive.get(key, true) {
                error!(
                    "Read-back of {} in {} failed, discarding write: {}",
                    key,
                    archive_path.display(),
                    e
                );
                self.discard(archive, key);
                return Err(e);
            }
        }

        if assignment.existing {
            self.mark_dirty(&mut archive);
        }
        self.checkin(archive);
        debug!(
            "Stored {} ({} bytes) in {}:{}",
            key,
            payload.len(),
            archive_path.display(),
            assignment.bucket
        );

        Ok(PutOutcome {
            bucket: assignment.bucket,
            overwritten: assignment.existing,
        })
    }

    /// Remove `key`. The archive file is deleted with its last key, together
    /// with any pending compaction task.
    pub fn delete(&self, archive_path: &Path, key: &str) -> StoreResult<RemoveOutcome> {
        let _guard = self.lock(archive_path)?;
        let mut archive = match self.checkout(archive_path, None) {
            Ok(archive) => archive,
            Err(StoreError::ArchiveNotFound(_)) => {
                return Err(StoreError::KeyNotFound(key.to_string()));
            }
            Err(e) => return Err(e),
        };

        let outcome = match archive.delete(key) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.checkin(archive);
                return Err(e);
            }
        };
        if outcome.now_empty {
            drop(archive);
            self.remove_archive(archive_path)?;
            return Ok(RemoveOutcome::ArchiveRemoved);
        }

        self.mark_dirty(&mut archive);
        self.checkin(archive);
        Ok(RemoveOutcome::Remaining)
    }

    /// Take the handle for `archive_path` out of the cache, or open it.
    /// With `create` a missing archive is created with that mode. The caller
    /// must hold the path lock.
    pub(crate) fn checkout(&self, archive_path: &Path, create: Option<u32>) -> StoreResult<Archive> {
        if let Some((_, archive)) = self.handles.remove(archive_path) {
            if archive.is_current() {
                return Ok(archive);
            }
            debug!(
                "Archive {} changed on disk, reopening",
                archive_path.display()
            );
        }
        match create {
            Some(mode) => Archive::open_or_create(archive_path, &self.open_policy, mode),
            None => Archive::open(archive_path, &self.open_policy),
        }
    }

    /// Park `archive` for the next caller, closing an arbitrary idle handle
    /// when the cache is full
    pub(crate) fn checkin(&self, archive: Archive) {
        if self.cached_handles == 0 {
            return;
        }
        while self.handles.len() >= self.cached_handles {
            let victim = self.handles.iter().next().map(|entry| entry.key().clone());
            let Some(victim) = victim else { break };
            self.handles.remove(&victim);
        }
        self.handles.insert(archive.path().to_path_buf(), archive);
    }

    fn lock(&self, archive_path: &Path) -> StoreResult<PathGuard> {
        self.locks.acquire(&archive_path.to_string_lossy())
    }

    /// Record that `archive` holds dead space. When the task cannot be
    /// written, compact now under the lock the caller holds.
    fn mark_dirty(&self, archive: &mut Archive) {
        let path = archive.path().to_string_lossy().into_owned();
        let Err(e) = self.coordinator.upsert(&path, &self.host_id, unix_now()) else {
            return;
        };
        warn!(
            "Failed to record compaction task for {}, compacting inline: {}",
            path, e
        );
        match archive.compact() {
            Ok(_) => info!("Compacted {} inline", path),
            Err(e) => error!("Inline compaction of {} failed: {}", path, e),
        }
    }

    fn discard(&self, archive: Archive, key: &str) {
        let path = archive.path().to_path_buf();
        match archive.delete(key) {
            Ok(outcome) if outcome.now_empty => {
                drop(archive);
                if let Err(e) = self.remove_archive(&path) {
                    error!("Failed to remove archive {}: {}", path.display(), e);
                }
            }
            Ok(_) => {}
            Err(e) => error!(
                "Failed to discard {} from {}: {}",
                key,
                path.display(),
                e
            ),
        }
    }

    fn remove_archive(&self, archive_path: &Path) -> StoreResult<()> {
        self.handles.remove(archive_path);
        std::fs::remove_file(archive_path)?;
        let path = archive_path.to_string_lossy();
        if let Err(e) = self.coordinator.remove(&path) {
            warn!("Failed to drop compaction task for {}: {}", path, e);
        }
        info!("Removed empty archive {}", path);
        Ok(())
    }
}

/// Current time in unix seconds
#[must_use]
pub fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coordinator::{CompactionTask, RedbCoordinator};
    use crate::lock::LockPolicy;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub store: Arc<ArchiveStore>,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let coordinator = RedbCoordinator::open(dir.path().join("compaction.redb")).unwrap();
            Self::with_coordinator(dir, Arc::new(coordinator))
        }

        pub fn with_coordinator(
            dir: tempfile::TempDir,
            coordinator: Arc<dyn CompactionCoordinator>,
        ) -> Self {
            Self::build(dir, coordinator, LockPolicy::default())
        }

        /// Fixture whose lock waiters give up after `policy.budget()`
        pub fn with_locks(policy: LockPolicy) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let coordinator = RedbCoordinator::open(dir.path().join("compaction.redb")).unwrap();
            Self::build(dir, Arc::new(coordinator), policy)
        }

        fn build(
            dir: tempfile::TempDir,
            coordinator: Arc<dyn CompactionCoordinator>,
            policy: LockPolicy,
        ) -> Self {
            let store = ArchiveStore::new(
                PathLocks::new(policy),
                coordinator,
                "h1",
                OpenPolicy::default(),
            );
            Self {
                dir,
                store: Arc::new(store),
            }
        }

        pub fn archive(&self, name: &str) -> PathBuf {
            let dir = self.dir.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            dir.join(format!("{name}.bolt"))
        }
    }

    /// Coordinator whose writes always fail
    struct Unavailable {
        upserts: AtomicUsize,
    }

    impl CompactionCoordinator for Unavailable {
        fn upsert(&self, _: &str, _: &str, _: u64) -> StoreResult<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Io(std::io::Error::other("coordinator offline")))
        }
        fn remove(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        fn get(&self, _: &str) -> StoreResult<Option<CompactionTask>> {
            Ok(None)
        }
        fn due(&self, _: &str, _: u64) -> StoreResult<Vec<CompactionTask>> {
            Ok(Vec::new())
        }
        fn record_failure(&self, _: &str) -> StoreResult<u32> {
            Ok(0)
        }
        fn list(&self) -> StoreResult<Vec<CompactionTask>> {
            Ok(Vec::new())
        }
    }

    fn whole(_: &RecordHeader) -> StoreResult<ReadPlan> {
        Ok(ReadPlan::Full)
    }

    #[test]
    fn test_put_then_read() {
        let fx = Fixture::new();
        let path = fx.archive("b");

        let outcome = fx.store.put(&path, "c.txt", b"hello", 0o640, true).unwrap();
        assert_eq!(
            outcome,
            PutOutcome {
                bucket: "wzd1".into(),
                overwritten: false
            }
        );

        let read = fx.store.read(&path, "c.txt", true, whole).unwrap();
        assert_eq!(read.body, b"hello");
        assert_eq!(read.header.size, 5);
        assert_eq!(read.header.crc, checksum(b"hello"));
        assert!(!fx.store.locks().is_held(&path.to_string_lossy()));
    }

    #[test]
    fn test_fresh_insert_creates_no_task() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "a", b"1", 0o640, true).unwrap();
        fx.store.put(&path, "b", b"2", 0o640, true).unwrap();
        assert!(fx.store.coordinator().list().unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_creates_task() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "c.txt", b"hello", 0o640, true).unwrap();
        let outcome = fx.store.put(&path, "c.txt", b"bye", 0o640, true).unwrap();
        assert!(outcome.overwritten);

        let task = fx
            .store
            .coordinator()
            .get(&path.to_string_lossy())
            .unwrap()
            .unwrap();
        assert_eq!(task.owner, "h1");
        assert_eq!(fx.store.read(&path, "c.txt", true, whole).unwrap().body, b"bye");
    }

    #[test]
    fn test_ranged_read_skips_payload() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "ten", b"0123456789", 0o640, false).unwrap();

        let read = fx
            .store
            .read(&path, "ten", true, |header| {
                Ok(ReadPlan::Range {
                    start: header.size - 3,
                    end: header.size - 1,
                })
            })
            .unwrap();
        assert_eq!(read.body, b"789");
        assert_eq!(read.plan, ReadPlan::Range { start: 7, end: 9 });
        assert_eq!(read.header.crc, 0);
    }

    #[test]
    fn test_missing_archive_reads() {
        let fx = Fixture::new();
        let path = fx.archive("none");
        assert!(fx.store.keys(&path).unwrap().is_empty());
        assert_eq!(fx.store.count(&path).unwrap(), 0);
        assert!(!fx.store.contains(&path, "x").unwrap());
        assert!(matches!(
            fx.store.read(&path, "x", true, whole),
            Err(StoreError::ArchiveNotFound(_))
        ));
        assert!(matches!(
            fx.store.delete(&path, "x"),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_delete_last_key_removes_archive_and_task() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "a", b"1", 0o640, true).unwrap();
        fx.store.put(&path, "b", b"2", 0o640, true).unwrap();

        assert_eq!(fx.store.delete(&path, "a").unwrap(), RemoveOutcome::Remaining);
        let key = path.to_string_lossy().into_owned();
        assert!(fx.store.coordinator().get(&key).unwrap().is_some());

        assert_eq!(
            fx.store.delete(&path, "b").unwrap(),
            RemoveOutcome::ArchiveRemoved
        );
        assert!(!path.exists());
        assert!(fx.store.coordinator().get(&key).unwrap().is_none());
    }

    #[test]
    fn test_coordinator_failure_compacts_inline() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(Unavailable {
            upserts: AtomicUsize::new(0),
        });
        let fx = Fixture::with_coordinator(dir, coordinator.clone());
        let path = fx.archive("b");

        fx.store.put(&path, "a", b"1", 0o640, true).unwrap();
        fx.store.put(&path, "a", b"2", 0o640, true).unwrap();
        fx.store.put(&path, "b", b"3", 0o640, true).unwrap();
        fx.store.delete(&path, "b").unwrap();

        assert_eq!(coordinator.upserts.load(Ordering::SeqCst), 2);
        assert_eq!(fx.store.read(&path, "a", true, whole).unwrap().body, b"2");
    }

    #[test]
    fn test_lock_timeout_surfaces() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        let store = ArchiveStore::new(
            PathLocks::new(LockPolicy {
                try_times: 2,
                sleep: std::time::Duration::from_millis(1),
            }),
            Arc::new(RedbCoordinator::open(fx.dir.path().join("c2.redb")).unwrap()),
            "h1",
            OpenPolicy::default(),
        );
        let _held = store.locks().acquire(&path.to_string_lossy()).unwrap();
        assert!(matches!(
            store.put(&path, "a", b"1", 0o640, true),
            Err(StoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_concurrent_puts_of_distinct_keys() {
        let fx = Fixture::new();
        let path = fx.archive("b");

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&fx.store);
                let path = path.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        let key = format!("t{t}-k{i}");
                        store.put(&path, &key, key.as_bytes(), 0o640, true).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let keys = fx.store.keys(&path).unwrap();
        assert_eq!(keys.len(), 80);
        for key in &keys {
            let read = fx.store.read(&path, key, true, whole).unwrap();
            assert_eq!(read.body, key.as_bytes());
        }
    }

    #[test]
    fn test_handle_reused_between_calls() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "a", b"1", 0o640, true).unwrap();
        assert_eq!(fx.store.handles.len(), 1);

        // the parked handle keeps the file open inside this process
        assert!(matches!(
            Archive::open(
                &path,
                &OpenPolicy {
                    attempts: 1,
                    sleep: std::time::Duration::ZERO
                }
            ),
            Err(StoreError::AlreadyOpen { .. })
        ));

        fx.store.put(&path, "b", b"2", 0o640, true).unwrap();
        assert_eq!(fx.store.count(&path).unwrap(), 2);
        assert_eq!(fx.store.handles.len(), 1);

        fx.store.delete(&path, "a").unwrap();
        fx.store.delete(&path, "b").unwrap();
        assert_eq!(fx.store.handles.len(), 0);
    }

    #[test]
    fn test_replaced_archive_is_reopened() {
        let fx = Fixture::new();
        let path = fx.archive("b");
        fx.store.put(&path, "old", b"1", 0o640, true).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(!fx.store.contains(&path, "old").unwrap());

        fx.store.put(&path, "new", b"2", 0o640, true).unwrap();
        assert_eq!(fx.store.keys(&path).unwrap(), vec!["new".to_string()]);
    }

    #[test]
    fn test_handle_cache_bounded() {
        let fx = Fixture::new();
        let store = ArchiveStore::new(
            PathLocks::default(),
            Arc::new(RedbCoordinator::open(fx.dir.path().join("c2.redb")).unwrap()),
            "h1",
            OpenPolicy::default(),
        )
        .with_cached_handles(2);

        for name in ["x", "y", "z"] {
            let path = fx.archive(name);
            store.put(&path, "k", name.as_bytes(), 0o640, true).unwrap();
            assert!(store.handles.len() <= 2);
        }
        for name in ["x", "y", "z"] {
            let read = store.read(&fx.archive(name), "k", true, whole).unwrap();
            assert_eq!(read.body, name.as_bytes());
        }

        let uncached = ArchiveStore::new(
            PathLocks::default(),
            Arc::new(RedbCoordinator::open(fx.dir.path().join("c3.redb")).unwrap()),
            "h1",
            OpenPolicy::default(),
        )
        .with_cached_handles(0);
        // closes the parked handles
        drop(store);
        uncached.put(&fx.archive("x"), "k2", b"2", 0o640, true).unwrap();
        assert_eq!(uncached.handles.len(), 0);
        assert_eq!(uncached.count(&fx.archive("x")).unwrap(), 2);
    }

    #[test]
    fn test_many_writers_wait_their_turn() {
        let fx = Fixture::new();
        let path = fx.archive("q");

        let handles: Vec<_> = (0..16)
            .map(|t| {
                let store = Arc::clone(&fx.store);
                let path = path.clone();
                std::thread::spawn(move || {
                    let key = format!("k{t}");
                    store.put(&path, &key, key.as_bytes(), 0o640, true).map(|_| ())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(fx.store.count(&path).unwrap(), 16);
        assert!(!fx.store.locks().is_held(&path.to_string_lossy()));
    }
}
