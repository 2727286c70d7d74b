//! Process-wide path locks.
//!
//! Every mutation of a path (standalone file or archive) and every archive
//! open happens under the lock for that path. Waiters queue per path and are
//! granted the lock in arrival order, whether they wait on a thread or in a
//! task. A waiter gives up once `try_times × sleep` has passed; the lock is
//! released when the returned [`PathGuard`] drops.

use crate::error::{StoreError, StoreResult};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Wait budget for acquiring a path lock
#[derive(Clone, Copy, Debug)]
pub struct LockPolicy {
    /// Number of `sleep` periods a waiter may spend queued
    pub try_times: u32,
    pub sleep: Duration,
}

impl LockPolicy {
    /// Longest time a waiter stays queued
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.sleep.saturating_mul(self.try_times)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            try_times: 1000,
            sleep: Duration::from_millis(10),
        }
    }
}

impl From<&packstore_common::config::LockConfig> for LockPolicy {
    fn from(cfg: &packstore_common::config::LockConfig) -> Self {
        Self {
            try_times: cfg.try_times,
            sleep: cfg.sleep(),
        }
    }
}

/// Holder flag and FIFO of waiting tickets for one path
#[derive(Debug, Default)]
struct Queue {
    held: bool,
    waiting: VecDeque<u64>,
    next_ticket: u64,
}

impl Queue {
    /// Take the lock if nobody holds it or waits for it
    fn take_if_idle(&mut self) -> bool {
        if self.held || !self.waiting.is_empty() {
            return false;
        }
        self.held = true;
        true
    }

    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiting.push_back(ticket);
        ticket
    }

    /// Take the lock if it is free and `ticket` is first in line
    fn take_turn(&mut self, ticket: u64) -> bool {
        if self.held || self.waiting.front() != Some(&ticket) {
            return false;
        }
        self.waiting.pop_front();
        self.held = true;
        true
    }

    fn abandon(&mut self, ticket: u64) {
        self.waiting.retain(|t| *t != ticket);
    }
}

#[derive(Debug, Default)]
struct PathEntry {
    queue: Mutex<Queue>,
    /// Wakes waiting threads
    ready: Condvar,
    /// Wakes waiting tasks
    released: Notify,
    /// Holders and waiters referencing this entry
    users: AtomicUsize,
}

impl PathEntry {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.ready.notify_all();
        self.released.notify_waiters();
    }
}

type Entries = Arc<DashMap<String, Arc<PathEntry>>>;

/// Per-path exclusive locks with fair, bounded waiting
#[derive(Clone, Debug, Default)]
pub struct PathLocks {
    entries: Entries,
    policy: LockPolicy,
}

impl PathLocks {
    #[must_use]
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Single non-blocking attempt. Fails while others are queued.
    #[must_use]
    pub fn try_acquire(&self, path: &str) -> Option<PathGuard> {
        let waiter = self.waiter(path);
        let granted = waiter.entry.queue().take_if_idle();
        granted.then(|| waiter.into_guard())
    }

    /// Acquire from a blocking context, parking the thread until the lock is
    /// handed over or the budget runs out
    pub fn acquire(&self, path: &str) -> StoreResult<PathGuard> {
        let deadline = Instant::now() + self.policy.budget();
        let mut waiter = self.waiter(path);
        let entry = Arc::clone(&waiter.entry);
        let mut queue = entry.queue();
        loop {
            if waiter.try_take(&mut queue) {
                drop(queue);
                return Ok(waiter.into_guard());
            }
            let now = Instant::now();
            if now >= deadline {
                drop(queue);
                return Err(self.timeout(path));
            }
            trace!("Waiting for lock on {}", path);
            queue = entry
                .ready
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Acquire from async code without blocking the runtime
    pub async fn acquire_async(&self, path: &str) -> StoreResult<PathGuard> {
        let deadline = tokio::time::Instant::now() + self.policy.budget();
        let mut waiter = self.waiter(path);
        let entry = Arc::clone(&waiter.entry);
        loop {
            let released = entry.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let granted = waiter.try_take(&mut entry.queue());
            if granted {
                return Ok(waiter.into_guard());
            }
            trace!("Waiting for lock on {}", path);
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(self.timeout(path));
            }
        }
    }

    /// Whether `path` is currently locked
    #[must_use]
    pub fn is_held(&self, path: &str) -> bool {
        self.entries
            .get(path)
            .is_some_and(|entry| {
                let queue = entry.queue();
                queue.held
            })
    }

    /// Register interest in `path`. The user count is raised while the map
    /// shard is locked so a concurrent release cannot drop the entry.
    fn waiter(&self, path: &str) -> Waiter {
        let entry = {
            let slot = self.entries.entry(path.to_string()).or_default();
            slot.users.fetch_add(1, Ordering::SeqCst);
            Arc::clone(slot.value())
        };
        Waiter {
            entries: Arc::clone(&self.entries),
            path: path.to_string(),
            entry,
            ticket: None,
            granted: false,
        }
    }

    fn timeout(&self, path: &str) -> StoreError {
        trace!("Gave up on lock for {} after {:?}", path, self.policy.budget());
        StoreError::LockTimeout {
            path: path.to_string(),
        }
    }
}

/// Drop one user of `entry`, removing it from the map once nobody refers to it
fn leave(entries: &Entries, path: &str, entry: &PathEntry) {
    if entry.users.fetch_sub(1, Ordering::SeqCst) == 1 {
        entries.remove_if(path, |_, e| e.users.load(Ordering::SeqCst) == 0);
    }
}

/// A caller waiting for a path. Dropping it before the lock is granted
/// leaves the queue, so cancelled tasks do not block the line.
struct Waiter {
    entries: Entries,
    path: String,
    entry: Arc<PathEntry>,
    ticket: Option<u64>,
    granted: bool,
}

impl Waiter {
    fn try_take(&mut self, queue: &mut Queue) -> bool {
        let granted = match self.ticket {
            Some(ticket) => queue.take_turn(ticket),
            None if queue.take_if_idle() => true,
            None => {
                self.ticket = Some(queue.enqueue());
                false
            }
        };
        if granted {
            self.ticket = None;
        }
        granted
    }

    fn into_guard(mut self) -> PathGuard {
        self.granted = true;
        PathGuard {
            entries: Arc::clone(&self.entries),
            path: self.path.clone(),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        if let Some(ticket) = self.ticket.take() {
            self.entry.queue().abandon(ticket);
            // the next in line may now be first
            self.entry.wake();
        }
        leave(&self.entries, &self.path, &self.entry);
    }
}

/// Held lock on one path, released on drop
pub struct PathGuard {
    entries: Entries,
    path: String,
    entry: Arc<PathEntry>,
}

impl std::fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathGuard").field("path", &self.path).finish()
    }
}

impl PathGuard {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.entry.queue().held = false;
        self.entry.wake();
        leave(&self.entries, &self.path, &self.entry);
    }
}
