//! Path-scoped reader/writer locks.
//!
//! Each path that is currently in use maps to a `tokio::sync::RwLock`.
//! Operations on unrelated paths never contend. A request takes all its
//! locks at once through [`PathLocks::acquire`], which sorts them so two
//! requests can never wait on each other in opposite orders.

use crate::tree::TreePath;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Dead entries are swept once the table grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

/// How a path is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Concurrent with other shared holders.
    Shared,
    /// Excludes every other holder.
    Exclusive,
}

#[derive(Debug)]
enum Guard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Locks held for one request. Released on drop.
#[derive(Debug, Default)]
pub struct LockSet {
    guards: Vec<Guard>,
}

impl LockSet {
    /// Number of distinct paths held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether no path is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// The lock table shared by every session.
#[derive(Debug, Default)]
pub struct PathLocks {
    table: DashMap<TreePath, Weak<RwLock<()>>>,
}

impl PathLocks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &TreePath) -> Arc<RwLock<()>> {
        match self.table.entry(path.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(lock) = occupied.get().upgrade() {
                    return lock;
                }
                let lock = Arc::new(RwLock::new(()));
                occupied.insert(Arc::downgrade(&lock));
                lock
            }
            Entry::Vacant(vacant) => {
                let lock = Arc::new(RwLock::new(()));
                vacant.insert(Arc::downgrade(&lock));
                lock
            }
        }
    }

    /// Acquires every requested lock in a global order.
    ///
    /// A path requested more than once is held once, exclusively if any
    /// request for it was exclusive.
    pub async fn acquire(&self, mut wanted: Vec<(TreePath, LockMode)>) -> LockSet {
        if self.table.len() > SWEEP_THRESHOLD {
            self.sweep();
        }

        // Exclusive sorts after Shared, so the last entry per path wins.
        wanted.sort();
        wanted.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                earlier.1 = earlier.1.max(later.1);
                true
            } else {
                false
            }
        });

        let mut guards = Vec::with_capacity(wanted.len());
        for (path, mode) in wanted {
            let lock = self.lock_for(&path);
            guards.push(match mode {
                LockMode::Shared => Guard::Shared(lock.read_owned().await),
                LockMode::Exclusive => Guard::Exclusive(lock.write_owned().await),
            });
        }
        LockSet { guards }
    }

    /// Drops table entries whose lock is no longer held by anyone.
    pub fn sweep(&self) {
        self.table.retain(|_, lock| lock.strong_count() > 0);
    }

    /// Number of paths currently tracked, live or not yet swept.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.table.len()
    }
}

/// Locks for an operation that reads `path`.
#[must_use]
pub fn read_path(path: &TreePath) -> Vec<(TreePath, LockMode)> {
    vec![(path.clone(), LockMode::Shared)]
}

/// Locks for an operation that modifies the content or attributes of
/// `path` without changing its directory.
#[must_use]
pub fn modify_path(path: &TreePath) -> Vec<(TreePath, LockMode)> {
    vec![(path.clone(), LockMode::Exclusive)]
}

/// Locks for an operation that adds or removes the name `path` in its
/// parent directory.
#[must_use]
pub fn change_entry(path: &TreePath) -> Vec<(TreePath, LockMode)> {
    let mut wanted = vec![(path.clone(), LockMode::Exclusive)];
    if let Some(parent) = path.parent() {
        wanted.push((parent, LockMode::Exclusive));
    }
    wanted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn p(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn shared_holders_coexist() {
        let locks = PathLocks::new();
        let a = locks.acquire(read_path(&p("/f"))).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(read_path(&p("/f"))))
            .await
            .expect("second reader must not block");
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn exclusive_blocks_readers_of_same_path_only() {
        let locks = PathLocks::new();
        let _w = locks.acquire(modify_path(&p("/f"))).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(read_path(&p("/f"))))
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(read_path(&p("/g"))))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn duplicate_paths_are_merged_exclusive() {
        let locks = PathLocks::new();
        let set = locks
            .acquire(vec![
                (p("/a"), LockMode::Shared),
                (p("/a"), LockMode::Exclusive),
                (p("/b"), LockMode::Shared),
            ])
            .await;
        assert_eq!(set.len(), 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), locks.acquire(read_path(&p("/a"))))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn opposite_order_requests_do_not_deadlock() {
        let locks = Arc::new(PathLocks::new());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let locks = Arc::clone(&locks);
            tasks.push(tokio::spawn(async move {
                let wanted = if i % 2 == 0 {
                    vec![(p("/x"), LockMode::Exclusive), (p("/y"), LockMode::Exclusive)]
                } else {
                    vec![(p("/y"), LockMode::Exclusive), (p("/x"), LockMode::Exclusive)]
                };
                let _set = locks.acquire(wanted).await;
                tokio::task::yield_now().await;
            }));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            for t in tasks {
                t.await.unwrap();
            }
        })
        .await
        .expect("lock ordering deadlocked");
    }

    #[tokio::test]
    async fn released_entries_are_swept() {
        let locks = PathLocks::new();
        drop(locks.acquire(change_entry(&p("/d/f"))).await);
        assert_eq!(locks.tracked(), 2);
        locks.sweep();
        assert_eq!(locks.tracked(), 0);
    }

    #[test]
    fn change_entry_includes_parent() {
        let wanted = change_entry(&p("/d/f"));
        assert!(wanted.contains(&(p("/d"), LockMode::Exclusive)));
        assert!(wanted.contains(&(p("/d/f"), LockMode::Exclusive)));
        assert_eq!(change_entry(&TreePath::root()).len(), 1);
    }
}
