//! Per-file advisory write locks keyed by client identity.
//!
//! ```text
//!             acquire(c)                release(c)
//!  (absent) ─────────────► Owned(c) ─────────────► Unowned
//!     ▲                      │  ▲                    │
//!     │      delete(c)       │  └────── acquire(c') ─┘
//!     └──────────────────────┘
//! ```
//!
//! Every operation runs inside one process-wide critical section. The table
//! is not sharded: operations are O(1) map lookups with no I/O, and a single
//! serialization point rules out ordering bugs between files.
//!
//! Acquisition never waits. A denied caller gets `false` back immediately and
//! retries later on its own schedule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::ClientId;

/// One row of the table. A row with `owner == None` is present but unowned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub owner: Option<ClientId>,
}

/// Counters for monitoring lock traffic.
#[derive(Debug, Clone, Default)]
pub struct LockStats {
    pub granted: u64,
    pub denied: u64,
    pub released: u64,
    pub deleted: u64,
    pub entries: usize,
}

#[derive(Default)]
struct AtomicLockStats {
    granted: AtomicU64,
    denied: AtomicU64,
    released: AtomicU64,
    deleted: AtomicU64,
}

/// In-memory lock table. Shared between handlers behind an `Arc`.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
    stats: AtomicLockStats,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the write lock on `file` for `client`.
    ///
    /// Creates the row on first use. Re-acquiring a lock already held by the
    /// same client succeeds.
    pub fn acquire(&self, file: &str, client: &ClientId) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(file.to_string())
            .or_insert(LockEntry { owner: None });

        let granted = match &entry.owner {
            None => {
                entry.owner = Some(client.clone());
                true
            }
            Some(owner) => owner == client,
        };
        drop(entries);

        if granted {
            self.stats.granted.fetch_add(1, Ordering::Relaxed);
            log::debug!("Lock on {file} granted to {client}");
        } else {
            self.stats.denied.fetch_add(1, Ordering::Relaxed);
            log::debug!("Lock on {file} denied to {client}");
        }
        granted
    }

    /// Clear ownership of `file`. Only the owner may release; the row stays.
    pub fn release(&self, file: &str, client: &ClientId) -> bool {
        let mut entries = self.entries.lock();
        Self::release_locked(&mut entries, file, client) && self.count_release()
    }

    /// Remove the row for `file`. Only the owner may delete it.
    pub fn delete(&self, file: &str, client: &ClientId) -> bool {
        let mut entries = self.entries.lock();
        Self::delete_locked(&mut entries, file, client) && self.count_delete()
    }

    /// Release the lock if the file is still on disk, delete the row otherwise.
    ///
    /// The ownership check and the release/delete happen under one hold of the
    /// critical section, so no acquire can slip in between.
    pub fn release_or_delete(&self, file: &str, client: &ClientId, file_exists: bool) -> bool {
        let mut entries = self.entries.lock();
        if !Self::owned_by(&entries, file, client) {
            log::warn!("{client} tried to release {file} without owning it");
            return false;
        }
        if file_exists {
            Self::release_locked(&mut entries, file, client) && self.count_release()
        } else {
            Self::delete_locked(&mut entries, file, client) && self.count_delete()
        }
    }

    pub fn is_owner(&self, file: &str, client: &ClientId) -> bool {
        Self::owned_by(&self.entries.lock(), file, client)
    }

    /// Current owner of `file`, `None` when unowned or never locked.
    pub fn owner_of(&self, file: &str) -> Option<ClientId> {
        self.entries.lock().get(file).and_then(|e| e.owner.clone())
    }

    /// Whether a row exists for `file`, owned or not.
    pub fn contains(&self, file: &str) -> bool {
        self.entries.lock().contains_key(file)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            granted: self.stats.granted.load(Ordering::Relaxed),
            denied: self.stats.denied.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            deleted: self.stats.deleted.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn owned_by(entries: &HashMap<String, LockEntry>, file: &str, client: &ClientId) -> bool {
        entries
            .get(file)
            .is_some_and(|e| e.owner.as_ref() == Some(client))
    }

    fn release_locked(
        entries: &mut HashMap<String, LockEntry>,
        file: &str,
        client: &ClientId,
    ) -> bool {
        match entries.get_mut(file) {
            Some(entry) if entry.owner.as_ref() == Some(client) => {
                entry.owner = None;
                log::debug!("Lock on {file} released by {client}");
                true
            }
            Some(entry) => {
                log::warn!(
                    "Lock on {file} not released: {client} is not the owner ({:?})",
                    entry.owner
                );
                false
            }
            None => {
                log::warn!("Lock on {file} not released: no such lock");
                false
            }
        }
    }

    fn delete_locked(
        entries: &mut HashMap<String, LockEntry>,
        file: &str,
        client: &ClientId,
    ) -> bool {
        if Self::owned_by(entries, file, client) {
            entries.remove(file);
            log::debug!("Lock on {file} deleted by {client}");
            true
        } else {
            log::warn!("Lock on {file} not deleted: {client} is not the owner");
            false
        }
    }

    fn count_release(&self) -> bool {
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn count_delete(&self) -> bool {
        self.stats.deleted.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids() -> (ClientId, ClientId) {
        (ClientId::new("alice"), ClientId::new("bob"))
    }

    #[test]
    fn test_acquire_creates_entry() {
        let table = LockTable::new();
        let (alice, _) = ids();
        assert!(!table.contains("a.txt"));
        assert!(table.acquire("a.txt", &alice));
        assert!(table.is_owner("a.txt", &alice));
        assert_eq!(table.owner_of("a.txt"), Some(alice));
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let table = LockTable::new();
        let (alice, _) = ids();
        assert!(table.acquire("a.txt", &alice));
        assert!(table.acquire("a.txt", &alice));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_second_client_denied() {
        let table = LockTable::new();
        let (alice, bob) = ids();
        assert!(table.acquire("a.txt", &alice));
        assert!(!table.acquire("a.txt", &bob));
        assert_eq!(table.owner_of("a.txt"), Some(alice));
        let stats = table.stats();
        assert_eq!(stats.granted, 1);
        assert_eq!(stats.denied, 1);
    }

    #[test]
    fn test_release_keeps_row() {
        let table = LockTable::new();
        let (alice, bob) = ids();
        table.acquire("a.txt", &alice);
        assert!(table.release("a.txt", &alice));
        assert!(table.contains("a.txt"));
        assert_eq!(table.owner_of("a.txt"), None);
        // Unowned row can be picked up by anyone
        assert!(table.acquire("a.txt", &bob));
    }

    #[test]
    fn test_release_twice_fails_second_time() {
        let table = LockTable::new();
        let (alice, _) = ids();
        table.acquire("a.txt", &alice);
        assert!(table.release("a.txt", &alice));
        assert!(!table.release("a.txt", &alice));
        assert!(table.contains("a.txt"));
        assert_eq!(table.owner_of("a.txt"), None);
    }

    #[test]
    fn test_non_owner_cannot_release_or_delete() {
        let table = LockTable::new();
        let (alice, bob) = ids();
        table.acquire("a.txt", &alice);
        assert!(!table.release("a.txt", &bob));
        assert!(!table.delete("a.txt", &bob));
        assert!(!table.release_or_delete("a.txt", &bob, true));
        assert!(!table.release_or_delete("a.txt", &bob, false));
        assert_eq!(table.owner_of("a.txt"), Some(alice));
    }

    #[test]
    fn test_release_missing_lock_fails() {
        let table = LockTable::new();
        let (alice, _) = ids();
        assert!(!table.release("nothing", &alice));
        assert!(!table.delete("nothing", &alice));
        assert!(table.is_empty());
    }

    #[test]
    fn test_delete_removes_row() {
        let table = LockTable::new();
        let (alice, _) = ids();
        table.acquire("a.txt", &alice);
        assert!(table.delete("a.txt", &alice));
        assert!(!table.contains("a.txt"));
        assert_eq!(table.stats().deleted, 1);
    }

    #[test]
    fn test_release_or_delete_follows_file_presence() {
        let table = LockTable::new();
        let (alice, _) = ids();
        table.acquire("kept", &alice);
        table.acquire("gone", &alice);
        assert!(table.release_or_delete("kept", &alice, true));
        assert!(table.release_or_delete("gone", &alice, false));
        assert!(table.contains("kept"));
        assert!(!table.contains("gone"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let table = Arc::new(LockTable::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || table.acquire("race.txt", &ClientId::new(format!("c{i}"))))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(table.owner_of("race.txt").is_some());
    }

    #[test]
    fn test_locks_are_per_file() {
        let table = LockTable::new();
        let (alice, bob) = ids();
        assert!(table.acquire("a.txt", &alice));
        assert!(table.acquire("b.txt", &bob));
        assert!(!table.is_owner("a.txt", &bob));
        assert!(!table.is_owner("b.txt", &alice));
    }
}
