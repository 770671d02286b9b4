//! The per-file state machine: `spec.md` §4.2.
//!
//! Backed by a [`dashmap::DashMap`] rather than a single `Mutex<HashMap>` so
//! that unrelated files don't contend on the same lock; the admission
//! operations still rely on `DashMap`'s per-key atomic `entry` API so that
//! the existence check and the insert happen under one lock acquisition, as
//! `spec.md` requires.

use dashmap::DashMap;
use thiserror::Error;

/// Lifecycle state of a file-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
}

/// One file's index entry.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub size: u64,
    pub replicas: Vec<u16>,
    pub status: FileStatus,
}

/// Errors from admission operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    #[error("file already exists")]
    AlreadyExists,
    #[error("file does not exist")]
    DoesNotExist,
}

/// The controller's file index.
#[derive(Debug, Default)]
pub struct FileIndex {
    entries: DashMap<String, FileEntry>,
}

impl FileIndex {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Admits a new `STORE`: rejects if an entry exists in any state.
    pub fn admit_store(&self, name: &str, size: u64, replicas: Vec<u16>) -> Result<(), IndexError> {
        match self.entries.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(IndexError::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(FileEntry { size, replicas, status: FileStatus::StoreInProgress });
                Ok(())
            }
        }
    }

    /// Transitions `STORE_IN_PROGRESS -> STORE_COMPLETE`. No-op if absent.
    pub fn mark_store_complete(&self, name: &str) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.status = FileStatus::StoreComplete;
        }
    }

    /// Admits a `REMOVE`: rejects unless the entry is visible
    /// (`STORE_COMPLETE`).
    pub fn admit_remove(&self, name: &str) -> Result<(), IndexError> {
        match self.entries.get_mut(name) {
            Some(mut entry) if entry.status == FileStatus::StoreComplete => {
                entry.status = FileStatus::RemoveInProgress;
                Ok(())
            }
            _ => Err(IndexError::DoesNotExist),
        }
    }

    /// Unconditionally deletes an entry.
    pub fn drop_entry(&self, name: &str) {
        self.entries.remove(name);
    }

    /// Returns a clone of the entry, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<FileEntry> {
        self.entries.get(name).map(|e| e.clone())
    }

    /// Names of all entries visible to `LIST`/`LOAD`/`REMOVE`
    /// (`STORE_COMPLETE` only).
    #[must_use]
    pub fn snapshot_visible(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == FileStatus::StoreComplete)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Names of entries currently in `REMOVE_IN_PROGRESS`, used by rebalance
    /// to reconcile nodes that still report them.
    #[must_use]
    pub fn snapshot_removing(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == FileStatus::RemoveInProgress)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Strips `port` from every entry's replica set (node eviction).
    pub fn scrub(&self, port: u16) {
        for mut entry in self.entries.iter_mut() {
            entry.replicas.retain(|&p| p != port);
        }
    }

    /// Overwrites an entry's replica set (rebalance commit).
    pub fn set_replicas(&self, name: &str, replicas: Vec<u16>) {
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.replicas = replicas;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn admits_new_file() {
        let idx = FileIndex::new();
        assert!(idx.admit_store("a.txt", 5, vec![4001, 4002]).is_ok());
        let entry = idx.get("a.txt").expect("entry");
        assert_eq!(entry.size, 5);
        assert_eq!(entry.status, FileStatus::StoreInProgress);
    }

    #[test]
    fn rejects_duplicate_store_regardless_of_status() {
        let idx = FileIndex::new();
        idx.admit_store("a.txt", 5, vec![4001]).unwrap();
        assert_eq!(idx.admit_store("a.txt", 9, vec![4002]), Err(IndexError::AlreadyExists));

        idx.mark_store_complete("a.txt");
        assert_eq!(idx.admit_store("a.txt", 9, vec![4002]), Err(IndexError::AlreadyExists));
    }

    #[test]
    fn visible_only_after_store_complete() {
        let idx = FileIndex::new();
        idx.admit_store("a.txt", 5, vec![4001]).unwrap();
        assert!(idx.snapshot_visible().is_empty());
        idx.mark_store_complete("a.txt");
        assert_eq!(idx.snapshot_visible(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn remove_rejects_in_progress_or_absent_file() {
        let idx = FileIndex::new();
        assert_eq!(idx.admit_remove("missing.txt"), Err(IndexError::DoesNotExist));

        idx.admit_store("a.txt", 5, vec![4001]).unwrap();
        assert_eq!(idx.admit_remove("a.txt"), Err(IndexError::DoesNotExist));
    }

    #[test]
    fn remove_succeeds_once_complete_then_can_be_restored() {
        let idx = FileIndex::new();
        idx.admit_store("a.txt", 5, vec![4001]).unwrap();
        idx.mark_store_complete("a.txt");
        assert!(idx.admit_remove("a.txt").is_ok());
        assert!(idx.snapshot_visible().is_empty());

        idx.drop_entry("a.txt");
        assert!(idx.admit_store("a.txt", 5, vec![4001]).is_ok());
    }

    #[test]
    fn scrub_removes_port_from_all_replica_sets() {
        let idx = FileIndex::new();
        idx.admit_store("a.txt", 5, vec![4001, 4002]).unwrap();
        idx.admit_store("b.txt", 5, vec![4002, 4003]).unwrap();
        idx.scrub(4002);
        assert_eq!(idx.get("a.txt").unwrap().replicas, vec![4001]);
        assert_eq!(idx.get("b.txt").unwrap().replicas, vec![4003]);
    }
}
