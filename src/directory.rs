//! Connection directory: origin → tunnel key and credential.
//!
//! The directory is a single table keyed by [`Origin`]. Each entry carries both
//! the tunnel key and the tunnel password, so "which origins are tunneled" and
//! "which origins have a tunnel credential" are always the same set.
//!
//! Only the [`TunnelManager`](crate::tunnel::TunnelManager) holds a
//! [`ConnectionDirectory`] and may mutate it. Everyone else (the fetch router,
//! UI code) gets a [`DirectoryReader`], which has no mutating methods.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::origin::Origin;

/// A live tunnel as recorded in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    pub key: String,
    /// URL the host reported for the tunnel, path included.
    pub url: String,
    pub password: String,
    pub destination: String,
}

type Table = Arc<RwLock<HashMap<Origin, TunnelEntry>>>;

fn read(table: &Table) -> RwLockReadGuard<'_, HashMap<Origin, TunnelEntry>> {
    // No code path panics while holding the lock, but don't let a poisoned
    // lock take routing down with it.
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(table: &Table) -> RwLockWriteGuard<'_, HashMap<Origin, TunnelEntry>> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}

/// Mutable handle to the directory. Not `Clone`: there is exactly one owner.
#[derive(Debug, Default)]
pub struct ConnectionDirectory {
    table: Table,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tunnel for `origin`, replacing any previous entry for it.
    /// Returns the replaced entry.
    pub fn insert(&self, origin: Origin, entry: TunnelEntry) -> Option<TunnelEntry> {
        write(&self.table).insert(origin, entry)
    }

    /// Remove every origin served by tunnel `key`. Returns the removed
    /// origins, sorted.
    pub fn remove_by_key(&self, key: &str) -> Vec<Origin> {
        let mut table = write(&self.table);
        let mut removed: Vec<Origin> = table
            .iter()
            .filter(|(_, e)| e.key == key)
            .map(|(o, _)| o.clone())
            .collect();
        for origin in &removed {
            table.remove(origin);
        }
        removed.sort();
        removed
    }

    /// A read-only view sharing this directory's table.
    pub fn reader(&self) -> DirectoryReader {
        DirectoryReader {
            table: Arc::clone(&self.table),
        }
    }
}

/// Cheap, cloneable, read-only view of the directory.
#[derive(Debug, Clone)]
pub struct DirectoryReader {
    table: Table,
}

impl DirectoryReader {
    pub fn key_for(&self, origin: &Origin) -> Option<String> {
        read(&self.table).get(origin).map(|e| e.key.clone())
    }

    pub fn password_for(&self, origin: &Origin) -> Option<String> {
        read(&self.table).get(origin).map(|e| e.password.clone())
    }

    pub fn get(&self, origin: &Origin) -> Option<TunnelEntry> {
        read(&self.table).get(origin).cloned()
    }

    /// All entries, sorted by origin.
    pub fn entries(&self) -> Vec<(Origin, TunnelEntry)> {
        let mut entries: Vec<(Origin, TunnelEntry)> = read(&self.table)
            .iter()
            .map(|(o, e)| (o.clone(), e.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        read(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
