//! The controller's per-file state machine.
//!
//! Every entry moves through a small lifecycle: created as
//! `StoreInProgress` when a store is admitted, promoted to `StoreComplete`
//! once all replicas acknowledge, flagged `RemoveInProgress` when a remove
//! is admitted, and deleted on completion or timeout cleanup. Only
//! `StoreComplete` entries are visible to list, load, and remove.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    StoreInProgress,
    StoreComplete,
    RemoveInProgress,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub size: u64,
    pub replicas: Vec<u16>,
    pub status: Status,
}

/// Why an admission was rejected. Maps directly onto the error replies a
/// client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    AlreadyExists,
    DoesNotExist,
}

#[derive(Debug, Default)]
pub struct FileIndex {
    files: BTreeMap<String, FileEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a store, atomically with the existence check: an entry in any
    /// state blocks a new store of the same name.
    pub fn admit_store(&mut self, name: &str, size: u64) -> Result<(), AdmitError> {
        if self.files.contains_key(name) {
            return Err(AdmitError::AlreadyExists);
        }
        self.files.insert(
            name.to_string(),
            FileEntry {
                size,
                replicas: Vec::new(),
                status: Status::StoreInProgress,
            },
        );
        Ok(())
    }

    pub fn set_replicas(&mut self, name: &str, replicas: &[u16]) {
        if let Some(entry) = self.files.get_mut(name) {
            entry.replicas = replicas.to_vec();
        }
    }

    /// Promotes an in-progress store; a no-op for absent entries or entries
    /// in any other state.
    pub fn mark_store_complete(&mut self, name: &str) {
        if let Some(entry) = self.files.get_mut(name) {
            if entry.status == Status::StoreInProgress {
                entry.status = Status::StoreComplete;
            }
        }
    }

    /// Admits a remove and returns the replica set to contact. Rejects
    /// entries that are absent or not yet visible.
    pub fn admit_remove(&mut self, name: &str) -> Result<Vec<u16>, AdmitError> {
        match self.files.get_mut(name) {
            Some(entry) if entry.status == Status::StoreComplete => {
                entry.status = Status::RemoveInProgress;
                Ok(entry.replicas.clone())
            }
            _ => Err(AdmitError::DoesNotExist),
        }
    }

    pub fn drop_entry(&mut self, name: &str) {
        self.files.remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Size and replica set of a visible file.
    pub fn visible(&self, name: &str) -> Option<(u64, Vec<u16>)> {
        self.files
            .get(name)
            .filter(|entry| entry.status == Status::StoreComplete)
            .map(|entry| (entry.size, entry.replicas.clone()))
    }

    pub fn snapshot_visible(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, entry)| entry.status == Status::StoreComplete)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn visible_len(&self) -> usize {
        self.files
            .values()
            .filter(|entry| entry.status == Status::StoreComplete)
            .count()
    }

    /// Every known file name, regardless of state.
    pub fn known_names(&self) -> BTreeSet<String> {
        self.files.keys().cloned().collect()
    }

    /// Names whose remove is still awaiting reconciliation.
    pub fn removing_names(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .filter(|(_, entry)| entry.status == Status::RemoveInProgress)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Strips a departed node from every replica set.
    pub fn scrub_node(&mut self, port: u16) {
        for entry in self.files.values_mut() {
            entry.replicas.retain(|p| *p != port);
        }
    }

    #[cfg(test)]
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }
}
