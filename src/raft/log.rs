/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The persisted Raft log of one table: a [snapshot](RaftSnapshot) of a compacted prefix, followed by
//! the entries after it.
//!
//! Every mutation is written to the [`KVStore`] in one atomic write batch before the in-memory copy is
//! updated, so a member that crashes restarts with the log it last acknowledged.

use std::fmt::{self, Display, Formatter};

use crate::{
    persistence::{
        pluggables::{KVGet, KVGetError, KVStore},
        write_batch::{KVSetError, PersistenceWriteBatch},
        PersistenceError,
    },
    types::data_types::{LogIndex, TableId, Term},
};

use super::types::{RaftLogEntry, RaftSnapshot};

pub(crate) struct RaftLog<K: KVStore> {
    kv_store: K,
    table: TableId,
    snapshot: RaftSnapshot,

    // `entries[i].index == snapshot.last_index + 1 + i`.
    entries: Vec<RaftLogEntry>,
}

impl<K: KVStore> RaftLog<K> {
    /// Start a new log that begins with `snapshot`, replacing whatever log `table` had.
    pub(crate) fn initialize(
        kv_store: K,
        table: TableId,
        snapshot: RaftSnapshot,
    ) -> Result<RaftLog<K>, RaftError> {
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        delete_entries(&kv_store, &table, &mut wb)?;
        wb.set_raft_snapshot(&table, &snapshot)?;
        wb.set_raft_log_last_index(&table, &snapshot.last_index)?;
        kv_store.clone().write(wb.into_inner());

        Ok(RaftLog {
            kv_store,
            table,
            snapshot,
            entries: Vec::new(),
        })
    }

    /// Load the persisted log of `table`. Returns `None` if `table` has no log.
    pub(crate) fn load(kv_store: K, table: TableId) -> Result<Option<RaftLog<K>>, RaftError> {
        let snapshot = match kv_store.raft_snapshot(&table)? {
            Some(snapshot) => snapshot,
            None => return Ok(None),
        };
        let last_index = kv_store
            .raft_log_last_index(&table)?
            .unwrap_or(snapshot.last_index);

        let mut entries = Vec::new();
        let mut index = snapshot.last_index + 1;
        while index <= last_index {
            entries.push(kv_store.raft_log_entry(&table, &index)?);
            index += 1;
        }

        Ok(Some(RaftLog {
            kv_store,
            table,
            snapshot,
            entries,
        }))
    }

    /// Delete the whole persisted log of `table`, including its hard state.
    pub(crate) fn delete(kv_store: &K, table: &TableId) -> Result<(), RaftError> {
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        delete_entries(kv_store, table, &mut wb)?;
        wb.delete_raft_state(table);
        kv_store.clone().write(wb.into_inner());
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> &RaftSnapshot {
        &self.snapshot
    }

    pub(crate) fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map_or(self.snapshot.last_index, |entry| entry.index)
    }

    pub(crate) fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.snapshot.last_term, |entry| entry.term)
    }

    /// Get the term of the entry at `index`. `None` if the entry is compacted (other than the last
    /// compacted entry) or does not exist yet.
    pub(crate) fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot.last_index {
            Some(self.snapshot.last_term)
        } else {
            self.entry(index).map(|entry| entry.term)
        }
    }

    pub(crate) fn entry(&self, index: LogIndex) -> Option<&RaftLogEntry> {
        if index <= self.snapshot.last_index {
            return None;
        }
        self.entries
            .get((index - self.snapshot.last_index - 1) as usize)
    }

    /// Get up to `max` entries, starting at `index`.
    pub(crate) fn entries_from(&self, index: LogIndex, max: usize) -> Vec<RaftLogEntry> {
        if index <= self.snapshot.last_index {
            return Vec::new();
        }
        let start = (index - self.snapshot.last_index - 1) as usize;
        self.entries
            .iter()
            .skip(start)
            .take(max)
            .cloned()
            .collect()
    }

    /// Iterate over the entries after `index`.
    pub(crate) fn entries_after(&self, index: LogIndex) -> impl Iterator<Item = &RaftLogEntry> {
        self.entries.iter().filter(move |entry| entry.index > index)
    }

    /// Append `entries`, which must directly follow the last entry.
    pub(crate) fn append(&mut self, entries: Vec<RaftLogEntry>) -> Result<(), RaftError> {
        let last = match entries.last() {
            Some(last) => last.index,
            None => return Ok(()),
        };

        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        for entry in &entries {
            wb.set_raft_log_entry(&self.table, entry)?;
        }
        wb.set_raft_log_last_index(&self.table, &last)?;
        self.kv_store.write(wb.into_inner());

        self.entries.extend(entries);
        Ok(())
    }

    /// Delete the entry at `index` and every entry after it. Entries at or before the snapshot are never
    /// deleted.
    pub(crate) fn truncate_from(&mut self, index: LogIndex) -> Result<(), RaftError> {
        let index = std::cmp::max(index, self.snapshot.last_index + 1);
        let last_index = self.last_index();
        if index > last_index {
            return Ok(());
        }

        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        let mut deleted = index;
        while deleted <= last_index {
            wb.delete_raft_log_entry(&self.table, &deleted);
            deleted += 1;
        }
        let new_last_index = LogIndex::new(index.int() - 1);
        wb.set_raft_log_last_index(&self.table, &new_last_index)?;
        self.kv_store.write(wb.into_inner());

        self.entries.retain(|entry| entry.index < index);
        Ok(())
    }

    /// Replace the prefix of the log up to and including `snapshot.last_index` with `snapshot`.
    /// `snapshot.last_index` must not be past the last entry.
    pub(crate) fn compact(&mut self, snapshot: RaftSnapshot) -> Result<(), RaftError> {
        if snapshot.last_index <= self.snapshot.last_index || snapshot.last_index > self.last_index() {
            return Ok(());
        }

        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        for entry in self.entries.iter().filter(|entry| entry.index <= snapshot.last_index) {
            wb.delete_raft_log_entry(&self.table, &entry.index);
        }
        wb.set_raft_snapshot(&self.table, &snapshot)?;
        self.kv_store.write(wb.into_inner());

        self.entries
            .retain(|entry| entry.index > snapshot.last_index);
        self.snapshot = snapshot;
        Ok(())
    }

    /// Replace the log with a snapshot received from the leader.
    ///
    /// If the log contains the snapshot's last entry, the entries after it are kept. Otherwise the whole
    /// log is discarded.
    pub(crate) fn install_snapshot(&mut self, snapshot: RaftSnapshot) -> Result<(), RaftError> {
        if self.term_at(snapshot.last_index) == Some(snapshot.last_term) {
            return self.compact(snapshot);
        }

        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        for entry in &self.entries {
            wb.delete_raft_log_entry(&self.table, &entry.index);
        }
        wb.set_raft_snapshot(&self.table, &snapshot)?;
        wb.set_raft_log_last_index(&self.table, &snapshot.last_index)?;
        self.kv_store.write(wb.into_inner());

        self.entries.clear();
        self.snapshot = snapshot;
        Ok(())
    }
}

fn delete_entries<K: KVStore>(
    kv_store: &K,
    table: &TableId,
    wb: &mut PersistenceWriteBatch<K::WriteBatch>,
) -> Result<(), RaftError> {
    let first_index = match kv_store.raft_snapshot(table)? {
        Some(snapshot) => snapshot.last_index + 1,
        None => return Ok(()),
    };
    if let Some(last_index) = kv_store.raft_log_last_index(table)? {
        let mut index = first_index;
        while index <= last_index {
            wb.delete_raft_log_entry(table, &index);
            index += 1;
        }
    }
    Ok(())
}

/// Errors that the Raft layer may encounter.
#[derive(Debug)]
pub enum RaftError {
    PersistenceError(PersistenceError),
}

impl Display for RaftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RaftError::PersistenceError(err) => write!(f, "persistence error: {:?}", err),
        }
    }
}

impl From<KVGetError> for RaftError {
    fn from(value: KVGetError) -> Self {
        RaftError::PersistenceError(PersistenceError::KVGetError(value))
    }
}

impl From<KVSetError> for RaftError {
    fn from(value: KVSetError) -> Self {
        RaftError::PersistenceError(PersistenceError::KVSetError(value))
    }
}
