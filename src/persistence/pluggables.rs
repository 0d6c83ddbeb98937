/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable persistence of Raft, branch history, and table participation state.
//!
//! The library user provides a key-value store by implementing [`KVStore`]. All the typed reads this
//! crate needs are provided methods of [`KVGet`], built on top of the one required method,
//! [`get`](KVGet::get). All writes go through [`WriteBatch`]es, which the store must apply atomically.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
};

use borsh::BorshDeserialize;

use crate::{
    multi_table_manager::types::TablePersistentState,
    raft::types::{RaftHardState, RaftLogEntry, RaftSnapshot},
    types::{
        branch::{BranchBirthCertificate, BranchId},
        data_types::{LogIndex, TableId},
    },
};

use super::variables::{self, branch_key, raft_log_entry_key, table_key};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    /// Atomically apply all the sets and deletes in `wb`.
    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Table participation ↓↓↓ */

    fn table_ids(&self) -> Result<BTreeSet<TableId>, KVGetError> {
        Ok(deserialize_at(self, &variables::TABLE_IDS, Key::TableIds)?.unwrap_or_default())
    }

    fn table_persistent_state(
        &self,
        table: &TableId,
    ) -> Result<Option<TablePersistentState>, KVGetError> {
        deserialize_at(
            self,
            &table_key(&variables::TABLE_PERSISTENT_STATE, table),
            Key::TablePersistentState { table: *table },
        )
    }

    /* ↓↓↓ Raft ↓↓↓ */

    fn raft_hard_state(&self, table: &TableId) -> Result<Option<RaftHardState>, KVGetError> {
        deserialize_at(
            self,
            &table_key(&variables::RAFT_HARD_STATE, table),
            Key::RaftHardState { table: *table },
        )
    }

    fn raft_snapshot(&self, table: &TableId) -> Result<Option<RaftSnapshot>, KVGetError> {
        deserialize_at(
            self,
            &table_key(&variables::RAFT_SNAPSHOT, table),
            Key::RaftSnapshot { table: *table },
        )
    }

    fn raft_log_last_index(&self, table: &TableId) -> Result<Option<LogIndex>, KVGetError> {
        deserialize_at(
            self,
            &table_key(&variables::RAFT_LOG_LAST_INDEX, table),
            Key::RaftLogLastIndex { table: *table },
        )
    }

    /// Get the log entry at `index`, which must exist.
    fn raft_log_entry(&self, table: &TableId, index: &LogIndex) -> Result<RaftLogEntry, KVGetError> {
        let key = Key::RaftLogEntry {
            table: *table,
            index: *index,
        };
        deserialize_at(self, &raft_log_entry_key(table, index), key.clone())?
            .ok_or(KVGetError::ValueExpectedButNotFound { key })
    }

    /* ↓↓↓ Branch history ↓↓↓ */

    fn branch_ids(&self, table: &TableId) -> Result<BTreeSet<BranchId>, KVGetError> {
        Ok(deserialize_at(
            self,
            &table_key(&variables::BRANCH_IDS, table),
            Key::BranchIds { table: *table },
        )?
        .unwrap_or_default())
    }

    fn branch(
        &self,
        table: &TableId,
        branch: &BranchId,
    ) -> Result<Option<BranchBirthCertificate>, KVGetError> {
        deserialize_at(
            self,
            &branch_key(table, branch),
            Key::Branch {
                table: *table,
                branch: *branch,
            },
        )
    }
}

/// Get the value at `key_bytes` and deserialize it, reporting failures against `key`.
fn deserialize_at<G: KVGet + ?Sized, T: BorshDeserialize>(
    kv_get: &G,
    key_bytes: &[u8],
    key: Key,
) -> Result<Option<T>, KVGetError> {
    match kv_get.get(key_bytes) {
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|err| KVGetError::DeserializeValueError { key, source: err }),
        None => Ok(None),
    }
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
/// The error may arise in the following circumstances:
/// 1. The value corresponding to a given key cannot be deserialized into its expected type,
/// 2. The value corresponding to a given key cannot be found.
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
    ValueExpectedButNotFound { key: Key },
}

impl Display for KVGetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KVGetError::DeserializeValueError { key, source } => {
                write!(f, "failed to deserialize {}: {}", key, source)
            }
            KVGetError::ValueExpectedButNotFound { key } => write!(f, "{} not found", key),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Key {
    TableIds,
    TablePersistentState { table: TableId },
    RaftHardState { table: TableId },
    RaftSnapshot { table: TableId },
    RaftLogLastIndex { table: TableId },
    RaftLogEntry { table: TableId, index: LogIndex },
    BranchIds { table: TableId },
    Branch { table: TableId, branch: BranchId },
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::TableIds => write!(f, "Table Ids"),
            Key::TablePersistentState { table } => {
                write!(f, "Table Persistent State for table {}", table)
            }
            Key::RaftHardState { table } => write!(f, "Raft Hard State for table {}", table),
            Key::RaftSnapshot { table } => write!(f, "Raft Snapshot for table {}", table),
            Key::RaftLogLastIndex { table } => {
                write!(f, "Raft Log Last Index for table {}", table)
            }
            Key::RaftLogEntry { table, index } => {
                write!(f, "Raft Log Entry {} for table {}", index, table)
            }
            Key::BranchIds { table } => write!(f, "Branch Ids for table {}", table),
            Key::Branch { table, branch } => {
                write!(f, "Branch {} for table {}", branch, table)
            }
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}
