/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed wrapper around a user-provided [`WriteBatch`].

use std::collections::BTreeSet;

use borsh::BorshSerialize;

use crate::{
    multi_table_manager::types::TablePersistentState,
    raft::types::{RaftHardState, RaftLogEntry, RaftSnapshot},
    types::{
        branch::{BranchBirthCertificate, BranchId},
        data_types::{LogIndex, TableId},
    },
};

use super::{
    pluggables::{Key, WriteBatch},
    variables::{self, branch_key, raft_log_entry_key, table_key},
};

/// A write batch that can only set and delete the variables listed in [`variables`].
pub struct PersistenceWriteBatch<W: WriteBatch>(pub(crate) W);

impl<W: WriteBatch> PersistenceWriteBatch<W> {
    pub fn new() -> PersistenceWriteBatch<W> {
        PersistenceWriteBatch(W::new())
    }

    /// Get the inner write batch, to be written into the key-value store.
    pub fn into_inner(self) -> W {
        self.0
    }

    fn set_value<T: BorshSerialize>(
        &mut self,
        key_bytes: &[u8],
        value: &T,
        key: Key,
    ) -> Result<(), KVSetError> {
        let value_bytes = value
            .try_to_vec()
            .map_err(|err| KVSetError::SerializeValueError { key, source: err })?;
        self.0.set(key_bytes, &value_bytes);
        Ok(())
    }

    /* ↓↓↓ Table participation ↓↓↓ */

    pub fn set_table_ids(&mut self, tables: &BTreeSet<TableId>) -> Result<(), KVSetError> {
        self.set_value(&variables::TABLE_IDS, tables, Key::TableIds)
    }

    pub fn set_table_persistent_state(
        &mut self,
        table: &TableId,
        state: &TablePersistentState,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &table_key(&variables::TABLE_PERSISTENT_STATE, table),
            state,
            Key::TablePersistentState { table: *table },
        )
    }

    pub fn delete_table_persistent_state(&mut self, table: &TableId) {
        self.0
            .delete(&table_key(&variables::TABLE_PERSISTENT_STATE, table));
    }

    /* ↓↓↓ Raft ↓↓↓ */

    pub fn set_raft_hard_state(
        &mut self,
        table: &TableId,
        hard_state: &RaftHardState,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &table_key(&variables::RAFT_HARD_STATE, table),
            hard_state,
            Key::RaftHardState { table: *table },
        )
    }

    pub fn set_raft_snapshot(
        &mut self,
        table: &TableId,
        snapshot: &RaftSnapshot,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &table_key(&variables::RAFT_SNAPSHOT, table),
            snapshot,
            Key::RaftSnapshot { table: *table },
        )
    }

    pub fn set_raft_log_last_index(
        &mut self,
        table: &TableId,
        index: &LogIndex,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &table_key(&variables::RAFT_LOG_LAST_INDEX, table),
            index,
            Key::RaftLogLastIndex { table: *table },
        )
    }

    pub fn set_raft_log_entry(
        &mut self,
        table: &TableId,
        entry: &RaftLogEntry,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &raft_log_entry_key(table, &entry.index),
            entry,
            Key::RaftLogEntry {
                table: *table,
                index: entry.index,
            },
        )
    }

    pub fn delete_raft_log_entry(&mut self, table: &TableId, index: &LogIndex) {
        self.0.delete(&raft_log_entry_key(table, index));
    }

    /// Delete the hard state, snapshot, and last index of `table`'s Raft log. Log entries have to be
    /// deleted one by one with [`delete_raft_log_entry`](Self::delete_raft_log_entry).
    pub fn delete_raft_state(&mut self, table: &TableId) {
        self.0.delete(&table_key(&variables::RAFT_HARD_STATE, table));
        self.0.delete(&table_key(&variables::RAFT_SNAPSHOT, table));
        self.0
            .delete(&table_key(&variables::RAFT_LOG_LAST_INDEX, table));
    }

    /* ↓↓↓ Branch history ↓↓↓ */

    pub fn set_branch_ids(
        &mut self,
        table: &TableId,
        branches: &BTreeSet<BranchId>,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &table_key(&variables::BRANCH_IDS, table),
            branches,
            Key::BranchIds { table: *table },
        )
    }

    pub fn set_branch(
        &mut self,
        table: &TableId,
        branch: &BranchId,
        certificate: &BranchBirthCertificate,
    ) -> Result<(), KVSetError> {
        self.set_value(
            &branch_key(table, branch),
            certificate,
            Key::Branch {
                table: *table,
                branch: *branch,
            },
        )
    }

    pub fn delete_branch(&mut self, table: &TableId, branch: &BranchId) {
        self.0.delete(&branch_key(table, branch));
    }
}

/// Error when trying to serialize a value into a [`PersistenceWriteBatch`].
#[derive(Debug)]
pub enum KVSetError {
    SerializeValueError { key: Key, source: std::io::Error },
}
