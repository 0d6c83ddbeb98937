/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each persisted variable is stored in the user-provided key-value
//! store.
//!
//! # List of persisted variables
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Table Ids|[`BTreeSet<TableId>`](crate::types::data_types::TableId)|Every table this server has a participation record for.|
//! |Table Persistent State|[`TableId`](crate::types::data_types::TableId) -> [`TablePersistentState`](crate::multi_table_manager::types::TablePersistentState)|Whether this server is an active or former member of each table.|
//! |Raft Hard State|[`TableId`](crate::types::data_types::TableId) -> [`RaftHardState`](crate::raft::types::RaftHardState)|Current term and vote of this server's Raft member for each table.|
//! |Raft Snapshot|[`TableId`](crate::types::data_types::TableId) -> [`RaftSnapshot`](crate::raft::types::RaftSnapshot)|The compacted prefix of each table's Raft log.|
//! |Raft Log Last Index|[`TableId`](crate::types::data_types::TableId) -> [`LogIndex`](crate::types::data_types::LogIndex)|Index of the last entry in each table's Raft log.|
//! |Raft Log Entries|([`TableId`](crate::types::data_types::TableId), [`LogIndex`](crate::types::data_types::LogIndex)) -> [`RaftLogEntry`](crate::raft::types::RaftLogEntry)|Entries of each table's Raft log that come after the snapshot.|
//! |Branch Ids|[`TableId`](crate::types::data_types::TableId) -> [`BTreeSet<BranchId>`](crate::types::branch::BranchId)|Every branch this server knows of, per table.|
//! |Branches|([`TableId`](crate::types::data_types::TableId), [`BranchId`](crate::types::branch::BranchId)) -> [`BranchBirthCertificate`](crate::types::branch::BranchBirthCertificate)|Birth certificates of known branches.|
//!
//! # Persistence of variables
//!
//! Each variable is stored as a **Borsh-serialized value**. Single values (Table Ids) are stored at a
//! one-byte constant key. Per-table variables are stored at the concatenation of their one-byte prefix
//! and the big-endian bytes of the table id. Variables keyed by a table and a second key append the
//! bytes of the second key (big-endian for log indices, raw hash bytes for branch ids).

use crate::types::{branch::BranchId, data_types::LogIndex, data_types::TableId};

// Variables
pub const TABLE_IDS: [u8; 1] = [0];
pub const TABLE_PERSISTENT_STATE: [u8; 1] = [1];
pub const RAFT_HARD_STATE: [u8; 1] = [2];
pub const RAFT_SNAPSHOT: [u8; 1] = [3];
pub const RAFT_LOG_LAST_INDEX: [u8; 1] = [4];
pub const RAFT_LOG_ENTRIES: [u8; 1] = [5];
pub const BRANCH_IDS: [u8; 1] = [6];
pub const BRANCHES: [u8; 1] = [7];

/// Concatenate two byteslices into one vector.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// Form the key of a per-table variable.
pub fn table_key(variable: &[u8], table: &TableId) -> Vec<u8> {
    concat(variable, &table.to_be_bytes())
}

/// Form the key of the Raft log entry at `index` of `table`.
pub fn raft_log_entry_key(table: &TableId, index: &LogIndex) -> Vec<u8> {
    concat(&table_key(&RAFT_LOG_ENTRIES, table), &index.to_be_bytes())
}

/// Form the key of the birth certificate of `branch` in `table`.
pub fn branch_key(table: &TableId, branch: &BranchId) -> Vec<u8> {
    concat(&table_key(&BRANCHES, table), &branch.bytes())
}
