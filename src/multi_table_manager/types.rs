/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-server, per-table persisted participation state, and the actions that change it.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    raft::types::RaftSnapshot,
    types::{
        data_types::{Epoch, LogIndex, RaftMemberId, TableId},
        table_config::TableConfig,
    },
};

/// Position of an action in the history of a table. Actions with a lower timestamp than the state a
/// server has already persisted for the table are stale and get rejected.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, BorshSerialize, BorshDeserialize,
)]
pub struct TableTimestamp {
    pub epoch: Epoch,
    pub log_index: LogIndex,
}

impl TableTimestamp {
    pub const fn new(epoch: Epoch, log_index: LogIndex) -> Self {
        Self { epoch, log_index }
    }
}

/// Persisted by a server that is a member of a table's Raft cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableActivePersistentState {
    /// The epoch of the table at the time this server was activated.
    pub epoch: Epoch,

    /// The id this server has in the table's Raft cluster.
    pub raft_member_id: RaftMemberId,
}

/// Persisted by a server that was once a member of a table's Raft cluster, but no longer is.
///
/// Having this record (as opposed to having no record at all) is how a server tells "previously active,
/// possibly holds data that needs erasing" apart from "never participated".
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableInactivePersistentState {
    /// The last table configuration this server heard about, if any. `None` if the table was dropped.
    pub second_hand_config: Option<TableConfig>,

    /// When this server stopped being a member.
    pub timestamp: TableTimestamp,
}

/// Participation state of this server in one table.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TablePersistentState {
    Active(TableActivePersistentState),
    Inactive(TableInactivePersistentState),
}

impl TablePersistentState {
    /// Get the timestamp of this state, used to reject stale actions. Active states are only ordered by
    /// epoch, so they compare as the earliest log index within their epoch.
    pub fn timestamp(&self) -> TableTimestamp {
        match self {
            TablePersistentState::Active(active) => {
                TableTimestamp::new(active.epoch, LogIndex::init())
            }
            TablePersistentState::Inactive(inactive) => inactive.timestamp,
        }
    }
}

/// Actions that change a server's participation in a table. Sent by table leaders (and by the server
/// that creates or drops a table) to each affected server's multi-table manager.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TableAction {
    /// Become (or stay) a member of `table`'s Raft cluster as `member`, starting from `snapshot`.
    Activate {
        table: TableId,
        timestamp: TableTimestamp,
        member: RaftMemberId,
        snapshot: RaftSnapshot,
    },

    /// Stop being a member of `table`'s Raft cluster.
    Deactivate {
        table: TableId,
        timestamp: TableTimestamp,
        config: TableConfig,
    },

    /// `table` was dropped. Stop participating and erase all of its data.
    Drop {
        table: TableId,
        timestamp: TableTimestamp,
    },
}

impl TableAction {
    pub fn table(&self) -> TableId {
        match self {
            TableAction::Activate { table, .. }
            | TableAction::Deactivate { table, .. }
            | TableAction::Drop { table, .. } => *table,
        }
    }

    pub fn timestamp(&self) -> TableTimestamp {
        match self {
            TableAction::Activate { timestamp, .. }
            | TableAction::Deactivate { timestamp, .. }
            | TableAction::Drop { timestamp, .. } => *timestamp,
        }
    }
}
