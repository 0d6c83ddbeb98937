/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that make up the replicated state of a table and the log that produces it.

use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    branch::{BranchHistory, BranchId},
    contract::Contract,
    data_types::{ContractId, Epoch, LogIndex, RaftMemberId, ServerId, Term},
    region::{is_partition, Region},
    table_config::{TableConfig, TableConfigError},
};

/// The authoritative, Raft-replicated state of a table.
///
/// Every member of the table's Raft cluster holds the same `TableRaftState` for a given
/// [`log_index`](Self::log_index).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableRaftState {
    /// The user's desired configuration of the table.
    pub config: TableConfig,

    /// The servers that are members of the table's Raft cluster, and their member ids.
    pub member_ids: BTreeMap<ServerId, RaftMemberId>,

    /// The current contract of every region. The keys always partition the table's key space.
    pub region_to_contract: BTreeMap<Region, (ContractId, Contract)>,

    /// Birth certificates of the branches named by committed contracts, and of the ancestors that some
    /// server's acked version may still lie on.
    pub branch_history: BranchHistory,

    /// Index of the last log entry applied to this state.
    pub log_index: LogIndex,

    /// Incremented every time a member becomes leader.
    pub epoch: Epoch,
}

impl TableRaftState {
    /// Create the initial state of a new table with `config`, with every configured server as a member.
    ///
    /// Every region starts out with the configured replicas and primary, on the
    /// [nil branch](BranchId::nil). The primaries create the first real branches.
    pub fn new_table(config: TableConfig) -> Result<TableRaftState, TableConfigError> {
        config.validate()?;

        let member_ids = config
            .all_servers()
            .into_iter()
            .map(|server| (server, RaftMemberId::generate()))
            .collect();

        let region_to_contract = config
            .regions()
            .into_iter()
            .zip(config.shards.iter())
            .map(|(region, shard)| {
                let contract = Contract::new(
                    shard.replicas.clone(),
                    Some(shard.primary),
                    BranchId::nil(),
                );
                (region, (ContractId::generate(), contract))
            })
            .collect();

        Ok(TableRaftState {
            config,
            member_ids,
            region_to_contract,
            branch_history: BranchHistory::new(),
            log_index: LogIndex::init(),
            epoch: Epoch::init(),
        })
    }

    /// Apply a committed log entry to the state.
    pub fn apply(&mut self, entry: &RaftLogEntry) {
        match &entry.change {
            TableChange::NewTerm => self.epoch += 1,
            TableChange::SetConfig(config) => self.config = config.clone(),
            TableChange::UpdateContracts {
                contracts,
                branch_history,
            } => {
                self.branch_history = branch_history.clone();
                for (region, contract) in contracts {
                    if let Some(current) = self.region_to_contract.get_mut(region) {
                        *current = contract.clone();
                    }
                }
            }
            TableChange::AddMember { server, member } => {
                self.member_ids.insert(*server, *member);
            }
            TableChange::RemoveMember { server } => {
                self.member_ids.remove(server);
            }
        }
        self.log_index = entry.index;
    }

    /// Get the Raft member ids of every member.
    pub fn members(&self) -> BTreeSet<RaftMemberId> {
        self.member_ids.values().copied().collect()
    }

    /// Get the server that holds Raft member id `member`.
    pub fn server_of(&self, member: &RaftMemberId) -> Option<ServerId> {
        self.member_ids
            .iter()
            .find(|(_, m)| *m == member)
            .map(|(server, _)| *server)
    }

    /// Get the region that contains `key`, and its current contract.
    pub fn contract_for_key(&self, key: &[u8]) -> Option<(&Region, &(ContractId, Contract))> {
        self.region_to_contract
            .iter()
            .find(|(region, _)| region.contains_key(key))
    }

    /// Check that the regions partition the key space and that every contract is well formed.
    pub fn is_consistent(&self) -> bool {
        is_partition(self.region_to_contract.keys())
            && self
                .region_to_contract
                .values()
                .all(|(_, contract)| contract.is_well_formed())
    }
}

/// A change to a [`TableRaftState`], carried by one Raft log entry.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum TableChange {
    /// Appended by every new leader at the start of its term. Increments the epoch.
    NewTerm,

    /// Replace the table's configuration. The new configuration must keep the shard scheme.
    SetConfig(TableConfig),

    /// Replace the contracts of some regions, and replace the branch history with the records that the
    /// contracts of all regions still need.
    UpdateContracts {
        contracts: BTreeMap<Region, (ContractId, Contract)>,
        branch_history: BranchHistory,
    },

    /// Add `server` to the Raft cluster as `member`.
    AddMember {
        server: ServerId,
        member: RaftMemberId,
    },

    /// Remove `server` from the Raft cluster.
    RemoveMember { server: ServerId },
}

impl TableChange {
    /// Name of the kind of change, in PascalCase, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TableChange::NewTerm => "NewTerm",
            TableChange::SetConfig(_) => "SetConfig",
            TableChange::UpdateContracts { .. } => "UpdateContracts",
            TableChange::AddMember { .. } => "AddMember",
            TableChange::RemoveMember { .. } => "RemoveMember",
        }
    }
}

/// An entry in a table's Raft log.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaftLogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub change: TableChange,
}

/// A compacted prefix of a table's Raft log: the state produced by applying every entry up to and
/// including `last_index`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaftSnapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub state: TableRaftState,
}

impl RaftSnapshot {
    /// Create the snapshot that a brand new table's members start from.
    pub fn initial(state: TableRaftState) -> RaftSnapshot {
        RaftSnapshot {
            last_index: LogIndex::init(),
            last_term: Term::init(),
            state,
        }
    }
}

/// The Raft state that must survive a restart before a member may send a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaftHardState {
    pub term: Term,
    pub voted_for: Option<RaftMemberId>,
}

/// A notification that the committed state of a table has changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitNotification {
    /// A log entry was committed and applied.
    Entry(RaftLogEntry),

    /// The whole state was replaced by a snapshot received from the leader.
    Snapshot { last_index: LogIndex },
}
