/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Status requests about a table, and the cache that a table manager answers them from.
//!
//! A [`TableStatusRequest`] names the parts of the status that the caller wants. The matching
//! [`TableStatusResponse`] carries exactly those parts: every part that was not requested is `None`,
//! so callers can tell "not requested" apart from "empty".
//!
//! Responses are assembled from a [`TableStatusCache`] that the table manager refreshes on every
//! iteration of its loop. Answering a status request never waits for the table manager or for any
//! remote server.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    coordinator::ack_directory::ContractAckDirectory,
    execution::handle::ShardStatus,
    raft::types::TableRaftState,
    types::{
        contract::{AckState, ContractAck},
        data_types::{ContractId, LogIndex, ServerId, Term},
        region::Region,
        table_config::TableConfig,
    },
};

use super::bcard::LeaderBcard;

/// The parts of a table's status that a caller wants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableStatusRequest {
    pub want_config: bool,
    pub want_sindexes: bool,
    pub want_raft_state: bool,
    pub want_contract_acks: bool,
    pub want_shard_status: bool,
    pub want_all_replicas_ready: bool,
}

impl TableStatusRequest {
    /// A request for every part of the status.
    pub fn everything() -> Self {
        Self {
            want_config: true,
            want_sindexes: true,
            want_raft_state: true,
            want_contract_acks: true,
            want_shard_status: true,
            want_all_replicas_ready: true,
        }
    }
}

/// The status of one server's replica of a table. Only the parts named in the [`TableStatusRequest`]
/// are `Some`.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableStatusResponse {
    pub config: Option<TableConfig>,
    pub sindexes: Option<BTreeSet<String>>,
    pub raft_state: Option<RaftStatus>,

    /// The acks in the leader's ack directory, if the responder is the leader. Otherwise, the latest acks
    /// of the responder's own executions.
    pub contract_acks: Option<Vec<ContractAckEntry>>,
    pub shard_status: Option<Vec<ShardStatus>>,

    /// Whether every region has a ready primary, and every replica of every region is streaming.
    /// Only the leader can answer `true`, since only the leader knows every server's acks.
    pub all_replicas_ready: Option<bool>,
}

/// The Raft part of a table's status.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaftStatus {
    /// The committed state.
    pub state: TableRaftState,
    pub term: Term,
    pub commit_index: LogIndex,
    pub is_leader: bool,

    /// The bcard of the leader that the responder knows of, if any.
    pub leader: Option<LeaderBcard>,
}

/// One entry of the contract acks part of a table's status.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ContractAckEntry {
    pub server: ServerId,
    pub region: Region,
    pub contract_id: ContractId,
    pub ack: ContractAck,
}

/// Snapshot of a table manager's state, refreshed by the table manager and read by status requests.
#[derive(Clone, Debug)]
pub(crate) struct TableStatusCache {
    pub(crate) raft: RaftStatus,
    pub(crate) contract_acks: Vec<ContractAckEntry>,
    pub(crate) shard_status: Vec<ShardStatus>,
    pub(crate) all_replicas_ready: bool,
}

impl TableStatusCache {
    /// Answer `request` from the cache.
    pub(crate) fn respond(&self, request: &TableStatusRequest) -> TableStatusResponse {
        let config = &self.raft.state.config;
        TableStatusResponse {
            config: request.want_config.then(|| config.clone()),
            sindexes: request.want_sindexes.then(|| config.sindexes.clone()),
            raft_state: request.want_raft_state.then(|| self.raft.clone()),
            contract_acks: request
                .want_contract_acks
                .then(|| self.contract_acks.clone()),
            shard_status: request.want_shard_status.then(|| self.shard_status.clone()),
            all_replicas_ready: request
                .want_all_replicas_ready
                .then_some(self.all_replicas_ready),
        }
    }
}

/// Check whether every region of `state` has a ready primary and only streaming replicas, according to
/// the acks in `acks`.
pub(crate) fn all_replicas_ready(state: &TableRaftState, acks: &ContractAckDirectory) -> bool {
    state
        .region_to_contract
        .iter()
        .all(|(region, (contract_id, contract))| {
            let primary_ready = contract.primary.map_or(false, |primary| {
                acks.get(&primary, region, contract_id)
                    .map(|ack| ack.state)
                    == Some(AckState::PrimaryReady)
            });
            primary_ready
                && contract.temporary_extra_replicas.is_empty()
                && contract.replicas.iter().all(|replica| {
                    acks.get(replica, region, contract_id)
                        .map_or(false, |ack| ack.state.is_at_least_streaming())
                })
        })
}
