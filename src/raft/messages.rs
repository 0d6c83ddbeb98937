/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged between the Raft members of one table.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{LogIndex, RaftMemberId, Term};

use super::types::{RaftLogEntry, RaftSnapshot};

/// A Raft message, addressed from one member id to another.
///
/// Messages are addressed by member id as well as by server, so that a server that was removed from a
/// table and later re-added (under a fresh member id) ignores messages meant for its former self.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RaftMessage {
    pub term: Term,
    pub from: RaftMemberId,
    pub to: RaftMemberId,
    pub payload: RaftPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RaftPayload {
    AppendEntries(AppendEntries),
    AppendResponse(AppendResponse),
    RequestVote(RequestVote),
    VoteResponse(VoteResponse),
    InstallSnapshot(InstallSnapshot),
}

/// Sent by the leader to replicate `entries`, which directly follow the entry at `base_index`. Also
/// serves as the leader's heartbeat when `entries` is empty.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AppendEntries {
    pub base_index: LogIndex,
    pub base_term: Term,
    pub entries: Vec<RaftLogEntry>,
    pub commit_index: LogIndex,
}

/// Reply to [`AppendEntries`] and [`InstallSnapshot`].
///
/// On success, `last_index` is the index up to which the follower's log matches the leader's. On failure,
/// it is a hint of where the leader should retry from.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AppendResponse {
    pub success: bool,
    pub last_index: LogIndex,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestVote {
    pub last_index: LogIndex,
    pub last_term: Term,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VoteResponse {
    pub granted: bool,
}

/// Sent by the leader to a follower that needs entries the leader has already compacted.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InstallSnapshot {
    pub snapshot: RaftSnapshot,
}
