/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged between the primary and secondary executions of one region.
//!
//! Every message carries the [`BranchId`] it was sent under. A receiving execution drops any message whose
//! branch differs from the branch of its current contract, and any message whose sender is not the
//! party its current contract says it should be talking to. This is how a superseded primary is fenced
//! off from its former secondaries.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    storage::StoredValue,
    types::{
        branch::{BranchId, Version},
        data_types::StateTimestamp,
        region::Region,
    },
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ExecutionMessage {
    BackfillRequest(BackfillRequest),
    BackfillChunk(BackfillChunk),
    StreamingConfirmed(StreamingConfirmed),
    ReplicationWrite(ReplicationWrite),
    PrimaryHeartbeat(PrimaryHeartbeat),
}

impl ExecutionMessage {
    /// Get the region of the executions that this message is for.
    pub fn region(&self) -> &Region {
        match self {
            ExecutionMessage::BackfillRequest(msg) => &msg.region,
            ExecutionMessage::BackfillChunk(msg) => &msg.region,
            ExecutionMessage::StreamingConfirmed(msg) => &msg.region,
            ExecutionMessage::ReplicationWrite(msg) => &msg.region,
            ExecutionMessage::PrimaryHeartbeat(msg) => &msg.region,
        }
    }
}

/// Sent by a secondary to its primary to ask for the writes it is missing.
///
/// The secondary holds the region at `version`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BackfillRequest {
    pub region: Region,
    pub branch: BranchId,
    pub version: Version,
}

/// One piece of a backfill, sent by a primary in response to a [`BackfillRequest`].
///
/// Chunks of one backfill are numbered from 0. If `reset` is true, the receiver must delete everything it
/// holds for the region before applying the first chunk. The last chunk of a backfill carries the
/// version that the receiver holds once it has applied every chunk.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BackfillChunk {
    pub region: Region,
    pub branch: BranchId,
    pub index: u32,
    pub reset: bool,
    pub items: Vec<(Vec<u8>, StoredValue)>,
    pub last: Option<Version>,
}

/// Sent by a secondary to its primary once it has applied a whole backfill, and is live-tailing the
/// primary's writes.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StreamingConfirmed {
    pub region: Region,
    pub branch: BranchId,
    pub version: Version,
}

/// A write accepted by a primary, streamed to its secondaries. `value: None` deletes the key.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ReplicationWrite {
    pub region: Region,
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Periodically sent by a primary to its secondaries so that they can tell whether they are up to date.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrimaryHeartbeat {
    pub region: Region,
    pub branch: BranchId,
    pub version: Version,
}

impl From<BackfillRequest> for ExecutionMessage {
    fn from(value: BackfillRequest) -> Self {
        ExecutionMessage::BackfillRequest(value)
    }
}

impl From<BackfillChunk> for ExecutionMessage {
    fn from(value: BackfillChunk) -> Self {
        ExecutionMessage::BackfillChunk(value)
    }
}

impl From<StreamingConfirmed> for ExecutionMessage {
    fn from(value: StreamingConfirmed) -> Self {
        ExecutionMessage::StreamingConfirmed(value)
    }
}

impl From<ReplicationWrite> for ExecutionMessage {
    fn from(value: ReplicationWrite) -> Self {
        ExecutionMessage::ReplicationWrite(value)
    }
}

impl From<PrimaryHeartbeat> for ExecutionMessage {
    fn from(value: PrimaryHeartbeat) -> Self {
        ExecutionMessage::PrimaryHeartbeat(value)
    }
}
