/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of events emitted by the replication core, for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Library users can register
//! handlers for each kind of event using the optional setters of
//! [`ServerSpec`](crate::server::ServerSpec). Events are delivered to handlers by a dedicated
//! [event bus](crate::event_bus) thread, so handlers never block the components that emit events.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    execution::roles::Role,
    raft::types::TableChange,
    types::{
        branch::{BranchId, Version},
        contract::AckState,
        data_types::{ContractId, LogIndex, RaftMemberId, TableId, Term},
        region::Region,
    },
};

/// Enumerates all events defined for the replication core.
pub enum Event {
    // Events that change the replicated table state.
    BecomeLeader(BecomeLeaderEvent),
    CommitTableChange(CommitTableChangeEvent),

    // Events emitted by executions.
    UpdateContractAck(UpdateContractAckEvent),
    StartExecution(StartExecutionEvent),
    TearDownExecution(TearDownExecutionEvent),
    CreateBranch(CreateBranchEvent),
    CompleteErase(CompleteEraseEvent),

    // Events that change this server's participation in a table.
    ActivateTable(ActivateTableEvent),
    DeactivateTable(DeactivateTableEvent),
    DropTable(DropTableEvent),
}

impl Event {
    /// Send the event to the event bus, if there is one.
    ///
    /// Sending fails silently if the event bus has already shut down. This only happens while the server
    /// is being dropped.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// This server's Raft member became the leader of `table` in `term`.
pub struct BecomeLeaderEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub term: Term,
}

/// A change to `table`'s replicated state was committed and applied at `log_index`.
pub struct CommitTableChangeEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub log_index: LogIndex,
    pub change: TableChange,
}

/// A local execution produced a new contract ack.
pub struct UpdateContractAckEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub region: Region,
    pub contract_id: ContractId,
    pub state: AckState,
}

pub struct StartExecutionEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub region: Region,
    pub role: Role,
}

/// An execution finished tearing down. After this event, the execution no longer touches storage.
pub struct TearDownExecutionEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub region: Region,
    pub role: Role,
}

/// A primary execution created and persisted a new branch.
pub struct CreateBranchEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub region: Region,
    pub branch: BranchId,
    pub parent_version: Version,
}

/// An erase execution finished resetting its region with hard durability.
pub struct CompleteEraseEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub region: Region,
}

pub struct ActivateTableEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
    pub member: RaftMemberId,
}

pub struct DeactivateTableEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
}

pub struct DropTableEvent {
    pub timestamp: SystemTime,
    pub table: TableId,
}
