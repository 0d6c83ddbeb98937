/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumerations around every message variant exchanged between servers.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    execution::messages::ExecutionMessage,
    multi_table_manager::types::TableAction,
    raft::messages::RaftMessage,
    table_manager::status::{TableStatusRequest, TableStatusResponse},
    types::{
        data_types::{TableId, Term},
        signed_messages::SignedContractAck,
        table_config::TableConfig,
    },
};

/// All message variants exchanged between servers.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// A message for the table manager of `table`.
    Table { table: TableId, msg: TableMessage },

    /// A change to the receiver's participation in a table. See [`TableAction`].
    Action(TableAction),

    /// Ask the receiver for the status of its replica of `table`.
    StatusRequest {
        request_id: u64,
        table: TableId,
        request: TableStatusRequest,
    },

    /// Reply to a [`StatusRequest`](Message::StatusRequest). `response` is `None` if the responder is not
    /// participating in the table.
    StatusResponse {
        request_id: u64,
        response: Option<TableStatusResponse>,
    },
}

impl From<TableAction> for Message {
    fn from(value: TableAction) -> Self {
        Message::Action(value)
    }
}

/// Message variants that are processed by the [table manager](crate::table_manager) of one table.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum TableMessage {
    /// See [`RaftMessage`].
    Raft(RaftMessage),

    /// A contract ack, sent to the contract ack mailbox of the leader of `term`.
    ContractAck { term: Term, ack: SignedContractAck },

    /// A new table configuration, sent to the set config mailbox of the leader of `term`.
    SetConfig { term: Term, config: TableConfig },

    /// See [`ExecutionMessage`].
    Execution(ExecutionMessage),
}

impl From<RaftMessage> for TableMessage {
    fn from(value: RaftMessage) -> Self {
        TableMessage::Raft(value)
    }
}

impl From<ExecutionMessage> for TableMessage {
    fn from(value: ExecutionMessage) -> Self {
        TableMessage::Execution(value)
    }
}
