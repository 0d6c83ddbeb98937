/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-server owner of every table this server participates in.
//!
//! A server's participation in a table is one of:
//! 1. **Active**: the server is a member of the table's Raft cluster, and runs a
//!    [table manager](crate::table_manager) for it.
//! 2. **Inactive**: the server was a member once. It keeps the last config it heard about (or none, if the
//!    table was dropped) so that it can reject stale [actions](types::TableAction), and erases any data
//!    left over from its membership.
//! 3. Neither: the server never heard of the table.
//!
//! Participation only changes through table actions, which table leaders send when they change the Raft
//! membership, and which servers send to each other when a table is created or dropped. An action with a
//! lower [timestamp](types::TableTimestamp) than the persisted state is stale and ignored. Drops are never
//! stale, and a dropped table rejects every other action.
//!
//! The multi-table manager thread also routes network messages and client requests to the table managers,
//! and answers status requests from their status caches without waiting on them.

pub(crate) mod implementation;
pub use implementation::MultiTableManagerError;

pub mod types;
