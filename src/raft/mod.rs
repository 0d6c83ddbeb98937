/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Raft replication of a table's [configuration state](types::TableRaftState).
//!
//! Every table runs its own Raft cluster, whose members are the servers that participate in the table.
//! The log entries are [`TableChange`](types::TableChange)s. Applying the committed prefix of the log to
//! an empty state produces the same [`TableRaftState`](types::TableRaftState) on every member: the
//! table's config, its contracts, its Raft membership, and its branch history.
//!
//! ## Protocol
//!
//! The implementation follows the Raft paper closely:
//! - **Elections**: a member that does not hear from a leader for a randomized number of ticks
//!   increments its term and asks the other voters for votes. Votes are only granted to candidates
//!   whose log is at least as up to date as the voter's. A candidate with votes from a majority of the
//!   voters becomes leader, and immediately appends a [`NewTerm`](types::TableChange::NewTerm) entry.
//! - **Replication**: the leader sends [`AppendEntries`](messages::AppendEntries) to each voter,
//!   starting from the voter's `next_index`. A voter rejects entries whose predecessor does not match
//!   its own log, and the leader retries from an earlier index.
//! - **Commitment**: an entry is committed once a majority of voters has stored it, and it or a later
//!   entry belongs to the leader's current term.
//! - **Compaction**: once enough entries are committed past the snapshot, the member replaces them
//!   with a snapshot of the committed state. Voters that fall behind the snapshot receive it through
//!   [`InstallSnapshot`](messages::InstallSnapshot).
//!
//! Membership changes are single-step: the leader proposes one [`AddMember`](types::TableChange::AddMember)
//! or [`RemoveMember`](types::TableChange::RemoveMember) at a time, and each member uses the latest
//! membership in its log as soon as it appends it.

pub mod types;

pub mod messages;

pub(crate) mod log;

pub(crate) mod implementation;
pub use implementation::ProposeError;
pub use log::RaftError;
