/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Leader-only logic that moves every region's contract towards the table's configuration.
//!
//! The table manager of the Raft leader collects the [acks](crate::types::contract::ContractAck) of every
//! server in a [`ContractAckDirectory`](ack_directory::ContractAckDirectory). Whenever the leader has no
//! change in flight, it joins the committed state with the directory and the set of live servers, and
//! proposes the next change that [`coordinate`](implementation::coordinate) decides on.
//!
//! ## Contract transitions
//!
//! For each region, in order:
//! 1. Servers in `temporary_extra_replicas` that ack `Nothing` are dropped from the contract.
//! 2. A primary that is not live loses the role.
//! 3. A primary that acks `PrimaryNeedBranch` gets its branch committed, together with the branch's
//!    birth certificates.
//! 4. Once the primary is ready and a quorum of the configured replicas is streaming, replicas that the
//!    config no longer names are moved to `temporary_extra_replicas`, where they erase their copy.
//! 5. Configured replicas that are Raft members are added to `replicas`.
//! 6. A region without a primary gets the live replica with the most recent version on the current
//!    branch, once a [quorum](quorum::AckQuorum) of replicas has acked the current contract.
//! 7. A ready primary hands over to the configured primary once the configured primary is streaming.
//!
//! If no contract changes, the leader instead adds a configured server to the Raft membership, or
//! removes a member that neither the config nor any contract names.

pub mod quorum;

pub mod ack_directory;

pub(crate) mod implementation;
