/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The replication core of a sharded document store.
//!
//! A *table* is an ordered key space, split into *regions* that are each replicated to a set of
//! servers. For each region, exactly one server at a time is the *primary*, which accepts writes and
//! streams them to the region's *secondaries*. Which server plays which role is decided by the table's
//! leader and written down in a [contract](types::contract::Contract) per region. Contracts are
//! replicated through a per-table Raft cluster, so every server learns of them in the same order.
//!
//! Each server realizes the contracts it learns of by running one [execution](execution) per region:
//! a primary, a secondary, or an eraser of data it should no longer hold. Executions report their
//! progress in [acks](types::contract::ContractAck), which the leader's [coordinator](coordinator)
//! joins with the table's configuration to decide on the next contracts.
//!
//! Writes carry a [version](types::branch::Version) on a *branch*. Every new primary starts a new branch
//! off the last version it has, and records it in the table's [branch history](branch_history), so that
//! servers can tell whether their data is an ancestor of the current branch or has diverged from it.
//!
//! ## Getting started
//!
//! Library users provide three pluggables and start a [server](server):
//! 1. A [key-value store](persistence::pluggables::KVStore) for the server's metadata.
//! 2. A [network](networking::network::Network) that reaches the other servers.
//! 3. A [storage](storage::Storage) for the data of the regions.
//!
//! ```ignore
//! let server = ServerSpec::builder()
//!     .kv_store(kv_store)
//!     .network(network)
//!     .storage(storage)
//!     .configuration(Configuration::builder().me(signing_key).log_events(true).build())
//!     .build()
//!     .start();
//!
//! let table = server.create_table(config)?;
//! ```

pub mod types;

pub mod persistence;

pub mod storage;

pub mod interruptor;

pub mod branch_history;

pub mod execution;

pub mod raft;

pub mod coordinator;

pub mod table_manager;

pub mod multi_table_manager;

pub mod networking;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod server;

#[cfg(test)]
pub(crate) mod test_utils;
