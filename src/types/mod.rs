//! Types and traits that are used across multiple components of the replication core.
//!
//! Other types, specific to single components, can be found in the "types" or "messages" submodules
//! of those components, e.g., [`crate::raft::types`].

pub mod branch;

pub mod contract;

pub mod crypto_primitives;

pub mod data_types;

pub mod region;

pub mod signed_messages;

pub mod table_config;
