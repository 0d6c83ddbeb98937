/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable persistence of the metadata that the replication core needs to survive restarts.
//!
//! Library users provide a key-value store by implementing the traits in [`pluggables`]. The replication
//! core stores three kinds of metadata in it, per table:
//! 1. This server's participation state ([`TablePersistentState`](crate::multi_table_manager::types::TablePersistentState)).
//! 2. The Raft hard state, snapshot, and log.
//! 3. The branch history.
//!
//! Region data itself does not live here, but in the [storage views](crate::storage) provided by the
//! user.

pub mod pluggables;

pub mod variables;

pub mod write_batch;

use pluggables::KVGetError;
use write_batch::KVSetError;

/// Errors that may be encountered when reading or writing the replication core's metadata.
#[derive(Debug)]
pub enum PersistenceError {
    KVGetError(KVGetError),
    KVSetError(KVSetError),
}

impl From<KVGetError> for PersistenceError {
    fn from(value: KVGetError) -> Self {
        PersistenceError::KVGetError(value)
    }
}

impl From<KVSetError> for PersistenceError {
    fn from(value: KVSetError) -> Self {
        PersistenceError::KVSetError(value)
    }
}
