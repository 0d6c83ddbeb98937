/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-region active objects that make a server's local copy of a region match the region's committed
//! contract.
//!
//! For every region of every table it participates in, a server runs exactly one execution. Which kind
//! of execution depends on the server's [role](roles::Role) in the region's contract:
//! - [Erase](erase): the server is not one of the contract's `replicas`. It deletes its copy of the
//!   region.
//! - [Primary](primary): the server is the contract's `primary`. It creates a branch, serves backfills,
//!   and accepts writes once enough secondaries are streaming.
//! - [Secondary](secondary): the server is one of the contract's other `replicas`. It backfills from
//!   the primary and then live-tails the primary's writes.
//!
//! ## Lifecycle
//!
//! Every execution runs on its own thread (see [`handle`]) and goes through three frames: *starting*,
//! *active*, and *tearing down*. The [table manager](crate::table_manager) starts an execution when the
//! server's role for a region changes, notifies the running execution in place when the region's
//! contract changes without changing the role, and [interrupts](crate::interruptor) and joins the
//! execution before starting a replacement. Since the replacement only starts after the old execution's
//! thread has exited, at most one execution ever writes to a region's store at a time.

pub(crate) mod context;

pub(crate) mod erase;

pub(crate) mod handle;
pub use handle::{FrameState, ShardStatus};

pub mod messages;

pub(crate) mod primary;

pub mod roles;

pub(crate) mod secondary;

use std::fmt::{self, Display, Formatter};

use crate::{
    branch_history::BranchHistoryError,
    coordinator::quorum::AckQuorum,
    interruptor::Interrupted,
    networking::network::Network,
    persistence::pluggables::KVStore,
    storage::{StoreError, StoreView},
    types::{branch::Version, data_types::{ServerId, Ticks}},
};

use self::{
    context::ExecutionContext, erase::EraseExecution, messages::ExecutionMessage,
    primary::PrimaryExecution, roles::Role, secondary::SecondaryExecution,
};

/// Configuration of every execution of a server.
#[derive(Clone)]
pub(crate) struct ExecutionConfiguration {
    pub(crate) me: ServerId,
    pub(crate) heartbeat_ticks: Ticks,
    pub(crate) backfill_chunk_size: usize,
    pub(crate) backfill_retry_ticks: Ticks,
    pub(crate) ack_quorum: AckQuorum,
}

/// Role-specific state of an execution, dispatched by `match`.
pub(crate) enum Execution {
    Erase(EraseExecution),
    Primary(PrimaryExecution),
    Secondary(SecondaryExecution),
}

impl Execution {
    pub(crate) fn new(role: Role) -> Execution {
        match role {
            Role::Erase => Execution::Erase(EraseExecution::new()),
            Role::Primary => Execution::Primary(PrimaryExecution::new()),
            Role::Secondary => Execution::Secondary(SecondaryExecution::new()),
        }
    }

    pub(crate) fn role(&self) -> Role {
        match self {
            Execution::Erase(_) => Role::Erase,
            Execution::Primary(_) => Role::Primary,
            Execution::Secondary(_) => Role::Secondary,
        }
    }

    /// Set up the execution. Called once, in the *starting* frame.
    pub(crate) fn start<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        match self {
            Execution::Erase(erase) => erase.start(ctx),
            Execution::Primary(primary) => primary.start(ctx),
            Execution::Secondary(secondary) => secondary.start(ctx),
        }
    }

    /// React to `ctx`'s contract having been replaced.
    pub(crate) fn on_contract_update<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        match self {
            Execution::Erase(erase) => erase.on_contract_update(ctx),
            Execution::Primary(primary) => primary.on_contract_update(ctx),
            Execution::Secondary(secondary) => secondary.on_contract_update(ctx),
        }
    }

    pub(crate) fn on_receive_msg<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        origin: ServerId,
        msg: ExecutionMessage,
    ) -> Result<(), ExecutionError> {
        match self {
            // Erasing servers take part in no protocol.
            Execution::Erase(_) => Ok(()),
            Execution::Primary(primary) => primary.on_receive_msg(ctx, origin, msg),
            Execution::Secondary(secondary) => secondary.on_receive_msg(ctx, origin, msg),
        }
    }

    /// Accept a client write. Only primaries in the *ready* sub-state accept writes.
    pub(crate) fn write<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<Version, WriteError> {
        match self {
            Execution::Primary(primary) => primary.write(ctx, key, value),
            Execution::Erase(_) | Execution::Secondary(_) => Err(WriteError::NotPrimary {
                primary: ctx.contract().primary,
            }),
        }
    }

    /// Serve a possibly stale local read. Primaries serve reads once their branch is committed, and
    /// secondaries once they are streaming.
    pub(crate) fn read<K: KVStore, V: StoreView, N: Network>(
        &self,
        ctx: &ExecutionContext<K, V, N>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, ReadError> {
        let readable = match self {
            Execution::Erase(_) => false,
            Execution::Primary(primary) => primary.is_readable(),
            Execution::Secondary(secondary) => secondary.is_readable(),
        };
        if !readable {
            return Err(ReadError::NotReadable);
        }
        Ok(ctx.store.read(key).and_then(|stored| stored.value))
    }

    pub(crate) fn tick<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        match self {
            Execution::Erase(_) => Ok(()),
            Execution::Primary(primary) => primary.tick(ctx),
            Execution::Secondary(secondary) => secondary.tick(ctx),
        }
    }
}

/// Reasons why an execution stops running before it is torn down.
#[derive(Debug)]
pub(crate) enum ExecutionError {
    /// The execution was interrupted. This is the normal way for an execution to end.
    Interrupted,

    /// The branch history diverged from what the committed contracts imply. Fatal to the table manager.
    BranchHistory(BranchHistoryError),

    /// The storage collaborator rejected an operation.
    Store(StoreError),
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::Interrupted => write!(f, "interrupted"),
            ExecutionError::BranchHistory(err) => write!(f, "branch history error: {}", err),
            ExecutionError::Store(err) => write!(f, "store error: {}", err),
        }
    }
}

impl From<Interrupted> for ExecutionError {
    fn from(_: Interrupted) -> Self {
        ExecutionError::Interrupted
    }
}

impl From<BranchHistoryError> for ExecutionError {
    fn from(value: BranchHistoryError) -> Self {
        ExecutionError::BranchHistory(value)
    }
}

impl From<StoreError> for ExecutionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Interrupted => ExecutionError::Interrupted,
            other => ExecutionError::Store(other),
        }
    }
}

/// Reasons why a client write was not accepted.
///
/// Every variant except `TableNotFound` and `Storage` is transient: the client should retry, possibly
/// against another server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteError {
    /// This server is the region's primary, but the primary is not *ready* yet.
    NotWritable,

    /// This server is not the region's primary. `primary` is the primary named by the contract this
    /// server knows about, if any.
    NotPrimary { primary: Option<ServerId> },

    /// This server does not participate in the table.
    TableNotFound,

    /// The region's execution did not answer in time, or was torn down while the write was queued.
    Timeout,

    /// The storage collaborator rejected the write.
    Storage(StoreError),
}

impl Display for WriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::NotWritable => write!(f, "region is not currently writable"),
            WriteError::NotPrimary { primary: Some(primary) } => {
                write!(f, "this server is not the primary, {} is", primary)
            }
            WriteError::NotPrimary { primary: None } => {
                write!(f, "this server is not the primary, and the region has none")
            }
            WriteError::TableNotFound => write!(f, "table not found"),
            WriteError::Timeout => write!(f, "timed out"),
            WriteError::Storage(err) => write!(f, "storage error: {}", err),
        }
    }
}

/// Reasons why a local read was not served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadError {
    /// This server's copy of the region is not up to date enough to be read.
    NotReadable,

    /// This server does not participate in the table.
    TableNotFound,

    /// The region's execution did not answer in time.
    Timeout,
}

impl Display for ReadError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::NotReadable => write!(f, "region is not currently readable on this server"),
            ReadError::TableNotFound => write!(f, "table not found"),
            ReadError::Timeout => write!(f, "timed out"),
        }
    }
}
