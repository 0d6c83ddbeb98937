/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable storage of region data.
//!
//! The replication core never interprets stored values. It moves opaque [`StoredValue`]s between
//! replicas and tags every region with the [`Version`] its data corresponds to (the region's
//! *metainfo*). Library users provide the actual storage engine by implementing:
//! 1. [`StoreView`]: access to the data of one region of one table.
//! 2. [`Storage`]: a factory of table-wide store views.
//!
//! ## Ownership
//!
//! The [table manager](crate::table_manager) opens one store view per table, and hands
//! [`subview`](StoreView::subview)s of it to [executions](crate::execution). At any moment, the
//! subview for a region is owned by at most one execution: a replacement execution only receives a
//! subview after its predecessor has finished tearing down.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    interruptor::{Interrupted, Interruptor},
    types::{
        branch::Version,
        data_types::{StateTimestamp, TableId},
        region::Region,
    },
};

/// A factory of [`StoreView`]s, one per table.
pub trait Storage: Clone + Send + 'static {
    type View: StoreView;

    /// Open the store view of `table`, creating an empty one if none exists. The returned view covers
    /// the whole key space.
    fn open_table(&self, table: TableId) -> Self::View;

    /// Delete every piece of data stored for `table`.
    fn drop_table(&self, table: TableId);

    /// Get the ids of every table that has some data stored.
    fn tables(&self) -> BTreeSet<TableId>;
}

/// Access to the data of one region of one table.
///
/// Implementations must make every individual method call atomic with respect to the other methods.
pub trait StoreView: Send + 'static {
    /// Get the region that this view covers.
    fn get_region(&self) -> Region;

    /// Get a view over `region`, which must be contained in this view's region. Returns `None`
    /// otherwise.
    fn subview(&self, region: &Region) -> Option<Self>
    where
        Self: Sized;

    /// Atomically delete every key in `region` and set the region's metainfo to `initial_metainfo`.
    ///
    /// Checks `interruptor` before starting. Once started, the reset completes. If `durability` is
    /// [`Durability::Hard`], the reset must have reached stable storage when this returns.
    fn reset_data(
        &mut self,
        initial_metainfo: Version,
        region: &Region,
        durability: Durability,
        interruptor: &Interruptor,
    ) -> Result<(), StoreError>;

    /// Read the value at `key`. Returns `None` if the key was never written, and a [`StoredValue`] with
    /// `value: None` if the key was deleted.
    fn read(&self, key: &[u8]) -> Option<StoredValue>;

    /// Get every key in `region` that was written (or deleted) at a timestamp strictly greater than
    /// `since`, in key order. Deleted keys are included, as tombstones.
    fn read_since(&self, region: &Region, since: StateTimestamp) -> Vec<(Vec<u8>, StoredValue)>;

    /// Write `value` at `key`. A `value` of `None` deletes the key.
    fn write(
        &mut self,
        key: &[u8],
        value: StoredValue,
        durability: Durability,
    ) -> Result<(), StoreError>;

    /// Get the version that the data in `region` corresponds to. `None` if the region's data was
    /// never reset or written through the replication core.
    fn metainfo(&self, region: &Region) -> Option<Version>;

    fn set_metainfo(
        &mut self,
        region: &Region,
        version: Version,
        durability: Durability,
    ) -> Result<(), StoreError>;
}

/// An opaque value stored at a key, tagged with the timestamp of the write that produced it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StoredValue {
    pub value: Option<Vec<u8>>,
    pub timestamp: StateTimestamp,
}

/// How durable a storage operation must be when it returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// The operation may be buffered in memory.
    Soft,

    /// The operation must survive a crash.
    Hard,
}

/// Errors that the storage collaborator may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The operation was interrupted before it started.
    Interrupted,

    /// A key or region outside of the view's region was passed.
    RegionMismatch,
}

impl From<Interrupted> for StoreError {
    fn from(_: Interrupted) -> Self {
        StoreError::Interrupted
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Interrupted => write!(f, "interrupted"),
            StoreError::RegionMismatch => write!(f, "key or region outside of the store view"),
        }
    }
}
