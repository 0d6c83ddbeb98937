//! A simple, volatile, in-memory implementation of [`Storage`].
//!
//! Every table is a map from keys to [`StoredValue`]s, plus the metainfo of the regions that were reset
//! or written through the replication core. Durability is ignored, since nothing survives the test
//! process anyway.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use shard_replication::{
    interruptor::Interruptor,
    storage::{Durability, Storage, StoreError, StoreView, StoredValue},
    types::{
        branch::Version,
        data_types::{StateTimestamp, TableId},
        region::Region,
    },
};

#[derive(Default)]
struct TableData {
    values: BTreeMap<Vec<u8>, StoredValue>,
    metainfo: BTreeMap<Region, Version>,
}

type Tables = Arc<Mutex<BTreeMap<TableId, TableData>>>;

/// An in-memory implementation of [`Storage`].
#[derive(Clone, Default)]
pub(crate) struct MemStorage(Tables);

impl MemStorage {
    pub(crate) fn new() -> MemStorage {
        MemStorage::default()
    }

    /// Get the live (not deleted) value at `key` of `table`, bypassing the replication core.
    pub(crate) fn value(&self, table: TableId, key: &[u8]) -> Option<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .get(&table)
            .and_then(|data| data.values.get(key))
            .and_then(|stored| stored.value.clone())
    }

    /// Get the number of live keys of `table`.
    pub(crate) fn live_keys(&self, table: TableId) -> usize {
        self.0.lock().unwrap().get(&table).map_or(0, |data| {
            data.values
                .values()
                .filter(|stored| stored.value.is_some())
                .count()
        })
    }
}

impl Storage for MemStorage {
    type View = MemStoreView;

    fn open_table(&self, table: TableId) -> MemStoreView {
        self.0.lock().unwrap().entry(table).or_default();
        MemStoreView {
            tables: self.0.clone(),
            table,
            region: Region::universe(),
        }
    }

    fn drop_table(&self, table: TableId) {
        self.0.lock().unwrap().remove(&table);
    }

    fn tables(&self) -> BTreeSet<TableId> {
        self.0.lock().unwrap().keys().copied().collect()
    }
}

/// A view of one region of one table of a [`MemStorage`].
pub(crate) struct MemStoreView {
    tables: Tables,
    table: TableId,
    region: Region,
}

impl MemStoreView {
    fn with_data<T>(&self, f: impl FnOnce(&mut TableData) -> T) -> T {
        let mut tables = self.tables.lock().unwrap();
        f(tables.entry(self.table).or_default())
    }

    fn check_region(&self, region: &Region) -> Result<(), StoreError> {
        if self.region.contains_region(region) {
            Ok(())
        } else {
            Err(StoreError::RegionMismatch)
        }
    }
}

impl StoreView for MemStoreView {
    fn get_region(&self) -> Region {
        self.region.clone()
    }

    fn subview(&self, region: &Region) -> Option<Self> {
        self.region.contains_region(region).then(|| MemStoreView {
            tables: self.tables.clone(),
            table: self.table,
            region: region.clone(),
        })
    }

    fn reset_data(
        &mut self,
        initial_metainfo: Version,
        region: &Region,
        _: Durability,
        interruptor: &Interruptor,
    ) -> Result<(), StoreError> {
        interruptor.check()?;
        self.check_region(region)?;
        self.with_data(|data| {
            data.values.retain(|key, _| !region.contains_key(key));
            data.metainfo.retain(|stored, _| !region.contains_region(stored));
            data.metainfo.insert(region.clone(), initial_metainfo);
        });
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Option<StoredValue> {
        if !self.region.contains_key(key) {
            return None;
        }
        self.with_data(|data| data.values.get(key).cloned())
    }

    fn read_since(&self, region: &Region, since: StateTimestamp) -> Vec<(Vec<u8>, StoredValue)> {
        self.with_data(|data| {
            data.values
                .iter()
                .filter(|(key, stored)| region.contains_key(key) && stored.timestamp > since)
                .map(|(key, stored)| (key.clone(), stored.clone()))
                .collect()
        })
    }

    fn write(&mut self, key: &[u8], value: StoredValue, _: Durability) -> Result<(), StoreError> {
        if !self.region.contains_key(key) {
            return Err(StoreError::RegionMismatch);
        }
        self.with_data(|data| data.values.insert(key.to_vec(), value));
        Ok(())
    }

    fn metainfo(&self, region: &Region) -> Option<Version> {
        self.with_data(|data| {
            data.metainfo.get(region).copied().or_else(|| {
                data.metainfo
                    .iter()
                    .find(|(stored, _)| stored.contains_region(region))
                    .map(|(_, version)| *version)
            })
        })
    }

    fn set_metainfo(
        &mut self,
        region: &Region,
        version: Version,
        _: Durability,
    ) -> Result<(), StoreError> {
        self.check_region(region)?;
        self.with_data(|data| {
            data.metainfo.retain(|stored, _| !region.contains_region(stored));
            data.metainfo.insert(region.clone(), version);
        });
        Ok(())
    }
}
