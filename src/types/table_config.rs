/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-facing configuration of a table: how its key space is sharded, and which servers should
//! replicate (and be primary for) each shard.
//!
//! The table leader's [coordinator](crate::coordinator) moves the committed contracts towards the
//! committed `TableConfig` one safe step at a time.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use super::{data_types::ServerId, region::Region};

/// Desired replicas and primary of one shard.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ShardConfig {
    pub replicas: BTreeSet<ServerId>,
    pub primary: ServerId,
}

/// Configuration of a table.
///
/// The table's key space is split at `split_points` into `split_points.len() + 1` shards, and
/// `shards[i]` configures the `i`-th of these in key order.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TableConfig {
    pub name: String,
    pub split_points: Vec<Vec<u8>>,
    pub shards: Vec<ShardConfig>,
    pub sindexes: BTreeSet<String>,
}

impl TableConfig {
    /// Check that the configuration describes a valid sharding of the table.
    pub fn validate(&self) -> Result<(), TableConfigError> {
        let regions =
            Region::split_universe(&self.split_points).ok_or(TableConfigError::InvalidSplitPoints)?;
        if regions.len() != self.shards.len() {
            return Err(TableConfigError::ShardCountMismatch {
                regions: regions.len(),
                shards: self.shards.len(),
            });
        }
        for (index, shard) in self.shards.iter().enumerate() {
            if shard.replicas.is_empty() {
                return Err(TableConfigError::NoReplicas { shard: index });
            }
            if !shard.replicas.contains(&shard.primary) {
                return Err(TableConfigError::PrimaryNotReplica { shard: index });
            }
        }
        Ok(())
    }

    /// Get the regions that the configured shards cover, in key order.
    pub fn regions(&self) -> Vec<Region> {
        Region::split_universe(&self.split_points).unwrap_or_default()
    }

    /// Get the configuration of the shard that covers exactly `region`.
    pub fn shard_for_region(&self, region: &Region) -> Option<&ShardConfig> {
        self.regions()
            .iter()
            .position(|r| r == region)
            .and_then(|index| self.shards.get(index))
    }

    /// Get every server that the configuration names as a replica of some shard.
    pub fn all_servers(&self) -> BTreeSet<ServerId> {
        self.shards
            .iter()
            .flat_map(|shard| shard.replicas.iter().copied())
            .collect()
    }

    /// Check whether `other` shards the key space the same way as `self`.
    pub fn has_same_shard_scheme(&self, other: &TableConfig) -> bool {
        self.split_points == other.split_points
    }
}

/// Ways in which a [`TableConfig`] can be invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableConfigError {
    /// The split points are not strictly increasing, or include the empty key.
    InvalidSplitPoints,

    /// The number of shard configurations does not match the number of regions produced by the split
    /// points.
    ShardCountMismatch { regions: usize, shards: usize },

    /// A shard has no replicas.
    NoReplicas { shard: usize },

    /// A shard's primary is not one of its replicas.
    PrimaryNotReplica { shard: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(byte: u8) -> ServerId {
        ServerId::new([byte; 32])
    }

    fn shard(replicas: &[u8], primary: u8) -> ShardConfig {
        ShardConfig {
            replicas: replicas.iter().map(|b| server(*b)).collect(),
            primary: server(primary),
        }
    }

    #[test]
    fn validate() {
        let mut config = TableConfig {
            name: String::from("users"),
            split_points: vec![b"m".to_vec()],
            shards: vec![shard(&[1, 2], 1), shard(&[2, 3], 3)],
            sindexes: BTreeSet::new(),
        };
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.all_servers().len(), 3);
        assert_eq!(
            config.shard_for_region(&config.regions()[1]).unwrap().primary,
            server(3)
        );

        config.shards[1].primary = server(1);
        assert_eq!(
            config.validate(),
            Err(TableConfigError::PrimaryNotReplica { shard: 1 })
        );

        config.shards.pop();
        assert_eq!(
            config.validate(),
            Err(TableConfigError::ShardCountMismatch {
                regions: 2,
                shards: 1
            })
        );
    }
}
