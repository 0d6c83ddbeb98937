/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The predicate that decides whether enough replicas of a region have caught up.

use borsh::{BorshDeserialize, BorshSerialize};

/// How many of a contract's `replicas` must be streaming before the contract counts as settled.
///
/// Used in two places:
/// 1. A [primary execution](crate::execution) only becomes *ready* (and accepts writes) once the quorum,
///    counting the primary itself, is streaming under its branch.
/// 2. The [coordinator](super) only picks a failover primary once a quorum of the region's replicas
///    has reported on the current contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum AckQuorum {
    /// More than half of the replicas.
    #[default]
    Majority,

    /// Every replica.
    All,
}

impl AckQuorum {
    /// Check whether `acked` out of `total` replicas satisfy the quorum.
    pub fn is_satisfied(&self, acked: usize, total: usize) -> bool {
        match self {
            AckQuorum::Majority => acked > total / 2,
            AckQuorum::All => acked >= total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_and_all() {
        assert!(AckQuorum::Majority.is_satisfied(2, 3));
        assert!(!AckQuorum::Majority.is_satisfied(1, 2));
        assert!(AckQuorum::Majority.is_satisfied(1, 1));
        assert!(AckQuorum::All.is_satisfied(3, 3));
        assert!(!AckQuorum::All.is_satisfied(2, 3));
    }
}
