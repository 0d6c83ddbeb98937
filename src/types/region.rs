/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Contiguous slices of a table's primary-key space.
//!
//! A table's key space is the set of all byte strings. A [`Region`] is a half-open interval
//! `[left, right)` of that space, where an absent `right` bound means "up to and including the greatest
//! key". The regions named by a table's committed contracts always [partition](is_partition) the whole
//! key space.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

/// Half-open interval `[left, right)` of the primary-key space of a table.
///
/// Regions are immutable values. They are ordered first by `left`, which means that sorting the regions
/// of a partition puts them in key order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Region {
    left: Vec<u8>,
    right: Option<Vec<u8>>,
}

impl Region {
    /// Create a region covering `[left, right)`, or `None` if the interval would be empty.
    pub fn new(left: Vec<u8>, right: Option<Vec<u8>>) -> Option<Region> {
        match &right {
            Some(right) if *right <= left => None,
            _ => Some(Region { left, right }),
        }
    }

    /// The region that covers the whole key space.
    pub fn universe() -> Region {
        Region {
            left: Vec::new(),
            right: None,
        }
    }

    /// Split the whole key space at `split_points` into consecutive regions.
    ///
    /// Returns `None` if `split_points` is not strictly increasing or contains the empty key.
    pub fn split_universe(split_points: &[Vec<u8>]) -> Option<Vec<Region>> {
        let mut regions = Vec::with_capacity(split_points.len() + 1);
        let mut left = Vec::new();
        for point in split_points {
            regions.push(Region::new(left, Some(point.clone()))?);
            left = point.clone();
        }
        regions.push(Region { left, right: None });
        Some(regions)
    }

    pub fn left(&self) -> &[u8] {
        &self.left
    }

    pub fn right(&self) -> Option<&[u8]> {
        self.right.as_deref()
    }

    /// Check whether `key` falls inside this region.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.left.as_slice()
            && match &self.right {
                Some(right) => key < right.as_slice(),
                None => true,
            }
    }

    /// Check whether every key of `other` is also in this region.
    pub fn contains_region(&self, other: &Region) -> bool {
        other.left >= self.left
            && match (&self.right, &other.right) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(right), Some(other_right)) => other_right <= right,
            }
    }

    /// Check whether this region and `other` have at least one key in common.
    pub fn overlaps(&self, other: &Region) -> bool {
        let self_before_other = match &self.right {
            Some(right) => *right <= other.left,
            None => false,
        };
        let other_before_self = match &other.right {
            Some(right) => *right <= self.left,
            None => false,
        };
        !self_before_other && !other_before_self
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, ", hex(&self.left))?;
        match &self.right {
            Some(right) => write!(f, "{})", hex(right)),
            None => write!(f, "+inf)"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::from("-inf");
    }
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Check whether `regions` exactly partition the whole key space, with no gaps and no overlaps.
pub fn is_partition<'a>(regions: impl IntoIterator<Item = &'a Region>) -> bool {
    let mut sorted: Vec<&Region> = regions.into_iter().collect();
    sorted.sort();

    let mut expected_left: Vec<u8> = Vec::new();
    for (i, region) in sorted.iter().enumerate() {
        if region.left != expected_left {
            return false;
        }
        match &region.right {
            Some(right) => expected_left = right.clone(),
            None => return i == sorted.len() - 1,
        }
    }

    // Either there were no regions, or the last region had a right bound.
    false
}
