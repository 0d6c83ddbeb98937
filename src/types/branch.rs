/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Branches, versions, and the records that link them.
//!
//! A **branch** is a write-generation of one region: the sequence of writes accepted by one primary
//! between the moment it took over and the moment it was superseded. Every branch starts at a
//! **version** of some older branch (its *parent version*), so following parent links from any
//! version leads back to [`Version::zero`]. These links are what the
//! [branch history manager](crate::branch_history) stores, and what makes
//! [`is_ancestor`](crate::branch_history::BranchHistoryManager::is_ancestor) decidable.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    crypto_primitives::hash_parts,
    data_types::{ContractId, CryptoHash, ServerId, StateTimestamp},
    region::Region,
};

/// Identity of a branch: the SHA256 hash of its birth certificate, its creator, and the contract under
/// which it was created.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BranchId(CryptoHash);

impl BranchId {
    pub const fn new(hash: CryptoHash) -> Self {
        Self(hash)
    }

    /// The branch that every region is on before any primary has ever written to it.
    pub const fn nil() -> Self {
        Self(CryptoHash::new([0u8; 32]))
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::nil()
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0.bytes()
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            Display::fmt(&self.0, f)
        }
    }
}

/// A point in the history of a region: "the state after the write at `timestamp` on `branch`".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub const fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The version of a region that holds no data. It is an ancestor of every other version.
    pub const fn zero() -> Self {
        Self {
            branch: BranchId::nil(),
            timestamp: StateTimestamp::zero(),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

/// Range of versions held by a replica for one region.
///
/// A replica whose region was written atomically holds a single version, in which case `earliest` and
/// `latest` are equal. A replica that is midway through a backfill may hold keys from both its old
/// version (`earliest`) and the version it is backfilling to (`latest`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct VersionRange {
    pub earliest: Version,
    pub latest: Version,
}

impl VersionRange {
    /// Create a `VersionRange` that contains only `version`.
    pub const fn single(version: Version) -> Self {
        Self {
            earliest: version,
            latest: version,
        }
    }

    pub fn is_coherent(&self) -> bool {
        self.earliest == self.latest
    }
}

/// The record written when a branch is created.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BranchBirthCertificate {
    /// The region whose writes this branch holds.
    pub origin_region: Region,

    /// The timestamp of the first version on the branch. Equal to `parent_version.timestamp`.
    pub initial_timestamp: StateTimestamp,

    /// The version that this branch forked from.
    pub parent_version: Version,
}

impl BranchBirthCertificate {
    /// Create the birth certificate of a branch that forks `region` at `parent_version`.
    pub fn new(origin_region: Region, parent_version: Version) -> Self {
        Self {
            origin_region,
            initial_timestamp: parent_version.timestamp,
            parent_version,
        }
    }

    /// Compute the [`BranchId`] of the branch that `creator` is creating with this certificate under the
    /// contract identified by `contract`.
    pub fn branch_id(&self, creator: &ServerId, contract: ContractId) -> BranchId {
        let certificate_bytes = self.try_to_vec().unwrap_or_default();
        BranchId::new(hash_parts(&[
            &certificate_bytes,
            &creator.bytes(),
            &contract.int().to_le_bytes(),
        ]))
    }
}

/// A set of branch records, keyed by branch id.
///
/// `BranchHistory` values travel inside contract acks (so that a new primary can tell the table leader
/// about the branch it just created) and inside the replicated table state (so that every server learns
/// the lineage of every committed branch).
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BranchHistory {
    branches: BTreeMap<BranchId, BranchBirthCertificate>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self {
            branches: BTreeMap::new(),
        }
    }

    pub fn get(&self, branch: &BranchId) -> Option<&BranchBirthCertificate> {
        self.branches.get(branch)
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }

    /// Insert a record, unless a record for `branch` already exists.
    pub fn insert(&mut self, branch: BranchId, certificate: BranchBirthCertificate) {
        self.branches.entry(branch).or_insert(certificate);
    }

    /// Insert every record in `other` that this history does not already have.
    pub fn extend(&mut self, other: &BranchHistory) {
        for (branch, certificate) in other.iter() {
            self.insert(*branch, certificate.clone());
        }
    }

    pub fn remove(&mut self, branch: &BranchId) -> Option<BranchBirthCertificate> {
        self.branches.remove(branch)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BranchId, &BranchBirthCertificate)> {
        self.branches.iter()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

impl FromIterator<(BranchId, BranchBirthCertificate)> for BranchHistory {
    fn from_iter<T: IntoIterator<Item = (BranchId, BranchBirthCertificate)>>(iter: T) -> Self {
        let mut history = BranchHistory::new();
        for (branch, certificate) in iter {
            history.insert(branch, certificate);
        }
        history
    }
}
