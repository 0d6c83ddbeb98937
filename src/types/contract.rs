/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Desired and actual replication state of one region.
//!
//! A [`Contract`] is what the table's Raft log says *should* happen to a region: which servers hold
//! it, which of them accepts writes, and under which branch. A [`ContractAck`] is what one server says
//! it is *actually* doing about that contract. The table leader compares the two to decide on the next
//! contract.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    branch::{BranchHistory, BranchId, Version, VersionRange},
    data_types::ServerId,
};

/// The committed, desired replication configuration of one region.
///
/// Contracts are immutable values: a new desired state is a new `Contract` (with a new
/// [`ContractId`](super::data_types::ContractId)), never a mutation of an old one.
///
/// ## Invariants
///
/// 1. `primary`, if present, is in `replicas`.
/// 2. `replicas` and `temporary_extra_replicas` are disjoint.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Contract {
    /// Servers that should hold an up-to-date copy of the region.
    pub replicas: BTreeSet<ServerId>,

    /// The server that accepts writes for the region. `None` while a new primary is being chosen.
    pub primary: Option<ServerId>,

    /// The branch that writes to the region are currently accepted under.
    pub branch: BranchId,

    /// Servers that are leaving the region. These servers erase their copy and are dropped from the
    /// contract once they acknowledge [`AckState::Nothing`].
    pub temporary_extra_replicas: BTreeSet<ServerId>,
}

impl Contract {
    pub fn new(replicas: BTreeSet<ServerId>, primary: Option<ServerId>, branch: BranchId) -> Self {
        Self {
            replicas,
            primary,
            branch,
            temporary_extra_replicas: BTreeSet::new(),
        }
    }

    /// Check the contract's invariants.
    pub fn is_well_formed(&self) -> bool {
        self.primary
            .map_or(true, |primary| self.replicas.contains(&primary))
            && self.replicas.is_disjoint(&self.temporary_extra_replicas)
    }

    /// Check whether `server` is named anywhere in this contract.
    pub fn mentions(&self, server: &ServerId) -> bool {
        self.replicas.contains(server) || self.temporary_extra_replicas.contains(server)
    }

    /// Iterate over every server named in this contract.
    pub fn all_servers(&self) -> impl Iterator<Item = &ServerId> {
        self.replicas.iter().chain(self.temporary_extra_replicas.iter())
    }
}

/// What a server is doing about a contract.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub enum AckState {
    /// The server holds no usable data for the region. Sent by erasing servers, including servers
    /// that are about to erase but have not finished yet.
    Nothing,

    /// A secondary that has not yet made contact with the contract's primary.
    SecondaryNeedPrimary,

    /// A secondary that is copying the region from the primary.
    SecondaryBackfilling,

    /// A secondary that has caught up and is live-tailing the primary's writes.
    SecondaryStreaming,

    /// A primary that has created a branch and is waiting for the leader to commit it.
    PrimaryNeedBranch,

    /// A primary whose branch is committed, but without a quorum of streaming secondaries.
    PrimaryInProgress,

    /// A primary that accepts writes.
    PrimaryReady,
}

impl AckState {
    /// Check whether the acking server holds a copy of the region that is kept up to date with the
    /// primary's writes.
    pub fn is_at_least_streaming(&self) -> bool {
        matches!(self, AckState::SecondaryStreaming | AckState::PrimaryReady)
    }

    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            AckState::PrimaryNeedBranch | AckState::PrimaryInProgress | AckState::PrimaryReady
        )
    }
}

/// A server's report of its actual execution state for one region's contract.
///
/// Sent by exactly one execution per (region, server) pair. Each ack supersedes the previous ack of
/// the same pair in the leader's [ack directory](crate::coordinator::ack_directory).
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ContractAck {
    pub state: AckState,

    /// For primaries: the branch the primary created. For secondaries: the branch they follow.
    pub branch: Option<BranchId>,

    /// The versions of the data held by the server.
    pub version: Option<VersionRange>,

    /// Records needed to interpret `branch` and `version`. Only sent with
    /// [`AckState::PrimaryNeedBranch`].
    pub branch_history: BranchHistory,
}

impl ContractAck {
    /// Create an ack that carries only a state.
    pub fn new(state: AckState) -> Self {
        Self {
            state,
            branch: None,
            version: None,
            branch_history: BranchHistory::new(),
        }
    }

    /// The ack of a server that holds no usable data.
    pub fn nothing() -> Self {
        Self::new(AckState::Nothing)
    }

    pub fn with_branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(VersionRange::single(version));
        self
    }

    pub fn with_branch_history(mut self, branch_history: BranchHistory) -> Self {
        self.branch_history = branch_history;
        self
    }

    /// The most recent version this ack reports, if any.
    pub fn latest_version(&self) -> Option<Version> {
        self.version.map(|range| range.latest)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn server(byte: u8) -> ServerId {
        ServerId::new([byte; 32])
    }

    #[test]
    fn well_formed_contracts() {
        let replicas: BTreeSet<ServerId> = [server(1), server(2)].into_iter().collect();
        let mut contract = Contract::new(replicas, Some(server(1)), BranchId::nil());
        assert!(contract.is_well_formed());

        contract.primary = Some(server(3));
        assert!(!contract.is_well_formed());

        contract.primary = None;
        contract.temporary_extra_replicas.insert(server(2));
        assert!(!contract.is_well_formed());
    }

    #[test]
    fn streaming_states() {
        assert!(AckState::SecondaryStreaming.is_at_least_streaming());
        assert!(AckState::PrimaryReady.is_at_least_streaming());
        assert!(!AckState::SecondaryBackfilling.is_at_least_streaming());
        assert!(!AckState::PrimaryInProgress.is_at_least_streaming());
        assert!(!AckState::Nothing.is_at_least_streaming());
    }
}
