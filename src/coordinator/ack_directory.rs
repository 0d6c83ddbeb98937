/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The leader's record of the latest [`ContractAck`] of every (server, region) pair.

use std::collections::BTreeMap;

use crate::{
    raft::types::TableRaftState,
    types::{
        contract::ContractAck,
        data_types::{ContractId, ServerId},
        region::Region,
    },
};

/// Last-writer-wins map from (server, region) to the latest ack that the server sent for the region,
/// and the contract it acked.
///
/// Every execution acks the contract it is currently working on, and each ack supersedes the
/// previous one. Inserting an ack equal to the one already stored is a no-op.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractAckDirectory {
    acks: BTreeMap<(ServerId, Region), (ContractId, ContractAck)>,
}

impl ContractAckDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ack`, sent by `server` for `contract_id` on `region`. Returns whether the directory
    /// changed.
    pub fn insert(
        &mut self,
        server: ServerId,
        region: Region,
        contract_id: ContractId,
        ack: ContractAck,
    ) -> bool {
        let key = (server, region);
        match self.acks.get(&key) {
            Some((stored_id, stored_ack)) if *stored_id == contract_id && *stored_ack == ack => {
                false
            }
            _ => {
                self.acks.insert(key, (contract_id, ack));
                true
            }
        }
    }

    /// Get the latest ack of `server` for `region`, if it acked `contract_id`.
    pub fn get(
        &self,
        server: &ServerId,
        region: &Region,
        contract_id: &ContractId,
    ) -> Option<&ContractAck> {
        self.acks
            .get(&(*server, region.clone()))
            .filter(|(acked_id, _)| acked_id == contract_id)
            .map(|(_, ack)| ack)
    }

    /// Iterate over every stored ack.
    pub fn iter(&self) -> impl Iterator<Item = (&(ServerId, Region), &(ContractId, ContractAck))> {
        self.acks.iter()
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Remove the acks of regions that no longer exist in `state`, and of servers that their region's
    /// contract no longer mentions.
    pub fn prune(&mut self, state: &TableRaftState) {
        self.acks.retain(|(server, region), _| {
            state
                .region_to_contract
                .get(region)
                .map_or(false, |(_, contract)| contract.mentions(server))
        })
    }

    pub fn clear(&mut self) {
        self.acks.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::contract::AckState;

    fn server(byte: u8) -> ServerId {
        ServerId::new([byte; 32])
    }

    #[test]
    fn inserting_the_same_ack_twice_is_a_noop() {
        let mut directory = ContractAckDirectory::new();
        let ack = ContractAck::new(AckState::SecondaryStreaming);
        assert!(directory.insert(server(1), Region::universe(), ContractId::new(1), ack.clone()));
        let before = directory.clone();
        assert!(!directory.insert(server(1), Region::universe(), ContractId::new(1), ack));
        assert_eq!(directory, before);
    }

    #[test]
    fn later_acks_supersede_earlier_ones() {
        let mut directory = ContractAckDirectory::new();
        directory.insert(
            server(1),
            Region::universe(),
            ContractId::new(1),
            ContractAck::new(AckState::SecondaryBackfilling),
        );
        directory.insert(
            server(1),
            Region::universe(),
            ContractId::new(2),
            ContractAck::nothing(),
        );
        assert_eq!(directory.len(), 1);
        assert!(directory
            .get(&server(1), &Region::universe(), &ContractId::new(1))
            .is_none());
        assert_eq!(
            directory
                .get(&server(1), &Region::universe(), &ContractId::new(2))
                .map(|ack| ack.state),
            Some(AckState::Nothing)
        );
    }
}
