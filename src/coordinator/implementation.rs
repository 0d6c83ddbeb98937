/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The leader's decision procedure: given the committed state, the ack directory, and the set of live
//! servers, decide on the next change to propose.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    raft::types::{TableChange, TableRaftState},
    types::{
        branch::{BranchHistory, BranchId},
        contract::{AckState, Contract, ContractAck},
        data_types::{ContractId, RaftMemberId, ServerId},
        region::Region,
        table_config::ShardConfig,
    },
};

use super::{ack_directory::ContractAckDirectory, quorum::AckQuorum};

/// Decide on the next change that the leader should propose, if any.
///
/// Contract transitions take priority over membership changes. All regions whose contracts should
/// change are changed in a single [`UpdateContracts`](TableChange::UpdateContracts).
pub(crate) fn coordinate(
    state: &TableRaftState,
    acks: &ContractAckDirectory,
    live: &BTreeSet<ServerId>,
    quorum: AckQuorum,
) -> Option<TableChange> {
    let mut contracts = BTreeMap::new();
    let mut branch_history = BranchHistory::new();

    for (region, (contract_id, contract)) in &state.region_to_contract {
        let shard = match state.config.shard_for_region(region) {
            Some(shard) => shard,
            None => continue,
        };
        let acked = RegionAcks {
            acks,
            region,
            contract_id,
        };
        let (new_contract, new_branches) =
            next_contract(state, shard, contract, &acked, live, quorum);
        if new_contract != *contract {
            debug_assert!(new_contract.is_well_formed());
            branch_history.extend(&new_branches);
            contracts.insert(region.clone(), (ContractId::generate(), new_contract));
        }
    }

    if !contracts.is_empty() {
        let branch_history = retained_branch_history(state, acks, &contracts, &branch_history);
        return Some(TableChange::UpdateContracts {
            contracts,
            branch_history,
        });
    }

    next_membership_change(state)
}

/// The acks that the servers sent for the current contract of one region.
struct RegionAcks<'a> {
    acks: &'a ContractAckDirectory,
    region: &'a Region,
    contract_id: &'a ContractId,
}

impl<'a> RegionAcks<'a> {
    fn of(&self, server: &ServerId) -> Option<&'a ContractAck> {
        self.acks.get(server, self.region, self.contract_id)
    }

    fn state_of(&self, server: &ServerId) -> Option<AckState> {
        self.of(server).map(|ack| ack.state)
    }
}

fn next_contract(
    state: &TableRaftState,
    shard: &ShardConfig,
    contract: &Contract,
    acks: &RegionAcks,
    live: &BTreeSet<ServerId>,
    quorum: AckQuorum,
) -> (Contract, BranchHistory) {
    let mut new = contract.clone();
    let mut branch_history = BranchHistory::new();

    // 1. Servers that left the region are dropped once they hold nothing.
    new.temporary_extra_replicas
        .retain(|server| acks.state_of(server) != Some(AckState::Nothing));

    // 2. A primary that stopped responding loses the role.
    if let Some(primary) = new.primary {
        if !live.contains(&primary) {
            log::debug!("Primary {} of {} is not live", primary, acks.region);
            new.primary = None;
        }
    }

    // 3. A primary that created a branch gets it committed.
    if let Some(primary) = new.primary {
        if let Some(ack) = acks.of(&primary) {
            if let (AckState::PrimaryNeedBranch, Some(branch)) = (ack.state, ack.branch) {
                if branch != contract.branch && ack.branch_history.contains(&branch) {
                    new.branch = branch;
                    branch_history.extend(&ack.branch_history);
                }
            }
        }
    }

    // 4. Replicas that the config no longer names leave the region, once the replicas that stay have
    //    caught up. The primary is never removed directly: step 7 fences it first.
    let primary_is_ready =
        new.primary.and_then(|primary| acks.state_of(&primary)) == Some(AckState::PrimaryReady);
    let staying_streaming = shard
        .replicas
        .iter()
        .filter(|server| new.replicas.contains(server))
        .filter(|server| {
            acks.state_of(server)
                .map_or(false, |state| state.is_at_least_streaming())
        })
        .count();
    if primary_is_ready && quorum.is_satisfied(staying_streaming, shard.replicas.len()) {
        let leaving: Vec<ServerId> = new
            .replicas
            .iter()
            .filter(|server| !shard.replicas.contains(server) && Some(**server) != new.primary)
            .copied()
            .collect();
        for server in leaving {
            new.replicas.remove(&server);
            new.temporary_extra_replicas.insert(server);
        }
    }

    // 5. Replicas that the config names join the region, once they are members of the table.
    for server in &shard.replicas {
        if !new.replicas.contains(server) && state.member_ids.contains_key(server) {
            new.temporary_extra_replicas.remove(server);
            new.replicas.insert(*server);
        }
    }

    // 6. A region without a primary gets the most up-to-date live replica as its primary, once enough
    //    replicas have reported on the current contract.
    if new.primary.is_none() {
        new.primary = pick_failover_primary(shard, contract, &new, acks, live, quorum);
        if let Some(primary) = new.primary {
            log::debug!("Picked {} as the new primary of {}", primary, acks.region);
        }
    }

    // 7. A ready primary that the config no longer names is fenced once the configured primary is
    //    streaming: the region goes without a primary until step 6 picks the replica holding the fenced
    //    primary's last write.
    if let Some(primary) = new.primary {
        let configured = shard.primary;
        if configured != primary
            && new.replicas.contains(&configured)
            && live.contains(&configured)
            && acks.state_of(&primary) == Some(AckState::PrimaryReady)
            && acks.of(&configured).map_or(false, |ack| {
                ack.state == AckState::SecondaryStreaming && ack.branch == Some(contract.branch)
            })
        {
            log::debug!(
                "Fencing primary {} of {} to hand it over to {}",
                primary,
                acks.region,
                configured
            );
            new.primary = None;
        }
    }

    (new, branch_history)
}

/// Pick the replica that holds the most recent data of the region.
///
/// Every live replica must have acked the current contract first: until a former primary acks a
/// contract that does not name it, it may still be accepting writes. Replicas in the middle of a
/// backfill hold a mix of two versions, and are only picked if no other replica can be.
fn pick_failover_primary(
    shard: &ShardConfig,
    contract: &Contract,
    new: &Contract,
    acks: &RegionAcks,
    live: &BTreeSet<ServerId>,
    quorum: AckQuorum,
) -> Option<ServerId> {
    let reported = contract
        .replicas
        .iter()
        .filter(|server| acks.of(server).is_some())
        .count();
    if !quorum.is_satisfied(reported, contract.replicas.len()) {
        return None;
    }
    if contract
        .replicas
        .iter()
        .any(|server| live.contains(server) && acks.of(server).is_none())
    {
        return None;
    }

    new.replicas
        .iter()
        .filter(|server| live.contains(server))
        .filter_map(|server| {
            let ack = acks.of(server)?;
            if ack.state == AckState::Nothing {
                return None;
            }
            let coherent = ack.state != AckState::SecondaryBackfilling;
            let version = ack.latest_version();
            let on_current_branch = version.map_or(false, |v| v.branch == contract.branch)
                || contract.branch == BranchId::nil();
            let timestamp = version.map(|v| v.timestamp).unwrap_or_default();
            let rank = (coherent, on_current_branch, timestamp, *server == shard.primary);
            Some((rank, *server))
        })
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, server)| server)
}

/// Select the records that the servers of every region may still need after `contracts` commit.
///
/// For each region, that is the lineage of the contract's branch down to the oldest branch that a server
/// of the region last acked a version on. Older records are dropped: a server whose version lies below
/// the retained lineage gets a full backfill, the same as a server on an unrelated branch.
fn retained_branch_history(
    state: &TableRaftState,
    acks: &ContractAckDirectory,
    contracts: &BTreeMap<Region, (ContractId, Contract)>,
    new_branches: &BranchHistory,
) -> BranchHistory {
    let mut known = state.branch_history.clone();
    known.extend(new_branches);

    let mut retained = BranchHistory::new();
    for (region, (_, contract)) in &state.region_to_contract {
        let contract = contracts.get(region).map_or(contract, |(_, new)| new);
        let acked: BTreeSet<BranchId> = acks
            .iter()
            .filter(|((server, acked_region), _)| acked_region == region && contract.mentions(server))
            .filter_map(|(_, (_, ack))| ack.version)
            .flat_map(|range| [range.earliest.branch, range.latest.branch])
            .collect();

        let mut lineage = Vec::new();
        let mut branch = contract.branch;
        while let Some(certificate) = known.get(&branch) {
            if lineage.iter().any(|(seen, _)| *seen == branch) {
                break;
            }
            lineage.push((branch, certificate));
            branch = certificate.parent_version.branch;
        }

        let keep = lineage
            .iter()
            .rposition(|(branch, _)| acked.contains(branch))
            .map_or(1, |oldest| oldest + 1);
        for (branch, certificate) in lineage.into_iter().take(keep) {
            retained.insert(branch, certificate.clone());
        }
    }
    retained
}

/// Add one configured server that is not a member yet, or else remove one member that the table no
/// longer needs.
fn next_membership_change(state: &TableRaftState) -> Option<TableChange> {
    let configured = state.config.all_servers();
    if let Some(server) = configured
        .iter()
        .find(|server| !state.member_ids.contains_key(server))
    {
        return Some(TableChange::AddMember {
            server: *server,
            member: RaftMemberId::generate(),
        });
    }

    let still_needed = |server: &ServerId| {
        configured.contains(server)
            || state
                .region_to_contract
                .values()
                .any(|(_, contract)| contract.mentions(server))
    };
    let unneeded = state
        .member_ids
        .keys()
        .find(|server| !still_needed(server))?;
    // The last member is never removed.
    if state.member_ids.len() <= 1 {
        return None;
    }
    Some(TableChange::RemoveMember { server: *unneeded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        raft::types::RaftLogEntry,
        types::{
            branch::{BranchBirthCertificate, Version},
            data_types::{StateTimestamp, Term},
            table_config::TableConfig,
        },
    };

    fn server(byte: u8) -> ServerId {
        ServerId::new([byte; 32])
    }

    fn servers(bytes: &[u8]) -> BTreeSet<ServerId> {
        bytes.iter().map(|byte| server(*byte)).collect()
    }

    fn branch(byte: u8) -> BranchId {
        BranchBirthCertificate::new(Region::universe(), Version::zero())
            .branch_id(&server(byte), ContractId::new(byte as u64))
    }

    fn config(replicas: &[u8], primary: u8) -> TableConfig {
        TableConfig {
            name: String::from("t"),
            split_points: Vec::new(),
            shards: vec![ShardConfig {
                replicas: servers(replicas),
                primary: server(primary),
            }],
            sindexes: BTreeSet::new(),
        }
    }

    fn state_with(config: TableConfig, contract: Contract) -> TableRaftState {
        let mut state = TableRaftState::new_table(config).unwrap();
        for byte in 1..=3 {
            state.member_ids.insert(server(byte), RaftMemberId::new(byte as u64));
        }
        state
            .region_to_contract
            .insert(Region::universe(), (ContractId::new(7), contract));
        state
    }

    fn ack(directory: &mut ContractAckDirectory, byte: u8, ack: ContractAck) {
        directory.insert(server(byte), Region::universe(), ContractId::new(7), ack);
    }

    fn only_contract(change: Option<TableChange>) -> Contract {
        match change {
            Some(TableChange::UpdateContracts { contracts, .. }) => {
                contracts.into_values().next().unwrap().1
            }
            other => panic!("expected a contract update, got {:?}", other),
        }
    }

    fn commit(state: &mut TableRaftState, change: Option<TableChange>) {
        let change = change.expect("a change to commit");
        let index = state.log_index + 1;
        state.apply(&RaftLogEntry {
            term: Term::new(1),
            index,
            change,
        });
    }

    fn streaming(on: BranchId, timestamp: u64) -> ContractAck {
        ContractAck::new(AckState::SecondaryStreaming)
            .with_branch(on)
            .with_version(Version::new(on, StateTimestamp::new(timestamp)))
    }

    fn ready(on: BranchId, timestamp: u64) -> ContractAck {
        ContractAck::new(AckState::PrimaryReady)
            .with_branch(on)
            .with_version(Version::new(on, StateTimestamp::new(timestamp)))
    }

    fn need_primary(on: BranchId, timestamp: u64) -> ContractAck {
        ContractAck::new(AckState::SecondaryNeedPrimary)
            .with_version(Version::new(on, StateTimestamp::new(timestamp)))
    }

    #[test]
    fn settled_contract_stays_unchanged() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), b1);
        let mut state = state_with(config(&[1, 2], 1), contract);
        state.member_ids.remove(&server(3));
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 5));
        ack(&mut acks, 2, streaming(b1, 5));

        let change = coordinate(&state, &acks, &servers(&[1, 2]), AckQuorum::Majority);
        assert_eq!(change, None);
    }

    #[test]
    fn need_branch_gets_committed_with_its_history() {
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), BranchId::nil());
        let state = state_with(config(&[1, 2, 3], 1), contract);
        let certificate = BranchBirthCertificate::new(Region::universe(), Version::zero());
        let b1 = certificate.branch_id(&server(1), ContractId::new(7));
        let mut history = BranchHistory::new();
        history.insert(b1, certificate);

        let mut acks = ContractAckDirectory::new();
        ack(
            &mut acks,
            1,
            ContractAck::new(AckState::PrimaryNeedBranch)
                .with_branch(b1)
                .with_version(Version::zero())
                .with_branch_history(history),
        );

        match coordinate(&state, &acks, &servers(&[1, 2, 3]), AckQuorum::Majority) {
            Some(TableChange::UpdateContracts {
                contracts,
                branch_history,
            }) => {
                let (_, contract) = &contracts[&Region::universe()];
                assert_eq!(contract.branch, b1);
                assert!(branch_history.contains(&b1));
                // Server 3 is a member named by the config, so it joins at the same time.
                assert!(contract.replicas.contains(&server(3)));
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn replicas_are_only_dropped_after_acking_nothing() {
        let b1 = branch(1);
        let mut contract = Contract::new(servers(&[1, 2]), Some(server(1)), b1);
        contract.temporary_extra_replicas.insert(server(3));
        let state = state_with(config(&[1, 2], 1), contract);

        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 5));
        ack(&mut acks, 2, streaming(b1, 5));
        ack(&mut acks, 3, streaming(b1, 5));
        let live = servers(&[1, 2, 3]);
        // Server 3 is not in the config, but still holds data.
        assert_eq!(coordinate(&state, &acks, &live, AckQuorum::Majority), None);

        ack(&mut acks, 3, ContractAck::nothing());
        let contract = only_contract(coordinate(&state, &acks, &live, AckQuorum::Majority));
        assert!(!contract.mentions(&server(3)));
    }

    #[test]
    fn replicas_leave_through_the_extras() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(1)), b1);
        let state = state_with(config(&[1, 2], 1), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 5));
        ack(&mut acks, 2, streaming(b1, 5));

        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[1, 2, 3]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.replicas, servers(&[1, 2]));
        assert_eq!(contract.temporary_extra_replicas, servers(&[3]));
    }

    #[test]
    fn removed_primary_is_fenced_before_the_hand_over() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), b1);
        let state = state_with(config(&[2], 2), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 5));
        ack(&mut acks, 2, streaming(b1, 5));

        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[1, 2]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.primary, None);
        assert_eq!(contract.branch, b1);
        assert!(contract.replicas.contains(&server(1)));
    }

    #[test]
    fn hand_over_waits_for_the_configured_primary_to_catch_up() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2]), None, b1);
        let state = state_with(config(&[2], 2), contract);
        let live = servers(&[1, 2]);

        // Server 1 was the primary, and its last write never reached server 2.
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, need_primary(b1, 6));
        ack(&mut acks, 2, streaming(b1, 5));
        let contract = only_contract(coordinate(&state, &acks, &live, AckQuorum::Majority));
        assert_eq!(contract.primary, Some(server(1)));

        ack(&mut acks, 2, streaming(b1, 6));
        let contract = only_contract(coordinate(&state, &acks, &live, AckQuorum::Majority));
        assert_eq!(contract.primary, Some(server(2)));
        assert_eq!(contract.branch, b1);
    }

    #[test]
    fn live_replicas_must_ack_before_a_primary_is_picked() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2, 3]), None, b1);
        let state = state_with(config(&[1, 2, 3], 2), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 2, streaming(b1, 5));
        ack(&mut acks, 3, streaming(b1, 5));

        // Server 1 is live but has not acked, so it may still be taking writes.
        assert_eq!(
            coordinate(&state, &acks, &servers(&[1, 2, 3]), AckQuorum::Majority),
            None
        );

        ack(&mut acks, 1, need_primary(b1, 5));
        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[1, 2, 3]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.primary, Some(server(2)));
    }

    #[test]
    fn failover_prefers_replicas_that_are_not_backfilling() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(1)), b1);
        let state = state_with(config(&[1, 2, 3], 1), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 12));
        ack(
            &mut acks,
            2,
            ContractAck::new(AckState::SecondaryBackfilling)
                .with_branch(b1)
                .with_version(Version::new(b1, StateTimestamp::new(9))),
        );
        ack(&mut acks, 3, streaming(b1, 4));

        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[2, 3]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.primary, Some(server(3)));
    }

    #[test]
    fn dead_primary_fails_over_to_the_most_recent_replica() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(1)), b1);
        let state = state_with(config(&[1, 2, 3], 1), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 9));
        ack(&mut acks, 2, streaming(b1, 4));
        ack(&mut acks, 3, streaming(b1, 8));

        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[2, 3]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.primary, Some(server(3)));
        assert_eq!(contract.branch, b1);
    }

    #[test]
    fn failover_waits_for_a_quorum_of_acks() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(1)), b1);
        let state = state_with(config(&[1, 2, 3], 1), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 3, streaming(b1, 8));

        let contract = only_contract(coordinate(
            &state,
            &acks,
            &servers(&[2, 3]),
            AckQuorum::Majority,
        ));
        assert_eq!(contract.primary, None);
    }

    #[test]
    fn configured_servers_become_members_first() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1]), Some(server(1)), b1);
        let mut state = state_with(config(&[1, 4], 1), contract);
        state.member_ids.remove(&server(2));
        state.member_ids.remove(&server(3));
        state.member_ids.remove(&server(4));
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 1));

        match coordinate(&state, &acks, &servers(&[1]), AckQuorum::Majority) {
            Some(TableChange::AddMember { server: added, .. }) => assert_eq!(added, server(4)),
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn unneeded_members_are_removed() {
        let b1 = branch(1);
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), b1);
        let state = state_with(config(&[1, 2], 1), contract);
        let mut acks = ContractAckDirectory::new();
        ack(&mut acks, 1, ready(b1, 1));
        ack(&mut acks, 2, streaming(b1, 1));

        assert_eq!(
            coordinate(&state, &acks, &servers(&[1, 2]), AckQuorum::Majority),
            Some(TableChange::RemoveMember { server: server(3) })
        );
    }

    #[test]
    fn branch_history_stays_bounded_across_failovers() {
        let certificate = BranchBirthCertificate::new(Region::universe(), Version::zero());
        let first = certificate.branch_id(&server(1), ContractId::new(7));
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), first);
        let mut state = state_with(config(&[1, 2], 1), contract);
        state.member_ids.remove(&server(3));
        state.branch_history.insert(first, certificate);

        let region = Region::universe();
        let mut acks = ContractAckDirectory::new();
        for round in 1..=10u64 {
            let (old_primary, new_primary) = if round % 2 == 1 { (1, 2) } else { (2, 1) };
            let at = Version::new(
                state.region_to_contract[&region].1.branch,
                StateTimestamp::new(round * 10),
            );

            // The primary stops responding, and the other replica takes over.
            let contract_id = state.region_to_contract[&region].0;
            let (old_ack, new_ack) = (ready(at.branch, round * 10), streaming(at.branch, round * 10));
            acks.insert(server(old_primary), region.clone(), contract_id, old_ack);
            acks.insert(server(new_primary), region.clone(), contract_id, new_ack);
            let live = servers(&[new_primary]);
            let change = coordinate(&state, &acks, &live, AckQuorum::Majority);
            commit(&mut state, change);
            let primary = state.region_to_contract[&region].1.primary;
            assert_eq!(primary, Some(server(new_primary)));

            // The new primary creates a branch, and the old primary comes back as a secondary.
            let contract_id = state.region_to_contract[&region].0;
            let certificate = BranchBirthCertificate::new(region.clone(), at);
            let branch = certificate.branch_id(&server(new_primary), contract_id);
            let mut history = state.branch_history.clone();
            history.insert(branch, certificate);
            acks.insert(
                server(new_primary),
                region.clone(),
                contract_id,
                ContractAck::new(AckState::PrimaryNeedBranch)
                    .with_branch(branch)
                    .with_version(at)
                    .with_branch_history(history),
            );
            let old_ack = need_primary(at.branch, round * 10);
            acks.insert(server(old_primary), region.clone(), contract_id, old_ack);
            let change = coordinate(&state, &acks, &servers(&[1, 2]), AckQuorum::Majority);
            commit(&mut state, change);

            assert_eq!(state.region_to_contract[&region].1.branch, branch);
            assert!(state.branch_history.contains(&branch));
            assert!(state.branch_history.len() <= 2);
        }
        assert!(!state.branch_history.contains(&first));
    }
}
