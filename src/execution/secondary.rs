/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of a server that holds a copy of a region but does not accept writes for it.
//!
//! ## Sub-states
//!
//! 1. **Need primary**: the secondary asks the contract's primary for a backfill, repeating the request
//!    every `backfill_retry_ticks` until the first chunk arrives. If the contract names no primary, or
//!    names the nil branch, there is no one to ask yet.
//! 2. **Backfilling**: the secondary applies backfill chunks in order. If the first chunk says so, it
//!    resets the region first.
//! 3. **Streaming**: after the last chunk, the secondary tells the primary it is streaming and applies
//!    the primary's writes in timestamp order. A secondary is additionally *up to date* when its version
//!    equals the version in the primary's latest heartbeat.
//!
//! ## Fencing
//!
//! A secondary only accepts messages that come from the primary of its current contract and carry the
//! branch of its current contract. A primary whose branch was superseded can therefore not make a
//! secondary that has seen the new contract apply another write.
//!
//! The one exception is a contract that keeps the branch and names no primary, which the leader
//! commits to fence a primary it is about to replace. The fenced primary stops accepting writes when it
//! sees that contract, so the writes it still streams under the unchanged branch are the last ones it
//! acknowledged, and the secondary keeps applying them.

use std::collections::BTreeMap;

use crate::{
    networking::network::Network,
    persistence::pluggables::KVStore,
    storage::{Durability, StoreView, StoredValue},
    types::{
        branch::{BranchId, Version},
        contract::{AckState, ContractAck},
        data_types::{ServerId, StateTimestamp, Ticks},
    },
};

use super::{
    context::ExecutionContext,
    messages::{
        BackfillChunk, BackfillRequest, ExecutionMessage, PrimaryHeartbeat, ReplicationWrite,
        StreamingConfirmed,
    },
    ExecutionError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SecondaryState {
    NeedPrimary,
    Backfilling { next_chunk: u32 },
    Streaming,
}

pub(crate) struct SecondaryExecution {
    state: SecondaryState,

    // The primary and branch of the contract this execution follows.
    primary: Option<ServerId>,
    branch: BranchId,

    applied: Version,
    backfill_start: Version,
    pending_writes: BTreeMap<StateTimestamp, ReplicationWrite>,
    latest_heartbeat: Option<Version>,
    ticks_since_request: Ticks,
    ticks_behind: Ticks,
}

impl SecondaryExecution {
    pub(crate) fn new() -> Self {
        Self {
            state: SecondaryState::NeedPrimary,
            primary: None,
            branch: BranchId::nil(),
            applied: Version::zero(),
            backfill_start: Version::zero(),
            pending_writes: BTreeMap::new(),
            latest_heartbeat: None,
            ticks_since_request: 0,
            ticks_behind: 0,
        }
    }

    pub(crate) fn start<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        self.applied = ctx.store.metainfo(&ctx.region).unwrap_or(Version::zero());
        self.follow(ctx)
    }

    /// Stay with the current primary if the new contract keeps both the primary and the branch, and start
    /// over otherwise.
    ///
    /// A contract that keeps the branch but names no primary fences the current primary. The writes it
    /// streamed before it stopped are still on this branch, so they keep being applied.
    pub(crate) fn on_contract_update<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        let fenced = ctx.contract().primary.is_none() && ctx.contract().branch == self.branch;
        if !fenced && (ctx.contract().primary != self.primary || ctx.contract().branch != self.branch) {
            return self.follow(ctx);
        }
        self.send_ack(ctx);
        Ok(())
    }

    pub(crate) fn on_receive_msg<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        origin: ServerId,
        msg: ExecutionMessage,
    ) -> Result<(), ExecutionError> {
        let branch = match &msg {
            ExecutionMessage::BackfillChunk(chunk) => chunk.branch,
            ExecutionMessage::ReplicationWrite(write) => write.branch,
            ExecutionMessage::PrimaryHeartbeat(heartbeat) => heartbeat.branch,
            ExecutionMessage::BackfillRequest(_) | ExecutionMessage::StreamingConfirmed(_) => {
                return Ok(())
            }
        };
        if self.primary != Some(origin) || branch != self.branch || branch.is_nil() {
            log::debug!(
                "Secondary of {} in table {} dropping a message from {} under branch {}",
                ctx.region,
                ctx.table,
                origin,
                branch
            );
            return Ok(());
        }

        match msg {
            ExecutionMessage::BackfillChunk(chunk) => self.on_receive_backfill_chunk(ctx, chunk),
            ExecutionMessage::ReplicationWrite(write) => self.on_receive_write(ctx, write),
            ExecutionMessage::PrimaryHeartbeat(heartbeat) => {
                self.on_receive_heartbeat(ctx, heartbeat);
                Ok(())
            }
            ExecutionMessage::BackfillRequest(_) | ExecutionMessage::StreamingConfirmed(_) => Ok(()),
        }
    }

    fn on_receive_backfill_chunk<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        chunk: BackfillChunk,
    ) -> Result<(), ExecutionError> {
        // Every backfill starts at chunk 0, so chunk 0 (re)starts a backfill unless one already finished.
        // Other chunks are only accepted in order.
        let accept = match self.state {
            SecondaryState::NeedPrimary => chunk.index == 0,
            SecondaryState::Backfilling { next_chunk } => {
                chunk.index == 0 || chunk.index == next_chunk
            }
            SecondaryState::Streaming => false,
        };
        if !accept {
            return Ok(());
        }

        if chunk.index == 0 {
            if chunk.reset {
                let region = ctx.region.clone();
                let interruptor = ctx.interruptor.clone();
                ctx.store
                    .reset_data(Version::zero(), &region, Durability::Soft, &interruptor)?;
                self.applied = Version::zero();
            }
            self.backfill_start = self.applied;
        }

        for (key, stored) in chunk.items {
            ctx.interruptor.check()?;
            ctx.store.write(&key, stored, Durability::Soft)?;
        }
        self.state = SecondaryState::Backfilling {
            next_chunk: chunk.index + 1,
        };

        if let Some(last) = chunk.last {
            self.applied = last;
            let region = ctx.region.clone();
            ctx.store.set_metainfo(&region, last, Durability::Hard)?;
            self.state = SecondaryState::Streaming;
            self.ticks_behind = 0;
            self.apply_pending_writes(ctx)?;

            if let Some(primary) = self.primary {
                let confirmed = StreamingConfirmed {
                    region: ctx.region.clone(),
                    branch: self.branch,
                    version: self.applied,
                };
                ctx.send_to(&primary, confirmed);
            }
        }

        self.send_ack(ctx);
        Ok(())
    }

    fn on_receive_write<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        write: ReplicationWrite,
    ) -> Result<(), ExecutionError> {
        if write.timestamp <= self.applied.timestamp && self.state == SecondaryState::Streaming {
            return Ok(());
        }
        self.pending_writes.insert(write.timestamp, write);
        if self.state == SecondaryState::Streaming {
            self.apply_pending_writes(ctx)?;
        }
        Ok(())
    }

    fn on_receive_heartbeat<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        heartbeat: PrimaryHeartbeat,
    ) {
        self.latest_heartbeat = Some(heartbeat.version);
        self.update_up_to_date(ctx);

        // Confirmations may get lost, so streaming secondaries repeat theirs on every heartbeat.
        if self.state == SecondaryState::Streaming {
            if let Some(primary) = self.primary {
                let confirmed = StreamingConfirmed {
                    region: ctx.region.clone(),
                    branch: self.branch,
                    version: self.applied,
                };
                ctx.send_to(&primary, confirmed);
            }
        }
    }

    /// Apply buffered writes for as long as they directly follow the applied version.
    fn apply_pending_writes<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        // Writes at or before the applied version are already reflected in the backfilled data.
        let applied_timestamp = self.applied.timestamp;
        self.pending_writes
            .retain(|timestamp, _| *timestamp > applied_timestamp);

        let region = ctx.region.clone();
        while let Some(write) = self.pending_writes.remove(&self.applied.timestamp.next()) {
            let stored = StoredValue {
                value: write.value,
                timestamp: write.timestamp,
            };
            ctx.store.write(&write.key, stored, Durability::Soft)?;
            self.applied = Version::new(self.branch, write.timestamp);
        }
        ctx.store
            .set_metainfo(&region, self.applied, Durability::Soft)?;

        if self.pending_writes.is_empty() {
            self.ticks_behind = 0;
        }
        self.update_up_to_date(ctx);
        Ok(())
    }

    pub(crate) fn tick<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        self.ticks_since_request += 1;

        match self.state {
            SecondaryState::NeedPrimary | SecondaryState::Backfilling { .. } => {
                if self.ticks_since_request >= ctx.config.backfill_retry_ticks {
                    self.request_backfill(ctx);
                }
            }
            SecondaryState::Streaming => {
                // A write that never arrived leaves a gap that no later write can fill. After waiting
                // for it for a while, catch up through a backfill instead.
                let behind = !self.pending_writes.is_empty()
                    || self
                        .latest_heartbeat
                        .is_some_and(|heartbeat| heartbeat.timestamp > self.applied.timestamp);
                if behind {
                    self.ticks_behind += 1;
                } else {
                    self.ticks_behind = 0;
                }
                if self.ticks_behind >= ctx.config.backfill_retry_ticks {
                    log::debug!(
                        "Secondary of {} in table {} fell behind at {}, backfilling again",
                        ctx.region,
                        ctx.table,
                        self.applied
                    );
                    self.ticks_behind = 0;
                    self.state = SecondaryState::Backfilling { next_chunk: 0 };
                    self.request_backfill(ctx);
                }
            }
        }

        self.send_ack(ctx);
        Ok(())
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.state == SecondaryState::Streaming
    }

    /// Start following the primary and branch of the current contract from scratch.
    ///
    /// A backfill that was cut short left keys of two versions in the region, which match no version at
    /// all. The region is emptied before following the new primary.
    fn follow<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        if let SecondaryState::Backfilling { .. } = self.state {
            log::debug!(
                "Secondary of {} in table {} abandoning a backfill to {}",
                ctx.region,
                ctx.table,
                self.applied
            );
            let region = ctx.region.clone();
            let interruptor = ctx.interruptor.clone();
            ctx.store
                .reset_data(Version::zero(), &region, Durability::Soft, &interruptor)?;
            self.applied = Version::zero();
            self.backfill_start = Version::zero();
        }

        self.primary = ctx.contract().primary;
        self.branch = ctx.contract().branch;
        self.state = SecondaryState::NeedPrimary;
        self.pending_writes.clear();
        self.latest_heartbeat = None;
        self.ticks_behind = 0;
        self.update_up_to_date(ctx);
        self.request_backfill(ctx);
        self.send_ack(ctx);
        Ok(())
    }

    fn request_backfill<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) {
        self.ticks_since_request = 0;
        let primary = match self.primary {
            Some(primary) if !self.branch.is_nil() && primary != *ctx.me() => primary,
            _ => return,
        };
        let request = BackfillRequest {
            region: ctx.region.clone(),
            branch: self.branch,
            version: self.applied,
        };
        ctx.send_to(&primary, request);
    }

    fn update_up_to_date<K: KVStore, V: StoreView, N: Network>(
        &self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) {
        let up_to_date = self.state == SecondaryState::Streaming
            && self.latest_heartbeat.map_or(false, |heartbeat| heartbeat == self.applied);
        ctx.update_status(|status| status.up_to_date = up_to_date);
    }

    fn send_ack<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) {
        let ack = match self.state {
            SecondaryState::NeedPrimary => {
                ContractAck::new(AckState::SecondaryNeedPrimary).with_version(self.applied)
            }
            SecondaryState::Backfilling { .. } => ContractAck::new(AckState::SecondaryBackfilling)
                .with_branch(self.branch)
                .with_version(self.backfill_start),
            SecondaryState::Streaming => ContractAck::new(AckState::SecondaryStreaming)
                .with_branch(self.branch)
                .with_version(self.applied),
        };
        ctx.send_ack(ack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coordinator::quorum::AckQuorum,
        execution::roles::Role,
        test_utils::{server, servers, ExecutionHarness},
        types::{
            branch::BranchBirthCertificate,
            contract::Contract,
            data_types::ContractId,
            region::Region,
        },
    };

    fn branch_of(byte: u8) -> BranchId {
        BranchBirthCertificate::new(Region::universe(), Version::zero())
            .branch_id(&server(byte), ContractId::new(byte as u64))
    }

    fn write(branch: BranchId, timestamp: u64, key: &[u8]) -> ExecutionMessage {
        ReplicationWrite {
            region: Region::universe(),
            branch,
            timestamp: StateTimestamp::new(timestamp),
            key: key.to_vec(),
            value: Some(b"v".to_vec()),
        }
        .into()
    }

    /// Start server 2 as a secondary of server 1, and bring it to streaming at timestamp 1.
    fn streaming_secondary() -> (ExecutionHarness, SecondaryExecution, BranchId) {
        let branch = branch_of(1);
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), branch);
        let mut harness = ExecutionHarness::new(2, Role::Secondary, AckQuorum::Majority, contract);
        let mut secondary = SecondaryExecution::new();
        secondary.start(&mut harness.ctx).unwrap();

        let sent = harness.network.take_execution_messages();
        assert!(matches!(
            &sent[..],
            [(to, ExecutionMessage::BackfillRequest(request))]
                if *to == server(1) && request.version == Version::zero()
        ));
        assert_eq!(harness.last_ack().1.state, AckState::SecondaryNeedPrimary);

        let chunk = BackfillChunk {
            region: Region::universe(),
            branch,
            index: 0,
            reset: false,
            items: vec![(
                b"a".to_vec(),
                StoredValue {
                    value: Some(b"v".to_vec()),
                    timestamp: StateTimestamp::new(1),
                },
            )],
            last: Some(Version::new(branch, StateTimestamp::new(1))),
        };
        secondary
            .on_receive_msg(&mut harness.ctx, server(1), chunk.into())
            .unwrap();
        assert!(secondary.is_readable());
        assert_eq!(harness.last_ack().1.state, AckState::SecondaryStreaming);
        assert!(harness
            .network
            .take_execution_messages()
            .iter()
            .any(|(to, msg)| *to == server(1) && matches!(msg, ExecutionMessage::StreamingConfirmed(_))));

        (harness, secondary, branch)
    }

    #[test]
    fn drops_writes_from_other_servers_and_branches() {
        let (mut harness, mut secondary, branch) = streaming_secondary();

        secondary
            .on_receive_msg(&mut harness.ctx, server(3), write(branch, 2, b"b"))
            .unwrap();
        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch_of(3), 2, b"c"))
            .unwrap();
        assert_eq!(harness.view.value(b"b"), None);
        assert_eq!(harness.view.value(b"c"), None);
        assert_eq!(secondary.applied, Version::new(branch, StateTimestamp::new(1)));

        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch, 2, b"d"))
            .unwrap();
        assert_eq!(harness.view.value(b"d"), Some(b"v".to_vec()));
    }

    #[test]
    fn applies_writes_in_timestamp_order() {
        let (mut harness, mut secondary, branch) = streaming_secondary();

        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch, 3, b"c"))
            .unwrap();
        assert_eq!(harness.view.value(b"c"), None);

        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch, 2, b"b"))
            .unwrap();
        assert_eq!(harness.view.value(b"b"), Some(b"v".to_vec()));
        assert_eq!(harness.view.value(b"c"), Some(b"v".to_vec()));
        assert_eq!(
            harness.view.metainfo(&Region::universe()),
            Some(Version::new(branch, StateTimestamp::new(3)))
        );
    }

    #[test]
    fn same_primary_and_branch_keep_streaming() {
        let (mut harness, mut secondary, branch) = streaming_secondary();

        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(1)), branch);
        harness.set_contract(2, contract);
        secondary.on_contract_update(&mut harness.ctx).unwrap();

        assert!(secondary.is_readable());
        assert!(harness.network.take_execution_messages().is_empty());
        let (contract_id, ack) = harness.last_ack();
        assert_eq!(contract_id, ContractId::new(2));
        assert_eq!(ack.state, AckState::SecondaryStreaming);
    }

    #[test]
    fn writes_of_a_fenced_primary_are_still_applied() {
        let (mut harness, mut secondary, branch) = streaming_secondary();

        harness.set_contract(2, Contract::new(servers(&[1, 2]), None, branch));
        secondary.on_contract_update(&mut harness.ctx).unwrap();
        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch, 2, b"b"))
            .unwrap();
        assert_eq!(harness.view.value(b"b"), Some(b"v".to_vec()));
        secondary.tick(&mut harness.ctx).unwrap();
        assert_eq!(
            harness.last_ack().1.latest_version(),
            Some(Version::new(branch, StateTimestamp::new(2)))
        );

        // Once another primary is named, the fenced primary is ignored.
        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(3)), branch);
        harness.set_contract(3, contract);
        secondary.on_contract_update(&mut harness.ctx).unwrap();
        secondary
            .on_receive_msg(&mut harness.ctx, server(1), write(branch, 3, b"c"))
            .unwrap();
        assert_eq!(harness.view.value(b"c"), None);
        assert_eq!(harness.last_ack().1.state, AckState::SecondaryNeedPrimary);
    }

    #[test]
    fn abandoned_backfill_empties_the_region() {
        let old_branch = branch_of(4);
        let branch = branch_of(1);
        let contract = Contract::new(servers(&[1, 2]), Some(server(1)), branch);
        let mut harness = ExecutionHarness::new(2, Role::Secondary, AckQuorum::Majority, contract);
        harness
            .view
            .put(b"old", b"v", 3, Version::new(old_branch, StateTimestamp::new(3)));
        let mut secondary = SecondaryExecution::new();
        secondary.start(&mut harness.ctx).unwrap();

        let chunk = BackfillChunk {
            region: Region::universe(),
            branch,
            index: 0,
            reset: false,
            items: vec![(
                b"new".to_vec(),
                StoredValue {
                    value: Some(b"v".to_vec()),
                    timestamp: StateTimestamp::new(5),
                },
            )],
            last: None,
        };
        secondary
            .on_receive_msg(&mut harness.ctx, server(1), chunk.into())
            .unwrap();
        let (_, ack) = harness.last_ack();
        assert_eq!(ack.state, AckState::SecondaryBackfilling);
        assert_eq!(
            ack.latest_version(),
            Some(Version::new(old_branch, StateTimestamp::new(3)))
        );

        let contract = Contract::new(servers(&[1, 2, 3]), Some(server(3)), branch);
        harness.set_contract(2, contract);
        secondary.on_contract_update(&mut harness.ctx).unwrap();

        assert_eq!(harness.view.len(), 0);
        assert!(harness.journal().contains(&String::from("reset")));
        let (_, ack) = harness.last_ack();
        assert_eq!(ack.state, AckState::SecondaryNeedPrimary);
        assert_eq!(ack.latest_version(), Some(Version::zero()));
    }
}
