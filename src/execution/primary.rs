/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of the server that accepts writes for a region.
//!
//! ## Sub-states
//!
//! A primary execution moves through three sub-states, each reported in its acks:
//! 1. **Need branch**: on start, the primary creates a new branch that forks the region's local version,
//!    records it in the branch history, and acks [`PrimaryNeedBranch`](AckState::PrimaryNeedBranch)
//!    with the branch's birth certificate. It waits for the leader to commit a contract naming the
//!    branch.
//! 2. **In progress**: the branch is committed. The primary serves backfills and streams its writes to
//!    every secondary that has asked for a backfill, but does not accept client writes yet.
//! 3. **Ready**: a quorum of the contract's replicas (counting the primary) is streaming under the
//!    branch. The primary accepts client writes.
//!
//! Committing the new branch fences every older branch: secondaries only accept messages sent under
//! the branch named by their current contract.
//!
//! ## Backfills
//!
//! A backfill request carries the version the secondary holds. If that version is an ancestor of the
//! primary's current version, the primary only sends the keys written after it. Otherwise the
//! secondary holds writes that the primary never saw (e.g., from a superseded branch), and the primary
//! tells it to reset the region before sending every key.

use std::{collections::BTreeMap, time::SystemTime};

use crate::{
    events::{CreateBranchEvent, Event},
    networking::network::Network,
    persistence::pluggables::KVStore,
    storage::{Durability, StoreView, StoredValue},
    types::{
        branch::{BranchBirthCertificate, BranchId, Version},
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
    ExecutionError, WriteError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PrimaryState {
    NeedBranch,
    InProgress,
    Ready,
}

pub(crate) struct PrimaryExecution {
    state: PrimaryState,
    branch: BranchId,
    current: Version,

    // Secondaries that writes are streamed to, and whether they confirmed that they are streaming.
    streaming_targets: BTreeMap<ServerId, bool>,
    ticks_since_heartbeat: Ticks,
}

impl PrimaryExecution {
    pub(crate) fn new() -> Self {
        Self {
            state: PrimaryState::NeedBranch,
            branch: BranchId::nil(),
            current: Version::zero(),
            streaming_targets: BTreeMap::new(),
            ticks_since_heartbeat: 0,
        }
    }

    pub(crate) fn start<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        let parent_version = ctx.store.metainfo(&ctx.region).unwrap_or(Version::zero());
        let certificate = BranchBirthCertificate::new(ctx.region.clone(), parent_version);
        let branch = certificate.branch_id(ctx.me(), ctx.contract_id());
        ctx.branch_history.create_branch(branch, &certificate)?;

        self.branch = branch;
        self.current = parent_version;

        Event::CreateBranch(CreateBranchEvent {
            timestamp: SystemTime::now(),
            table: ctx.table,
            region: ctx.region.clone(),
            branch,
            parent_version,
        })
        .publish(&ctx.event_publisher);

        self.on_contract_update(ctx)
    }

    pub(crate) fn on_contract_update<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        // Secondaries that were removed from the contract no longer get writes.
        let replicas = ctx.contract().replicas.clone();
        self.streaming_targets
            .retain(|target, _| replicas.contains(target));

        if self.state == PrimaryState::NeedBranch && ctx.contract().branch == self.branch {
            // The leader committed the branch. From now on the local data is on the new branch.
            self.current = Version::new(self.branch, self.current.timestamp);
            let region = ctx.region.clone();
            ctx.store
                .set_metainfo(&region, self.current, Durability::Hard)?;
            self.state = PrimaryState::InProgress;
        }

        self.update_readiness(ctx);
        self.send_ack(ctx)
    }

    pub(crate) fn on_receive_msg<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        origin: ServerId,
        msg: ExecutionMessage,
    ) -> Result<(), ExecutionError> {
        match msg {
            ExecutionMessage::BackfillRequest(request) => {
                self.on_receive_backfill_request(ctx, origin, request)
            }
            ExecutionMessage::StreamingConfirmed(confirmed) => {
                self.on_receive_streaming_confirmed(ctx, origin, confirmed)
            }
            ExecutionMessage::BackfillChunk(_)
            | ExecutionMessage::ReplicationWrite(_)
            | ExecutionMessage::PrimaryHeartbeat(_) => {
                log::debug!(
                    "Primary of {} in table {} ignoring a message meant for a secondary from {}",
                    ctx.region,
                    ctx.table,
                    origin
                );
                Ok(())
            }
        }
    }

    fn on_receive_backfill_request<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        origin: ServerId,
        request: BackfillRequest,
    ) -> Result<(), ExecutionError> {
        if self.state == PrimaryState::NeedBranch
            || request.branch != self.branch
            || ctx.contract().branch != self.branch
            || origin == *ctx.me()
            || !ctx.contract().replicas.contains(&origin)
        {
            return Ok(());
        }

        let incremental = ctx
            .branch_history
            .is_ancestor(&request.version, &self.current)?;
        let items: Vec<(Vec<u8>, StoredValue)> = if incremental {
            ctx.store
                .read_since(&ctx.region, request.version.timestamp)
        } else {
            ctx.store
                .read_since(&ctx.region, StateTimestamp::zero())
                .into_iter()
                .filter(|(_, stored)| stored.value.is_some())
                .collect()
        };

        log::debug!(
            "Backfilling {} of table {} to {} from {}: {} keys, reset: {}",
            ctx.region,
            ctx.table,
            origin,
            request.version,
            items.len(),
            !incremental
        );

        let chunk_size = ctx.config.backfill_chunk_size.max(1);
        let mut chunks: Vec<Vec<(Vec<u8>, StoredValue)>> = items
            .chunks(chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }

        let last_index = chunks.len() - 1;
        for (index, items) in chunks.into_iter().enumerate() {
            ctx.interruptor.check()?;
            let chunk = BackfillChunk {
                region: ctx.region.clone(),
                branch: self.branch,
                index: index as u32,
                reset: !incremental,
                items,
                last: (index == last_index).then_some(self.current),
            };
            ctx.send_to(&origin, chunk);
        }

        // Writes accepted from here on are streamed to the requester. It is not counted towards the
        // quorum until it confirms that it applied the whole backfill.
        self.streaming_targets.insert(origin, false);
        self.update_readiness(ctx);
        self.send_ack(ctx)
    }

    fn on_receive_streaming_confirmed<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        origin: ServerId,
        confirmed: StreamingConfirmed,
    ) -> Result<(), ExecutionError> {
        if confirmed.branch != self.branch {
            return Ok(());
        }
        if let Some(is_streaming) = self.streaming_targets.get_mut(&origin) {
            *is_streaming = true;
        }
        self.update_readiness(ctx);
        self.send_ack(ctx)
    }

    /// Accept a client write, apply it locally, and stream it to every streaming target.
    pub(crate) fn write<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<Version, WriteError> {
        if self.state != PrimaryState::Ready || ctx.contract().branch != self.branch {
            return Err(WriteError::NotWritable);
        }

        let timestamp = self.current.timestamp.next();
        let stored = StoredValue {
            value: value.clone(),
            timestamp,
        };
        ctx.store
            .write(&key, stored, Durability::Soft)
            .map_err(WriteError::Storage)?;
        self.current = Version::new(self.branch, timestamp);
        let region = ctx.region.clone();
        ctx.store
            .set_metainfo(&region, self.current, Durability::Soft)
            .map_err(WriteError::Storage)?;

        let targets: Vec<ServerId> = self.streaming_targets.keys().copied().collect();
        for target in targets {
            let write = ReplicationWrite {
                region: region.clone(),
                branch: self.branch,
                timestamp,
                key: key.clone(),
                value: value.clone(),
            };
            ctx.send_to(&target, write);
        }

        Ok(self.current)
    }

    pub(crate) fn tick<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        self.ticks_since_heartbeat += 1;
        if self.state != PrimaryState::NeedBranch
            && self.ticks_since_heartbeat >= ctx.config.heartbeat_ticks
        {
            self.ticks_since_heartbeat = 0;
            let secondaries: Vec<ServerId> = ctx
                .contract()
                .replicas
                .iter()
                .filter(|replica| *replica != ctx.me())
                .copied()
                .collect();
            for secondary in secondaries {
                let heartbeat = PrimaryHeartbeat {
                    region: ctx.region.clone(),
                    branch: self.branch,
                    version: self.current,
                };
                ctx.send_to(&secondary, heartbeat);
            }
        }

        // Acks carry the current version, which only changes through writes. Refreshing it once per tick
        // keeps the leader's view of this replica recent without acking every write.
        self.send_ack(ctx)
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.state != PrimaryState::NeedBranch
    }

    fn update_readiness<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) {
        if self.state == PrimaryState::NeedBranch {
            return;
        }

        let contract = ctx.contract();
        let streaming = contract
            .replicas
            .iter()
            .filter(|replica| {
                *replica == ctx.me() || self.streaming_targets.get(*replica) == Some(&true)
            })
            .count();
        let ready = contract.branch == self.branch
            && ctx
                .config
                .ack_quorum
                .is_satisfied(streaming, contract.replicas.len());

        let state = if ready {
            PrimaryState::Ready
        } else {
            PrimaryState::InProgress
        };
        if state != self.state {
            log::debug!(
                "Primary of {} in table {} is now {:?}",
                ctx.region,
                ctx.table,
                state
            );
            self.state = state;
        }
    }

    fn send_ack<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        let ack = match self.state {
            PrimaryState::NeedBranch => ContractAck::new(AckState::PrimaryNeedBranch)
                .with_branch(self.branch)
                .with_version(self.current)
                .with_branch_history(ctx.branch_history.branch_history_for(&self.branch)?),
            PrimaryState::InProgress => ContractAck::new(AckState::PrimaryInProgress)
                .with_branch(self.branch)
                .with_version(self.current),
            PrimaryState::Ready => ContractAck::new(AckState::PrimaryReady)
                .with_branch(self.branch)
                .with_version(self.current),
        };
        let up_to_date = self.state == PrimaryState::Ready;
        ctx.update_status(|status| status.up_to_date = up_to_date);
        ctx.send_ack(ack);
        Ok(())
    }
}
