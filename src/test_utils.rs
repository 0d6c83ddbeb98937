/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! In-memory collaborators for the unit tests of executions and Raft members, which are driven by
//! calling their event handlers directly instead of through their threads.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::{
    branch_history::BranchHistoryManager,
    coordinator::quorum::AckQuorum,
    execution::{
        context::ExecutionContext, handle::ShardStatus, messages::ExecutionMessage, roles::Role,
        ExecutionConfiguration,
    },
    interruptor::Interruptor,
    networking::{
        messages::{Message, TableMessage},
        network::Network,
        sending::SenderHandle,
    },
    persistence::pluggables::{KVGet, KVStore, WriteBatch},
    raft::messages::RaftMessage,
    storage::{Durability, StoreError, StoreView, StoredValue},
    types::{
        branch::Version,
        contract::{Contract, ContractAck},
        data_types::{ContractId, ServerId, StateTimestamp, TableId},
        region::Region,
        table_config::{ShardConfig, TableConfig},
    },
};

pub(crate) const TABLE: TableId = TableId::new(1);

/// A server id that is a valid verifying key, so that messages addressed to it are not dropped.
pub(crate) fn server(byte: u8) -> ServerId {
    ServerId::from(SigningKey::from_bytes(&[byte; 32]).verifying_key())
}

pub(crate) fn servers(bytes: &[u8]) -> BTreeSet<ServerId> {
    bytes.iter().map(|byte| server(*byte)).collect()
}

/// A single-shard table replicated on `replicas`.
pub(crate) fn table_config(replicas: &[u8], primary: u8) -> TableConfig {
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

/* ↓↓↓ Key-value store ↓↓↓ */

#[derive(Clone, Default)]
pub(crate) struct MemKV(Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>);

impl MemKV {
    pub(crate) fn new() -> MemKV {
        MemKV::default()
    }
}

impl KVStore for MemKV {
    type WriteBatch = MemWriteBatch;
    type Snapshot<'a> = MemKV;

    fn write(&mut self, wb: Self::WriteBatch) {
        let mut map = self.0.lock().unwrap();
        for (key, value) in wb.0 {
            match value {
                Some(value) => map.insert(key, value),
                None => map.remove(&key),
            };
        }
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clear();
    }

    fn snapshot<'b>(&'b self) -> MemKV {
        MemKV(Arc::new(Mutex::new(self.0.lock().unwrap().clone())))
    }
}

impl KVGet for MemKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().unwrap().get(key).cloned()
    }
}

pub(crate) struct MemWriteBatch(Vec<(Vec<u8>, Option<Vec<u8>>)>);

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch(Vec::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.push((key.to_vec(), Some(value.to_vec())));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.push((key.to_vec(), None));
    }
}

/* ↓↓↓ Store view ↓↓↓ */

/// Things that happened to a region, in order: acks sent and resets performed.
pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct RegionData {
    values: BTreeMap<Vec<u8>, StoredValue>,
    metainfo: Option<Version>,
}

/// A view of a single region. Clones share the same data.
#[derive(Clone)]
pub(crate) struct MemView {
    data: Arc<Mutex<RegionData>>,
    region: Region,
    journal: Journal,
}

impl MemView {
    fn new(journal: Journal) -> MemView {
        MemView {
            data: Arc::new(Mutex::new(RegionData::default())),
            region: Region::universe(),
            journal,
        }
    }

    pub(crate) fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.read(key).and_then(|stored| stored.value)
    }

    /// Write `value` at `key` with `timestamp`, and move the metainfo to `version`.
    pub(crate) fn put(&self, key: &[u8], value: &[u8], timestamp: u64, version: Version) {
        let mut data = self.data.lock().unwrap();
        data.values.insert(
            key.to_vec(),
            StoredValue {
                value: Some(value.to_vec()),
                timestamp: StateTimestamp::new(timestamp),
            },
        );
        data.metainfo = Some(version);
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().unwrap().values.len()
    }
}

impl StoreView for MemView {
    fn get_region(&self) -> Region {
        self.region.clone()
    }

    fn subview(&self, region: &Region) -> Option<Self> {
        self.region.contains_region(region).then(|| MemView {
            region: region.clone(),
            ..self.clone()
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
        let mut data = self.data.lock().unwrap();
        data.values.retain(|key, _| !region.contains_key(key));
        data.metainfo = Some(initial_metainfo);
        self.journal.lock().unwrap().push(String::from("reset"));
        Ok(())
    }

    fn read(&self, key: &[u8]) -> Option<StoredValue> {
        self.data.lock().unwrap().values.get(key).cloned()
    }

    fn read_since(&self, region: &Region, since: StateTimestamp) -> Vec<(Vec<u8>, StoredValue)> {
        self.data
            .lock()
            .unwrap()
            .values
            .iter()
            .filter(|(key, stored)| region.contains_key(key) && stored.timestamp > since)
            .map(|(key, stored)| (key.clone(), stored.clone()))
            .collect()
    }

    fn write(&mut self, key: &[u8], value: StoredValue, _: Durability) -> Result<(), StoreError> {
        self.data.lock().unwrap().values.insert(key.to_vec(), value);
        Ok(())
    }

    fn metainfo(&self, _: &Region) -> Option<Version> {
        self.data.lock().unwrap().metainfo
    }

    fn set_metainfo(
        &mut self,
        _: &Region,
        version: Version,
        _: Durability,
    ) -> Result<(), StoreError> {
        self.data.lock().unwrap().metainfo = Some(version);
        Ok(())
    }
}

/* ↓↓↓ Network ↓↓↓ */

/// A network that delivers nothing and remembers everything that was sent through it.
#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    sent: Arc<Mutex<Vec<(VerifyingKey, Message)>>>,
}

impl RecordingNetwork {
    fn take(&self) -> Vec<(ServerId, TableMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
            .into_iter()
            .filter_map(|(peer, message)| match message {
                Message::Table { msg, .. } => Some((ServerId::from(peer), msg)),
                _ => None,
            })
            .collect()
    }

    /// Take every execution message sent so far, with its recipient.
    pub(crate) fn take_execution_messages(&self) -> Vec<(ServerId, ExecutionMessage)> {
        self.take()
            .into_iter()
            .filter_map(|(peer, msg)| match msg {
                TableMessage::Execution(msg) => Some((peer, msg)),
                _ => None,
            })
            .collect()
    }

    /// Take every Raft message sent so far, with its recipient.
    pub(crate) fn take_raft_messages(&self) -> Vec<(ServerId, RaftMessage)> {
        self.take()
            .into_iter()
            .filter_map(|(peer, msg)| match msg {
                TableMessage::Raft(msg) => Some((peer, msg)),
                _ => None,
            })
            .collect()
    }
}

impl Network for RecordingNetwork {
    fn send(&mut self, peer: VerifyingKey, message: Message) {
        self.sent.lock().unwrap().push((peer, message));
    }

    fn recv(&mut self) -> Option<(VerifyingKey, Message)> {
        None
    }
}

/* ↓↓↓ Executions ↓↓↓ */

/// An execution context over in-memory collaborators, and handles to observe what the execution did.
pub(crate) struct ExecutionHarness {
    pub(crate) ctx: ExecutionContext<MemKV, MemView, RecordingNetwork>,
    pub(crate) view: MemView,
    pub(crate) network: RecordingNetwork,
    pub(crate) interruptor: Interruptor,
    acks: Arc<Mutex<Vec<(ContractId, ContractAck)>>>,
    journal: Journal,
    status: Arc<Mutex<ShardStatus>>,
}

impl ExecutionHarness {
    pub(crate) fn new(me: u8, role: Role, quorum: AckQuorum, contract: Contract) -> ExecutionHarness {
        let config = ExecutionConfiguration {
            me: server(me),
            heartbeat_ticks: 5,
            backfill_chunk_size: 2,
            backfill_retry_ticks: 3,
            ack_quorum: quorum,
        };
        let journal = Journal::default();
        let view = MemView::new(journal.clone());
        let network = RecordingNetwork::default();
        let interruptor = Interruptor::new();
        let status = Arc::new(Mutex::new(ShardStatus::new(Region::universe(), role)));
        let acks = Arc::new(Mutex::new(Vec::new()));

        let ctx = ExecutionContext::new(
            config,
            TABLE,
            view.clone(),
            BranchHistoryManager::new(MemKV::new(), TABLE),
            SenderHandle::new(network.clone()),
            None,
            interruptor.clone(),
            status.clone(),
            ContractId::new(1),
            contract,
            Self::ack_callback(&acks, &journal),
        );

        ExecutionHarness {
            ctx,
            view,
            network,
            interruptor,
            acks,
            journal,
            status,
        }
    }

    fn ack_callback(
        acks: &Arc<Mutex<Vec<(ContractId, ContractAck)>>>,
        journal: &Journal,
    ) -> Box<dyn Fn(ContractId, ContractAck) + Send> {
        let acks = acks.clone();
        let journal = journal.clone();
        Box::new(move |contract_id, ack| {
            journal
                .lock()
                .unwrap()
                .push(format!("ack {:?}", ack.state));
            acks.lock().unwrap().push((contract_id, ack));
        })
    }

    /// Replace the context's contract, as the execution's thread does before calling
    /// `on_contract_update`.
    pub(crate) fn set_contract(&mut self, contract_id: u64, contract: Contract) {
        let callback = Self::ack_callback(&self.acks, &self.journal);
        self.ctx
            .set_contract(ContractId::new(contract_id), contract, callback);
    }

    /// The latest ack, and the contract it acknowledged.
    pub(crate) fn last_ack(&self) -> (ContractId, ContractAck) {
        self.acks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("the execution has acked")
    }

    pub(crate) fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub(crate) fn status(&self) -> ShardStatus {
        self.status.lock().unwrap().clone()
    }
}
