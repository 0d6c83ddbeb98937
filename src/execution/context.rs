/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The resources and the current contract that an execution works with.

use std::{
    sync::{mpsc::Sender, Arc, Mutex},
    time::SystemTime,
};

use crate::{
    branch_history::BranchHistoryManager,
    events::{Event, UpdateContractAckEvent},
    interruptor::Interruptor,
    networking::{network::Network, sending::SenderHandle},
    persistence::pluggables::KVStore,
    storage::StoreView,
    types::{
        contract::{Contract, ContractAck},
        data_types::{ContractId, ServerId, TableId},
        region::Region,
    },
};

use super::{handle::ShardStatus, messages::ExecutionMessage, ExecutionConfiguration};

/// Closure through which an execution reports its acks to the table manager.
pub(crate) type AckCallback = Box<dyn Fn(ContractId, ContractAck) + Send>;

/// Everything an [`Execution`](super::Execution) needs besides its role-specific state.
///
/// The context is owned by the execution's thread. The store view in it is owned exclusively by the
/// execution for as long as the execution runs.
pub(crate) struct ExecutionContext<K: KVStore, V: StoreView, N: Network> {
    pub(crate) config: ExecutionConfiguration,
    pub(crate) table: TableId,
    pub(crate) region: Region,
    pub(crate) store: V,
    pub(crate) branch_history: BranchHistoryManager<K>,
    pub(crate) interruptor: Interruptor,
    pub(crate) event_publisher: Option<Sender<Event>>,
    sender: SenderHandle<N>,
    status: Arc<Mutex<ShardStatus>>,
    contract_id: ContractId,
    contract: Contract,
    ack_callback: AckCallback,
    last_ack: Option<(ContractId, ContractAck)>,
}

impl<K: KVStore, V: StoreView, N: Network> ExecutionContext<K, V, N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ExecutionConfiguration,
        table: TableId,
        store: V,
        branch_history: BranchHistoryManager<K>,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
        interruptor: Interruptor,
        status: Arc<Mutex<ShardStatus>>,
        contract_id: ContractId,
        contract: Contract,
        ack_callback: AckCallback,
    ) -> Self {
        Self {
            config,
            table,
            region: store.get_region(),
            store,
            branch_history,
            interruptor,
            event_publisher,
            sender,
            status,
            contract_id,
            contract,
            ack_callback,
            last_ack: None,
        }
    }

    pub(crate) fn me(&self) -> &ServerId {
        &self.config.me
    }

    pub(crate) fn contract_id(&self) -> ContractId {
        self.contract_id
    }

    pub(crate) fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Replace the current contract. Acks sent from now on acknowledge `contract_id`.
    pub(crate) fn set_contract(
        &mut self,
        contract_id: ContractId,
        contract: Contract,
        ack_callback: AckCallback,
    ) {
        self.contract_id = contract_id;
        self.contract = contract;
        self.ack_callback = ack_callback;
    }

    /// Report `ack` for the current contract, unless it is identical to the last ack reported for the
    /// current contract.
    pub(crate) fn send_ack(&mut self, ack: ContractAck) {
        if self
            .last_ack
            .as_ref()
            .is_some_and(|(contract_id, last_ack)| *contract_id == self.contract_id && *last_ack == ack)
        {
            return;
        }

        (self.ack_callback)(self.contract_id, ack.clone());
        Event::UpdateContractAck(UpdateContractAckEvent {
            timestamp: SystemTime::now(),
            table: self.table,
            region: self.region.clone(),
            contract_id: self.contract_id,
            state: ack.state,
        })
        .publish(&self.event_publisher);

        self.update_status(|status| {
            status.ack_state = Some(ack.state);
            status.version = ack.latest_version();
        });
        self.last_ack = Some((self.contract_id, ack));
    }

    /// Send an execution message to the execution of the same region on `peer`.
    pub(crate) fn send_to<S: Into<ExecutionMessage>>(&mut self, peer: &ServerId, msg: S) {
        self.sender
            .send_table_message(self.table, peer, msg.into())
    }

    /// Apply `update` to the status shared with the execution's handle.
    pub(crate) fn update_status(&self, update: impl FnOnce(&mut ShardStatus)) {
        let mut status = self.status.lock().unwrap(); // Safety: the status is never locked across a panic.
        update(&mut status)
    }
}
