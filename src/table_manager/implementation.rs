/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The table manager thread and the procedures used in it.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    branch_history::{BranchHistoryError, BranchHistoryManager},
    coordinator::{ack_directory::ContractAckDirectory, implementation::coordinate, quorum::AckQuorum},
    events::Event,
    execution::{
        context::{AckCallback, ExecutionContext},
        handle::ExecutionHandle,
        messages::ExecutionMessage,
        roles::{classify, Role},
        ExecutionConfiguration, ReadError, WriteError,
    },
    interruptor::Interruptor,
    multi_table_manager::types::{TableAction, TableTimestamp},
    networking::{messages::TableMessage, network::Network, sending::SenderHandle},
    persistence::pluggables::KVStore,
    raft::{
        implementation::{ProposeError, RaftMember},
        log::RaftError,
        messages::RaftMessage,
        types::{CommitNotification, TableChange},
    },
    storage::{StoreError, StoreView},
    types::{
        branch::{BranchId, Version},
        contract::{Contract, ContractAck},
        crypto_primitives::Keypair,
        data_types::{ContractId, RaftMemberId, ServerId, TableId, Term, Ticks},
        region::Region,
        signed_messages::SignedContractAck,
        table_config::{TableConfig, TableConfigError},
    },
};

use super::{
    bcard::LeaderBcard,
    status::{all_replicas_ready, ContractAckEntry, RaftStatus, TableStatusCache},
};

/// Configuration of every table manager of a server.
#[derive(Clone)]
pub(crate) struct TableManagerConfiguration {
    pub(crate) keypair: Keypair,
    pub(crate) tick_interval: Duration,
    pub(crate) liveness_timeout_ticks: Ticks,
    pub(crate) ack_resend_ticks: Ticks,
    pub(crate) gc_interval_ticks: Ticks,
    pub(crate) ack_quorum: AckQuorum,
    pub(crate) execution: ExecutionConfiguration,
}

/// Inputs that the multi-table manager sends into a table manager's thread.
pub(crate) enum TableManagerInput {
    Message {
        origin: ServerId,
        msg: TableMessage,
    },
    SetConfig {
        config: TableConfig,
        reply: Sender<Result<(), TableManagerError>>,
    },
    Write {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        reply: Sender<Result<Version, WriteError>>,
    },
    Read {
        key: Vec<u8>,
        reply: Sender<Result<Option<Vec<u8>>, ReadError>>,
    },
}

/// Handle to a running table manager, owned by the multi-table manager.
///
/// Dropping the handle stops the table manager, which tears down all of its executions first.
pub(crate) struct TableManagerHandle {
    table: TableId,
    member_id: RaftMemberId,
    inputs: Sender<TableManagerInput>,
    status: Arc<Mutex<TableStatusCache>>,
    shutdown_signal: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl TableManagerHandle {
    pub(crate) fn table(&self) -> TableId {
        self.table
    }

    pub(crate) fn member_id(&self) -> RaftMemberId {
        self.member_id
    }

    pub(crate) fn send(&self, input: TableManagerInput) {
        // Only fails once the thread has exited, after which nothing reads the reply channels either.
        let _ = self.inputs.send(input);
    }

    /// Get the latest status cached by the table manager.
    pub(crate) fn status(&self) -> TableStatusCache {
        self.status.lock().unwrap().clone() // Safety: the cache is never locked across a panic.
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.shutdown_signal.send(());
            if thread.join().is_err() {
                log::error!("Table manager thread of table {} panicked", self.table);
            }
        }
    }
}

impl Drop for TableManagerHandle {
    fn drop(&mut self) {
        self.stop()
    }
}

/// An ack reported by one of this server's executions.
struct LocalAck {
    region: Region,
    contract_id: ContractId,
    ack: ContractAck,
}

/// Supervisor of one table on one server.
///
/// Owns the table's [Raft member](RaftMember) and one [execution](crate::execution) per region, and keeps
/// the executions in line with the committed contracts. While its Raft member is the leader, it also
/// collects every server's acks and proposes the changes that the [coordinator](crate::coordinator)
/// decides on.
pub(crate) struct TableManager<K: KVStore, V: StoreView, N: Network> {
    config: TableManagerConfiguration,
    table: TableId,
    raft: RaftMember<K, N>,
    store: V,
    branch_history: BranchHistoryManager<K>,
    network: N,
    sender: SenderHandle<N>,
    local_actions: Sender<TableAction>,
    event_publisher: Option<Sender<Event>>,

    executions: BTreeMap<Region, ExecutionHandle>,
    execution_contracts: BTreeMap<Region, ContractId>,

    local_ack_sender: Sender<LocalAck>,
    local_acks: Receiver<LocalAck>,
    latest_local_acks: BTreeMap<Region, (ContractId, ContractAck)>,

    // Only filled while this server is the leader.
    ack_directory: ContractAckDirectory,
    leader_term: Option<Term>,

    gc_candidates: BTreeSet<BranchId>,
    ticks: Ticks,
    status: Arc<Mutex<TableStatusCache>>,
}

impl<K: KVStore, V: StoreView, N: Network + 'static> TableManager<K, V, N> {
    /// Start the thread of the table manager of `table`, whose Raft member is `raft` and whose data is
    /// in `store`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        config: TableManagerConfiguration,
        table: TableId,
        raft: RaftMember<K, N>,
        kv_store: K,
        store: V,
        network: N,
        local_actions: Sender<TableAction>,
        event_publisher: Option<Sender<Event>>,
    ) -> TableManagerHandle {
        let (local_ack_sender, local_acks) = mpsc::channel();
        let member_id = raft.member_id();
        let status = Arc::new(Mutex::new(TableStatusCache {
            raft: RaftStatus {
                state: raft.committed_state().clone(),
                term: raft.term(),
                commit_index: raft.commit_index(),
                is_leader: false,
                leader: None,
            },
            contract_acks: Vec::new(),
            shard_status: Vec::new(),
            all_replicas_ready: false,
        }));

        let table_manager = TableManager {
            branch_history: BranchHistoryManager::new(kv_store, table),
            sender: SenderHandle::new(network.clone()),
            config,
            table,
            raft,
            store,
            network,
            local_actions,
            event_publisher,
            executions: BTreeMap::new(),
            execution_contracts: BTreeMap::new(),
            local_ack_sender,
            local_acks,
            latest_local_acks: BTreeMap::new(),
            ack_directory: ContractAckDirectory::new(),
            leader_term: None,
            gc_candidates: BTreeSet::new(),
            ticks: 0,
            status: status.clone(),
        };

        let (inputs, input_receiver) = mpsc::channel();
        let (shutdown_signal, shutdown_receiver) = mpsc::channel();
        let thread = thread::spawn(move || table_manager.run(input_receiver, shutdown_receiver));

        TableManagerHandle {
            table,
            member_id,
            inputs,
            status,
            shutdown_signal,
            thread: Some(thread),
        }
    }

    fn run(mut self, inputs: Receiver<TableManagerInput>, shutdown_signal: Receiver<()>) {
        if let Err(err) = self.manage(&inputs, &shutdown_signal) {
            log::error!("Table manager of table {} stopped: {}", self.table, err);
            self.executions.clear();
            self.refresh_status();

            // A failed table manager stays registered until it is stopped, but does nothing.
            let _ = shutdown_signal.recv();
        }
    }

    /// The table manager loop. Returns `Ok(())` when the shutdown signal is received.
    fn manage(
        &mut self,
        inputs: &Receiver<TableManagerInput>,
        shutdown_signal: &Receiver<()>,
    ) -> Result<(), TableManagerError> {
        let state = self.raft.committed_state().clone();
        self.branch_history
            .import_branch_history(&state.branch_history)?;
        self.reconcile_executions()?;

        let mut last_tick = Instant::now();
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return Ok(()),
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Table manager thread disconnected from multi-table manager")
                }
            }

            // 1. Handle the inputs that arrived until the next tick is due.
            let timeout = self
                .config
                .tick_interval
                .saturating_sub(last_tick.elapsed());
            match inputs.recv_timeout(timeout) {
                Ok(input) => self.on_input(input)?,
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
            for input in inputs.try_iter().collect::<Vec<_>>() {
                self.on_input(input)?;
            }

            // 2. Forward the acks of local executions.
            self.on_local_acks();

            // 3. Tick.
            if last_tick.elapsed() >= self.config.tick_interval {
                last_tick = Instant::now();
                self.tick()?;
            }

            // 4. Realize whatever was committed.
            self.on_commits()?;

            // 5. Propose the next change, if leader.
            self.coordinate()?;

            self.check_executions()?;
            self.refresh_status();
        }
    }

    /* ↓↓↓ Inputs ↓↓↓ */

    fn on_input(&mut self, input: TableManagerInput) -> Result<(), TableManagerError> {
        match input {
            TableManagerInput::Message { origin, msg } => self.on_receive_msg(origin, msg),
            TableManagerInput::SetConfig { config, reply } => {
                let _ = reply.send(self.on_set_config(config));
                Ok(())
            }
            TableManagerInput::Write { key, value, reply } => {
                self.on_write(key, value, reply);
                Ok(())
            }
            TableManagerInput::Read { key, reply } => {
                self.on_read(key, reply);
                Ok(())
            }
        }
    }

    fn on_receive_msg(&mut self, origin: ServerId, msg: TableMessage) -> Result<(), TableManagerError> {
        match msg {
            TableMessage::Raft(msg) => self.on_receive_raft_msg(origin, msg),
            TableMessage::ContractAck { term, ack } => {
                self.on_receive_contract_ack(origin, term, ack);
                Ok(())
            }
            TableMessage::SetConfig { term, config } => {
                if self.raft.is_leader() && term == self.raft.term() {
                    if let Err(err) = self.propose_config(config) {
                        log::warn!(
                            "Rejected config for table {} from {}: {}",
                            self.table,
                            origin,
                            err
                        );
                    }
                }
                Ok(())
            }
            TableMessage::Execution(msg) => {
                self.on_receive_execution_msg(origin, msg);
                Ok(())
            }
        }
    }

    fn on_receive_raft_msg(&mut self, origin: ServerId, msg: RaftMessage) -> Result<(), TableManagerError> {
        self.raft.on_receive_msg(origin, msg)?;
        Ok(())
    }

    fn on_receive_contract_ack(&mut self, origin: ServerId, term: Term, signed: SignedContractAck) {
        if !self.raft.is_leader() || term != self.raft.term() {
            return;
        }
        if signed.server != origin || signed.table != self.table || !signed.is_signed_by_server() {
            log::warn!(
                "Dropping a contract ack for table {} from {} with a bad signature",
                self.table,
                origin
            );
            return;
        }
        self.ack_directory
            .insert(signed.server, signed.region, signed.contract_id, signed.ack);
    }

    fn on_receive_execution_msg(&mut self, origin: ServerId, msg: ExecutionMessage) {
        match self.executions.get(msg.region()) {
            Some(execution) => execution.deliver(origin, msg),
            None => log::debug!(
                "Dropping an execution message for {} of table {} from {}",
                msg.region(),
                self.table,
                origin
            ),
        }
    }

    fn on_set_config(&mut self, config: TableConfig) -> Result<(), TableManagerError> {
        if self.raft.is_leader() {
            return self.propose_config(config);
        }
        match self.raft.leader() {
            Some(leader) => {
                validate_config(&self.raft.committed_state().config, &config)?;
                let bcard = LeaderBcard::new(leader, self.table, self.raft.term());
                let address = bcard.set_config_mailbox;
                self.sender.send_table_message(
                    self.table,
                    &address.server,
                    TableMessage::SetConfig {
                        term: address.term,
                        config,
                    },
                );
                Ok(())
            }
            None => Err(TableManagerError::NoLeader),
        }
    }

    fn propose_config(&mut self, config: TableConfig) -> Result<(), TableManagerError> {
        validate_config(&self.raft.committed_state().config, &config)?;
        self.raft.propose_change(TableChange::SetConfig(config))?;
        Ok(())
    }

    fn on_write(
        &mut self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        reply: Sender<Result<Version, WriteError>>,
    ) {
        let state = self.raft.committed_state();
        let (region, primary) = match state.contract_for_key(&key) {
            Some((region, (_, contract))) => (region.clone(), contract.primary),
            None => {
                let _ = reply.send(Err(WriteError::TableNotFound));
                return;
            }
        };
        match self.executions.get(&region) {
            Some(execution) if execution.role() == Role::Primary => {
                execution.write(key, value, reply)
            }
            _ => {
                let _ = reply.send(Err(WriteError::NotPrimary { primary }));
            }
        }
    }

    fn on_read(&mut self, key: Vec<u8>, reply: Sender<Result<Option<Vec<u8>>, ReadError>>) {
        let region = self
            .raft
            .committed_state()
            .contract_for_key(&key)
            .map(|(region, _)| region.clone());
        match region.and_then(|region| self.executions.get(&region)) {
            Some(execution) => execution.read(key, reply),
            None => {
                let _ = reply.send(Err(ReadError::NotReadable));
            }
        }
    }

    /* ↓↓↓ Acks ↓↓↓ */

    fn on_local_acks(&mut self) {
        let acks: Vec<LocalAck> = self.local_acks.try_iter().collect();
        for LocalAck {
            region,
            contract_id,
            ack,
        } in acks
        {
            self.latest_local_acks
                .insert(region.clone(), (contract_id, ack.clone()));
            self.forward_ack(region, contract_id, ack);
        }
    }

    /// Send an ack of a local execution to the leader, or record it directly if this server is the
    /// leader.
    fn forward_ack(&mut self, region: Region, contract_id: ContractId, ack: ContractAck) {
        let me = self.config.keypair.server_id();
        // Only servers that the region's contract mentions report to the leader.
        let mentioned = self
            .raft
            .committed_state()
            .region_to_contract
            .get(&region)
            .map_or(false, |(current_id, contract)| {
                *current_id == contract_id && contract.mentions(&me)
            });
        if !mentioned {
            return;
        }

        if self.raft.is_leader() {
            self.ack_directory.insert(me, region, contract_id, ack);
            return;
        }
        if let Some(leader) = self.raft.leader() {
            let bcard = LeaderBcard::new(leader, self.table, self.raft.term());
            let address = bcard.contract_ack_minidir;
            let signed =
                SignedContractAck::new(&self.config.keypair, self.table, region, contract_id, ack);
            self.sender.send_table_message(
                self.table,
                &address.server,
                TableMessage::ContractAck {
                    term: address.term,
                    ack: signed,
                },
            );
        }
    }

    fn resend_acks(&mut self) {
        let acks: Vec<(Region, (ContractId, ContractAck))> = self
            .latest_local_acks
            .iter()
            .map(|(region, ack)| (region.clone(), ack.clone()))
            .collect();
        for (region, (contract_id, ack)) in acks {
            self.forward_ack(region, contract_id, ack);
        }
    }

    /* ↓↓↓ Ticks ↓↓↓ */

    fn tick(&mut self) -> Result<(), TableManagerError> {
        self.ticks += 1;
        self.raft.tick()?;

        // A new leader starts with an empty ack directory.
        let leader_term = self.raft.is_leader().then(|| self.raft.term());
        if leader_term != self.leader_term {
            self.leader_term = leader_term;
            self.ack_directory.clear();
            self.resend_acks();
        }

        if self.ticks % self.config.ack_resend_ticks.max(1) == 0 {
            self.resend_acks();
            if self.raft.is_leader() {
                self.reactivate_silent_members();
            }
        }

        if self.raft.is_leader() {
            for server in self.raft.take_unknown_senders() {
                if !self.raft.latest_members().contains_key(&server) {
                    self.send_deactivate(server);
                }
            }
        } else {
            self.raft.take_unknown_senders();
        }

        if self.ticks % self.config.gc_interval_ticks.max(1) == 0 {
            self.collect_branch_garbage()?;
        }
        Ok(())
    }

    /// Send an activate action to every member that the leader has not heard from recently. Members
    /// that are already active ignore it.
    fn reactivate_silent_members(&mut self) {
        let live = self.raft.live_servers(self.config.liveness_timeout_ticks);
        let silent: Vec<(ServerId, RaftMemberId)> = self
            .raft
            .latest_members()
            .iter()
            .filter(|(server, _)| !live.contains(server))
            .map(|(server, member)| (*server, *member))
            .collect();
        for (server, member) in silent {
            self.send_activate(server, member);
        }
    }

    /* ↓↓↓ Commits ↓↓↓ */

    fn on_commits(&mut self) -> Result<(), TableManagerError> {
        let notifications = self.raft.take_commit_notifications();
        if notifications.is_empty() {
            return Ok(());
        }

        let me = self.config.keypair.server_id();
        for notification in notifications {
            match notification {
                CommitNotification::Entry(entry) => match entry.change {
                    TableChange::UpdateContracts { branch_history, .. } => {
                        self.branch_history
                            .import_branch_history(&branch_history)?;
                    }
                    TableChange::RemoveMember { server } if server == me => {
                        self.deactivate_self();
                    }
                    TableChange::RemoveMember { server } if self.raft.is_leader() => {
                        self.send_deactivate(server);
                    }
                    _ => (),
                },
                CommitNotification::Snapshot { .. } => {
                    let branch_history = self.raft.committed_state().branch_history.clone();
                    self.branch_history
                        .import_branch_history(&branch_history)?;
                }
            }
        }

        self.ack_directory.prune(self.raft.committed_state());
        self.reconcile_executions()
    }

    /// Make the local executions match the committed contracts.
    ///
    /// An execution whose role stays the same is notified of its new contract in place. An execution
    /// whose role changes is torn down, and its replacement only starts after its thread has exited.
    fn reconcile_executions(&mut self) -> Result<(), TableManagerError> {
        let me = self.config.keypair.server_id();
        let contracts: Vec<(Region, ContractId, Contract)> = self
            .raft
            .committed_state()
            .region_to_contract
            .iter()
            .map(|(region, (contract_id, contract))| (region.clone(), *contract_id, contract.clone()))
            .collect();

        for (region, contract_id, contract) in contracts {
            let role = classify(&me, &contract);
            let same_role = self
                .executions
                .get(&region)
                .map_or(false, |execution| execution.role() == role);

            if same_role {
                if self.execution_contracts.get(&region) != Some(&contract_id) {
                    let ack_callback = self.ack_callback(region.clone());
                    if let Some(execution) = self.executions.get(&region) {
                        execution.update_contract(contract_id, contract, ack_callback);
                    }
                    self.execution_contracts.insert(region, contract_id);
                }
                continue;
            }

            if let Some(execution) = self.executions.remove(&region) {
                execution.tear_down();
            }
            self.latest_local_acks.remove(&region);
            self.start_execution(role, region.clone(), contract_id, contract)?;
            self.execution_contracts.insert(region, contract_id);
        }
        Ok(())
    }

    fn start_execution(
        &mut self,
        role: Role,
        region: Region,
        contract_id: ContractId,
        contract: Contract,
    ) -> Result<(), TableManagerError> {
        let store = self
            .store
            .subview(&region)
            .ok_or(TableManagerError::Store(StoreError::RegionMismatch))?;
        let interruptor = Interruptor::new();
        let status = ExecutionHandle::new_status(region.clone(), role);
        let ctx = ExecutionContext::new(
            self.config.execution.clone(),
            self.table,
            store,
            self.branch_history.clone(),
            SenderHandle::new(self.network.clone()),
            self.event_publisher.clone(),
            interruptor.clone(),
            status.clone(),
            contract_id,
            contract,
            self.ack_callback(region.clone()),
        );
        let execution = ExecutionHandle::start(
            role,
            ctx,
            interruptor,
            status,
            self.config.tick_interval,
        );
        self.executions.insert(region, execution);
        Ok(())
    }

    fn ack_callback(&self, region: Region) -> AckCallback {
        let local_acks = self.local_ack_sender.clone();
        Box::new(move |contract_id, ack| {
            let _ = local_acks.send(LocalAck {
                region: region.clone(),
                contract_id,
                ack,
            });
        })
    }

    /// Stop the table manager if one of its executions failed. Such failures mean that the local state
    /// diverged from the committed state.
    fn check_executions(&self) -> Result<(), TableManagerError> {
        match self
            .executions
            .values()
            .find(|execution| execution.has_failed())
        {
            Some(execution) => Err(TableManagerError::ExecutionFailed {
                region: execution.region().clone(),
            }),
            None => Ok(()),
        }
    }

    /* ↓↓↓ Coordination ↓↓↓ */

    fn coordinate(&mut self) -> Result<(), TableManagerError> {
        if !self.raft.is_leader() || self.raft.has_uncommitted_entries() {
            return Ok(());
        }

        let live = self.raft.live_servers(self.config.liveness_timeout_ticks);
        let change = match coordinate(
            self.raft.committed_state(),
            &self.ack_directory,
            &live,
            self.config.ack_quorum,
        ) {
            Some(change) => change,
            None => return Ok(()),
        };

        log::debug!("Leader of table {} proposing {}", self.table, change.kind());
        let added = match &change {
            TableChange::AddMember { server, member } => Some((*server, *member)),
            _ => None,
        };
        match self.raft.propose_change(change) {
            Ok(_) => (),
            Err(ProposeError::NotLeader { .. }) => return Ok(()),
            Err(ProposeError::RaftError(err)) => return Err(err.into()),
        }

        // The new member has to start before the change can commit, since it counts towards the majority.
        if let Some((server, member)) = added {
            self.send_activate(server, member);
        }
        Ok(())
    }

    /* ↓↓↓ Actions ↓↓↓ */

    fn timestamp(&self) -> TableTimestamp {
        let state = self.raft.committed_state();
        TableTimestamp::new(state.epoch, state.log_index)
    }

    fn send_activate(&mut self, server: ServerId, member: RaftMemberId) {
        let action = TableAction::Activate {
            table: self.table,
            timestamp: self.timestamp(),
            member,
            snapshot: self.raft.activation_snapshot(),
        };
        self.send_action(server, action)
    }

    fn send_deactivate(&mut self, server: ServerId) {
        log::debug!("Telling {} to leave table {}", server, self.table);
        let action = TableAction::Deactivate {
            table: self.table,
            timestamp: self.timestamp(),
            config: self.raft.committed_state().config.clone(),
        };
        self.send_action(server, action)
    }

    fn deactivate_self(&mut self) {
        let me = self.config.keypair.server_id();
        self.send_deactivate(me)
    }

    fn send_action(&mut self, server: ServerId, action: TableAction) {
        if server == self.config.keypair.server_id() {
            let _ = self.local_actions.send(action);
        } else {
            self.sender.send(&server, action);
        }
    }

    /* ↓↓↓ Branch garbage collection ↓↓↓ */

    /// Delete the branches that neither the committed history nor a local version referred to, both in
    /// the previous pass and in this one.
    fn collect_branch_garbage(&mut self) -> Result<(), TableManagerError> {
        let state = self.raft.committed_state();
        let mut roots: BTreeSet<BranchId> = state
            .region_to_contract
            .values()
            .map(|(_, contract)| contract.branch)
            .collect();
        roots.extend(state.branch_history.iter().map(|(branch, _)| *branch));
        for (_, ack) in self.latest_local_acks.values() {
            roots.extend(ack.branch);
            if let Some(range) = ack.version {
                roots.insert(range.earliest.branch);
                roots.insert(range.latest.branch);
            }
        }
        for execution in self.executions.values() {
            roots.extend(execution.status().version.map(|version| version.branch));
        }

        let mut candidates = BTreeSet::new();
        self.branch_history.prepare_gc(roots, &mut candidates)?;
        let garbage: BTreeSet<BranchId> = candidates
            .intersection(&self.gc_candidates)
            .copied()
            .collect();
        self.branch_history.perform_gc(&garbage)?;
        self.gc_candidates = candidates.difference(&garbage).copied().collect();
        Ok(())
    }

    /* ↓↓↓ Status ↓↓↓ */

    fn refresh_status(&mut self) {
        let is_leader = self.raft.is_leader();
        let state = self.raft.committed_state();

        let contract_acks: Vec<ContractAckEntry> = if is_leader {
            self.ack_directory
                .iter()
                .map(|((server, region), (contract_id, ack))| ContractAckEntry {
                    server: *server,
                    region: region.clone(),
                    contract_id: *contract_id,
                    ack: ack.clone(),
                })
                .collect()
        } else {
            let me = self.config.keypair.server_id();
            self.latest_local_acks
                .iter()
                .map(|(region, (contract_id, ack))| ContractAckEntry {
                    server: me,
                    region: region.clone(),
                    contract_id: *contract_id,
                    ack: ack.clone(),
                })
                .collect()
        };

        let cache = TableStatusCache {
            raft: RaftStatus {
                state: state.clone(),
                term: self.raft.term(),
                commit_index: self.raft.commit_index(),
                is_leader,
                leader: self
                    .raft
                    .leader()
                    .map(|leader| LeaderBcard::new(leader, self.table, self.raft.term())),
            },
            contract_acks,
            shard_status: self
                .executions
                .values()
                .map(|execution| execution.status())
                .collect(),
            all_replicas_ready: is_leader && all_replicas_ready(state, &self.ack_directory),
        };
        *self.status.lock().unwrap() = cache; // Safety: the cache is never locked across a panic.
    }
}

fn validate_config(current: &TableConfig, new: &TableConfig) -> Result<(), TableManagerError> {
    new.validate()?;
    if !current.has_same_shard_scheme(new) {
        return Err(TableManagerError::ShardSchemeChanged);
    }
    Ok(())
}

/// Reasons why a table manager stopped, or rejected a request.
#[derive(Debug)]
pub enum TableManagerError {
    /// The Raft layer failed to persist its state.
    Raft(RaftError),

    /// The local branch history diverged from the committed state.
    BranchHistory(BranchHistoryError),

    /// The storage collaborator rejected an operation.
    Store(StoreError),

    /// The execution of `region` stopped with an error.
    ExecutionFailed { region: Region },

    /// The request must be sent to the leader, which is currently unknown.
    NoLeader,

    /// This server does not participate in the table.
    NotParticipating,

    /// The new config is not valid.
    InvalidConfig(TableConfigError),

    /// The new config splits the key space differently from the current one.
    ShardSchemeChanged,
}

impl Display for TableManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TableManagerError::Raft(err) => write!(f, "{}", err),
            TableManagerError::BranchHistory(err) => write!(f, "{}", err),
            TableManagerError::Store(err) => write!(f, "store error: {}", err),
            TableManagerError::ExecutionFailed { region } => {
                write!(f, "execution of {} failed", region)
            }
            TableManagerError::NoLeader => write!(f, "no leader known"),
            TableManagerError::NotParticipating => {
                write!(f, "this server does not participate in the table")
            }
            TableManagerError::InvalidConfig(err) => write!(f, "invalid config: {:?}", err),
            TableManagerError::ShardSchemeChanged => {
                write!(f, "changing the split points of a table is not supported")
            }
        }
    }
}

impl From<RaftError> for TableManagerError {
    fn from(value: RaftError) -> Self {
        TableManagerError::Raft(value)
    }
}

impl From<ProposeError> for TableManagerError {
    fn from(value: ProposeError) -> Self {
        match value {
            ProposeError::NotLeader { .. } => TableManagerError::NoLeader,
            ProposeError::RaftError(err) => TableManagerError::Raft(err),
        }
    }
}

impl From<BranchHistoryError> for TableManagerError {
    fn from(value: BranchHistoryError) -> Self {
        TableManagerError::BranchHistory(value)
    }
}

impl From<TableConfigError> for TableManagerError {
    fn from(value: TableConfigError) -> Self {
        TableManagerError::InvalidConfig(value)
    }
}
