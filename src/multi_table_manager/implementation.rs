/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The multi-table manager thread and the procedures used in it.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    branch_history::{BranchHistoryError, BranchHistoryManager},
    events::{ActivateTableEvent, DeactivateTableEvent, DropTableEvent, Event},
    execution::{ReadError, WriteError},
    networking::{messages::Message, network::Network, sending::SenderHandle},
    persistence::{
        pluggables::{KVGet, KVGetError, KVStore},
        write_batch::{KVSetError, PersistenceWriteBatch},
        PersistenceError,
    },
    raft::{
        implementation::{RaftConfiguration, RaftMember},
        log::{RaftError, RaftLog},
        types::{RaftSnapshot, TableRaftState},
    },
    storage::Storage,
    table_manager::{
        implementation::{
            TableManager, TableManagerConfiguration, TableManagerError, TableManagerHandle,
            TableManagerInput,
        },
        status::{TableStatusRequest, TableStatusResponse},
    },
    types::{
        branch::Version,
        data_types::{RaftMemberId, ServerId, TableId},
        table_config::{TableConfig, TableConfigError},
    },
};

use super::types::{
    TableAction, TableActivePersistentState, TableInactivePersistentState, TablePersistentState,
    TableTimestamp,
};

/// How long the multi-table manager waits for a network message before checking its other inputs.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Configuration of the multi-table manager, and of every table it manages.
#[derive(Clone)]
pub(crate) struct MultiTableManagerConfiguration {
    pub(crate) me: ServerId,
    pub(crate) request_timeout: Duration,
    pub(crate) raft: RaftConfiguration,
    pub(crate) table_manager: TableManagerConfiguration,
}

/// Requests that the [server](crate::server::Server) sends to the multi-table manager thread. Every
/// request carries the sender that its reply goes to.
pub(crate) enum MultiTableManagerRequest {
    CreateTable {
        config: TableConfig,
        reply: Sender<Result<TableId, MultiTableManagerError>>,
    },
    DropTable {
        table: TableId,
        reply: Sender<Result<(), MultiTableManagerError>>,
    },
    SetConfig {
        table: TableId,
        config: TableConfig,
        reply: Sender<Result<(), TableManagerError>>,
    },
    Status {
        table: TableId,
        request: TableStatusRequest,
        reply: Sender<Option<TableStatusResponse>>,
    },
    RemoteStatus {
        server: ServerId,
        table: TableId,
        request: TableStatusRequest,
        reply: Sender<Option<TableStatusResponse>>,
    },
    Write {
        table: TableId,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        reply: Sender<Result<Version, WriteError>>,
    },
    Read {
        table: TableId,
        key: Vec<u8>,
        reply: Sender<Result<Option<Vec<u8>>, ReadError>>,
    },
    Tables {
        reply: Sender<BTreeSet<TableId>>,
    },
}

/// Owner of every table manager of a server.
///
/// Persists which tables this server participates in, starts and stops
/// [table managers](crate::table_manager) in response to [`TableAction`]s, and routes network messages
/// and client requests to them.
pub(crate) struct MultiTableManager<K: KVStore, S: Storage, N: Network> {
    config: MultiTableManagerConfiguration,
    kv_store: K,
    storage: S,
    network: N,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,

    table_managers: BTreeMap<TableId, TableManagerHandle>,

    local_action_sender: Sender<TableAction>,
    local_actions: Receiver<TableAction>,

    next_request_id: u64,
    pending_status_requests: BTreeMap<u64, (Sender<Option<TableStatusResponse>>, Instant)>,
}

impl<K: KVStore, S: Storage, N: Network + 'static> MultiTableManager<K, S, N> {
    pub(crate) fn new(
        config: MultiTableManagerConfiguration,
        kv_store: K,
        storage: S,
        network: N,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let (local_action_sender, local_actions) = mpsc::channel();
        Self {
            sender: SenderHandle::new(network.clone()),
            config,
            kv_store,
            storage,
            network,
            event_publisher,
            table_managers: BTreeMap::new(),
            local_action_sender,
            local_actions,
            next_request_id: 0,
            pending_status_requests: BTreeMap::new(),
        }
    }

    /// Start the multi-table manager thread. The thread first resumes every table this server is an
    /// active member of, then serves `requests` and the network `messages` until `shutdown_signal` fires.
    pub(crate) fn start(
        mut self,
        requests: Receiver<MultiTableManagerRequest>,
        messages: Receiver<(ServerId, Message)>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(err) = self.load_tables() {
                log::error!("Failed to resume tables: {}", err);
            }

            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => break,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("Multi-table manager thread disconnected from main thread")
                    }
                }

                for request in requests.try_iter() {
                    self.on_request(request);
                }

                let local_actions: Vec<TableAction> = self.local_actions.try_iter().collect();
                for action in local_actions {
                    self.on_action(action);
                }

                match messages.recv_timeout(POLL_INTERVAL) {
                    Ok((origin, msg)) => {
                        self.on_receive_msg(origin, msg);
                        for (origin, msg) in messages.try_iter() {
                            self.on_receive_msg(origin, msg);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => (),
                    Err(RecvTimeoutError::Disconnected) => {
                        panic!("Multi-table manager thread disconnected from poller")
                    }
                }

                self.prune_status_requests();
            }

            // Stop every table manager before the thread exits, so that their executions are torn down
            // before the network and storage are dropped.
            self.table_managers.clear();
        })
    }

    /* ↓↓↓ Startup ↓↓↓ */

    /// Resume every table this server is active in, and erase the data of every other table.
    fn load_tables(&mut self) -> Result<(), MultiTableManagerError> {
        let table_ids = self.kv_store.table_ids()?;
        for table in &table_ids {
            match self.kv_store.table_persistent_state(table)? {
                Some(TablePersistentState::Active(active)) => self.resume_table(*table, active)?,
                Some(TablePersistentState::Inactive(_)) => {
                    // A previous run may have crashed between persisting the deactivation and erasing.
                    log::debug!("Erasing leftover data of inactive table {}", table);
                    self.storage.drop_table(*table);
                }
                None => (),
            }
        }

        for table in self.storage.tables() {
            if !table_ids.contains(&table) {
                log::info!("Erasing data of unknown table {}", table);
                self.storage.drop_table(table);
            }
        }

        Ok(())
    }

    fn resume_table(
        &mut self,
        table: TableId,
        active: TableActivePersistentState,
    ) -> Result<(), MultiTableManagerError> {
        let raft = RaftMember::load(
            self.config.raft.clone(),
            table,
            active.raft_member_id,
            self.kv_store.clone(),
            SenderHandle::new(self.network.clone()),
            self.event_publisher.clone(),
        )?;

        match raft {
            Some(raft) => {
                log::info!("Resuming table {} as member {}", table, active.raft_member_id);
                self.start_table_manager(table, raft);
            }
            None => {
                // Activation did not get as far as persisting the Raft state. Forget the table
                // entirely, so that a retried activation is accepted.
                log::warn!("Table {} has no Raft state, forgetting it", table);
                self.erase_table(table)?;
                let mut table_ids = self.kv_store.table_ids()?;
                table_ids.remove(&table);
                let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
                wb.set_table_ids(&table_ids)?;
                wb.delete_table_persistent_state(&table);
                self.kv_store.clone().write(wb.into_inner());
            }
        }
        Ok(())
    }

    /* ↓↓↓ Requests ↓↓↓ */

    fn on_request(&mut self, request: MultiTableManagerRequest) {
        match request {
            MultiTableManagerRequest::CreateTable { config, reply } => {
                let _ = reply.send(self.create_table(config));
            }
            MultiTableManagerRequest::DropTable { table, reply } => {
                let _ = reply.send(self.drop_table(table));
            }
            MultiTableManagerRequest::SetConfig {
                table,
                config,
                reply,
            } => match self.table_managers.get(&table) {
                Some(table_manager) => {
                    table_manager.send(TableManagerInput::SetConfig { config, reply })
                }
                None => {
                    let _ = reply.send(Err(TableManagerError::NotParticipating));
                }
            },
            MultiTableManagerRequest::Status {
                table,
                request,
                reply,
            } => {
                let _ = reply.send(self.local_status(&table, &request));
            }
            MultiTableManagerRequest::RemoteStatus {
                server,
                table,
                request,
                reply,
            } => {
                if server == self.config.me {
                    let _ = reply.send(self.local_status(&table, &request));
                } else {
                    let request_id = self.next_request_id;
                    self.next_request_id += 1;
                    self.pending_status_requests
                        .insert(request_id, (reply, Instant::now()));
                    self.sender.send(
                        &server,
                        Message::StatusRequest {
                            request_id,
                            table,
                            request,
                        },
                    );
                }
            }
            MultiTableManagerRequest::Write {
                table,
                key,
                value,
                reply,
            } => match self.table_managers.get(&table) {
                Some(table_manager) => {
                    table_manager.send(TableManagerInput::Write { key, value, reply })
                }
                None => {
                    let _ = reply.send(Err(WriteError::TableNotFound));
                }
            },
            MultiTableManagerRequest::Read { table, key, reply } => {
                match self.table_managers.get(&table) {
                    Some(table_manager) => table_manager.send(TableManagerInput::Read { key, reply }),
                    None => {
                        let _ = reply.send(Err(ReadError::TableNotFound));
                    }
                }
            }
            MultiTableManagerRequest::Tables { reply } => {
                let _ = reply.send(self.table_managers.keys().copied().collect());
            }
        }
    }

    /// Create a table with `config`, by activating every configured server with the same initial
    /// snapshot.
    fn create_table(&mut self, config: TableConfig) -> Result<TableId, MultiTableManagerError> {
        let state = TableRaftState::new_table(config)?;
        let table = TableId::generate();
        log::info!(
            "Creating table {} ({}) on {} servers",
            table,
            state.config.name,
            state.member_ids.len()
        );

        let snapshot = RaftSnapshot::initial(state);
        for (server, member) in snapshot.state.member_ids.clone() {
            let action = TableAction::Activate {
                table,
                timestamp: TableTimestamp::default(),
                member,
                snapshot: snapshot.clone(),
            };
            self.send_action(server, action);
        }
        Ok(table)
    }

    /// Tell every server that may hold data of `table` to drop it.
    fn drop_table(&mut self, table: TableId) -> Result<(), MultiTableManagerError> {
        let (servers, timestamp) = match self.table_managers.get(&table) {
            Some(table_manager) => {
                let state = table_manager.status().raft.state;
                let servers: BTreeSet<ServerId> = state
                    .member_ids
                    .keys()
                    .copied()
                    .chain(state.config.all_servers())
                    .chain(
                        state
                            .region_to_contract
                            .values()
                            .flat_map(|(_, contract)| contract.all_servers().copied()),
                    )
                    .collect();
                (servers, TableTimestamp::new(state.epoch, state.log_index))
            }
            None => match self.kv_store.table_persistent_state(&table)? {
                Some(TablePersistentState::Inactive(TableInactivePersistentState {
                    second_hand_config: Some(config),
                    timestamp,
                })) => (config.all_servers(), timestamp),
                _ => return Err(MultiTableManagerError::TableNotFound),
            },
        };

        log::info!("Dropping table {} on {} servers", table, servers.len());
        for server in servers.into_iter().filter(|server| *server != self.config.me) {
            self.sender.send(&server, TableAction::Drop { table, timestamp });
        }
        // Also dropped locally even if this server is no longer named anywhere.
        self.on_action(TableAction::Drop { table, timestamp });
        Ok(())
    }

    fn local_status(
        &self,
        table: &TableId,
        request: &TableStatusRequest,
    ) -> Option<TableStatusResponse> {
        self.table_managers
            .get(table)
            .map(|table_manager| table_manager.status().respond(request))
    }

    fn prune_status_requests(&mut self) {
        let timeout = self.config.request_timeout;
        self.pending_status_requests
            .retain(|_, (_, sent_at)| sent_at.elapsed() < timeout);
    }

    /* ↓↓↓ Network messages ↓↓↓ */

    fn on_receive_msg(&mut self, origin: ServerId, msg: Message) {
        match msg {
            Message::Table { table, msg } => match self.table_managers.get(&table) {
                Some(table_manager) => {
                    table_manager.send(TableManagerInput::Message { origin, msg })
                }
                None => log::trace!(
                    "Dropping message from {} for table {}, which is not active here",
                    origin,
                    table
                ),
            },
            Message::Action(action) => {
                log::debug!(
                    "Received {} action for table {} from {}",
                    action_kind(&action),
                    action.table(),
                    origin
                );
                self.on_action(action)
            }
            Message::StatusRequest {
                request_id,
                table,
                request,
            } => {
                let response = self.local_status(&table, &request);
                self.sender.send(
                    &origin,
                    Message::StatusResponse {
                        request_id,
                        response,
                    },
                );
            }
            Message::StatusResponse {
                request_id,
                response,
            } => {
                if let Some((reply, _)) = self.pending_status_requests.remove(&request_id) {
                    let _ = reply.send(response);
                }
            }
        }
    }

    /* ↓↓↓ Table actions ↓↓↓ */

    fn send_action(&mut self, server: ServerId, action: TableAction) {
        if server == self.config.me {
            let _ = self.local_action_sender.send(action);
        } else {
            self.sender.send(&server, action);
        }
    }

    fn on_action(&mut self, action: TableAction) {
        let table = action.table();
        if let Err(err) = self.try_action(action) {
            log::error!("Failed to apply action to table {}: {}", table, err);
        }
    }

    fn try_action(&mut self, action: TableAction) -> Result<(), MultiTableManagerError> {
        let table = action.table();
        if let Some(persisted) = self.kv_store.table_persistent_state(&table)? {
            if is_stale(&persisted, &action) {
                log::debug!(
                    "Ignoring stale {} action for table {}",
                    action_kind(&action),
                    table
                );
                return Ok(());
            }
        }

        match action {
            TableAction::Activate {
                table,
                member,
                snapshot,
                ..
            } => self.activate(table, member, snapshot),
            TableAction::Deactivate {
                table,
                timestamp,
                config,
            } => {
                log::info!("Leaving table {}", table);
                self.leave_table(table, timestamp, Some(config))?;
                Event::DeactivateTable(DeactivateTableEvent {
                    timestamp: SystemTime::now(),
                    table,
                })
                .publish(&self.event_publisher);
                Ok(())
            }
            TableAction::Drop { table, timestamp } => {
                // Remembered even if this server never participated, so that a late activation is
                // rejected.
                let was_known = self.kv_store.table_persistent_state(&table)?.is_some();
                self.leave_table(table, timestamp, None)?;
                if was_known {
                    log::info!("Dropped table {}", table);
                    Event::DropTable(DropTableEvent {
                        timestamp: SystemTime::now(),
                        table,
                    })
                    .publish(&self.event_publisher);
                }
                Ok(())
            }
        }
    }

    fn activate(
        &mut self,
        table: TableId,
        member: RaftMemberId,
        snapshot: RaftSnapshot,
    ) -> Result<(), MultiTableManagerError> {
        log::info!("Joining table {} as member {}", table, member);

        // A previous member's table manager must be gone before the new member's Raft state replaces
        // the old one.
        self.table_managers.remove(&table);
        RaftLog::delete(&self.kv_store, &table)?;

        let state = TablePersistentState::Active(TableActivePersistentState {
            epoch: snapshot.state.epoch,
            raft_member_id: member,
        });
        self.persist_state(table, &state)?;

        let raft = RaftMember::activate(
            self.config.raft.clone(),
            table,
            member,
            snapshot,
            self.kv_store.clone(),
            SenderHandle::new(self.network.clone()),
            self.event_publisher.clone(),
        )?;
        self.start_table_manager(table, raft);

        Event::ActivateTable(ActivateTableEvent {
            timestamp: SystemTime::now(),
            table,
            member,
        })
        .publish(&self.event_publisher);
        Ok(())
    }

    /// Stop participating in `table`, erase everything stored for it, and remember that this server was
    /// once a member. `config` is `None` if the table was dropped.
    fn leave_table(
        &mut self,
        table: TableId,
        timestamp: TableTimestamp,
        config: Option<TableConfig>,
    ) -> Result<(), MultiTableManagerError> {
        self.table_managers.remove(&table);
        self.erase_table(table)?;
        let state = TablePersistentState::Inactive(TableInactivePersistentState {
            second_hand_config: config,
            timestamp,
        });
        self.persist_state(table, &state)
    }

    fn erase_table(&mut self, table: TableId) -> Result<(), MultiTableManagerError> {
        RaftLog::delete(&self.kv_store, &table)?;
        BranchHistoryManager::new(self.kv_store.clone(), table).delete_all()?;
        self.storage.drop_table(table);
        Ok(())
    }

    fn persist_state(
        &mut self,
        table: TableId,
        state: &TablePersistentState,
    ) -> Result<(), MultiTableManagerError> {
        let mut table_ids = self.kv_store.table_ids()?;
        table_ids.insert(table);
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        wb.set_table_ids(&table_ids)?;
        wb.set_table_persistent_state(&table, state)?;
        self.kv_store.clone().write(wb.into_inner());
        Ok(())
    }

    fn start_table_manager(&mut self, table: TableId, raft: RaftMember<K, N>) {
        let handle = TableManager::start(
            self.config.table_manager.clone(),
            table,
            raft,
            self.kv_store.clone(),
            self.storage.open_table(table),
            self.network.clone(),
            self.local_action_sender.clone(),
            self.event_publisher.clone(),
        );
        self.table_managers.insert(table, handle);
    }
}

/// Check whether `action` is older than what this server has already persisted for its table.
///
/// Drops are never stale. Everything else is stale if the table was dropped, if its timestamp is older
/// than the persisted state's, or if it activates the member this server already is.
pub(crate) fn is_stale(persisted: &TablePersistentState, action: &TableAction) -> bool {
    if let TableAction::Drop { .. } = action {
        return false;
    }

    match persisted {
        TablePersistentState::Inactive(TableInactivePersistentState {
            second_hand_config: None,
            ..
        }) => true,
        _ if action.timestamp() < persisted.timestamp() => true,
        TablePersistentState::Active(active) => matches!(
            action,
            TableAction::Activate { member, .. } if *member == active.raft_member_id
        ),
        TablePersistentState::Inactive(_) => false,
    }
}

fn action_kind(action: &TableAction) -> &'static str {
    match action {
        TableAction::Activate { .. } => "activate",
        TableAction::Deactivate { .. } => "deactivate",
        TableAction::Drop { .. } => "drop",
    }
}

/// Errors that the multi-table manager may encounter while changing this server's participation in a
/// table.
#[derive(Debug)]
pub enum MultiTableManagerError {
    Persistence(PersistenceError),
    Raft(RaftError),
    BranchHistory(BranchHistoryError),
    InvalidConfig(TableConfigError),

    /// This server neither participates in the table nor remembers where it lives.
    TableNotFound,
}

impl Display for MultiTableManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MultiTableManagerError::Persistence(err) => write!(f, "persistence error: {:?}", err),
            MultiTableManagerError::Raft(err) => write!(f, "{}", err),
            MultiTableManagerError::BranchHistory(err) => write!(f, "{}", err),
            MultiTableManagerError::InvalidConfig(err) => write!(f, "invalid config: {:?}", err),
            MultiTableManagerError::TableNotFound => write!(f, "table not found"),
        }
    }
}

impl From<KVGetError> for MultiTableManagerError {
    fn from(value: KVGetError) -> Self {
        MultiTableManagerError::Persistence(PersistenceError::KVGetError(value))
    }
}

impl From<KVSetError> for MultiTableManagerError {
    fn from(value: KVSetError) -> Self {
        MultiTableManagerError::Persistence(PersistenceError::KVSetError(value))
    }
}

impl From<RaftError> for MultiTableManagerError {
    fn from(value: RaftError) -> Self {
        MultiTableManagerError::Raft(value)
    }
}

impl From<BranchHistoryError> for MultiTableManagerError {
    fn from(value: BranchHistoryError) -> Self {
        MultiTableManagerError::BranchHistory(value)
    }
}

impl From<TableConfigError> for MultiTableManagerError {
    fn from(value: TableConfigError) -> Self {
        MultiTableManagerError::InvalidConfig(value)
    }
}
