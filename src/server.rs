/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a server, and to operate on the tables it participates in.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the server](ServerSpec) with:
//!   1. `ServerSpec::builder` to construct a `ServerSpecBuilder`,
//!   2. The setters of the `ServerSpecBuilder`, and
//!   3. The `ServerSpecBuilder::build` method to construct a [`ServerSpec`],
//! - The function to [start](ServerSpec::start) a [`Server`] given its specification,
//! - [The type](Server) which keeps the server alive, and through which clients create, configure,
//!   drop, write to, and query tables.
//!
//! ## Starting a server
//!
//! ```ignore
//! let server =
//!     ServerSpec::builder()
//!     .kv_store(kv_store)
//!     .network(network)
//!     .storage(storage)
//!     .configuration(configuration)
//!     .on_commit_table_change(commit_handler)
//!     .build()
//!     .start();
//! ```
//!
//! ### Required setters
//!
//! - `.kv_store(...)`: where the server persists its metadata.
//! - `.network(...)`: how the server reaches its peers.
//! - `.storage(...)`: where the server keeps the data of its regions.
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters register user-defined handlers for the events in [crate::events]:
//! - `.on_become_leader(...)`
//! - `.on_commit_table_change(...)`
//! - `.on_update_contract_ack(...)`
//! - `.on_start_execution(...)`
//! - `.on_tear_down_execution(...)`
//! - `.on_create_branch(...)`
//! - `.on_complete_erase(...)`
//! - `.on_activate_table(...)`
//! - `.on_deactivate_table(...)`
//! - `.on_drop_table(...)`
//!
//! ## Talking to a server
//!
//! Every method of [`Server`] hands a request to the multi-table manager thread and waits up to
//! [`Configuration::request_timeout`] for the reply. None of them waits for a quorum of servers: a
//! successful [`set_table_config`](Server::set_table_config) only means that the leader accepted the
//! config, and [`table_status`](Server::table_status) reports the progress of realizing it.

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread::JoinHandle,
    time::Duration,
};

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::{
    coordinator::quorum::AckQuorum,
    event_bus::{start_event_bus, EventHandlers, HandlerPtr, UserHandlers},
    events::*,
    execution::{ExecutionConfiguration, ReadError, WriteError},
    multi_table_manager::implementation::{
        MultiTableManager, MultiTableManagerConfiguration, MultiTableManagerError,
        MultiTableManagerRequest,
    },
    networking::{network::Network, receiving::start_polling},
    persistence::pluggables::KVStore,
    raft::implementation::RaftConfiguration,
    storage::Storage,
    table_manager::{
        implementation::{TableManagerConfiguration, TableManagerError},
        status::{TableStatusRequest, TableStatusResponse},
    },
    types::{
        branch::Version,
        crypto_primitives::Keypair,
        data_types::{ServerId, TableId},
        table_config::TableConfig,
    },
};

/// Stores the user-defined parameters required to start a server.
///
/// Every timer of the replication protocol counts *ticks* of [`tick_interval`](Self::tick_interval),
/// so scaling `tick_interval` scales every timeout at once.
///
/// ## Log Events
///
/// The server logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
/// onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].
    Required:
    - `.me(...)`
    - `.log_events(...)`
    Optional:
    - `.tick_interval(...)`
    - `.heartbeat_ticks(...)`
    - `.election_timeout_ticks(...)`
    - `.liveness_timeout_ticks(...)`
    - `.ack_resend_ticks(...)`
    - `.gc_interval_ticks(...)`
    - `.log_compaction_threshold(...)`
    - `.max_entries_per_append(...)`
    - `.backfill_chunk_size(...)`
    - `.backfill_retry_ticks(...)`
    - `.ack_quorum(...)`
    - `.request_timeout(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the server's keypair, used to identify the server and sign its acks. Required."))]
    pub me: SigningKey,

    #[builder(
        default = Duration::from_millis(50),
        setter(doc = "Set the duration of one tick. Defaults to 50 milliseconds.")
    )]
    pub tick_interval: Duration,

    #[builder(
        default = 2,
        setter(doc = "Set how often, in ticks, a Raft leader and a primary send heartbeats. Defaults to 2.")
    )]
    pub heartbeat_ticks: u64,

    #[builder(
        default = (10, 20),
        setter(doc = "Set the range, in ticks, that Raft election timeouts are drawn from. Defaults to (10, 20).")
    )]
    pub election_timeout_ticks: (u64, u64),

    #[builder(
        default = 20,
        setter(doc = "Set how long, in ticks, a server may stay silent before the leader considers it failed. Defaults to 20.")
    )]
    pub liveness_timeout_ticks: u64,

    #[builder(
        default = 10,
        setter(doc = "Set how often, in ticks, acks are re-sent to the leader. Defaults to 10.")
    )]
    pub ack_resend_ticks: u64,

    #[builder(
        default = 100,
        setter(doc = "Set how often, in ticks, unreachable branches are collected. Defaults to 100.")
    )]
    pub gc_interval_ticks: u64,

    #[builder(
        default = 1000,
        setter(doc = "Set how many applied entries the Raft log keeps before compacting. Defaults to 1000.")
    )]
    pub log_compaction_threshold: u64,

    #[builder(
        default = 64,
        setter(doc = "Set the maximum number of entries in one Raft append message. Defaults to 64.")
    )]
    pub max_entries_per_append: usize,

    #[builder(
        default = 256,
        setter(doc = "Set the maximum number of keys in one backfill chunk. Defaults to 256.")
    )]
    pub backfill_chunk_size: usize,

    #[builder(
        default = 10,
        setter(doc = "Set how long, in ticks, a secondary waits for a backfill chunk before asking again. Defaults to 10.")
    )]
    pub backfill_retry_ticks: u64,

    #[builder(
        default,
        setter(doc = "Set how many replicas must be streaming before a primary is ready. Defaults to a majority.")
    )]
    pub ack_quorum: AckQuorum,

    #[builder(
        default = Duration::from_secs(5),
        setter(doc = "Set how long the methods of [Server] wait for a reply. Defaults to 5 seconds.")
    )]
    pub request_timeout: Duration,

    #[builder(setter(doc = "Enable logging of events? Required."))]
    pub log_events: bool,
}

impl From<Configuration> for MultiTableManagerConfiguration {
    fn from(value: Configuration) -> Self {
        let keypair = Keypair::new(value.me);
        let me = keypair.server_id();
        MultiTableManagerConfiguration {
            me,
            request_timeout: value.request_timeout,
            raft: RaftConfiguration {
                me,
                heartbeat_ticks: value.heartbeat_ticks,
                election_timeout_ticks: value.election_timeout_ticks,
                log_compaction_threshold: value.log_compaction_threshold,
                max_entries_per_append: value.max_entries_per_append,
            },
            table_manager: TableManagerConfiguration {
                keypair,
                tick_interval: value.tick_interval,
                liveness_timeout_ticks: value.liveness_timeout_ticks,
                ack_resend_ticks: value.ack_resend_ticks,
                gc_interval_ticks: value.gc_interval_ticks,
                ack_quorum: value.ack_quorum,
                execution: ExecutionConfiguration {
                    me,
                    heartbeat_ticks: value.heartbeat_ticks,
                    backfill_chunk_size: value.backfill_chunk_size,
                    backfill_retry_ticks: value.backfill_retry_ticks,
                    ack_quorum: value.ack_quorum,
                },
            },
        }
    }
}

/// Stores all the trait implementations and parameters required to run a [`Server`].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ServerSpec]. On the builder call the following methods to construct a valid [ServerSpec].
    Required:
    - `.kv_store(...)`
    - `.network(...)`
    - `.storage(...)`
    - `.configuration(...)`
    Optional:
    - `.on_become_leader(...)`
    - `.on_commit_table_change(...)`
    - `.on_update_contract_ack(...)`
    - `.on_start_execution(...)`
    - `.on_tear_down_execution(...)`
    - `.on_create_branch(...)`
    - `.on_complete_erase(...)`
    - `.on_activate_table(...)`
    - `.on_deactivate_table(...)`
    - `.on_drop_table(...)`
"))]
pub struct ServerSpec<K: KVStore, S: Storage, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the implementation of the server's metadata store. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. Required."))]
    network: N,
    #[builder(setter(doc = "Set the implementation of the storage that region data lives in. Required."))]
    storage: S,
    #[builder(setter(doc = "Set the [configuration](Configuration) of the server. Required."))]
    configuration: Configuration,

    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&BecomeLeaderEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<BecomeLeaderEvent>),
    doc = "Register a handler closure to be invoked after this server becomes the leader of a table. Optional."))]
    on_become_leader: Option<HandlerPtr<BecomeLeaderEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitTableChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitTableChangeEvent>),
    doc = "Register a handler closure to be invoked after a change to a table's replicated state is committed. Optional."))]
    on_commit_table_change: Option<HandlerPtr<CommitTableChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateContractAckEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateContractAckEvent>),
    doc = "Register a handler closure to be invoked after a local execution produces a new ack. Optional."))]
    on_update_contract_ack: Option<HandlerPtr<UpdateContractAckEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartExecutionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartExecutionEvent>),
    doc = "Register a handler closure to be invoked after a local execution starts. Optional."))]
    on_start_execution: Option<HandlerPtr<StartExecutionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TearDownExecutionEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TearDownExecutionEvent>),
    doc = "Register a handler closure to be invoked after a local execution is torn down. Optional."))]
    on_tear_down_execution: Option<HandlerPtr<TearDownExecutionEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CreateBranchEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CreateBranchEvent>),
    doc = "Register a handler closure to be invoked after a local primary creates a branch. Optional."))]
    on_create_branch: Option<HandlerPtr<CreateBranchEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CompleteEraseEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CompleteEraseEvent>),
    doc = "Register a handler closure to be invoked after a local erase execution finishes. Optional."))]
    on_complete_erase: Option<HandlerPtr<CompleteEraseEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ActivateTableEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ActivateTableEvent>),
    doc = "Register a handler closure to be invoked after this server joins a table. Optional."))]
    on_activate_table: Option<HandlerPtr<ActivateTableEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DeactivateTableEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DeactivateTableEvent>),
    doc = "Register a handler closure to be invoked after this server leaves a table. Optional."))]
    on_deactivate_table: Option<HandlerPtr<DeactivateTableEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&DropTableEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<DropTableEvent>),
    doc = "Register a handler closure to be invoked after this server drops a table. Optional."))]
    on_drop_table: Option<HandlerPtr<DropTableEvent>>,
}

impl<K: KVStore, S: Storage, N: Network + 'static> ServerSpec<K, S, N> {
    /// Start the server's threads: the poller, the multi-table manager (which resumes every table this
    /// server is an active member of), and the event bus if any event handler is registered.
    pub fn start(self) -> Server {
        let user_handlers = UserHandlers {
            on_become_leader: self.on_become_leader,
            on_commit_table_change: self.on_commit_table_change,
            on_update_contract_ack: self.on_update_contract_ack,
            on_start_execution: self.on_start_execution,
            on_tear_down_execution: self.on_tear_down_execution,
            on_create_branch: self.on_create_branch,
            on_complete_erase: self.on_complete_erase,
            on_activate_table: self.on_activate_table,
            on_deactivate_table: self.on_deactivate_table,
            on_drop_table: self.on_drop_table,
        };
        let event_handlers = EventHandlers::new(self.configuration.log_events, user_handlers);

        let (event_bus, event_bus_shutdown, event_publisher) = if !event_handlers.is_empty() {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus =
                start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
            (Some(event_bus), Some(event_bus_shutdown), Some(event_publisher))
        } else {
            (None, None, None)
        };

        let request_timeout = self.configuration.request_timeout;
        let config: MultiTableManagerConfiguration = self.configuration.into();
        let me = config.me;

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let (poller, messages) = start_polling(self.network.clone(), poller_shutdown_receiver);

        let (requests, request_receiver) = mpsc::channel();
        let (multi_table_manager_shutdown, multi_table_manager_shutdown_receiver) = mpsc::channel();
        let multi_table_manager = MultiTableManager::new(
            config,
            self.kv_store,
            self.storage,
            self.network,
            event_publisher,
        )
        .start(
            request_receiver,
            messages,
            multi_table_manager_shutdown_receiver,
        );

        log::info!("Started server {}", me);

        Server {
            me,
            request_timeout,
            requests,
            poller: Some(poller),
            poller_shutdown,
            multi_table_manager: Some(multi_table_manager),
            multi_table_manager_shutdown,
            event_bus,
            event_bus_shutdown,
        }
    }
}

/// A handle to the background threads of a server. When this value is dropped, all background threads
/// are gracefully shut down.
pub struct Server {
    me: ServerId,
    request_timeout: Duration,
    requests: Sender<MultiTableManagerRequest>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
    multi_table_manager: Option<JoinHandle<()>>,
    multi_table_manager_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Server {
    /// Get the id of this server.
    pub fn id(&self) -> ServerId {
        self.me
    }

    /// Create a table with `config`. Every server named by `config` becomes a member of the new table's
    /// Raft cluster.
    ///
    /// Returns once the activations are sent, before the table is ready. Poll
    /// [`table_status`](Self::table_status) with `want_all_replicas_ready` on the leader to find out when
    /// every region is fully replicated.
    pub fn create_table(&self, config: TableConfig) -> Result<TableId, ServerError> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::CreateTable { config, reply })?;
        Ok(self.wait(response)??)
    }

    /// Drop `table` on every server that may hold data of it. This server must participate in the table,
    /// or have participated in it.
    pub fn drop_table(&self, table: TableId) -> Result<(), ServerError> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::DropTable { table, reply })?;
        Ok(self.wait(response)??)
    }

    /// Replace the configuration of `table`. The new configuration must keep the table's split points.
    ///
    /// If this server is not the table's leader, the config is forwarded to the leader, and `Ok` only
    /// means that it was sent.
    pub fn set_table_config(&self, table: TableId, config: TableConfig) -> Result<(), ServerError> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::SetConfig {
            table,
            config,
            reply,
        })?;
        Ok(self.wait(response)??)
    }

    /// Get the status of this server's replica of `table`. Returns `None` if this server does not
    /// participate in the table.
    pub fn table_status(
        &self,
        table: TableId,
        request: TableStatusRequest,
    ) -> Option<TableStatusResponse> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::Status {
            table,
            request,
            reply,
        })
        .ok()?;
        self.wait(response).ok().flatten()
    }

    /// Get the status of `server`'s replica of `table`. Returns `None` if `server` does not participate
    /// in the table or did not reply in time.
    pub fn request_table_status(
        &self,
        server: ServerId,
        table: TableId,
        request: TableStatusRequest,
    ) -> Option<TableStatusResponse> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::RemoteStatus {
            server,
            table,
            request,
            reply,
        })
        .ok()?;
        self.wait(response).ok().flatten()
    }

    /// Write `value` to `key` of `table`, or delete `key` if `value` is `None`. This server must be the
    /// ready primary of the region that contains `key`.
    ///
    /// The write is applied locally and streamed to the region's secondaries. It is not acknowledged by
    /// them before this returns.
    pub fn write(
        &self,
        table: TableId,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> Result<Version, WriteError> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::Write {
            table,
            key,
            value,
            reply,
        })
        .map_err(|_| WriteError::Timeout)?;
        self.wait(response).map_err(|_| WriteError::Timeout)?
    }

    /// Read `key` of `table` from this server's copy, which may be stale.
    pub fn read_local(&self, table: TableId, key: Vec<u8>) -> Result<Option<Vec<u8>>, ReadError> {
        let (reply, response) = mpsc::channel();
        self.request(MultiTableManagerRequest::Read { table, key, reply })
            .map_err(|_| ReadError::Timeout)?;
        self.wait(response).map_err(|_| ReadError::Timeout)?
    }

    /// Get the ids of every table this server is an active member of.
    pub fn tables(&self) -> BTreeSet<TableId> {
        let (reply, response) = mpsc::channel();
        if self
            .request(MultiTableManagerRequest::Tables { reply })
            .is_err()
        {
            return BTreeSet::new();
        }
        self.wait(response).unwrap_or_default()
    }

    fn request(&self, request: MultiTableManagerRequest) -> Result<(), ServerError> {
        self.requests
            .send(request)
            .map_err(|_| ServerError::ShuttingDown)
    }

    fn wait<T>(&self, response: Receiver<T>) -> Result<T, ServerError> {
        response
            .recv_timeout(self.request_timeout)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => ServerError::Timeout,
                RecvTimeoutError::Disconnected => ServerError::ShuttingDown,
            })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The multi-table manager
        // receives messages from the poller and assumes that the poller lives longer than it. The event
        // bus is stopped last so that the events of tearing down executions are still delivered.

        let _ = self.multi_table_manager_shutdown.send(());
        if let Some(multi_table_manager) = self.multi_table_manager.take() {
            if multi_table_manager.join().is_err() {
                log::error!("Multi-table manager thread panicked");
            }
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                log::error!("Poller thread panicked");
            }
        }

        if let Some(event_bus_shutdown) = &self.event_bus_shutdown {
            let _ = event_bus_shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Event bus thread panicked");
            }
        }
    }
}

/// Reasons why a request to a [`Server`] failed.
#[derive(Debug)]
pub enum ServerError {
    MultiTableManager(MultiTableManagerError),
    TableManager(TableManagerError),

    /// The server did not reply within [`Configuration::request_timeout`].
    Timeout,

    /// The server's threads are stopping.
    ShuttingDown,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::MultiTableManager(err) => write!(f, "{}", err),
            ServerError::TableManager(err) => write!(f, "{}", err),
            ServerError::Timeout => write!(f, "timed out waiting for the server"),
            ServerError::ShuttingDown => write!(f, "server is shutting down"),
        }
    }
}

impl From<MultiTableManagerError> for ServerError {
    fn from(value: MultiTableManagerError) -> Self {
        ServerError::MultiTableManager(value)
    }
}

impl From<TableManagerError> for ServerError {
    fn from(value: TableManagerError) -> Self {
        ServerError::TableManager(value)
    }
}
