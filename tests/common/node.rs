use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use shard_replication::{
    events::{CompleteEraseEvent, CreateBranchEvent},
    raft::types::TableRaftState,
    server::{Configuration, Server, ServerSpec},
    table_manager::status::{TableStatusRequest, TableStatusResponse},
    types::{
        branch::BranchId,
        data_types::{ServerId, TableId},
        region::Region,
        table_config::{ShardConfig, TableConfig},
    },
};

use super::{
    mem_db::MemDB,
    mem_store::MemStorage,
    network::{mock_network, NetworkStub},
};

/// A test server, together with the pluggables it runs on. The pluggables outlive the server, so that
/// a node can be stopped and started again with the same persisted state.
pub(crate) struct Node {
    keypair: SigningKey,
    network: NetworkStub,
    kv_store: MemDB,
    storage: MemStorage,
    server: Option<Server>,
    created_branches: Arc<Mutex<Vec<BranchId>>>,
    completed_erases: Arc<Mutex<Vec<(TableId, Region)>>>,
}

impl Node {
    pub(crate) fn new(keypair: SigningKey, network: NetworkStub) -> Node {
        let mut node = Node {
            keypair,
            network,
            kv_store: MemDB::new(),
            storage: MemStorage::new(),
            server: None,
            created_branches: Arc::new(Mutex::new(Vec::new())),
            completed_erases: Arc::new(Mutex::new(Vec::new())),
        };
        node.start();
        node
    }

    pub(crate) fn start(&mut self) {
        let configuration = Configuration::builder()
            .me(self.keypair.clone())
            .tick_interval(Duration::from_millis(20))
            .log_events(true)
            .build();

        let created_branches = self.created_branches.clone();
        let completed_erases = self.completed_erases.clone();
        let server = ServerSpec::builder()
            .kv_store(self.kv_store.clone())
            .network(self.network.clone())
            .storage(self.storage.clone())
            .configuration(configuration)
            .on_create_branch(move |event: &CreateBranchEvent| {
                created_branches.lock().unwrap().push(event.branch)
            })
            .on_complete_erase(move |event: &CompleteEraseEvent| {
                completed_erases
                    .lock()
                    .unwrap()
                    .push((event.table, event.region.clone()))
            })
            .build()
            .start();
        self.server = Some(server);
    }

    pub(crate) fn stop(&mut self) {
        self.server = None;
    }

    pub(crate) fn id(&self) -> ServerId {
        ServerId::from(self.keypair.verifying_key())
    }

    pub(crate) fn server(&self) -> &Server {
        self.server.as_ref().expect("Node is stopped")
    }

    pub(crate) fn network(&self) -> &NetworkStub {
        &self.network
    }

    pub(crate) fn storage(&self) -> &MemStorage {
        &self.storage
    }

    pub(crate) fn kv_store(&self) -> &MemDB {
        &self.kv_store
    }

    pub(crate) fn created_branches(&self) -> Vec<BranchId> {
        self.created_branches.lock().unwrap().clone()
    }

    pub(crate) fn completed_erases(&self) -> Vec<(TableId, Region)> {
        self.completed_erases.lock().unwrap().clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.server.is_some()
    }

    pub(crate) fn status(&self, table: TableId) -> Option<TableStatusResponse> {
        self.server
            .as_ref()?
            .table_status(table, TableStatusRequest::everything())
    }

    /// Get the committed state of `table` as this node knows it.
    pub(crate) fn committed_state(&self, table: TableId) -> Option<TableRaftState> {
        Some(self.status(table)?.raft_state?.state)
    }

    pub(crate) fn is_leader(&self, table: TableId) -> bool {
        self.status(table)
            .and_then(|status| status.raft_state)
            .map_or(false, |raft| raft.is_leader)
    }
}

/// Create `count` nodes connected by a mock network, and start all of them.
pub(crate) fn start_nodes(count: usize) -> Vec<Node> {
    let mut csprg = OsRng {};
    let keypairs: Vec<SigningKey> = (0..count)
        .map(|_| SigningKey::generate(&mut csprg))
        .collect();
    let network_stubs = mock_network(keypairs.iter().map(|kp| kp.verifying_key()));
    keypairs
        .into_iter()
        .zip(network_stubs)
        .map(|(keypair, network)| Node::new(keypair, network))
        .collect()
}

/// Find the running node that leads `table`, if any.
pub(crate) fn leader(nodes: &[Node], table: TableId) -> Option<&Node> {
    nodes
        .iter()
        .find(|node| node.is_running() && node.is_leader(table))
}

/// Check whether the leader of `table` reports every region fully replicated.
pub(crate) fn all_replicas_ready(nodes: &[Node], table: TableId) -> bool {
    leader(nodes, table)
        .and_then(|leader| {
            leader.server().table_status(
                table,
                TableStatusRequest {
                    want_all_replicas_ready: true,
                    ..Default::default()
                },
            )
        })
        .and_then(|status| status.all_replicas_ready)
        .unwrap_or(false)
}

/// A config with one shard, replicated to `replicas`, whose primary is `primary`.
pub(crate) fn single_shard_config(replicas: &[ServerId], primary: ServerId) -> TableConfig {
    TableConfig {
        name: String::from("test_table"),
        split_points: Vec::new(),
        shards: vec![ShardConfig {
            replicas: replicas.iter().copied().collect::<BTreeSet<_>>(),
            primary,
        }],
        sindexes: BTreeSet::new(),
    }
}

/// Poll `condition` every 100 milliseconds until it holds, panicking with `what` if it does not hold
/// within `timeout`.
pub(crate) fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    log::debug!("Waiting until {}", what);
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting until {}", what);
        }
        thread::sleep(Duration::from_millis(100));
    }
}
