//! Moving a region to a different set of replicas.
//!
//! Scenario: a table starts out replicated to nodes 0 and 1, with node 0 as primary. Its config is then
//! changed so that the region is replicated to nodes 1 and 2, with node 1 as primary. Node 2 must be
//! backfilled with the existing data, primacy must pass to node 1, and node 0 must leave the table and
//! erase its copy.

use std::{collections::BTreeSet, time::Duration};

use log::LevelFilter;

mod common;

use crate::common::{
    logging::setup_logger,
    node::{all_replicas_ready, leader, single_shard_config, start_nodes, wait_until},
};

const TIMEOUT: Duration = Duration::from_secs(60);

#[test]
fn reconfiguration_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Create a table replicated to nodes 0 and 1, with node 0 as primary.
    let nodes = start_nodes(3);
    let ids: Vec<_> = nodes.iter().map(|node| node.id()).collect();
    let table = nodes[0]
        .server()
        .create_table(single_shard_config(&ids[..2], ids[0]))
        .unwrap();
    wait_until("all replicas are ready", TIMEOUT, || {
        all_replicas_ready(&nodes, table)
    });
    assert!(nodes[2].server().tables().is_empty());

    // 2. Write some keys through node 0.
    for i in 0..20u8 {
        wait_until("the primary accepts a write", TIMEOUT, || {
            nodes[0]
                .server()
                .write(table, vec![i], Some(vec![i, i]))
                .is_ok()
        });
    }

    // 3. Move the region to nodes 1 and 2, with node 1 as primary. Only the leader accepts the change.
    let new_config = single_shard_config(&ids[1..], ids[1]);
    let new_replicas: BTreeSet<_> = ids[1..].iter().copied().collect();
    wait_until("the leader accepts the new config", TIMEOUT, || {
        leader(&nodes, table).map_or(false, |leader| {
            leader
                .server()
                .set_table_config(table, new_config.clone())
                .is_ok()
        })
    });

    // 4. Wait until the committed contract reflects the new config.
    wait_until("the new contract is committed", TIMEOUT, || {
        leader(&nodes[1..], table).map_or(false, |leader| {
            let state = leader.committed_state(table).unwrap();
            state.config == new_config
                && state.region_to_contract.values().all(|(_, contract)| {
                    contract.replicas == new_replicas
                        && contract.primary == Some(ids[1])
                        && contract.temporary_extra_replicas.is_empty()
                })
        })
    });
    wait_until("all replicas are ready", TIMEOUT, || {
        all_replicas_ready(&nodes[1..], table)
    });

    // 5. Node 0 leaves the table and erases its copy.
    wait_until("node 0 leaves the table", TIMEOUT, || {
        nodes[0].server().tables().is_empty()
    });
    assert_eq!(nodes[0].storage().live_keys(table), 0);
    assert!(nodes[0].status(table).is_none());

    // 6. Node 2 was backfilled, and node 1 accepts writes that reach node 2.
    for i in 0..20u8 {
        assert_eq!(nodes[2].storage().value(table, &[i]), Some(vec![i, i]));
    }
    wait_until("the new primary accepts a write", TIMEOUT, || {
        nodes[1]
            .server()
            .write(table, b"new".to_vec(), Some(b"value".to_vec()))
            .is_ok()
    });
    wait_until("node 2 serves the new write", TIMEOUT, || {
        nodes[2].server().read_local(table, b"new".to_vec()) == Ok(Some(b"value".to_vec()))
    });
}
