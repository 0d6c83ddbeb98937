//! Handing primacy over while clients keep writing.
//!
//! Scenario: a table is replicated to nodes 0 and 1, with node 0 as primary. While a client writes to
//! node 0 as fast as it accepts writes, the config is changed to make node 1 the primary. Every write
//! that node 0 acknowledged must survive the hand-over on both nodes.

use std::{
    thread,
    time::{Duration, Instant},
};

use log::LevelFilter;

mod common;

use crate::common::{
    logging::setup_logger,
    node::{all_replicas_ready, leader, single_shard_config, start_nodes, wait_until},
};

const TIMEOUT: Duration = Duration::from_secs(60);

#[test]
fn handover_test() {
    setup_logger(LevelFilter::Debug);

    // 1. Create a table replicated to nodes 0 and 1, with node 0 as primary.
    let nodes = start_nodes(2);
    let ids: Vec<_> = nodes.iter().map(|node| node.id()).collect();
    let table = nodes[0]
        .server()
        .create_table(single_shard_config(&ids, ids[0]))
        .unwrap();
    wait_until("all replicas are ready", TIMEOUT, || {
        all_replicas_ready(&nodes, table)
    });

    // 2. Ask for node 1 to become the primary.
    let new_config = single_shard_config(&ids, ids[1]);
    wait_until("the leader accepts the new config", TIMEOUT, || {
        leader(&nodes, table).map_or(false, |leader| {
            leader
                .server()
                .set_table_config(table, new_config.clone())
                .is_ok()
        })
    });

    // 3. Keep writing to node 0 until the committed contract names node 1.
    let handed_over = || {
        leader(&nodes, table).map_or(false, |leader| {
            leader.committed_state(table).map_or(false, |state| {
                state
                    .region_to_contract
                    .values()
                    .all(|(_, contract)| contract.primary == Some(ids[1]))
            })
        })
    };
    let deadline = Instant::now() + TIMEOUT;
    let mut acked = Vec::new();
    let mut attempt = 0u32;
    loop {
        let key = format!("key-{}", attempt).into_bytes();
        if nodes[0]
            .server()
            .write(table, key.clone(), Some(attempt.to_be_bytes().to_vec()))
            .is_ok()
        {
            acked.push((key, attempt));
        }
        attempt += 1;

        if attempt % 10 == 0 && handed_over() {
            break;
        }
        if Instant::now() > deadline {
            panic!("Timed out waiting until node 1 becomes the primary");
        }
        thread::sleep(Duration::from_millis(2));
    }
    log::debug!("Node 0 acknowledged {} of {} writes", acked.len(), attempt);
    assert!(!acked.is_empty());

    // 4. Once both replicas are ready, each holds every acknowledged write.
    wait_until("all replicas are ready", TIMEOUT, || {
        all_replicas_ready(&nodes, table)
    });
    for node in &nodes {
        for (key, attempt) in &acked {
            assert_eq!(
                node.storage().value(table, key),
                Some(attempt.to_be_bytes().to_vec()),
                "{} lost an acknowledged write",
                node.id()
            );
        }
    }

    // 5. Node 1 accepts writes now, and node 0 rejects them.
    wait_until("the new primary accepts a write", TIMEOUT, || {
        nodes[1]
            .server()
            .write(table, b"after".to_vec(), Some(b"value".to_vec()))
            .is_ok()
    });
    assert!(nodes[0]
        .server()
        .write(table, b"stale".to_vec(), Some(b"value".to_vec()))
        .is_err());
}
