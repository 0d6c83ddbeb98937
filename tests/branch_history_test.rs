//! Tests for the branch history store of a single table, run directly against an in-memory key-value
//! store.

use std::collections::BTreeSet;

use shard_replication::{
    branch_history::{BranchHistoryError, BranchHistoryManager},
    types::{
        branch::{BranchBirthCertificate, BranchHistory, BranchId, Version},
        data_types::{ContractId, CryptoHash, ServerId, StateTimestamp, TableId},
        region::Region,
    },
};

mod common;

use crate::common::mem_db::MemDB;

fn creator() -> ServerId {
    ServerId::new([7u8; 32])
}

/// Create a branch forking off `parent` at `timestamp`, and return its id and record.
fn fork(parent: BranchId, timestamp: u64, contract: u64) -> (BranchId, BranchBirthCertificate) {
    let certificate = BranchBirthCertificate::new(
        Region::universe(),
        Version::new(parent, StateTimestamp::new(timestamp)),
    );
    let branch = certificate.branch_id(&creator(), ContractId::new(contract));
    (branch, certificate)
}

fn version(branch: BranchId, timestamp: u64) -> Version {
    Version::new(branch, StateTimestamp::new(timestamp))
}

#[test]
fn ancestry_follows_parent_links() {
    let manager = BranchHistoryManager::new(MemDB::new(), TableId::new(1));

    // nil -> a@0 -> b@5, and a -> c@8.
    let (a, a_cert) = fork(BranchId::nil(), 0, 1);
    let (b, b_cert) = fork(a, 5, 2);
    let (c, c_cert) = fork(a, 8, 3);
    manager.create_branch(a, &a_cert).unwrap();
    manager.create_branch(b, &b_cert).unwrap();
    manager.create_branch(c, &c_cert).unwrap();

    assert!(manager.is_ancestor(&Version::zero(), &version(b, 7)).unwrap());
    assert!(manager.is_ancestor(&version(a, 3), &version(b, 7)).unwrap());
    assert!(manager.is_ancestor(&version(a, 5), &version(b, 5)).unwrap());
    assert!(manager.is_ancestor(&version(b, 6), &version(b, 7)).unwrap());

    // Writes on `a` after the fork point are not in `b`'s lineage.
    assert!(!manager.is_ancestor(&version(a, 6), &version(b, 7)).unwrap());
    assert!(!manager.is_ancestor(&version(b, 7), &version(b, 6)).unwrap());
    assert!(!manager.is_ancestor(&version(c, 9), &version(b, 9)).unwrap());
    assert!(!manager.is_ancestor(&version(b, 6), &version(c, 9)).unwrap());

    let history = manager.branch_history_for(&b).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.contains(&a) && history.contains(&b) && !history.contains(&c));
}

#[test]
fn creating_branches_checks_existing_records() {
    let manager = BranchHistoryManager::new(MemDB::new(), TableId::new(1));
    let (a, a_cert) = fork(BranchId::nil(), 0, 1);

    // A branch whose parent is unknown is accepted, and its lineage ends at the unknown parent.
    let (b, b_cert) = fork(a, 4, 2);
    manager.create_branch(b, &b_cert).unwrap();
    assert!(!manager.is_ancestor(&Version::zero(), &version(b, 5)).unwrap());
    assert!(manager.is_ancestor(&version(b, 4), &version(b, 5)).unwrap());

    // Creating the same branch twice with the same record is a no-op.
    manager.create_branch(a, &a_cert).unwrap();
    manager.create_branch(a, &a_cert).unwrap();
    assert!(manager.is_branch_known(&a).unwrap());
    assert!(manager.is_branch_known(&BranchId::nil()).unwrap());
    assert!(manager.is_ancestor(&Version::zero(), &version(b, 5)).unwrap());

    // Creating it with a different record is an error.
    let (_, other_cert) = fork(BranchId::nil(), 3, 9);
    assert!(matches!(
        manager.create_branch(a, &other_cert),
        Err(BranchHistoryError::DuplicateBranch { branch }) if branch == a
    ));

    // Asking for the records of an unknown branch is an error.
    let unknown = BranchId::new(CryptoHash::new([9u8; 32]));
    assert!(matches!(
        manager.branch_history_for(&unknown),
        Err(BranchHistoryError::MissingBranch { branch }) if branch == unknown
    ));
}

#[test]
fn import_accepts_truncated_lineages() {
    let kv_store = MemDB::new();
    let manager = BranchHistoryManager::new(kv_store.clone(), TableId::new(1));

    let (a, a_cert) = fork(BranchId::nil(), 0, 1);
    let (b, b_cert) = fork(a, 5, 2);
    let pruned_parent = BranchId::new(CryptoHash::new([9u8; 32]));
    let (truncated, truncated_cert) = fork(pruned_parent, 2, 3);

    let mut records = BranchHistory::new();
    records.insert(b, b_cert);
    records.insert(a, a_cert);
    records.insert(truncated, truncated_cert);

    assert_eq!(manager.import_branch_history(&records).unwrap(), 3);
    assert!(manager.is_branch_known(&a).unwrap());
    assert!(manager.is_branch_known(&b).unwrap());
    assert!(manager.is_branch_known(&truncated).unwrap());
    assert!(!manager.is_branch_known(&pruned_parent).unwrap());
    // The parent version is named by the record, but nothing before it is known.
    assert!(manager
        .is_ancestor(&version(pruned_parent, 1), &version(truncated, 4))
        .unwrap());
    assert!(!manager
        .is_ancestor(&Version::zero(), &version(truncated, 4))
        .unwrap());
    assert_eq!(manager.branch_history_for(&truncated).unwrap().len(), 1);

    // Importing again inserts nothing.
    assert_eq!(manager.import_branch_history(&records).unwrap(), 0);

    // A second manager over the same store sees the same records.
    let other = BranchHistoryManager::new(kv_store, TableId::new(1));
    assert!(other.is_ancestor(&version(a, 1), &version(b, 6)).unwrap());

    // Tables do not share records.
    let unrelated = BranchHistoryManager::new(MemDB::new(), TableId::new(2));
    assert!(!unrelated.is_branch_known(&a).unwrap());
}

#[test]
fn gc_keeps_only_roots() {
    let kv_store = MemDB::new();
    let manager = BranchHistoryManager::new(kv_store.clone(), TableId::new(1));

    // nil -> a -> b -> d, and a -> c.
    let (a, a_cert) = fork(BranchId::nil(), 0, 1);
    let (b, b_cert) = fork(a, 5, 2);
    let (c, c_cert) = fork(a, 8, 3);
    let (d, d_cert) = fork(b, 9, 4);
    for (branch, certificate) in [(a, &a_cert), (b, &b_cert), (c, &c_cert), (d, &d_cert)] {
        manager.create_branch(branch, certificate).unwrap();
    }

    let mut garbage = BTreeSet::new();
    manager.prepare_gc([b, d], &mut garbage).unwrap();
    assert_eq!(garbage, BTreeSet::from([a, c]));

    manager.perform_gc(&garbage).unwrap();
    assert!(!manager.is_branch_known(&c).unwrap());
    assert!(manager.is_ancestor(&version(b, 6), &version(d, 10)).unwrap());

    // The lineage of `d` now ends at `b`'s parent version.
    assert!(manager.is_ancestor(&version(a, 2), &version(d, 10)).unwrap());
    assert!(!manager.is_ancestor(&Version::zero(), &version(d, 10)).unwrap());

    // Deleting everything leaves nothing behind in the store.
    manager.delete_all().unwrap();
    assert!(!manager.is_branch_known(&b).unwrap());
    assert!(!manager.is_branch_known(&d).unwrap());
    assert_eq!(kv_store.len(), 1);
}
