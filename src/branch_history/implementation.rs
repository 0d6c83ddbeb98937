/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Main type: [`BranchHistoryManager`].

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    sync::{Arc, Mutex},
};

use crate::{
    persistence::{
        pluggables::{KVGet, KVGetError, KVStore},
        write_batch::{KVSetError, PersistenceWriteBatch},
        PersistenceError,
    },
    types::{
        branch::{BranchBirthCertificate, BranchHistory, BranchId, Version},
        data_types::TableId,
    },
};

/// Handle to the branch history of one table, stored in the server's [`KVStore`].
///
/// Clones share the same underlying store and lock, so a clone can be handed to every execution of the
/// table.
#[derive(Clone)]
pub struct BranchHistoryManager<K: KVStore> {
    kv_store: K,
    table: TableId,

    // Serializes read-modify-write sequences on the set of branch ids.
    lock: Arc<Mutex<()>>,
}

impl<K: KVStore> BranchHistoryManager<K> {
    pub fn new(kv_store: K, table: TableId) -> Self {
        Self {
            kv_store,
            table,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the birth certificate of `branch`.
    pub fn get_branch(&self, branch: &BranchId) -> Result<BranchBirthCertificate, BranchHistoryError> {
        self.kv_store
            .branch(&self.table, branch)?
            .ok_or(BranchHistoryError::MissingBranch { branch: *branch })
    }

    pub fn is_branch_known(&self, branch: &BranchId) -> Result<bool, BranchHistoryError> {
        Ok(branch.is_nil() || self.kv_store.branch(&self.table, branch)?.is_some())
    }

    /// Record a newly created branch.
    ///
    /// Creating a branch that already exists with the same certificate does nothing. Creating a branch that
    /// already exists with a *different* certificate fails with
    /// [`DuplicateBranch`](BranchHistoryError::DuplicateBranch), since it means that two servers derived the
    /// same id from different records.
    pub fn create_branch(
        &self,
        branch: BranchId,
        certificate: &BranchBirthCertificate,
    ) -> Result<(), BranchHistoryError> {
        let _guard = self.lock.lock().unwrap(); // Safety: the lock guards no data.

        if let Some(existing) = self.kv_store.branch(&self.table, &branch)? {
            return if existing == *certificate {
                Ok(())
            } else {
                Err(BranchHistoryError::DuplicateBranch { branch })
            };
        }

        let mut branch_ids = self.kv_store.branch_ids(&self.table)?;
        branch_ids.insert(branch);

        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        wb.set_branch(&self.table, &branch, certificate)?;
        wb.set_branch_ids(&self.table, &branch_ids)?;
        self.kv_store.clone().write(wb.into_inner());

        Ok(())
    }

    /// Merge records learned from peers into the store.
    ///
    /// Existing records are never overwritten. A record whose parent is unknown is stored all the same:
    /// the committed history only keeps the part of a lineage that some server may still need. Returns
    /// the number of records inserted.
    pub fn import_branch_history(&self, records: &BranchHistory) -> Result<usize, BranchHistoryError> {
        let _guard = self.lock.lock().unwrap(); // Safety: the lock guards no data.

        let mut branch_ids = self.kv_store.branch_ids(&self.table)?;
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        let mut inserted = 0;
        for (branch, certificate) in records.iter() {
            if branch.is_nil() || !branch_ids.insert(*branch) {
                continue;
            }
            wb.set_branch(&self.table, branch, certificate)?;
            inserted += 1;
        }

        if inserted > 0 {
            wb.set_branch_ids(&self.table, &branch_ids)?;
            self.kv_store.clone().write(wb.into_inner());
        }

        Ok(inserted)
    }

    /// Check whether `ancestor` is equal to, or comes before, `descendant` in `descendant`'s lineage.
    ///
    /// Walks parent links backwards from `descendant` until reaching `ancestor`'s branch, the nil branch, or
    /// a branch whose record is not stored. In the last case the lineage was truncated above `ancestor`,
    /// and `ancestor` counts as unrelated.
    pub fn is_ancestor(&self, ancestor: &Version, descendant: &Version) -> Result<bool, BranchHistoryError> {
        let max_steps = self.kv_store.branch_ids(&self.table)?.len() + 1;
        let mut current = *descendant;
        for _ in 0..=max_steps {
            if current.branch == ancestor.branch {
                return Ok(ancestor.timestamp <= current.timestamp);
            }
            if current.branch.is_nil() {
                return Ok(false);
            }
            let certificate = match self.kv_store.branch(&self.table, &current.branch)? {
                Some(certificate) => certificate,
                None => {
                    log::debug!(
                        "Lineage of {} in table {} is truncated at branch {}",
                        descendant,
                        self.table,
                        current.branch
                    );
                    return Ok(false);
                }
            };

            // A branch starts at the timestamp of its parent version, so versions on `current.branch` earlier
            // than `initial_timestamp` do not exist.
            current = certificate.parent_version;
        }

        // Unreachable while the store is acyclic.
        log::error!("Branch history of table {} contains a cycle", self.table);
        Ok(false)
    }

    /// Get the stored records of `branch` and of as many of its ancestors as are stored.
    ///
    /// Fails with [`MissingBranch`](BranchHistoryError::MissingBranch) if `branch` itself is unknown.
    pub fn branch_history_for(&self, branch: &BranchId) -> Result<BranchHistory, BranchHistoryError> {
        let mut history = BranchHistory::new();
        if branch.is_nil() {
            return Ok(history);
        }
        let mut current = *branch;
        let mut certificate = self.get_branch(&current)?;
        loop {
            let parent = certificate.parent_version.branch;
            history.insert(current, certificate);
            if parent.is_nil() || history.contains(&parent) {
                break;
            }
            match self.kv_store.branch(&self.table, &parent)? {
                Some(parent_certificate) => {
                    current = parent;
                    certificate = parent_certificate;
                }
                None => break,
            }
        }
        Ok(history)
    }

    /// Collect into `out` every known branch that is not in `roots`.
    ///
    /// `roots` should contain the committed branch history, and the branches of every local version and
    /// every branch a local execution created but the leader has not committed yet.
    pub fn prepare_gc(
        &self,
        roots: impl IntoIterator<Item = BranchId>,
        out: &mut BTreeSet<BranchId>,
    ) -> Result<(), BranchHistoryError> {
        let known = self.kv_store.branch_ids(&self.table)?;
        let roots: BTreeSet<BranchId> = roots.into_iter().collect();
        out.extend(known.difference(&roots).copied());
        Ok(())
    }

    /// Delete every branch in `branches`.
    pub fn perform_gc(&self, branches: &BTreeSet<BranchId>) -> Result<(), BranchHistoryError> {
        if branches.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().unwrap(); // Safety: the lock guards no data.

        let mut branch_ids = self.kv_store.branch_ids(&self.table)?;
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        for branch in branches {
            if branch_ids.remove(branch) {
                wb.delete_branch(&self.table, branch);
            }
        }
        wb.set_branch_ids(&self.table, &branch_ids)?;
        self.kv_store.clone().write(wb.into_inner());

        Ok(())
    }

    /// Delete every record of the table. Called when this server stops participating in the table.
    pub fn delete_all(&self) -> Result<(), BranchHistoryError> {
        let branch_ids = self.kv_store.branch_ids(&self.table)?;
        self.perform_gc(&branch_ids)
    }
}

/// Errors that may be encountered when using the [`BranchHistoryManager`].
///
/// `MissingBranch` and `DuplicateBranch` indicate that this server's local state has diverged from
/// committed table state. The table manager that encounters them stops.
#[derive(Debug)]
pub enum BranchHistoryError {
    /// A branch that is expected to be known is not stored.
    MissingBranch { branch: BranchId },

    /// A branch was created twice with different birth certificates.
    DuplicateBranch { branch: BranchId },

    PersistenceError(PersistenceError),
}

impl Display for BranchHistoryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BranchHistoryError::MissingBranch { branch } => write!(f, "missing branch {}", branch),
            BranchHistoryError::DuplicateBranch { branch } => {
                write!(f, "branch {} created with conflicting certificates", branch)
            }
            BranchHistoryError::PersistenceError(err) => write!(f, "persistence error: {:?}", err),
        }
    }
}

impl From<KVGetError> for BranchHistoryError {
    fn from(value: KVGetError) -> Self {
        BranchHistoryError::PersistenceError(PersistenceError::KVGetError(value))
    }
}

impl From<KVSetError> for BranchHistoryError {
    fn from(value: KVSetError) -> Self {
        BranchHistoryError::PersistenceError(PersistenceError::KVSetError(value))
    }
}
