/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Store of [branch birth certificates](crate::types::branch::BranchBirthCertificate).
//!
//! Every server keeps one [`BranchHistoryManager`] per table. Records enter it in two ways:
//! 1. A [primary execution](crate::execution::primary) [creates](BranchHistoryManager::create_branch) a
//!    branch when it takes over a region.
//! 2. The [table manager](crate::table_manager) [imports](BranchHistoryManager::import_branch_history)
//!    the records carried in committed table state, which the leader copies from primaries' acks.
//!
//! ## Truncated lineages
//!
//! The committed history only keeps the part of each region's lineage that some server's acked version
//! may still lie on, so a stored record's parent may be unknown. A walk up the parent links that reaches
//! an unknown branch ends there, and [`is_ancestor`](BranchHistoryManager::is_ancestor) treats the
//! version it was looking for as unrelated. Branch ids hash their birth certificates, which name the
//! parent version, so parent links cannot form a cycle.
//!
//! ## Garbage collection
//!
//! Collection is split into two phases so that a branch created between discovery and deletion is never
//! deleted: [`prepare_gc`](BranchHistoryManager::prepare_gc) computes the set of branches that neither
//! the committed history nor a local version refers to, and
//! [`perform_gc`](BranchHistoryManager::perform_gc) deletes exactly that set.

mod implementation;

pub use implementation::{BranchHistoryError, BranchHistoryManager};
