/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Per-server, per-table supervisor.
//!
//! The table manager thread is the driving force of a server's participation in one table. It owns the
//! table's [Raft member](crate::raft) and one [execution](crate::execution) per region, and loops until
//! it is stopped. Every iteration:
//! 1. Handles the inputs that the [multi-table manager](crate::multi_table_manager) routed to it until
//!    the next tick is due:
//!     * Raft messages go to the Raft member.
//!     * Contract acks from other servers go into the leader's ack directory, if this server is the
//!       leader of the term that the sender addressed, and the ack's signature verifies.
//!     * New configs are proposed if this server is the leader, and forwarded to the leader's
//!       [bcard](bcard::LeaderBcard) otherwise.
//!     * Execution messages, client writes, and client reads go to the execution of the region they
//!       concern.
//! 2. Forwards the acks that local executions reported to the leader.
//! 3. Ticks the Raft member, and periodically re-sends acks, re-activates silent members, and collects
//!    branch garbage.
//! 4. Realizes the changes that were committed: imports branch history, and starts, updates, or tears
//!    down executions to match the committed contracts.
//! 5. If this server is the leader and no change is in flight, proposes the next change that the
//!    [coordinator](crate::coordinator) decides on.
//! 6. Refreshes the [status cache](status) that status requests are answered from.
//!
//! A table manager that encounters a protocol invariant violation, or one of whose executions fails,
//! logs an error and stops managing the table until the multi-table manager stops it.

pub mod bcard;

pub(crate) mod implementation;
pub use implementation::TableManagerError;

pub mod status;
