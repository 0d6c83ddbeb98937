/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the server's
//! [configuration](crate::server::Configuration).
//!
//! The replication core logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least three values. The first three values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//! 3. The id of the table the event concerns.
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [CreateBranch](crate::events::CreateBranchEvent) is printed:
//!
//! ```text
//! CreateBranch, 1701329264, 7, [-inf, 6d), fNGCJyk, Id5u7f6@12
//! ```
//!
//! In the snippet:
//! - The fourth value is the region whose branch was created.
//! - The fifth value is the first seven characters of the Base64 encoding of the new branch's id.
//! - The sixth value is the parent version of the branch.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const BECOME_LEADER: &str = "BecomeLeader";
pub const COMMIT_TABLE_CHANGE: &str = "CommitTableChange";

pub const UPDATE_CONTRACT_ACK: &str = "UpdateContractAck";
pub const START_EXECUTION: &str = "StartExecution";
pub const TEAR_DOWN_EXECUTION: &str = "TearDownExecution";
pub const CREATE_BRANCH: &str = "CreateBranch";
pub const COMPLETE_ERASE: &str = "CompleteErase";

pub const ACTIVATE_TABLE: &str = "ActivateTable";
pub const DEACTIVATE_TABLE: &str = "DeactivateTable";
pub const DROP_TABLE: &str = "DropTable";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for BecomeLeaderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |become_leader_event: &BecomeLeaderEvent| {
            log::info!(
                "{}, {}, {}, {}",
                BECOME_LEADER,
                secs_since_unix_epoch(become_leader_event.timestamp),
                become_leader_event.table,
                become_leader_event.term
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitTableChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_table_change_event: &CommitTableChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_TABLE_CHANGE,
                secs_since_unix_epoch(commit_table_change_event.timestamp),
                commit_table_change_event.table,
                commit_table_change_event.log_index,
                commit_table_change_event.change.kind()
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateContractAckEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_contract_ack_event: &UpdateContractAckEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {:?}",
                UPDATE_CONTRACT_ACK,
                secs_since_unix_epoch(update_contract_ack_event.timestamp),
                update_contract_ack_event.table,
                update_contract_ack_event.region,
                update_contract_ack_event.contract_id,
                update_contract_ack_event.state
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartExecutionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_execution_event: &StartExecutionEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                START_EXECUTION,
                secs_since_unix_epoch(start_execution_event.timestamp),
                start_execution_event.table,
                start_execution_event.region,
                start_execution_event.role
            )
        };
        Box::new(logger)
    }
}

impl Logger for TearDownExecutionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |tear_down_execution_event: &TearDownExecutionEvent| {
            log::info!(
                "{}, {}, {}, {}, {:?}",
                TEAR_DOWN_EXECUTION,
                secs_since_unix_epoch(tear_down_execution_event.timestamp),
                tear_down_execution_event.table,
                tear_down_execution_event.region,
                tear_down_execution_event.role
            )
        };
        Box::new(logger)
    }
}

impl Logger for CreateBranchEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |create_branch_event: &CreateBranchEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}@{}",
                CREATE_BRANCH,
                secs_since_unix_epoch(create_branch_event.timestamp),
                create_branch_event.table,
                create_branch_event.region,
                first_seven_base64_chars(&create_branch_event.branch.bytes()),
                first_seven_base64_chars(&create_branch_event.parent_version.branch.bytes()),
                create_branch_event.parent_version.timestamp
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteEraseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |complete_erase_event: &CompleteEraseEvent| {
            log::info!(
                "{}, {}, {}, {}",
                COMPLETE_ERASE,
                secs_since_unix_epoch(complete_erase_event.timestamp),
                complete_erase_event.table,
                complete_erase_event.region
            )
        };
        Box::new(logger)
    }
}

impl Logger for ActivateTableEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |activate_table_event: &ActivateTableEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ACTIVATE_TABLE,
                secs_since_unix_epoch(activate_table_event.timestamp),
                activate_table_event.table,
                activate_table_event.member
            )
        };
        Box::new(logger)
    }
}

impl Logger for DeactivateTableEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |deactivate_table_event: &DeactivateTableEvent| {
            log::info!(
                "{}, {}, {}",
                DEACTIVATE_TABLE,
                secs_since_unix_epoch(deactivate_table_event.timestamp),
                deactivate_table_event.table
            )
        };
        Box::new(logger)
    }
}

impl Logger for DropTableEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |drop_table_event: &DropTableEvent| {
            log::info!(
                "{}, {}, {}",
                DROP_TABLE,
                secs_since_unix_epoch(drop_table_event.timestamp),
                drop_table_event.table
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
