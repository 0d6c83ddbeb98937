/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Business cards that tell other servers how to reach a table's leader.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{ServerId, TableId, Term};

/// Address of a mailbox of the table manager of `table` on `server`, valid only during `term`.
///
/// Messages sent to a mailbox whose term has ended are dropped by the receiver. Senders treat this
/// like any other lost message, and retry against the new leader once they learn of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MailboxAddress {
    pub server: ServerId,
    pub table: TableId,
    pub term: Term,
}

/// The mailboxes of a table's leader, published once per term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct LeaderBcard {
    /// The leader's server.
    pub id: ServerId,

    /// Where to send new table configurations.
    pub set_config_mailbox: MailboxAddress,

    /// Where to send contract acks.
    pub contract_ack_minidir: MailboxAddress,
}

impl LeaderBcard {
    pub fn new(leader: ServerId, table: TableId, term: Term) -> Self {
        let address = MailboxAddress {
            server: leader,
            table,
            term,
        };
        Self {
            id: leader,
            set_config_mailbox: address,
            contract_ack_minidir: address,
        }
    }
}
