/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to other servers.

use crate::types::data_types::{ServerId, TableId};

use super::{
    messages::{Message, TableMessage},
    network::Network,
};

/// Handle for sending messages to the [`Network`].
///
/// It can be used to send instances of any type that implement the [`Into<Message>`]
/// trait.
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    /// Send `msg` to `peer`. Messages to a peer whose id is not a valid verifying key are dropped with a
    /// warning.
    pub(crate) fn send<S: Into<Message>>(&mut self, peer: &ServerId, msg: S) {
        match peer.verifying_key() {
            Ok(verifying_key) => self.network.send(verifying_key, msg.into()),
            Err(_) => log::warn!("Dropping message to {}: not a valid verifying key", peer),
        }
    }

    /// Send a message concerning `table` to `peer`.
    pub(crate) fn send_table_message<S: Into<TableMessage>>(
        &mut self,
        table: TableId,
        peer: &ServerId,
        msg: S,
    ) {
        self.send(
            peer,
            Message::Table {
                table,
                msg: msg.into(),
            },
        )
    }
}
