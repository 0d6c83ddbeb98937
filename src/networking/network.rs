/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking.

use ed25519_dalek::VerifyingKey;

use super::messages::Message;

/// Implemented by networking providers.
///
/// Delivery is best effort: messages may be dropped, duplicated, or delivered out of order. Every protocol
/// in the replication core retries on its own, so providers need not add reliability on top.
pub trait Network: Clone + Send {
    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: VerifyingKey, message: Message);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(VerifyingKey, Message)>;
}
