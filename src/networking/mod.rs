/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pluggable peer-to-peer (P2P) networking.
//!
//! Servers are reachable by their [`VerifyingKey`](ed25519_dalek::VerifyingKey). Networking providers
//! interact with the replication core's threads through implementations of the
//! [`Network`](network::Network) trait.

pub mod network;

pub mod messages;

pub(crate) mod receiving;

pub(crate) mod sending;
