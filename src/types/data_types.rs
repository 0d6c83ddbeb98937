/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or integers, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{SignatureError, VerifyingKey};
use rand::Rng;

/// Identity of a server. This is the byte representation of the server's Ed25519 verifying key.
///
/// `ServerId`s are what [contracts](super::contract::Contract) name in their `replicas` and `primary`
/// fields, and what the [networking provider](crate::networking::network::Network) uses to address
/// peers (after conversion back into a [`VerifyingKey`]).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ServerId([u8; 32]);

impl ServerId {
    /// Create a new `ServerId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `ServerId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Convert this `ServerId` back into the Ed25519 verifying key it was made from.
    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0)
    }
}

impl From<VerifyingKey> for ServerId {
    fn from(value: VerifyingKey) -> Self {
        ServerId(value.to_bytes())
    }
}

impl From<&VerifyingKey> for ServerId {
    fn from(value: &VerifyingKey) -> Self {
        ServerId(value.to_bytes())
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        write!(f, "{}", &encoded[0..7])
    }
}

impl Debug for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self)
    }
}

/// Number that uniquely identifies a table across the cluster.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct TableId(u64);

impl TableId {
    /// Create a new `TableId` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Generate a random `TableId`.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    /// Get the `u64` value of this `TableId`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the big-endian representation of this `TableId`, used to form persistence keys.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of a server *within one table's Raft cluster*.
///
/// A server gets a fresh `RaftMemberId` every time it is added to a table's Raft membership, so a
/// server that is removed and later re-added never gets confused with its former self.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RaftMemberId(u64);

impl RaftMemberId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Generate a random `RaftMemberId`.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for RaftMemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity of one committed [`Contract`](super::contract::Contract) value.
///
/// Every time the leader proposes a new contract for a region it generates a fresh `ContractId`, so that
/// [acks](super::contract::ContractAck) can say exactly which contract they are acknowledging.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ContractId(u64);

impl ContractId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Generate a random `ContractId`.
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ContractId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Raft term. Starts at 0 and increases by 1 every time a member starts an election.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Term(u64);

impl Term {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the initial `Term`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Term {
    type Output = Term;

    fn add(self, rhs: u64) -> Self::Output {
        Term(self.0 + rhs)
    }
}

/// Position of an entry in a table's Raft log. The first entry has index 1; index 0 means "before the
/// first entry".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the big-endian representation of the inner value. Big-endian keeps log entry keys ordered.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl AddAssign<u64> for LogIndex {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<LogIndex> for LogIndex {
    type Output = u64;

    fn sub(self, rhs: LogIndex) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// Coarse-grained fencing counter of a table. Incremented once for every Raft term in which some
/// member became leader.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for Epoch {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

/// Logical timestamp of a write within a lineage of [branches](super::branch::BranchBirthCertificate).
///
/// Timestamps only increase along a lineage: a new branch starts at the timestamp of the version it
/// forks from.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct StateTimestamp(u64);

impl StateTimestamp {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The timestamp of a region that has never been written to.
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the timestamp directly after this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for StateTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// 32-byte cryptographic hash. Always a SHA256 hash in this crate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    /// Create a new `CryptoHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `CryptoHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        write!(f, "{}", &encoded[0..7])
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoHash({})", self)
    }
}

/// Ed25519 digital signature.
///
/// Within this crate, these are produced using the [`ed25519_dalek`] crate, whose main definitions
/// are re-exported from the [`crypto_primitives`](super::crypto_primitives) module.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        write!(f, "SignatureBytes({})", &encoded[0..7])
    }
}

/// Number of times the [table manager](crate::table_manager) loop has ticked.
pub(crate) type Ticks = u64;
