/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages that carry a digital signature of their sender.

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    contract::ContractAck,
    crypto_primitives::{Keypair, Signature, Verifier, VerifyingKey},
    data_types::{ContractId, ServerId, SignatureBytes, TableId},
    region::Region,
};

/// Data types that contain: 1. A message, and 2. A digital signature over said message whose
/// correctness can be verified against a `VerifyingKey`.
pub(crate) trait SignedMessage: Clone {
    /// Get the bytes that are passed as input into the signing function to form the signature
    /// of the `SignedMessage`.
    fn message_bytes(&self) -> Vec<u8>;

    /// Get the signature of the `SignedMessage`.
    fn signature_bytes(&self) -> SignatureBytes;

    /// Verify that `signature_bytes` is a signature created by `verifying_key` over `message_bytes`.
    fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature_bytes().bytes());
        verifying_key
            .verify(&self.message_bytes(), &signature)
            .is_ok()
    }
}

/// A [`ContractAck`] for one region of one table, signed by the server that sends it.
///
/// Servers send these to the table leader's contract ack mailbox. The leader only inserts a
/// `SignedContractAck` into its ack directory if it [`is_correct`](SignedMessage::is_correct) for the
/// `server` it names, and if `server` is also the peer it arrived from.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedContractAck {
    pub table: TableId,
    pub region: Region,
    pub contract_id: ContractId,
    pub ack: ContractAck,
    pub server: ServerId,
    pub signature: SignatureBytes,
}

impl SignedContractAck {
    /// Create a `SignedContractAck`, signing it with `keypair`.
    pub(crate) fn new(
        keypair: &Keypair,
        table: TableId,
        region: Region,
        contract_id: ContractId,
        ack: ContractAck,
    ) -> Self {
        let message = (&table, &region, &contract_id, &ack)
            .try_to_vec()
            .unwrap_or_default();
        let signature = keypair.sign(&message);
        Self {
            table,
            region,
            contract_id,
            ack,
            server: keypair.server_id(),
            signature,
        }
    }

    /// Check whether the signature verifies against the `server` named in the message.
    pub(crate) fn is_signed_by_server(&self) -> bool {
        match self.server.verifying_key() {
            Ok(verifying_key) => self.is_correct(&verifying_key),
            Err(_) => false,
        }
    }
}

impl SignedMessage for SignedContractAck {
    fn message_bytes(&self) -> Vec<u8> {
        (&self.table, &self.region, &self.contract_id, &self.ack)
            .try_to_vec()
            .unwrap_or_default()
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}
