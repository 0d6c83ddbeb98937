/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that determine what role a server should play for a region, given the region's committed
//! contract.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{contract::Contract, data_types::ServerId};

/// The three kinds of [execution](super) a server can run for a region.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
pub enum Role {
    Erase,
    Primary,
    Secondary,
}

/// Determine the role that `server` should play for a region whose committed contract is `contract`.
///
/// ## `classify` logic
///
/// The role depends on two factors:
/// 1. Whether `server` is the contract's `primary`.
/// 2. Whether `server` is in the contract's `replicas`.
///
/// Since a contract's primary is always one of its replicas, only three combinations are possible. The
/// below table specifies the role in each:
///
/// ||In `replicas`|Not in `replicas`|
/// |---|---|---|
/// |`primary`|`Primary`|(impossible)|
/// |Not `primary`|`Secondary`|`Erase`|
///
/// Servers listed in `temporary_extra_replicas` are not in `replicas`, and therefore erase. So do servers
/// that the contract does not mention at all: they may still hold data for the region from an earlier
/// contract, or from before a crash.
pub fn classify(server: &ServerId, contract: &Contract) -> Role {
    if contract.primary.as_ref() == Some(server) {
        Role::Primary
    } else if contract.replicas.contains(server) {
        Role::Secondary
    } else {
        Role::Erase
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::types::branch::BranchId;

    fn server(byte: u8) -> ServerId {
        ServerId::new([byte; 32])
    }

    #[test]
    fn classify_covers_every_role() {
        let replicas: BTreeSet<ServerId> = [server(1), server(2)].into_iter().collect();
        let mut contract = Contract::new(replicas, Some(server(1)), BranchId::nil());
        contract.temporary_extra_replicas.insert(server(3));

        assert_eq!(classify(&server(1), &contract), Role::Primary);
        assert_eq!(classify(&server(2), &contract), Role::Secondary);
        assert_eq!(classify(&server(3), &contract), Role::Erase);
        assert_eq!(classify(&server(4), &contract), Role::Erase);

        contract.primary = None;
        assert_eq!(classify(&server(1), &contract), Role::Secondary);
    }
}
