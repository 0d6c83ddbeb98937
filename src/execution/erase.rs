/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Execution of a server that should not hold a region.
//!
//! The erase execution acks [`Nothing`](crate::types::contract::AckState::Nothing) *before* it starts
//! deleting, so that the leader never counts a server that is about to lose its data as a holder of
//! the region. It then resets the region to empty with hard durability. The reset is atomic over the
//! region, so an interrupted erase leaves either the old data or none, and is simply started again by
//! the next erase execution.

use std::time::SystemTime;

use crate::{
    events::{CompleteEraseEvent, Event},
    networking::network::Network,
    persistence::pluggables::KVStore,
    storage::{Durability, StoreView},
    types::{branch::Version, contract::ContractAck},
};

use super::{context::ExecutionContext, ExecutionError};

pub(crate) struct EraseExecution;

impl EraseExecution {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) fn start<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        ctx.send_ack(ContractAck::nothing());

        let region = ctx.region.clone();
        let interruptor = ctx.interruptor.clone();
        ctx.store
            .reset_data(Version::zero(), &region, Durability::Hard, &interruptor)?;

        ctx.update_status(|status| status.erase_complete = true);
        Event::CompleteErase(CompleteEraseEvent {
            timestamp: SystemTime::now(),
            table: ctx.table,
            region,
        })
        .publish(&ctx.event_publisher);

        Ok(())
    }

    /// Re-ack `Nothing` for the new contract. An erasing server has nothing else to say.
    pub(crate) fn on_contract_update<K: KVStore, V: StoreView, N: Network>(
        &mut self,
        ctx: &mut ExecutionContext<K, V, N>,
    ) -> Result<(), ExecutionError> {
        ctx.send_ack(ContractAck::nothing());
        Ok(())
    }
}
