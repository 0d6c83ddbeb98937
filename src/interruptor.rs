/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cooperative cancellation token.
//!
//! Every long-running operation that an [execution](crate::execution) performs (erasing a region,
//! serving or applying a backfill) takes an `&Interruptor` and checks it between steps. The
//! [table manager](crate::table_manager) holds a clone of every execution's interruptor, and
//! [`interrupt`](Interruptor::interrupt)s it when the execution is superseded or the server shuts down.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Clone, Debug, Default)]
pub struct Interruptor(Arc<AtomicBool>);

impl Interruptor {
    pub fn new() -> Interruptor {
        Interruptor(Arc::new(AtomicBool::new(false)))
    }

    /// Signal every holder of a clone of this interruptor to stop.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Convenience for use with `?` at suspension points.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Returned by an operation that stopped early because its [`Interruptor`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let interruptor = Interruptor::new();
        let held_by_execution = interruptor.clone();
        assert_eq!(held_by_execution.check(), Ok(()));

        interruptor.interrupt();
        assert!(held_by_execution.is_interrupted());
        assert_eq!(held_by_execution.check(), Err(Interrupted));
    }
}
