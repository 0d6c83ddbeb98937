/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that runs one execution, and the handle the table manager keeps to it.
//!
//! ## Execution loop
//!
//! The thread blocks on its input channel until the next tick is due. Every time it wakes up it:
//! 1. Drains its input channel. If the batch contains several contract updates, only the latest is
//!    applied, since every earlier one is superseded by it.
//! 2. Handles the messages, writes, and reads in the batch in arrival order.
//! 3. Ticks the execution if a tick interval has passed.
//!
//! The [interruptor](crate::interruptor) is checked between every step, and inside every long-running
//! step. Once it fires, the thread publishes a [`TearDownExecutionEvent`] and exits, dropping its store
//! view.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    events::{Event, StartExecutionEvent, TearDownExecutionEvent},
    interruptor::Interruptor,
    networking::network::Network,
    persistence::pluggables::KVStore,
    storage::StoreView,
    types::{
        branch::Version,
        contract::{AckState, Contract},
        data_types::{ContractId, ServerId},
        region::Region,
    },
};

use super::{
    context::{AckCallback, ExecutionContext},
    messages::ExecutionMessage,
    roles::Role,
    Execution, ExecutionError, ReadError, WriteError,
};

/// Frame of an execution's lifecycle, shared by every role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum FrameState {
    Starting,
    Active,
    TearingDown,
}

/// Status of one local execution, as reported in [table status responses](crate::table_manager::status).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ShardStatus {
    pub region: Region,
    pub role: Role,
    pub frame: FrameState,

    /// State of the execution's latest ack. `None` until the execution has acked.
    pub ack_state: Option<AckState>,

    /// The version reported in the execution's latest ack, if any.
    pub version: Option<Version>,

    /// For primaries: whether the primary is *ready*. For secondaries: whether the secondary is
    /// streaming and has applied every write announced by the primary's latest heartbeat.
    pub up_to_date: bool,

    /// For erase executions: whether the region has been reset to empty.
    pub erase_complete: bool,

    /// Whether the execution stopped because of an error rather than being torn down.
    pub failed: bool,
}

impl ShardStatus {
    pub(crate) fn new(region: Region, role: Role) -> Self {
        Self {
            region,
            role,
            frame: FrameState::Starting,
            ack_state: None,
            version: None,
            up_to_date: false,
            erase_complete: false,
            failed: false,
        }
    }
}

/// Inputs that the table manager sends into an execution's thread.
pub(crate) enum ExecutionInput {
    Contract {
        contract_id: ContractId,
        contract: Contract,
        ack_callback: AckCallback,
    },
    Message {
        origin: ServerId,
        msg: ExecutionMessage,
    },
    Write {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        reply: Sender<Result<Version, WriteError>>,
    },
    Read {
        key: Vec<u8>,
        reply: Sender<Result<Option<Vec<u8>>, ReadError>>,
    },
}

/// Handle to a running execution, owned by the table manager.
///
/// Dropping the handle interrupts the execution and waits for its thread to exit.
pub(crate) struct ExecutionHandle {
    role: Role,
    region: Region,
    input: Sender<ExecutionInput>,
    interruptor: Interruptor,
    status: Arc<Mutex<ShardStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionHandle {
    /// Spawn the thread of an execution of `role`, working on `ctx`.
    pub(crate) fn start<K: KVStore, V: StoreView, N: Network + 'static>(
        role: Role,
        ctx: ExecutionContext<K, V, N>,
        interruptor: Interruptor,
        status: Arc<Mutex<ShardStatus>>,
        tick_interval: Duration,
    ) -> ExecutionHandle {
        let region = ctx.region.clone();
        let (input, inputs) = mpsc::channel();
        let thread = thread::spawn(move || run(Execution::new(role), ctx, inputs, tick_interval));

        ExecutionHandle {
            role,
            region,
            input,
            interruptor,
            status,
            thread: Some(thread),
        }
    }

    /// Create the status that a new execution of `role` for `region` will share with its handle.
    pub(crate) fn new_status(region: Region, role: Role) -> Arc<Mutex<ShardStatus>> {
        Arc::new(Mutex::new(ShardStatus::new(region, role)))
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn region(&self) -> &Region {
        &self.region
    }

    /// Notify the execution of a new contract for its region. Returns immediately. The execution reports
    /// its acks for the new contract through `ack_callback`.
    pub(crate) fn update_contract(
        &self,
        contract_id: ContractId,
        contract: Contract,
        ack_callback: AckCallback,
    ) {
        let _ = self.input.send(ExecutionInput::Contract {
            contract_id,
            contract,
            ack_callback,
        });
    }

    pub(crate) fn deliver(&self, origin: ServerId, msg: ExecutionMessage) {
        let _ = self.input.send(ExecutionInput::Message { origin, msg });
    }

    pub(crate) fn write(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        reply: Sender<Result<Version, WriteError>>,
    ) {
        if let Err(mpsc::SendError(ExecutionInput::Write { reply, .. })) =
            self.input.send(ExecutionInput::Write { key, value, reply })
        {
            let _ = reply.send(Err(WriteError::Timeout));
        }
    }

    pub(crate) fn read(&self, key: Vec<u8>, reply: Sender<Result<Option<Vec<u8>>, ReadError>>) {
        if let Err(mpsc::SendError(ExecutionInput::Read { reply, .. })) =
            self.input.send(ExecutionInput::Read { key, reply })
        {
            let _ = reply.send(Err(ReadError::Timeout));
        }
    }

    pub(crate) fn status(&self) -> ShardStatus {
        self.status.lock().unwrap().clone() // Safety: the status is never locked across a panic.
    }

    /// Check whether the execution stopped because of an error.
    pub(crate) fn has_failed(&self) -> bool {
        self.status().failed
    }

    /// Interrupt the execution and wait until its thread has exited. After this returns, the execution
    /// no longer touches its store view.
    pub(crate) fn tear_down(mut self) {
        self.stop()
    }

    fn stop(&mut self) {
        self.interruptor.interrupt();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Execution thread of {} panicked", self.region);
            }
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.stop()
    }
}

fn run<K: KVStore, V: StoreView, N: Network>(
    mut execution: Execution,
    mut ctx: ExecutionContext<K, V, N>,
    inputs: Receiver<ExecutionInput>,
    tick_interval: Duration,
) {
    let role = execution.role();
    Event::StartExecution(StartExecutionEvent {
        timestamp: SystemTime::now(),
        table: ctx.table,
        region: ctx.region.clone(),
        role,
    })
    .publish(&ctx.event_publisher);

    let result = execution.start(&mut ctx).and_then(|()| {
        ctx.update_status(|status| status.frame = FrameState::Active);
        execute(&mut execution, &mut ctx, &inputs, tick_interval)
    });

    ctx.update_status(|status| status.frame = FrameState::TearingDown);
    match result {
        Ok(()) | Err(ExecutionError::Interrupted) => (),
        Err(err) => {
            log::error!(
                "{:?} execution of {} in table {} failed: {}",
                role,
                ctx.region,
                ctx.table,
                err
            );
            ctx.update_status(|status| status.failed = true);
        }
    }

    Event::TearDownExecution(TearDownExecutionEvent {
        timestamp: SystemTime::now(),
        table: ctx.table,
        region: ctx.region.clone(),
        role,
    })
    .publish(&ctx.event_publisher);
}

fn execute<K: KVStore, V: StoreView, N: Network>(
    execution: &mut Execution,
    ctx: &mut ExecutionContext<K, V, N>,
    inputs: &Receiver<ExecutionInput>,
    tick_interval: Duration,
) -> Result<(), ExecutionError> {
    let mut last_tick = Instant::now();
    loop {
        ctx.interruptor.check()?;

        let mut batch = Vec::new();
        match inputs.recv_timeout(tick_interval.saturating_sub(last_tick.elapsed())) {
            Ok(input) => batch.push(input),
            Err(RecvTimeoutError::Timeout) => (),
            // The handle is gone, which only happens after it interrupted the execution.
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
        batch.extend(inputs.try_iter());

        let mut latest_contract = None;
        let mut others = Vec::new();
        for input in batch {
            match input {
                ExecutionInput::Contract {
                    contract_id,
                    contract,
                    ack_callback,
                } => latest_contract = Some((contract_id, contract, ack_callback)),
                other => others.push(other),
            }
        }

        if let Some((contract_id, contract, ack_callback)) = latest_contract {
            ctx.set_contract(contract_id, contract, ack_callback);
            execution.on_contract_update(ctx)?;
        }

        for input in others {
            ctx.interruptor.check()?;
            match input {
                ExecutionInput::Message { origin, msg } => {
                    execution.on_receive_msg(ctx, origin, msg)?
                }
                ExecutionInput::Write { key, value, reply } => {
                    let result = if ctx.region.contains_key(&key) {
                        execution.write(ctx, key, value)
                    } else {
                        Err(WriteError::NotPrimary { primary: None })
                    };
                    let _ = reply.send(result);
                }
                ExecutionInput::Read { key, reply } => {
                    let _ = reply.send(execution.read(ctx, &key));
                }
                // Filtered out above.
                ExecutionInput::Contract { .. } => (),
            }
        }

        if last_tick.elapsed() >= tick_interval {
            execution.tick(ctx)?;
            last_tick = Instant::now();
        }
    }
}
