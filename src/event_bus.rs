/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Thread that receives events published by the components of a server, and fans them out to the
//! registered [handlers](HandlerPtr).

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

/// Pointer to a handler closure, parametrised by the argument (for our use case, event type).
pub type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Stores the handlers for every kind of [`Event`].
pub(crate) struct EventHandlers {
    pub(crate) become_leader_handlers: Vec<HandlerPtr<BecomeLeaderEvent>>,
    pub(crate) commit_table_change_handlers: Vec<HandlerPtr<CommitTableChangeEvent>>,
    pub(crate) update_contract_ack_handlers: Vec<HandlerPtr<UpdateContractAckEvent>>,
    pub(crate) start_execution_handlers: Vec<HandlerPtr<StartExecutionEvent>>,
    pub(crate) tear_down_execution_handlers: Vec<HandlerPtr<TearDownExecutionEvent>>,
    pub(crate) create_branch_handlers: Vec<HandlerPtr<CreateBranchEvent>>,
    pub(crate) complete_erase_handlers: Vec<HandlerPtr<CompleteEraseEvent>>,
    pub(crate) activate_table_handlers: Vec<HandlerPtr<ActivateTableEvent>>,
    pub(crate) deactivate_table_handlers: Vec<HandlerPtr<DeactivateTableEvent>>,
    pub(crate) drop_table_handlers: Vec<HandlerPtr<DropTableEvent>>,
}

/// Handlers passed in by the user through the optional setters of
/// [`ServerSpec`](crate::server::ServerSpec).
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_become_leader: Option<HandlerPtr<BecomeLeaderEvent>>,
    pub(crate) on_commit_table_change: Option<HandlerPtr<CommitTableChangeEvent>>,
    pub(crate) on_update_contract_ack: Option<HandlerPtr<UpdateContractAckEvent>>,
    pub(crate) on_start_execution: Option<HandlerPtr<StartExecutionEvent>>,
    pub(crate) on_tear_down_execution: Option<HandlerPtr<TearDownExecutionEvent>>,
    pub(crate) on_create_branch: Option<HandlerPtr<CreateBranchEvent>>,
    pub(crate) on_complete_erase: Option<HandlerPtr<CompleteEraseEvent>>,
    pub(crate) on_activate_table: Option<HandlerPtr<ActivateTableEvent>>,
    pub(crate) on_deactivate_table: Option<HandlerPtr<DeactivateTableEvent>>,
    pub(crate) on_drop_table: Option<HandlerPtr<DropTableEvent>>,
}

impl EventHandlers {
    /// Create the handler lists from the user's handlers, adding the default
    /// [loggers](crate::logging) in front of them if `log_events` is true.
    pub(crate) fn new(log_events: bool, user_handlers: UserHandlers) -> EventHandlers {
        fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            if let Some(user_handler) = user_handler {
                handlers.push(user_handler);
            }
            handlers
        }

        EventHandlers {
            become_leader_handlers: handlers(log_events, user_handlers.on_become_leader),
            commit_table_change_handlers: handlers(log_events, user_handlers.on_commit_table_change),
            update_contract_ack_handlers: handlers(log_events, user_handlers.on_update_contract_ack),
            start_execution_handlers: handlers(log_events, user_handlers.on_start_execution),
            tear_down_execution_handlers: handlers(log_events, user_handlers.on_tear_down_execution),
            create_branch_handlers: handlers(log_events, user_handlers.on_create_branch),
            complete_erase_handlers: handlers(log_events, user_handlers.on_complete_erase),
            activate_table_handlers: handlers(log_events, user_handlers.on_activate_table),
            deactivate_table_handlers: handlers(log_events, user_handlers.on_deactivate_table),
            drop_table_handlers: handlers(log_events, user_handlers.on_drop_table),
        }
    }

    /// Check whether no handler at all is registered, in which case no event bus needs to be started.
    pub(crate) fn is_empty(&self) -> bool {
        self.become_leader_handlers.is_empty()
            && self.commit_table_change_handlers.is_empty()
            && self.update_contract_ack_handlers.is_empty()
            && self.start_execution_handlers.is_empty()
            && self.tear_down_execution_handlers.is_empty()
            && self.create_branch_handlers.is_empty()
            && self.complete_erase_handlers.is_empty()
            && self.activate_table_handlers.is_empty()
            && self.deactivate_table_handlers.is_empty()
            && self.drop_table_handlers.is_empty()
    }

    /// Invoke every handler registered for the kind of `event`.
    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::BecomeLeader(become_leader_event) => self
                .become_leader_handlers
                .iter()
                .for_each(|handler| handler(&become_leader_event)),

            Event::CommitTableChange(commit_table_change_event) => self
                .commit_table_change_handlers
                .iter()
                .for_each(|handler| handler(&commit_table_change_event)),

            Event::UpdateContractAck(update_contract_ack_event) => self
                .update_contract_ack_handlers
                .iter()
                .for_each(|handler| handler(&update_contract_ack_event)),

            Event::StartExecution(start_execution_event) => self
                .start_execution_handlers
                .iter()
                .for_each(|handler| handler(&start_execution_event)),

            Event::TearDownExecution(tear_down_execution_event) => self
                .tear_down_execution_handlers
                .iter()
                .for_each(|handler| handler(&tear_down_execution_event)),

            Event::CreateBranch(create_branch_event) => self
                .create_branch_handlers
                .iter()
                .for_each(|handler| handler(&create_branch_event)),

            Event::CompleteErase(complete_erase_event) => self
                .complete_erase_handlers
                .iter()
                .for_each(|handler| handler(&complete_erase_event)),

            Event::ActivateTable(activate_table_event) => self
                .activate_table_handlers
                .iter()
                .for_each(|handler| handler(&activate_table_event)),

            Event::DeactivateTable(deactivate_table_event) => self
                .deactivate_table_handlers
                .iter()
                .for_each(|handler| handler(&deactivate_table_event)),

            Event::DropTable(drop_table_event) => self
                .drop_table_handlers
                .iter()
                .for_each(|handler| handler(&drop_table_event)),
        }
    }
}

/// Start the event bus thread, which polls `event_subscriber` and fires the matching handlers in
/// `event_handlers` for every event received, until it receives a signal through `shutdown_signal`.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone. Wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(50)),
        }
    })
}
