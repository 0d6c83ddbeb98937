/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of one table's Raft member.
//!
//! Main type: [`RaftMember`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    sync::mpsc::Sender,
    time::SystemTime,
};

use rand::Rng;

use crate::{
    events::{BecomeLeaderEvent, CommitTableChangeEvent, Event},
    networking::{network::Network, sending::SenderHandle},
    persistence::{
        pluggables::{KVGet, KVStore},
        write_batch::PersistenceWriteBatch,
    },
    types::data_types::{LogIndex, RaftMemberId, ServerId, TableId, Term, Ticks},
};

use super::{
    log::{RaftError, RaftLog},
    messages::{
        AppendEntries, AppendResponse, InstallSnapshot, RaftMessage, RaftPayload, RequestVote,
        VoteResponse,
    },
    types::{
        CommitNotification, RaftHardState, RaftLogEntry, RaftSnapshot, TableChange, TableRaftState,
    },
};

/// A single member of a table's Raft cluster.
///
/// # Usage
///
/// After creating an instance of `RaftMember` using [`activate`](Self::activate) or
/// [`load`](Self::load), the [table manager](crate::table_manager) interacts with it by calling:
/// 1. [`on_receive_msg`](Self::on_receive_msg) whenever a [`RaftMessage`] addressed to this member
///    arrives.
/// 2. [`tick`](Self::tick) once per tick interval. All of the member's timers count ticks.
/// 3. [`propose_change`](Self::propose_change) to append a change to the log, if this member is the
///    leader.
/// 4. [`take_commit_notifications`](Self::take_commit_notifications) after each of the above, to learn
///    which changes were committed, and [`committed_state`](Self::committed_state) to read the result.
///
/// ## Membership
///
/// The voters of the cluster are the members of the *latest* state, which includes changes that are
/// appended but not yet committed. The leader only proposes one membership change at a time, so any two
/// consecutive voter sets overlap in a majority.
pub(crate) struct RaftMember<K: KVStore, N: Network> {
    config: RaftConfiguration,
    table: TableId,
    member_id: RaftMemberId,
    kv_store: K,
    log: RaftLog<K>,
    hard_state: RaftHardState,
    role: RaftRole,
    committed_state: TableRaftState,
    commit_index: LogIndex,

    // Servers and member ids of the latest state.
    latest_members: BTreeMap<ServerId, RaftMemberId>,

    // Servers that sent Raft messages from member ids that are not members.
    unknown_senders: BTreeSet<ServerId>,

    ticks: Ticks,
    election_deadline: Ticks,
    commit_notifications: Vec<CommitNotification>,
    sender: SenderHandle<N>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, N: Network> RaftMember<K, N> {
    /// Create a brand new member with id `member_id` that starts from `snapshot`, replacing any Raft state
    /// this server persisted for `table` before.
    pub(crate) fn activate(
        config: RaftConfiguration,
        table: TableId,
        member_id: RaftMemberId,
        snapshot: RaftSnapshot,
        kv_store: K,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Self, RaftError> {
        let hard_state = RaftHardState::default();
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        wb.set_raft_hard_state(&table, &hard_state)?;
        kv_store.clone().write(wb.into_inner());

        let log = RaftLog::initialize(kv_store.clone(), table, snapshot)?;
        Ok(Self::new(
            config,
            table,
            member_id,
            kv_store,
            log,
            hard_state,
            sender,
            event_publisher,
        ))
    }

    /// Resume the member with id `member_id` from the Raft state persisted for `table`. Returns `None` if
    /// there is no persisted state.
    pub(crate) fn load(
        config: RaftConfiguration,
        table: TableId,
        member_id: RaftMemberId,
        kv_store: K,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Option<Self>, RaftError> {
        let log = match RaftLog::load(kv_store.clone(), table)? {
            Some(log) => log,
            None => return Ok(None),
        };
        let hard_state = kv_store.raft_hard_state(&table)?.unwrap_or_default();
        Ok(Some(Self::new(
            config,
            table,
            member_id,
            kv_store,
            log,
            hard_state,
            sender,
            event_publisher,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        config: RaftConfiguration,
        table: TableId,
        member_id: RaftMemberId,
        kv_store: K,
        log: RaftLog<K>,
        hard_state: RaftHardState,
        sender: SenderHandle<N>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let committed_state = log.snapshot().state.clone();
        let commit_index = log.snapshot().last_index;
        let mut member = Self {
            election_deadline: 0,
            config,
            table,
            member_id,
            kv_store,
            log,
            hard_state,
            role: RaftRole::Follower { leader: None },
            latest_members: committed_state.member_ids.clone(),
            committed_state,
            commit_index,
            unknown_senders: BTreeSet::new(),
            ticks: 0,
            commit_notifications: Vec::new(),
            sender,
            event_publisher,
        };
        member.refresh_latest_members();
        member.reset_election_deadline();
        member
    }

    /* ↓↓↓ Queries ↓↓↓ */

    pub(crate) fn member_id(&self) -> RaftMemberId {
        self.member_id
    }

    pub(crate) fn term(&self) -> Term {
        self.hard_state.term
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role, RaftRole::Leader(_))
    }

    /// Get the server of the member this member believes to be the leader.
    pub(crate) fn leader(&self) -> Option<ServerId> {
        match &self.role {
            RaftRole::Leader(_) => Some(self.config.me),
            RaftRole::Follower { leader: Some(leader) } => self.server_of(leader),
            RaftRole::Follower { leader: None } | RaftRole::Candidate { .. } => None,
        }
    }

    /// Get a consistent view of the committed state.
    pub(crate) fn committed_state(&self) -> &TableRaftState {
        &self.committed_state
    }

    pub(crate) fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Check whether the log has entries that are not committed yet.
    pub(crate) fn has_uncommitted_entries(&self) -> bool {
        self.log.last_index() > self.commit_index
    }

    /// Get the servers and member ids of the latest state, including uncommitted changes.
    pub(crate) fn latest_members(&self) -> &BTreeMap<ServerId, RaftMemberId> {
        &self.latest_members
    }

    /// Get the servers that the leader heard from within the last `timeout` ticks, including itself.
    /// Empty if this member is not the leader.
    pub(crate) fn live_servers(&self, timeout: Ticks) -> BTreeSet<ServerId> {
        match &self.role {
            RaftRole::Leader(leader_state) => {
                let mut live: BTreeSet<ServerId> = leader_state
                    .last_contact
                    .iter()
                    .filter(|(_, contact)| self.ticks.saturating_sub(**contact) <= timeout)
                    .filter_map(|(member, _)| self.server_of(member))
                    .collect();
                live.insert(self.config.me);
                live
            }
            _ => BTreeSet::new(),
        }
    }

    /// Create a snapshot of the committed state, with which new members are activated.
    pub(crate) fn activation_snapshot(&self) -> RaftSnapshot {
        RaftSnapshot {
            last_index: self.commit_index,
            last_term: self
                .log
                .term_at(self.commit_index)
                .unwrap_or(self.log.snapshot().last_term),
            state: self.committed_state.clone(),
        }
    }

    /// Take the servers that sent messages to this member from a member id that is not in the latest
    /// membership since the last call. These are usually removed members that never learned of their
    /// removal.
    pub(crate) fn take_unknown_senders(&mut self) -> BTreeSet<ServerId> {
        std::mem::take(&mut self.unknown_senders)
    }

    /// Take every commit notification produced since the last call.
    pub(crate) fn take_commit_notifications(&mut self) -> Vec<CommitNotification> {
        std::mem::take(&mut self.commit_notifications)
    }

    /* ↓↓↓ Events ↓↓↓ */

    /// Advance the member's timers by one tick, possibly starting an election or sending heartbeats.
    pub(crate) fn tick(&mut self) -> Result<(), RaftError> {
        self.ticks += 1;

        let heartbeat_due = match &mut self.role {
            RaftRole::Leader(leader_state) => {
                leader_state.ticks_since_heartbeat += 1;
                if leader_state.ticks_since_heartbeat >= self.config.heartbeat_ticks {
                    leader_state.ticks_since_heartbeat = 0;
                    true
                } else {
                    false
                }
            }
            RaftRole::Follower { .. } | RaftRole::Candidate { .. } => {
                if self.ticks >= self.election_deadline && self.is_voter() {
                    return self.start_election();
                }
                false
            }
        };

        if heartbeat_due {
            self.send_append_entries_to_all();
        }
        Ok(())
    }

    /// Append `change` to the log. Only the leader accepts proposals.
    ///
    /// Returns the index of the new entry. The change is committed once
    /// [`take_commit_notifications`](Self::take_commit_notifications) returns an entry with this index.
    pub(crate) fn propose_change(&mut self, change: TableChange) -> Result<LogIndex, ProposeError> {
        if !self.is_leader() {
            return Err(ProposeError::NotLeader {
                leader: self.leader(),
            });
        }

        let entry = RaftLogEntry {
            term: self.hard_state.term,
            index: self.log.last_index() + 1,
            change,
        };
        let index = entry.index;
        self.log.append(vec![entry])?;
        self.refresh_latest_members();

        self.send_append_entries_to_all();
        self.advance_commit_index()?;
        Ok(index)
    }

    /// Process `msg`, received from the server `origin`.
    pub(crate) fn on_receive_msg(
        &mut self,
        origin: ServerId,
        msg: RaftMessage,
    ) -> Result<(), RaftError> {
        if msg.to != self.member_id {
            return Ok(());
        }
        if !self.latest_members.values().any(|member| *member == msg.from) {
            self.unknown_senders.insert(origin);
            return Ok(());
        }

        if msg.term > self.hard_state.term {
            self.become_follower(msg.term, None)?;
        }

        match msg.payload {
            RaftPayload::AppendEntries(append_entries) => {
                self.on_receive_append_entries(origin, msg.term, msg.from, append_entries)
            }
            RaftPayload::AppendResponse(response) => {
                self.on_receive_append_response(msg.term, msg.from, response)
            }
            RaftPayload::RequestVote(request_vote) => {
                self.on_receive_request_vote(origin, msg.term, msg.from, request_vote)
            }
            RaftPayload::VoteResponse(response) => {
                self.on_receive_vote_response(msg.term, msg.from, response)
            }
            RaftPayload::InstallSnapshot(install_snapshot) => {
                self.on_receive_install_snapshot(origin, msg.term, msg.from, install_snapshot)
            }
        }
    }

    fn on_receive_append_entries(
        &mut self,
        origin: ServerId,
        term: Term,
        from: RaftMemberId,
        append_entries: AppendEntries,
    ) -> Result<(), RaftError> {
        if term < self.hard_state.term {
            self.respond(origin, from, false, self.log.last_index());
            return Ok(());
        }
        self.follow_leader(term, from)?;

        let AppendEntries {
            mut base_index,
            mut base_term,
            mut entries,
            commit_index,
        } = append_entries;

        // Entries that are already compacted are committed, and so match.
        let snapshot_index = self.log.snapshot().last_index;
        if base_index < snapshot_index {
            entries.retain(|entry| entry.index > snapshot_index);
            base_index = snapshot_index;
            base_term = self.log.snapshot().last_term;
        }

        match self.log.term_at(base_index) {
            None => {
                let last_index = self.log.last_index();
                self.respond(origin, from, false, last_index);
                return Ok(());
            }
            Some(local_term) if local_term != base_term => {
                let hint = LogIndex::new(base_index.int().saturating_sub(1));
                self.respond(origin, from, false, hint);
                return Ok(());
            }
            Some(_) => (),
        }

        let match_index = base_index + entries.len() as u64;
        if let Some(first_new) = entries
            .iter()
            .position(|entry| self.log.term_at(entry.index) != Some(entry.term))
        {
            let new_entries = entries.split_off(first_new);
            self.log.truncate_from(new_entries[0].index)?;
            self.log.append(new_entries)?;
            self.refresh_latest_members();
        }

        let new_commit_index = std::cmp::min(commit_index, match_index);
        if new_commit_index > self.commit_index {
            self.apply_committed(new_commit_index)?;
        }

        self.respond(origin, from, true, match_index);
        Ok(())
    }

    fn on_receive_append_response(
        &mut self,
        term: Term,
        from: RaftMemberId,
        response: AppendResponse,
    ) -> Result<(), RaftError> {
        if term != self.hard_state.term {
            return Ok(());
        }
        let last_index = self.log.last_index();
        let ticks = self.ticks;
        let leader_state = match &mut self.role {
            RaftRole::Leader(leader_state) => leader_state,
            _ => return Ok(()),
        };
        leader_state.last_contact.insert(from, ticks);

        let next_index = if response.success {
            let match_index = leader_state.match_index.entry(from).or_default();
            *match_index = std::cmp::max(*match_index, response.last_index);
            let next_index = *match_index + 1;
            leader_state.next_index.insert(from, next_index);
            next_index
        } else {
            let current = leader_state
                .next_index
                .get(&from)
                .copied()
                .unwrap_or(last_index + 1);
            let next_index = std::cmp::max(
                std::cmp::min(LogIndex::new(current.int().saturating_sub(1)), response.last_index + 1),
                LogIndex::new(1),
            );
            leader_state.next_index.insert(from, next_index);
            next_index
        };

        if response.success {
            self.advance_commit_index()?;
        }
        if next_index <= last_index || !response.success {
            self.send_append_entries(from);
        }
        Ok(())
    }

    fn on_receive_request_vote(
        &mut self,
        origin: ServerId,
        term: Term,
        from: RaftMemberId,
        request_vote: RequestVote,
    ) -> Result<(), RaftError> {
        let log_is_up_to_date = (request_vote.last_term, request_vote.last_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = term == self.hard_state.term
            && self.hard_state.voted_for.map_or(true, |voted_for| voted_for == from)
            && log_is_up_to_date
            && self.latest_members.values().any(|member| *member == from);

        if granted {
            self.hard_state.voted_for = Some(from);
            self.persist_hard_state()?;
            self.reset_election_deadline();
        }

        self.send(
            origin,
            from,
            RaftPayload::VoteResponse(VoteResponse { granted }),
        );
        Ok(())
    }

    fn on_receive_vote_response(
        &mut self,
        term: Term,
        from: RaftMemberId,
        response: VoteResponse,
    ) -> Result<(), RaftError> {
        if term != self.hard_state.term || !response.granted {
            return Ok(());
        }
        if let RaftRole::Candidate { votes } = &mut self.role {
            votes.insert(from);
            self.check_election_won()?;
        }
        Ok(())
    }

    fn on_receive_install_snapshot(
        &mut self,
        origin: ServerId,
        term: Term,
        from: RaftMemberId,
        install_snapshot: InstallSnapshot,
    ) -> Result<(), RaftError> {
        if term < self.hard_state.term {
            self.respond(origin, from, false, self.log.last_index());
            return Ok(());
        }
        self.follow_leader(term, from)?;

        let snapshot = install_snapshot.snapshot;
        let last_index = snapshot.last_index;
        if last_index > self.commit_index {
            self.committed_state = snapshot.state.clone();
            self.commit_index = last_index;
            self.log.install_snapshot(snapshot)?;
            self.refresh_latest_members();
            self.commit_notifications
                .push(CommitNotification::Snapshot { last_index });
        }

        self.respond(origin, from, true, last_index);
        Ok(())
    }

    /* ↓↓↓ Roles ↓↓↓ */

    fn start_election(&mut self) -> Result<(), RaftError> {
        self.hard_state.term = self.hard_state.term + 1;
        self.hard_state.voted_for = Some(self.member_id);
        self.persist_hard_state()?;
        self.reset_election_deadline();

        log::debug!(
            "Member {} of table {} starting an election for term {}",
            self.member_id,
            self.table,
            self.hard_state.term
        );

        self.role = RaftRole::Candidate {
            votes: [self.member_id].into_iter().collect(),
        };
        let request_vote = RequestVote {
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        for (server, member) in self.peers() {
            self.send(
                server,
                member,
                RaftPayload::RequestVote(request_vote.clone()),
            );
        }

        self.check_election_won()
    }

    fn check_election_won(&mut self) -> Result<(), RaftError> {
        let votes = match &self.role {
            RaftRole::Candidate { votes } => votes,
            _ => return Ok(()),
        };
        let voters: BTreeSet<RaftMemberId> = self.latest_members.values().copied().collect();
        let granted = votes.intersection(&voters).count();
        if granted <= voters.len() / 2 {
            return Ok(());
        }

        let next_index = self.log.last_index() + 1;
        let peers = self.peers();
        self.role = RaftRole::Leader(LeaderState {
            next_index: peers.iter().map(|(_, member)| (*member, next_index)).collect(),
            match_index: BTreeMap::new(),
            // Every peer gets a full liveness timeout before it counts as failed.
            last_contact: peers.iter().map(|(_, member)| (*member, self.ticks)).collect(),
            ticks_since_heartbeat: 0,
        });

        Event::BecomeLeader(BecomeLeaderEvent {
            timestamp: SystemTime::now(),
            table: self.table,
            term: self.hard_state.term,
        })
        .publish(&self.event_publisher);

        // Entries from earlier terms only get committed together with an entry from the current term.
        match self.propose_change(TableChange::NewTerm) {
            Ok(_) => Ok(()),
            Err(ProposeError::RaftError(err)) => Err(err),
            Err(ProposeError::NotLeader { .. }) => Ok(()),
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<RaftMemberId>) -> Result<(), RaftError> {
        if term > self.hard_state.term {
            self.hard_state = RaftHardState {
                term,
                voted_for: None,
            };
            self.persist_hard_state()?;
        }
        self.role = RaftRole::Follower { leader };
        Ok(())
    }

    /// Recognize `leader` as the leader of `term`, which is the current term.
    fn follow_leader(&mut self, term: Term, leader: RaftMemberId) -> Result<(), RaftError> {
        match &self.role {
            RaftRole::Follower { leader: Some(current) } if *current == leader => (),
            _ => self.become_follower(term, Some(leader))?,
        }
        self.reset_election_deadline();
        Ok(())
    }

    /* ↓↓↓ Replication ↓↓↓ */

    fn send_append_entries_to_all(&mut self) {
        let peers: Vec<RaftMemberId> = self.peers().into_iter().map(|(_, member)| member).collect();
        for peer in peers {
            self.send_append_entries(peer);
        }
    }

    fn send_append_entries(&mut self, peer: RaftMemberId) {
        let server = match self.server_of(&peer) {
            Some(server) => server,
            None => return,
        };
        let last_index = self.log.last_index();
        let next_index = match &mut self.role {
            RaftRole::Leader(leader_state) => *leader_state
                .next_index
                .entry(peer)
                .or_insert(last_index + 1),
            _ => return,
        };

        let snapshot = self.log.snapshot();
        if next_index <= snapshot.last_index {
            let payload = RaftPayload::InstallSnapshot(InstallSnapshot {
                snapshot: snapshot.clone(),
            });
            self.send(server, peer, payload);
            return;
        }

        let base_index = LogIndex::new(next_index.int() - 1);
        let base_term = match self.log.term_at(base_index) {
            Some(term) => term,
            None => return,
        };
        let payload = RaftPayload::AppendEntries(AppendEntries {
            base_index,
            base_term,
            entries: self
                .log
                .entries_from(next_index, self.config.max_entries_per_append),
            commit_index: self.commit_index,
        });
        self.send(server, peer, payload);
    }

    /// Commit the highest entry of the current term that a majority of voters has replicated.
    fn advance_commit_index(&mut self) -> Result<(), RaftError> {
        let leader_state = match &self.role {
            RaftRole::Leader(leader_state) => leader_state,
            _ => return Ok(()),
        };

        let mut match_indices: Vec<LogIndex> = self
            .latest_members
            .values()
            .map(|member| {
                if *member == self.member_id {
                    self.log.last_index()
                } else {
                    leader_state
                        .match_index
                        .get(member)
                        .copied()
                        .unwrap_or_default()
                }
            })
            .collect();
        if match_indices.is_empty() {
            return Ok(());
        }
        match_indices.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = match_indices[match_indices.len() / 2];

        if quorum_index > self.commit_index
            && self.log.term_at(quorum_index) == Some(self.hard_state.term)
        {
            self.apply_committed(quorum_index)?;
        }
        Ok(())
    }

    /// Apply every entry up to and including `new_commit_index` to the committed state.
    fn apply_committed(&mut self, new_commit_index: LogIndex) -> Result<(), RaftError> {
        let new_commit_index = std::cmp::min(new_commit_index, self.log.last_index());
        let entries: Vec<RaftLogEntry> = self
            .log
            .entries_after(self.commit_index)
            .take_while(|entry| entry.index <= new_commit_index)
            .cloned()
            .collect();

        for entry in entries {
            self.committed_state.apply(&entry);
            self.commit_index = entry.index;

            Event::CommitTableChange(CommitTableChangeEvent {
                timestamp: SystemTime::now(),
                table: self.table,
                log_index: entry.index,
                change: entry.change.clone(),
            })
            .publish(&self.event_publisher);
            self.commit_notifications
                .push(CommitNotification::Entry(entry));
        }

        // A leader that committed its own removal hands the cluster over to the remaining voters.
        if self.is_leader() && !self.committed_state.member_ids.contains_key(&self.config.me) {
            log::debug!(
                "Member {} of table {} stepping down after its removal",
                self.member_id,
                self.table
            );
            self.role = RaftRole::Follower { leader: None };
        }

        self.maybe_compact()
    }

    fn maybe_compact(&mut self) -> Result<(), RaftError> {
        if self.commit_index - self.log.snapshot().last_index < self.config.log_compaction_threshold {
            return Ok(());
        }
        let snapshot = self.activation_snapshot();
        log::debug!(
            "Member {} of table {} compacting its log up to {}",
            self.member_id,
            self.table,
            snapshot.last_index
        );
        self.log.compact(snapshot)
    }

    /* ↓↓↓ Helpers ↓↓↓ */

    fn is_voter(&self) -> bool {
        self.latest_members
            .values()
            .any(|member| *member == self.member_id)
    }

    /// Get every voter other than this member.
    fn peers(&self) -> Vec<(ServerId, RaftMemberId)> {
        self.latest_members
            .iter()
            .filter(|(_, member)| **member != self.member_id)
            .map(|(server, member)| (*server, *member))
            .collect()
    }

    fn server_of(&self, member: &RaftMemberId) -> Option<ServerId> {
        self.latest_members
            .iter()
            .find(|(_, m)| *m == member)
            .map(|(server, _)| *server)
            .or_else(|| self.committed_state.server_of(member))
    }

    /// Recompute the latest members from the committed members and the uncommitted entries.
    fn refresh_latest_members(&mut self) {
        let mut members = self.committed_state.member_ids.clone();
        for entry in self.log.entries_after(self.commit_index) {
            match &entry.change {
                TableChange::AddMember { server, member } => {
                    members.insert(*server, *member);
                }
                TableChange::RemoveMember { server } => {
                    members.remove(server);
                }
                _ => (),
            }
        }
        self.latest_members = members;
    }

    fn reset_election_deadline(&mut self) {
        let (min, max) = self.config.election_timeout_ticks;
        let timeout = if max > min {
            rand::thread_rng().gen_range(min, max + 1)
        } else {
            min
        };
        self.election_deadline = self.ticks + timeout;
    }

    fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        let mut wb = PersistenceWriteBatch::<K::WriteBatch>::new();
        wb.set_raft_hard_state(&self.table, &self.hard_state)?;
        self.kv_store.write(wb.into_inner());
        Ok(())
    }

    fn respond(&mut self, origin: ServerId, to: RaftMemberId, success: bool, last_index: LogIndex) {
        self.send(
            origin,
            to,
            RaftPayload::AppendResponse(AppendResponse {
                success,
                last_index,
            }),
        )
    }

    fn send(&mut self, server: ServerId, to: RaftMemberId, payload: RaftPayload) {
        let msg = RaftMessage {
            term: self.hard_state.term,
            from: self.member_id,
            to,
            payload,
        };
        self.sender.send_table_message(self.table, &server, msg)
    }
}

/// Configuration of every Raft member of a server.
#[derive(Clone)]
pub(crate) struct RaftConfiguration {
    pub(crate) me: ServerId,
    pub(crate) heartbeat_ticks: Ticks,
    pub(crate) election_timeout_ticks: (Ticks, Ticks),
    pub(crate) log_compaction_threshold: u64,
    pub(crate) max_entries_per_append: usize,
}

enum RaftRole {
    Follower { leader: Option<RaftMemberId> },
    Candidate { votes: BTreeSet<RaftMemberId> },
    Leader(LeaderState),
}

struct LeaderState {
    next_index: BTreeMap<RaftMemberId, LogIndex>,
    match_index: BTreeMap<RaftMemberId, LogIndex>,
    last_contact: BTreeMap<RaftMemberId, Ticks>,
    ticks_since_heartbeat: Ticks,
}

/// Reasons why [`propose_change`](RaftMember::propose_change) rejected a proposal.
#[derive(Debug)]
pub enum ProposeError {
    /// This member is not the leader. `leader` is the server this member believes to be the leader.
    NotLeader { leader: Option<ServerId> },

    RaftError(RaftError),
}

impl Display for ProposeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProposeError::NotLeader { leader: Some(leader) } => {
                write!(f, "not the leader, {} is", leader)
            }
            ProposeError::NotLeader { leader: None } => write!(f, "not the leader"),
            ProposeError::RaftError(err) => write!(f, "{}", err),
        }
    }
}

impl From<RaftError> for ProposeError {
    fn from(value: RaftError) -> Self {
        ProposeError::RaftError(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{server, table_config, MemKV, RecordingNetwork, TABLE};

    struct Follower {
        member: RaftMember<MemKV, RecordingNetwork>,
        network: RecordingNetwork,
        leader_id: RaftMemberId,
        state: TableRaftState,
    }

    /// Server 2 of a two-server table, driven by hand as the follower of server 1.
    fn follower() -> Follower {
        let state = TableRaftState::new_table(table_config(&[1, 2], 1)).unwrap();
        let leader_id = state.member_ids[&server(1)];
        let config = RaftConfiguration {
            me: server(2),
            heartbeat_ticks: 2,
            election_timeout_ticks: (100, 100),
            log_compaction_threshold: 1000,
            max_entries_per_append: 10,
        };
        let network = RecordingNetwork::default();
        let member = RaftMember::activate(
            config,
            TABLE,
            state.member_ids[&server(2)],
            RaftSnapshot::initial(state.clone()),
            MemKV::new(),
            SenderHandle::new(network.clone()),
            None,
        )
        .unwrap();

        Follower {
            member,
            network,
            leader_id,
            state,
        }
    }

    impl Follower {
        fn receive(&mut self, term: u64, payload: RaftPayload) {
            let msg = RaftMessage {
                term: Term::new(term),
                from: self.leader_id,
                to: self.member.member_id(),
                payload,
            };
            self.member.on_receive_msg(server(1), msg).unwrap();
        }

        fn last_response(&self) -> AppendResponse {
            match self.network.take_raft_messages().pop() {
                Some((_, RaftMessage {
                    payload: RaftPayload::AppendResponse(response),
                    ..
                })) => response,
                other => panic!("expected an append response, got {:?}", other),
            }
        }
    }

    fn entry(term: u64, index: u64, change: TableChange) -> RaftLogEntry {
        RaftLogEntry {
            term: Term::new(term),
            index: LogIndex::new(index),
            change,
        }
    }

    fn append(base: (u64, u64), entries: Vec<RaftLogEntry>, commit_index: u64) -> RaftPayload {
        RaftPayload::AppendEntries(AppendEntries {
            base_index: LogIndex::new(base.1),
            base_term: Term::new(base.0),
            entries,
            commit_index: LogIndex::new(commit_index),
        })
    }

    #[test]
    fn conflicting_entries_are_replaced_by_the_new_leader() {
        let mut follower = follower();
        let entries = vec![
            entry(1, 1, TableChange::NewTerm),
            entry(1, 2, TableChange::NewTerm),
            entry(1, 3, TableChange::NewTerm),
        ];
        follower.receive(1, append((0, 0), entries, 1));
        assert_eq!(
            follower.last_response(),
            AppendResponse {
                success: true,
                last_index: LogIndex::new(3)
            }
        );
        assert_eq!(follower.member.commit_index(), LogIndex::new(1));

        // The leader of term 2 never saw entries 2 and 3 of term 1.
        follower.receive(2, append((1, 1), vec![entry(2, 2, TableChange::NewTerm)], 2));
        assert_eq!(
            follower.last_response(),
            AppendResponse {
                success: true,
                last_index: LogIndex::new(2)
            }
        );
        assert_eq!(follower.member.log.last_index(), LogIndex::new(2));
        assert_eq!(follower.member.log.term_at(LogIndex::new(2)), Some(Term::new(2)));
        assert_eq!(follower.member.commit_index(), LogIndex::new(2));
        assert_eq!(
            follower.member.take_commit_notifications(),
            vec![
                CommitNotification::Entry(entry(1, 1, TableChange::NewTerm)),
                CommitNotification::Entry(entry(2, 2, TableChange::NewTerm)),
            ]
        );
    }

    #[test]
    fn mismatch_at_the_start_of_the_log_hints_index_zero() {
        let mut follower = follower();

        follower.receive(1, append((1, 0), vec![entry(1, 1, TableChange::NewTerm)], 1));
        assert_eq!(
            follower.last_response(),
            AppendResponse {
                success: false,
                last_index: LogIndex::new(0)
            }
        );
        assert_eq!(follower.member.log.last_index(), LogIndex::new(0));
    }

    #[test]
    fn entries_after_an_installed_snapshot_are_committed() {
        let mut follower = follower();
        let snapshot = RaftSnapshot {
            last_index: LogIndex::new(5),
            last_term: Term::new(1),
            state: follower.state.clone(),
        };
        follower.receive(1, RaftPayload::InstallSnapshot(InstallSnapshot { snapshot }));
        assert_eq!(
            follower.last_response(),
            AppendResponse {
                success: true,
                last_index: LogIndex::new(5)
            }
        );
        assert_eq!(
            follower.member.take_commit_notifications(),
            vec![CommitNotification::Snapshot {
                last_index: LogIndex::new(5)
            }]
        );

        let member = RaftMemberId::new(77);
        let change = TableChange::AddMember {
            server: server(3),
            member,
        };
        follower.receive(1, append((1, 5), vec![entry(1, 6, change.clone())], 6));
        assert_eq!(
            follower.last_response(),
            AppendResponse {
                success: true,
                last_index: LogIndex::new(6)
            }
        );
        assert_eq!(follower.member.commit_index(), LogIndex::new(6));
        assert_eq!(
            follower.member.take_commit_notifications(),
            vec![CommitNotification::Entry(entry(1, 6, change))]
        );
        assert_eq!(
            follower.member.committed_state().member_ids.get(&server(3)),
            Some(&member)
        );
        assert_eq!(follower.member.latest_members().get(&server(3)), Some(&member));
    }
}
