use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::grpc::ProtoRequestVoteReq;
use crate::replica::election::{ElectionState, ElectionStateSnapshot, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peer_calls::{self, BatchError};
use crate::replica::peers::{ClusterTracker, Peer, ReplicaId};
use crate::replica::quorum;
use crate::replica::replica_api::{
    AddPeerError, AddPeerInput, AppendEntriesError, AppendEntriesInput, AppendEntriesOutput,
    AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerError, CompactLogError, CompactLogInput, CompactLogOutput,
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerError,
    LeaderRedirectInfo, LeaderTimerTick, MissingLogInfo, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    RequestVoteReplyFromPeer, RequestVoteResult, SnapshotSource, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
use std::cmp;
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

/// Replica is one node's Raft state machine. It runs inside the replica actor: every method is
/// called from the actor's event loop, one event at a time, and never awaits. Calls to peers are
/// spawned and report back as new events.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog<L>,
    snapshot_source: Arc<dyn SnapshotSource>,
    actor_client: WeakActorClient,
    append_entries_timeout: Duration,
    install_snapshot_timeout: Duration,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        logger: slog::Logger,
        my_replica_id: ReplicaId,
        cluster_tracker: ClusterTracker,
        local_state: Box<dyn PersistentLocalState>,
        election_state: ElectionState,
        write_ahead_log: WriteAheadLog<L>,
        snapshot_source: Arc<dyn SnapshotSource>,
        actor_client: WeakActorClient,
        append_entries_timeout: Duration,
    ) -> Self {
        Replica {
            logger,
            my_replica_id,
            cluster_tracker,
            local_state,
            election_state,
            write_ahead_log,
            snapshot_source,
            actor_client,
            append_entries_timeout,
            // A whole entity store goes over the wire, not a batch of entries.
            install_snapshot_timeout: append_entries_timeout * 100,
        }
    }

    // ------- Client writes --------

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        self.check_leader()?;

        // The entry is only acknowledged to the client once it is applied (§5.3); here it is
        // just durable on the leader.
        let term = self.local_state.current_term();
        let index = self
            .write_ahead_log
            .append(WriteAheadLogEntry {
                term,
                data: input.data.to_vec(),
            })
            .map_err(EnqueueForReplicationError::LocalIoError)?;

        for peer_id in self.cluster_tracker.peer_ids() {
            self.handle_leader_timer(LeaderTimerTick { peer_id, term });
        }
        self.advance_commit_index();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: index,
        })
    }

    fn check_leader(&self) -> Result<(), EnqueueForReplicationError> {
        match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => Ok(()),
            // A joining node can follow a leader before it has applied the leader's membership.
            ElectionStateSnapshot::Follower(leader_id) => match self.cluster_tracker.metadata(&leader_id) {
                Some(leader) => Err(EnqueueForReplicationError::LeaderRedirect(LeaderRedirectInfo {
                    ip_addr: leader.ip_addr,
                    sync_port: leader.sync_port,
                    replica_id: leader_id,
                })),
                None => Err(EnqueueForReplicationError::NoLeader),
            },
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::FollowerNoLeader => {
                Err(EnqueueForReplicationError::NoLeader)
            }
        }
    }

    // ------- Elections --------

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        let (current_term, voted_for) = self.local_state.voted_for_current_term();
        if input.candidate_term < current_term {
            slog::info!(
                self.logger,
                "Refusing vote to {:?}: term {:?} is behind ours",
                input.candidate_id,
                input.candidate_term
            );
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        let newer_term = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RequestVoteError::ServerIoError)?;
        let voted_for = if newer_term {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Saw term {:?} in RequestVote. Now {:?}",
                input.candidate_term,
                self.election_state
            );
            // Nobody has our vote in a term we just learned about.
            None
        } else {
            voted_for
        };

        let log_is_current = self.candidate_log_is_current(input.candidate_last_log_entry);
        let vote_granted = match voted_for {
            // A retry from the candidate we already voted for. The vote is on disk.
            Some(vote) if *vote == input.candidate_id => log_is_current,
            Some(vote) => {
                slog::info!(self.logger, "Refusing vote to {:?}: voted for {:?}", input.candidate_id, vote);
                false
            }
            None if !log_is_current => {
                slog::info!(self.logger, "Refusing vote to {:?}: its log is behind ours", input.candidate_id);
                false
            }
            None => {
                let stored = self
                    .local_state
                    .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
                    .map_err(RequestVoteError::ServerIoError)?;
                if stored {
                    slog::info!(self.logger, "Voted for {:?} in term {:?}", input.candidate_id, input.candidate_term);
                    // Granting a vote counts as hearing from a would-be leader.
                    self.election_state.reset_timeout_if_follower();
                }
                stored
            }
        };

        Ok(RequestVoteOutput { vote_granted })
    }

    /// A later last term wins; with equal last terms the longer log wins (§5.4.1). That is exactly
    /// the ordering of `(term, index)` tuples, and any log beats an empty one.
    fn candidate_log_is_current(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        candidate_last_entry >= self.write_ahead_log.latest_entry()
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.cluster_tracker.is_joining() {
            slog::debug!(self.logger, "Not a voter yet. Ignoring election timeout.");
            return;
        }
        if self.election_state.current_state() == ElectionStateSnapshot::Leader {
            return;
        }

        // The self-vote is persisted before we act as a candidate.
        let term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist vote for self, staying put: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(self.logger, "Election timeout. Campaigning for term {:?}", term);

        if self.cluster_tracker.num_voting_replicas() == 1 {
            self.become_leader(term);
            return;
        }
        for peer in self.cluster_tracker.iter_peers() {
            self.spawn_request_vote(peer, term);
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        if self.local_state.current_term() != reply.term {
            slog::debug!(self.logger, "Ignoring vote reply from {:?} for old term {:?}", reply.peer_id, reply.term);
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => self.count_vote(reply.peer_id, reply.term),
            RequestVoteResult::VoteNotGranted => {
                slog::info!(self.logger, "{:?} refused its vote for term {:?}", reply.peer_id, reply.term)
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                if self.election_state.current_state() != ElectionStateSnapshot::Candidate {
                    return;
                }
                if let Some(peer) = self.cluster_tracker.peer(&reply.peer_id) {
                    self.spawn_request_vote(peer, reply.term);
                }
            }
        }
    }

    fn count_vote(&mut self, voter: ReplicaId, term: Term) {
        // None: this election is already won or lost.
        let votes = match self.election_state.add_vote_if_candidate(voter) {
            Some(votes) => votes,
            None => return,
        };
        let voters = self.cluster_tracker.num_voting_replicas();
        slog::info!(self.logger, "Have {}/{} votes for term {:?}", votes, voters, term);

        if votes > voters / 2 {
            self.become_leader(term);
        }
    }

    fn spawn_request_vote(&self, peer: &Peer, term: Term) {
        let last_entry = self.write_ahead_log.latest_entry();
        let request = ProtoRequestVoteReq {
            client_node_id: self.my_replica_id.as_str().to_string(),
            term: term.as_u64(),
            last_log_entry_term: last_entry.map_or(0, |(term, _)| term.as_u64()),
            last_log_entry_index: last_entry.map_or(0, |(_, index)| index.as_u64()),
        };
        tokio::spawn(peer_calls::request_vote(
            self.logger.clone(),
            peer.client.clone(),
            peer.metadata.replica_id.clone(),
            request,
            term,
            self.actor_client.clone(),
        ));
    }

    fn become_leader(&mut self, term: Term) {
        let last_index = self.write_ahead_log.latest_entry().map(|(_, index)| index);
        self.election_state
            .transition_to_leader(term, self.cluster_tracker.peer_ids(), last_index);
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // Entries from earlier terms only commit underneath one from ours (Figure 8), so a new
        // leader appends an empty entry right away.
        if let Err(e) = self.write_ahead_log.append(WriteAheadLogEntry { term, data: Vec::new() }) {
            slog::error!(self.logger, "Failed to append leader no-op entry: {:?}", e);
            return;
        }
        self.advance_commit_index();
    }

    /// Returns true if `observed_term` was newer than ours, in which case we are now a follower.
    fn step_down_if_term_increased(&mut self, logger: &slog::Logger, observed_term: Term) -> bool {
        match self.local_state.store_term_if_increased(observed_term) {
            Ok(true) => {
                self.election_state.transition_to_follower(None);
                slog::info!(logger, "Observed term {:?}. Stepped down to follower.", observed_term);
                true
            }
            Ok(false) => false,
            Err(e) => {
                slog::error!(logger, "Failed to persist observed term {:?}: {:?}", observed_term, e);
                false
            }
        }
    }

    // ------- Replication (follower side) --------

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // A joining node doesn't know the membership yet, so it trusts whoever leads.
        if !self.cluster_tracker.contains_member(&input.leader_id) && !self.cluster_tracker.is_joining() {
            return Err(AppendEntriesError::ClientNotInCluster);
        }
        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                ObserveLeaderError::TermOutOfDate(info) => AppendEntriesError::ClientTermOutOfDate(info),
                ObserveLeaderError::Io(e) => AppendEntriesError::ServerIoError(e),
            })?;

        if let Some((prev_term, prev_index)) = input.leader_previous_log_entry {
            if !self.log_matches_at(prev_term, prev_index)? {
                return Err(AppendEntriesError::ServerMissingPreviousLogEntry(MissingLogInfo {
                    last_log_index: self.write_ahead_log.latest_entry().map(|(_, i)| i),
                }));
            }
        }

        let first_new_index = input
            .leader_previous_log_entry
            .map_or_else(Index::start_index, |(_, prev_index)| prev_index.plus(1));
        let first_held_index = self.write_ahead_log.first_index();
        for (offset, entry) in input.new_entries.iter().enumerate() {
            let index = first_new_index.plus(offset as u64);
            // Already covered by our snapshot, hence committed and matching.
            if index < first_held_index {
                continue;
            }

            // Same index and term means same entry. A different term means our suffix from here
            // on lost an election; drop it.
            match self.write_ahead_log.term_at(index).map_err(AppendEntriesError::ServerIoError)? {
                Some(term) if term == entry.term => continue,
                Some(_) => self
                    .write_ahead_log
                    .truncate(index)
                    .map_err(AppendEntriesError::ServerIoError)?,
                None => {}
            }

            let appended = self
                .write_ahead_log
                .append(WriteAheadLogEntry {
                    term: entry.term,
                    data: entry.data.to_vec(),
                })
                .map_err(AppendEntriesError::ServerIoError)?;
            if appended != index {
                return Err(AppendEntriesError::ServerIoError(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Appended log entry at {:?}, expected {:?}", appended, index),
                )));
            }
        }

        // Commit no further than what this call proved we hold.
        if let (Some(leader_commit), Some(last_new_index)) = (
            input.leader_commit_index,
            first_new_index.plus(input.new_entries.len() as u64).checked_minus(1),
        ) {
            self.write_ahead_log
                .ratchet_fwd_commit_index_if_changed(cmp::min(leader_commit, last_new_index));
        }
        self.write_ahead_log.apply_all_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    /// True if our log holds an entry with `term` at `index`, or a snapshot covers `index`.
    fn log_matches_at(&self, term: Term, index: Index) -> Result<bool, AppendEntriesError> {
        if matches!(self.write_ahead_log.snapshot_point(), Some(point) if index <= point.index) {
            return Ok(true);
        }
        let my_term = self
            .write_ahead_log
            .term_at(index)
            .map_err(AppendEntriesError::ServerIoError)?;
        Ok(my_term == Some(term))
    }

    /// Term bookkeeping shared by the calls only a leader makes.
    fn observe_leader(&mut self, leader_term: Term, leader_id: &ReplicaId) -> Result<(), ObserveLeaderError> {
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(ObserveLeaderError::TermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        let newer_term = self
            .local_state
            .store_term_if_increased(leader_term)
            .map_err(ObserveLeaderError::Io)?;
        let is_follower = matches!(
            self.election_state.current_state(),
            ElectionStateSnapshot::Follower(_) | ElectionStateSnapshot::FollowerNoLeader
        );
        if newer_term || !is_follower {
            self.election_state.transition_to_follower(Some(leader_id.clone()));
        } else {
            self.election_state.set_leader_if_unknown(leader_id);
        }

        self.election_state.reset_timeout_if_follower();
        Ok(())
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        if !self.cluster_tracker.contains_member(&input.leader_id) && !self.cluster_tracker.is_joining() {
            return Err(InstallSnapshotError::ClientNotInCluster);
        }
        self.observe_leader(input.leader_term, &input.leader_id)
            .map_err(|e| match e {
                ObserveLeaderError::TermOutOfDate(info) => InstallSnapshotError::ClientTermOutOfDate(info),
                ObserveLeaderError::Io(e) => InstallSnapshotError::ServerIoError(e),
            })?;

        if matches!(self.write_ahead_log.commit_index(), Some(ci) if ci >= input.last_included.index) {
            slog::info!(
                self.logger,
                "Ignoring snapshot {:?}, already committed through {:?}",
                input.last_included,
                self.write_ahead_log.commit_index()
            );
            return Ok(InstallSnapshotOutput {});
        }

        // The snapshot must be durable before the log it replaces is dropped.
        input.snapshot.commit().map_err(InstallSnapshotError::ServerIoError)?;
        self.write_ahead_log
            .install_snapshot(input.last_included)
            .map_err(InstallSnapshotError::ServerIoError)?;
        slog::info!(self.logger, "Installed snapshot {:?} from leader", input.last_included);

        Ok(InstallSnapshotOutput {})
    }

    // ------- Replication (leader side) --------

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let term = self.local_state.current_term();
        if term != tick.term {
            slog::debug!(self.logger, "Dropping heartbeat tick from term {:?}", tick.term);
            return;
        }
        let peer = match self.cluster_tracker.peer(&tick.peer_id) {
            Some(peer) => peer.clone(),
            None => {
                slog::warn!(self.logger, "Heartbeat tick for unknown peer {:?}", tick.peer_id);
                return;
            }
        };

        match self.replicate_to(peer, term) {
            Ok(()) => {}
            Err(TickError::NotLeader) | Err(TickError::Batch(BatchError::PeerBusy)) => {}
            Err(e) => slog::error!(self.logger, "Can't replicate to {:?}: {:?}", tick.peer_id, e),
        }
    }

    /// Sends `peer` its next batch of entries, or a snapshot if those entries were compacted away.
    fn replicate_to(&mut self, peer: Peer, term: Term) -> Result<(), TickError> {
        let peer_id = peer.metadata.replica_id.clone();
        let first_held_index = self.write_ahead_log.first_index();
        let peer_state = self
            .election_state
            .leader_state_mut()
            .ok_or(TickError::NotLeader)?
            .peer_state_mut(&peer_id)
            .ok_or(TickError::UntrackedPeer)?;

        let (next_index, _) = peer_state.next_and_previous_log_index();
        if next_index >= first_held_index {
            let (request, descriptor) = peer_calls::next_append_entries(
                term,
                &self.my_replica_id,
                peer_id,
                peer_state,
                &self.write_ahead_log,
            )?;
            peer_state.reset_heartbeat_timer();
            tokio::spawn(peer_calls::append_entries(
                self.logger.clone(),
                peer.client,
                request,
                self.append_entries_timeout,
                self.actor_client.clone(),
                descriptor,
            ));
            return Ok(());
        }

        if peer_state.is_installing_snapshot() || peer_state.has_outstanding_request() {
            return Err(TickError::Batch(BatchError::PeerBusy));
        }
        let point = self
            .snapshot_source
            .latest_point()
            .filter(|point| point.index.plus(1) >= first_held_index)
            .ok_or(TickError::NoSnapshot(next_index))?;
        peer_state.start_snapshot_install(point);
        peer_state.reset_heartbeat_timer();

        slog::info!(self.logger, "{:?} is behind our compacted log. Sending snapshot {:?}", peer_id, point);
        tokio::spawn(peer_calls::install_snapshot(
            self.logger.clone(),
            peer.client,
            peer_id,
            self.snapshot_source.clone(),
            point,
            self.my_replica_id.clone(),
            term,
            self.install_snapshot_timeout,
            self.actor_client.clone(),
        ));
        Ok(())
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let AppendEntriesReplyFromPeer { descriptor, result } = reply;
        let logger = self.logger.new(slog::o!(
            "Peer" => format!("{:?}", descriptor.peer_id),
            "SeqNo" => descriptor.seq_no,
        ));
        slog::debug!(logger, "AppendEntries reply: {:?}", result);

        if self.local_state.current_term() != descriptor.term {
            slog::debug!(logger, "Reply is from term {:?}. Ignoring.", descriptor.term);
            return;
        }

        let update = match result {
            Ok(()) => PeerStateUpdate::Success {
                previous_log_entry: descriptor.previous_log_entry_index,
                num_entries_replicated: descriptor.num_log_entries,
            },
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(hint)) => {
                slog::info!(logger, "Peer log ends at {:?}. Rewinding.", hint.last_log_index);
                PeerStateUpdate::PeerLogBehind(hint)
            }
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                if self.step_down_if_term_increased(&logger, new_term) {
                    return;
                }
                slog::warn!(logger, "Peer called term {:?} stale without a newer one", descriptor.term);
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(reason)) => {
                slog::warn!(logger, "AppendEntries failed: {}", reason);
                PeerStateUpdate::OtherError
            }
        };

        let next_index = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader| leader.peer_state_mut(&descriptor.peer_id))
        {
            Some(peer_state) => {
                peer_state.handle_append_entries_result(&logger, descriptor.seq_no, update);
                peer_state.next_and_previous_log_index().0
            }
            None => {
                slog::debug!(logger, "No longer leader of this peer");
                return;
            }
        };
        self.advance_commit_index();

        // Keep streaming while the peer is behind instead of waiting out the heartbeat.
        if matches!(self.write_ahead_log.latest_entry(), Some((_, last)) if last >= next_index) {
            self.handle_leader_timer(LeaderTimerTick {
                peer_id: descriptor.peer_id,
                term: descriptor.term,
            });
        }
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self.logger.new(slog::o!("Peer" => format!("{:?}", reply.peer_id)));
        if self.local_state.current_term() != reply.term {
            slog::debug!(logger, "InstallSnapshot reply is from term {:?}. Ignoring.", reply.term);
            return;
        }
        if let Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) = &reply.result {
            if self.step_down_if_term_increased(&logger, *new_term) {
                return;
            }
        }

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|leader| leader.peer_state_mut(&reply.peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        match &reply.result {
            Ok(()) => {
                slog::info!(logger, "Peer installed snapshot {:?}", reply.last_included);
                peer_state.snapshot_installed(reply.last_included);
            }
            Err(e) => {
                slog::warn!(logger, "Peer failed to install snapshot: {:?}", e);
                peer_state.snapshot_failed();
            }
        }

        self.advance_commit_index();
        self.handle_leader_timer(LeaderTimerTick {
            peer_id: reply.peer_id,
            term: reply.term,
        });
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    fn advance_commit_index(&mut self) {
        let leader_last = self.write_ahead_log.latest_entry().map(|(_, index)| index);
        let majority_index = match self.election_state.leader_state_mut() {
            Some(leader) => quorum::majority_match_index(leader_last, leader.peers_iter().map(|p| p.matched())),
            None => return,
        };

        if let Some(index) = majority_index {
            let term = self.local_state.current_term();
            match self.write_ahead_log.ratchet_fwd_commit_index_if_valid(index, term) {
                Ok(_) => self.write_ahead_log.apply_all_committed_entries(),
                Err(e) => slog::warn!(self.logger, "Failed to check commit index {:?}: {:?}", index, e),
            }
        }
    }

    // ------- Log and membership upkeep --------

    pub(crate) fn handle_compact_log(&mut self, input: CompactLogInput) -> Result<CompactLogOutput, CompactLogError> {
        let compacted = self
            .write_ahead_log
            .compact_through(input.through)
            .map_err(CompactLogError::LocalIoError)?;
        Ok(CompactLogOutput { compacted })
    }

    pub(crate) fn handle_add_peer(&mut self, input: AddPeerInput) -> Result<(), AddPeerError> {
        let peer_id = input.metadata.replica_id.clone();
        let was_joining = self.cluster_tracker.is_joining();
        let is_new = self
            .cluster_tracker
            .add_member(input.metadata)
            .map_err(|e| AddPeerError::InvalidAddress(e.to_string()))?;

        if was_joining && !self.cluster_tracker.is_joining() {
            slog::info!(self.logger, "Our own membership is committed. Now a voting member.");
        }
        if is_new {
            slog::info!(self.logger, "Added peer {:?}", peer_id);
            let last_index = self.write_ahead_log.latest_entry().map(|(_, index)| index);
            self.election_state.add_peer_if_leader(peer_id, last_index);
        }
        Ok(())
    }
}

enum ObserveLeaderError {
    TermOutOfDate(TermOutOfDateInfo),
    Io(io::Error),
}

/// Why a heartbeat tick sent nothing.
#[derive(Debug)]
enum TickError {
    NotLeader,
    UntrackedPeer,
    NoSnapshot(Index),
    Batch(BatchError),
}

impl From<BatchError> for TickError {
    fn from(e: BatchError) -> Self {
        TickError::Batch(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::commitlog::InMemoryLog;
    use crate::grpc::ProtoSnapshotChunk;
    use crate::membership::NodeIdentity;
    use crate::replica::election::{ElectionConfig, ElectionState};
    use crate::replica::local_state::DurableLocalState;
    use crate::replica::peer_client::OutboundCredentials;
    use crate::replica::peers::ReplicaMetadata;
    use crate::replica::replica_api::{AppendEntriesLogEntry, StagedSnapshot};
    use crate::replica::write_ahead_log::{self, CommitStream, Committed, SnapshotPoint};
    use crate::server::test_support::TestCa;
    use crate::storage::MemoryStableStore;
    use bytes::Bytes;
    use slog::Drain;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>>;

    struct NoSnapshots;

    impl SnapshotSource for NoSnapshots {
        fn latest_point(&self) -> Option<SnapshotPoint> {
            None
        }

        fn stream_chunks(
            &self,
            _point: SnapshotPoint,
            _client_node_id: String,
            _term: Term,
            _sink: mpsc::Sender<ProtoSnapshotChunk>,
        ) -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no snapshots"))
        }
    }

    struct CountingSnapshot(Arc<std::sync::atomic::AtomicUsize>);

    impl StagedSnapshot for CountingSnapshot {
        fn commit(self: Box<Self>) -> Result<(), io::Error> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_logger() -> slog::Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    struct Harness {
        replica: Repl,
        commit_stream: CommitStream,
        // Keeps the actor channel open for timers.
        _actor_client: ActorClient,
        _actor_rx: mpsc::Receiver<crate::actor::Event>,
    }

    fn new_replica(joining: bool) -> Harness {
        let logger = test_logger();
        let identity = Arc::new(NodeIdentity::generate());
        let my_replica_id = ReplicaId::new(identity.node_id());
        let metadata = ReplicaMetadata {
            replica_id: my_replica_id.clone(),
            ip_addr: Ipv4Addr::LOCALHOST,
            raft_port: 1,
            sync_port: 2,
            public_key: identity.public_key_hex(),
        };
        let (actor_client, actor_rx) = ActorClient::new(16);

        let (election_state, _listener) = ElectionState::new_follower(
            ElectionConfig {
                my_replica_id: my_replica_id.clone(),
                leader_heartbeat_duration: Duration::from_secs(60),
                follower_min_timeout: Duration::from_secs(60),
                follower_max_timeout: Duration::from_secs(60),
            },
            actor_client.weak(),
        );
        let (wal, commit_stream) =
            write_ahead_log::wired(logger.clone(), InMemoryLog::create().unwrap(), None, None).unwrap();
        let local_state = DurableLocalState::open(Arc::new(MemoryStableStore::new()), my_replica_id.clone()).unwrap();

        let replica = Replica::new(
            logger,
            my_replica_id,
            ClusterTracker::new(
                metadata,
                OutboundCredentials {
                    tls: TestCa::new().issue(identity.node_id()),
                    identity,
                },
                joining,
            ),
            Box::new(local_state),
            election_state,
            wal,
            Arc::new(NoSnapshots),
            actor_client.weak(),
            Duration::from_millis(100),
        );

        Harness {
            replica,
            commit_stream,
            _actor_client: actor_client,
            _actor_rx: actor_rx,
        }
    }

    async fn next_committed_data(stream: &mut CommitStream) -> (u64, Bytes) {
        match stream.recv().await {
            Some(Committed::Entry(entry)) => (entry.index.as_u64(), entry.data),
            other => panic!("Expected committed entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn single_node_elects_itself_and_commits() {
        let mut h = new_replica(false);

        let rejected = h.replica.handle_enqueue_for_replication(EnqueueForReplicationInput {
            data: Bytes::from_static(b"early"),
        });
        assert!(matches!(rejected, Err(EnqueueForReplicationError::NoLeader)));

        h.replica.handle_follower_timeout();
        assert_eq!(h.replica.election_state.current_state(), ElectionStateSnapshot::Leader);

        // Leader's no-op entry.
        let (index, data) = next_committed_data(&mut h.commit_stream).await;
        assert_eq!(index, 1);
        assert!(data.is_empty());

        let output = h
            .replica
            .handle_enqueue_for_replication(EnqueueForReplicationInput {
                data: Bytes::from_static(b"cmd"),
            })
            .unwrap();
        assert_eq!(output.enqueued_index, Index::new(2));
        assert_eq!(output.enqueued_term, Term::new(1));

        let (index, data) = next_committed_data(&mut h.commit_stream).await;
        assert_eq!(index, 2);
        assert_eq!(&data[..], b"cmd");
    }

    #[tokio::test]
    async fn joining_node_waits_and_accepts_unknown_leader() {
        let mut h = new_replica(true);

        h.replica.handle_follower_timeout();
        assert_eq!(h.replica.election_state.current_state(), ElectionStateSnapshot::FollowerNoLeader);
        assert_eq!(h.replica.local_state.current_term(), Term::new(0));

        let leader = ReplicaId::new("leader");
        h.replica
            .server_handle_append_entries(AppendEntriesInput {
                leader_term: Term::new(3),
                leader_id: leader.clone(),
                leader_previous_log_entry: None,
                leader_commit_index: Some(Index::new(1)),
                new_entries: vec![AppendEntriesLogEntry {
                    term: Term::new(3),
                    data: Bytes::from_static(b"a"),
                }],
            })
            .unwrap();

        assert_eq!(h.replica.election_state.current_state(), ElectionStateSnapshot::Follower(leader));
        let (index, data) = next_committed_data(&mut h.commit_stream).await;
        assert_eq!(index, 1);
        assert_eq!(&data[..], b"a");

        // We don't know where the leader's sync port is yet.
        let redirect = h.replica.handle_enqueue_for_replication(EnqueueForReplicationInput {
            data: Bytes::from_static(b"x"),
        });
        assert!(matches!(redirect, Err(EnqueueForReplicationError::NoLeader)));
    }

    #[tokio::test]
    async fn follower_replaces_conflicting_suffix() {
        let mut h = new_replica(true);
        let leader = ReplicaId::new("leader");
        let entry = |term: u64, data: &'static [u8]| AppendEntriesLogEntry {
            term: Term::new(term),
            data: Bytes::from_static(data),
        };

        h.replica
            .server_handle_append_entries(AppendEntriesInput {
                leader_term: Term::new(1),
                leader_id: leader.clone(),
                leader_previous_log_entry: None,
                leader_commit_index: None,
                new_entries: vec![entry(1, b"a"), entry(1, b"b"), entry(1, b"c")],
            })
            .unwrap();

        // Missing previous entry at 5: hint says our log ends at 3.
        let missing = h.replica.server_handle_append_entries(AppendEntriesInput {
            leader_term: Term::new(2),
            leader_id: leader.clone(),
            leader_previous_log_entry: Some((Term::new(2), Index::new(5))),
            leader_commit_index: None,
            new_entries: vec![],
        });
        match missing {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry(hint)) => {
                assert_eq!(hint.last_log_index, Some(Index::new(3)))
            }
            other => panic!("Unexpected {:?}", other),
        }

        // New leader overwrites index 2 and 3.
        h.replica
            .server_handle_append_entries(AppendEntriesInput {
                leader_term: Term::new(2),
                leader_id: leader.clone(),
                leader_previous_log_entry: Some((Term::new(1), Index::new(1))),
                leader_commit_index: Some(Index::new(2)),
                new_entries: vec![entry(2, b"B")],
            })
            .unwrap();

        assert_eq!(h.replica.write_ahead_log.latest_entry(), Some((Term::new(2), Index::new(2))));
        assert_eq!(next_committed_data(&mut h.commit_stream).await, (1, Bytes::from_static(b"a")));
        assert_eq!(next_committed_data(&mut h.commit_stream).await, (2, Bytes::from_static(b"B")));

        // Stale leader is rejected.
        let stale = h.replica.server_handle_append_entries(AppendEntriesInput {
            leader_term: Term::new(1),
            leader_id: leader,
            leader_previous_log_entry: None,
            leader_commit_index: None,
            new_entries: vec![],
        });
        assert!(matches!(stale, Err(AppendEntriesError::ClientTermOutOfDate(_))));
    }

    #[tokio::test]
    async fn installs_snapshot_once() {
        let mut h = new_replica(true);
        let commits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let point = SnapshotPoint {
            term: Term::new(2),
            index: Index::new(40),
        };
        let install = |commits: &Arc<std::sync::atomic::AtomicUsize>| InstallSnapshotInput {
            leader_term: Term::new(2),
            leader_id: ReplicaId::new("leader"),
            last_included: point,
            snapshot: Box::new(CountingSnapshot(commits.clone())),
        };

        h.replica.server_handle_install_snapshot(install(&commits)).unwrap();
        assert!(matches!(h.commit_stream.recv().await, Some(Committed::Snapshot(p)) if p == point));

        // A repeat is acknowledged but not staged again.
        h.replica.server_handle_install_snapshot(install(&commits)).unwrap();
        assert_eq!(commits.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Entries after the snapshot line up with it.
        h.replica
            .server_handle_append_entries(AppendEntriesInput {
                leader_term: Term::new(2),
                leader_id: ReplicaId::new("leader"),
                leader_previous_log_entry: Some((Term::new(1), Index::new(39))),
                leader_commit_index: Some(Index::new(41)),
                new_entries: vec![
                    AppendEntriesLogEntry {
                        term: Term::new(2),
                        data: Bytes::from_static(b"covered"),
                    },
                    AppendEntriesLogEntry {
                        term: Term::new(2),
                        data: Bytes::from_static(b"next"),
                    },
                ],
            })
            .unwrap();
        assert_eq!(next_committed_data(&mut h.commit_stream).await, (41, Bytes::from_static(b"next")));
    }
}
