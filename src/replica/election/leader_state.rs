use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimer;
use crate::replica::write_ahead_log::SnapshotPoint;
use crate::replica::{MissingLogInfo, ReplicaId};
use std::cmp;
use std::collections::HashMap;

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(super) fn contains_peer(&self, peer_id: &ReplicaId) -> bool {
        self.peer_state.contains_key(peer_id)
    }

    pub(super) fn insert_peer(&mut self, peer_id: ReplicaId, state: PeerState) {
        self.peer_state.insert(peer_id, state);
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }
}

/// The leader's view of one follower's log.
pub(crate) struct PeerState {
    // Dropping it stops heartbeats to this peer.
    heartbeat: HeartbeatTimer,
    /// First index we haven't sent yet. Starts right after our own tail.
    next: Index,
    /// Highest index the peer has confirmed holding. Only moves forward.
    matched: Option<Index>,
    /// A snapshot stream is in flight. No AppendEntries go out meanwhile.
    installing_snapshot: Option<SnapshotPoint>,
    requests: RequestCounter,
}

/// Numbers this term's requests to a peer so that a late reply can't overwrite a newer one.
#[derive(Default)]
struct RequestCounter {
    sent: u64,
    answered: u64,
}

impl RequestCounter {
    fn next(&mut self) -> u64 {
        self.sent += 1;
        self.sent
    }

    fn in_flight(&self) -> bool {
        self.answered < self.sent
    }

    /// False for replies older than one already handled, or for numbers we never sent.
    fn accept(&mut self, seq_no: u64) -> bool {
        let fresh = (self.answered + 1..=self.sent).contains(&seq_no);
        if fresh {
            self.answered = seq_no;
        }
        fresh
    }
}

impl PeerState {
    pub(super) fn new(heartbeat: HeartbeatTimer, leader_last_index: Option<Index>) -> Self {
        PeerState {
            heartbeat,
            next: leader_last_index.map_or_else(Index::start_index, |last| last.plus(1)),
            matched: None,
            installing_snapshot: None,
            requests: RequestCounter::default(),
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_append_entries_result(&mut self, logger: &slog::Logger, seq_no: u64, update: PeerStateUpdate) {
        if !self.requests.accept(seq_no) {
            slog::warn!(logger, "Discarding stale reply #{}: {:?}", seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => self.record_match(logger, previous_log_entry, num_entries_replicated),
            PeerStateUpdate::PeerLogBehind(hint) => self.rewind(logger, hint),
            PeerStateUpdate::OtherError => {}
        }
    }

    fn record_match(&mut self, logger: &slog::Logger, previous: Option<Index>, count: usize) {
        // An empty batch still proves the peer holds everything through `previous`.
        let through = match previous {
            Some(previous) => previous.plus(count as u64),
            None if count == 0 => return,
            None => Index::new_usize(count),
        };

        // A snapshot install may have moved us past what this reply covers.
        if self.matched.map_or(false, |matched| through <= matched) {
            slog::debug!(logger, "Reply confirms {:?}, already matched {:?}", through, self.matched);
            return;
        }
        self.matched = Some(through);
        self.next = cmp::max(self.next, through.plus(1));
    }

    fn rewind(&mut self, logger: &slog::Logger, hint: MissingLogInfo) {
        // Once the logs have matched they can't diverge again within a term. A peer saying
        // otherwise is misbehaving, so leave our state alone.
        if self.matched.is_some() {
            slog::warn!(logger, "Peer reports a missing entry below {:?}, which it matched before", self.matched);
            return;
        }

        let one_back = match self.next.checked_minus(1) {
            Some(index) => index,
            None => {
                slog::warn!(logger, "Peer reports a missing entry, but we're already sending from the start");
                return;
            }
        };
        // Skip straight past the peer's last entry when it told us where that is.
        let after_peer_tail = hint
            .last_log_index
            .map_or_else(Index::start_index, |last| last.plus(1));
        self.next = cmp::min(one_back, after_peer_tail);
    }

    pub(crate) fn is_installing_snapshot(&self) -> bool {
        self.installing_snapshot.is_some()
    }

    pub(crate) fn start_snapshot_install(&mut self, point: SnapshotPoint) {
        self.installing_snapshot = Some(point);
    }

    /// The peer now holds everything up to and including `point`.
    pub(crate) fn snapshot_installed(&mut self, point: SnapshotPoint) {
        self.installing_snapshot = None;
        self.matched = cmp::max(self.matched, Some(point.index));
        self.next = cmp::max(self.next, point.index.plus(1));
    }

    pub(crate) fn snapshot_failed(&mut self) {
        self.installing_snapshot = None;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.requests.in_flight()
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.requests.next()
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat.reset();
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind(MissingLogInfo),
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::Term;
    use slog::Drain;
    use std::time::Duration;

    fn test_logger() -> slog::Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog::Logger::root(drain, slog::o!())
    }

    fn peer_state(previous_log_entry_index: Option<Index>) -> (PeerState, ActorClient) {
        let (actor_client, _rx) = ActorClient::new(10);
        let timer = HeartbeatTimer::start(
            Duration::from_secs(60),
            actor_client.weak(),
            ReplicaId::new("peer-a"),
            Term::new(1),
        );
        (PeerState::new(timer, previous_log_entry_index), actor_client)
    }

    fn reply(state: &mut PeerState, logger: &slog::Logger, update: PeerStateUpdate) {
        let seq_no = state.next_seq_no();
        state.handle_append_entries_result(logger, seq_no, update);
    }

    #[tokio::test]
    async fn rewind_jumps_to_peer_hint() {
        let logger = test_logger();
        let (mut state, _client) = peer_state(Some(Index::new(50)));
        assert_eq!(state.next_and_previous_log_index().0, Index::new(51));

        reply(
            &mut state,
            &logger,
            PeerStateUpdate::PeerLogBehind(MissingLogInfo {
                last_log_index: Some(Index::new(7)),
            }),
        );
        assert_eq!(state.next_and_previous_log_index(), (Index::new(8), Some(Index::new(7))));

        // A hint past our current guess never moves us forward.
        reply(
            &mut state,
            &logger,
            PeerStateUpdate::PeerLogBehind(MissingLogInfo {
                last_log_index: Some(Index::new(20)),
            }),
        );
        assert_eq!(state.next_and_previous_log_index().0, Index::new(7));
    }

    #[tokio::test]
    async fn success_and_stale_replies() {
        let logger = test_logger();
        let (mut state, _client) = peer_state(Some(Index::new(3)));

        let stale_seq_no = state.next_seq_no();
        reply(
            &mut state,
            &logger,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(3)),
                num_entries_replicated: 2,
            },
        );
        assert_eq!(state.matched(), Some(Index::new(5)));
        assert_eq!(state.next_and_previous_log_index().0, Index::new(6));
        assert!(!state.has_outstanding_request());

        // Seq no older than one we've already handled.
        state.handle_append_entries_result(
            &logger,
            stale_seq_no,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(5)),
                num_entries_replicated: 10,
            },
        );
        assert_eq!(state.matched(), Some(Index::new(5)));
    }

    #[tokio::test]
    async fn snapshot_install_moves_peer_forward() {
        let logger = test_logger();
        let (mut state, _client) = peer_state(None);
        let point = SnapshotPoint {
            term: Term::new(2),
            index: Index::new(100),
        };

        state.start_snapshot_install(point);
        assert!(state.is_installing_snapshot());
        state.snapshot_installed(point);
        assert!(!state.is_installing_snapshot());
        assert_eq!(state.matched(), Some(Index::new(100)));
        assert_eq!(state.next_and_previous_log_index().0, Index::new(101));

        // A heartbeat reply from before the install doesn't move it back.
        reply(
            &mut state,
            &logger,
            PeerStateUpdate::Success {
                previous_log_entry: Some(Index::new(4)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(state.matched(), Some(Index::new(100)));
    }
}
