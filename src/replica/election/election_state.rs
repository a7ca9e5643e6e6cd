use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::{self, ElectionStateChangeNotifier};
use crate::replica::election::timers::{ElectionTimer, HeartbeatTimer};
use crate::replica::election::{LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// ElectionState holds the node's current Raft role and the timers that belong to it. Changing
/// role drops the old timers, which stops their tasks. Term and log checks live in the replica;
/// this type only records the outcome and tells listeners.
pub(crate) struct ElectionState {
    role: Role,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    notifier: ElectionStateChangeNotifier,
}

enum Role {
    Follower {
        leader: Option<ReplicaId>,
        timer: ElectionTimer,
    },
    Candidate {
        votes: HashSet<ReplicaId>,
        _timer: ElectionTimer,
    },
    Leader {
        term: Term,
        tracker: LeaderStateTracker,
    },
}

impl Role {
    fn snapshot(&self) -> ElectionStateSnapshot {
        match self {
            Role::Leader { .. } => ElectionStateSnapshot::Leader,
            Role::Candidate { .. } => ElectionStateSnapshot::Candidate,
            Role::Follower { leader: Some(id), .. } => ElectionStateSnapshot::Follower(id.clone()),
            Role::Follower { leader: None, .. } => ElectionStateSnapshot::FollowerNoLeader,
        }
    }
}

impl ElectionState {
    /// Every replica boots as a follower that hasn't heard from a leader yet.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let role = Role::Follower {
            leader: None,
            timer: election_timer(&config, &actor_client),
        };
        let (notifier, listener) = state_change_listener::new(role.snapshot());

        let election_state = ElectionState {
            role,
            config,
            actor_client,
            notifier,
        };
        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, leader: Option<ReplicaId>) {
        let timer = self.election_timer();
        self.become_role(Role::Follower { leader, timer });
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let mut votes = HashSet::with_capacity(3);
        votes.insert(self.config.my_replica_id.clone());
        let _timer = self.election_timer();
        self.become_role(Role::Candidate { votes, _timer });
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        previous_log_entry_index: Option<Index>,
    ) {
        let mut tracker = LeaderStateTracker::new(HashMap::with_capacity(peer_ids.len()));
        for peer_id in peer_ids {
            let timer = self.heartbeat_timer(peer_id.clone(), term);
            tracker.insert_peer(peer_id, PeerState::new(timer, previous_log_entry_index));
        }
        self.become_role(Role::Leader { term, tracker });
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        self.role.snapshot()
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let Role::Follower { timer, .. } = &self.role {
            timer.reset();
        }
    }

    /// A follower that learns the leader from an AppendEntries after an election it sat out.
    pub(crate) fn set_leader_if_unknown(&mut self, leader_id: &ReplicaId) {
        if let Role::Follower { leader: leader @ None, .. } = &mut self.role {
            *leader = Some(leader_id.clone());
            self.notifier.notify_new_state(self.role.snapshot());
        }
    }

    /// Returns the number of distinct votes so far, or None once we've stopped campaigning.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        match &mut self.role {
            Role::Candidate { votes, .. } => {
                votes.insert(vote_from);
                Some(votes.len())
            }
            _ => None,
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        match &mut self.role {
            Role::Leader { tracker, .. } => Some(tracker),
            _ => None,
        }
    }

    /// Starts replicating to a member added while we lead. Returns false if we aren't leader or
    /// already replicate to it.
    pub(crate) fn add_peer_if_leader(&mut self, peer_id: ReplicaId, previous_log_entry_index: Option<Index>) -> bool {
        let term = match &self.role {
            Role::Leader { term, tracker } if !tracker.contains_peer(&peer_id) => *term,
            _ => return false,
        };
        let timer = self.heartbeat_timer(peer_id.clone(), term);
        if let Role::Leader { tracker, .. } = &mut self.role {
            tracker.insert_peer(peer_id, PeerState::new(timer, previous_log_entry_index));
        }
        true
    }

    fn become_role(&mut self, role: Role) {
        self.role = role;
        self.notifier.notify_new_state(self.role.snapshot());
    }

    fn election_timer(&self) -> ElectionTimer {
        election_timer(&self.config, &self.actor_client)
    }

    fn heartbeat_timer(&self, peer_id: ReplicaId, term: Term) -> HeartbeatTimer {
        HeartbeatTimer::start(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            peer_id,
            term,
        )
    }
}

fn election_timer(config: &ElectionConfig, actor_client: &WeakActorClient) -> ElectionTimer {
    ElectionTimer::start(
        config.follower_min_timeout,
        config.follower_max_timeout,
        actor_client.clone(),
    )
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Leader { term, .. } => write!(f, "Leader(term={:?})", term),
            Role::Candidate { votes, .. } => write!(f, "Candidate(votes={})", votes.len()),
            Role::Follower { leader, .. } => write!(f, "Follower(Leader={:?})", leader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn config() -> ElectionConfig {
        ElectionConfig {
            my_replica_id: ReplicaId::new("scorer-a"),
            // Long enough that no timer fires during a test.
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn candidate_counts_each_voter_once() {
        let (client, _rx) = ActorClient::new(10);
        let (mut state, _listener) = ElectionState::new_follower(config(), client.weak());
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("scorer-b")), None);

        state.transition_to_candidate_and_vote_for_self();
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("scorer-a")), Some(1));
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("scorer-b")), Some(2));
        assert_eq!(state.add_vote_if_candidate(ReplicaId::new("scorer-b")), Some(2));
    }

    #[tokio::test]
    async fn listener_follows_role_changes() {
        let (client, _rx) = ActorClient::new(10);
        let (mut state, mut listener) = ElectionState::new_follower(config(), client.weak());
        assert_eq!(listener.current(), ElectionStateSnapshot::FollowerNoLeader);

        let leader = ReplicaId::new("scorer-c");
        state.set_leader_if_unknown(&leader);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Follower(leader.clone())));

        // Already knows a leader: a second hint changes nothing.
        state.set_leader_if_unknown(&ReplicaId::new("scorer-d"));
        assert_eq!(state.current_state(), ElectionStateSnapshot::Follower(leader));

        state.transition_to_candidate_and_vote_for_self();
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));
    }

    #[tokio::test]
    async fn leader_adds_each_peer_once() {
        let (client, _rx) = ActorClient::new(10);
        let (mut state, _listener) = ElectionState::new_follower(config(), client.weak());
        assert!(!state.add_peer_if_leader(ReplicaId::new("scorer-b"), None));

        let peers = vec![ReplicaId::new("scorer-b")].into_iter().collect();
        state.transition_to_leader(Term::new(3), peers, Some(Index::new(7)));
        assert!(!state.add_peer_if_leader(ReplicaId::new("scorer-b"), Some(Index::new(7))));
        assert!(state.add_peer_if_leader(ReplicaId::new("scorer-c"), Some(Index::new(7))));

        let tracker = state.leader_state_mut().unwrap();
        assert_eq!(tracker.peers_iter().count(), 2);
        assert_eq!(format!("{:?}", state), "Leader(term=3)");
    }
}
