use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot};

/// Something this node noticed about the cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    /// This node's election role changed. Only the latest role is reported: roles that came and
    /// went between two `next_event()` calls are skipped.
    Election(ElectionEvent),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectionEvent {
    Leader,
    Candidate,
    Follower(FollowerEventData),
    FollowerNoLeader,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FollowerEventData {
    pub leader_node_id: String,
}

/// Subscription to a node's [`NodeEvent`]s. Clones share nothing but the source; each one sees
/// every change after its last read.
#[derive(Clone)]
pub struct NodeEventListener {
    elections: ElectionStateChangeListener,
}

impl NodeEventListener {
    pub(crate) fn new(elections: ElectionStateChangeListener) -> Self {
        NodeEventListener { elections }
    }

    /// None once the node's replica has stopped.
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        let role = self.elections.next().await?;
        Some(NodeEvent::Election(role.into()))
    }

    /// The role right now, without waiting for a change.
    pub fn current(&self) -> ElectionEvent {
        self.elections.current().into()
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for ElectionEvent {
    fn from(role: ElectionStateSnapshot) -> Self {
        use ElectionStateSnapshot::*;
        match role {
            Leader => ElectionEvent::Leader,
            Candidate => ElectionEvent::Candidate,
            FollowerNoLeader => ElectionEvent::FollowerNoLeader,
            Follower(leader) => ElectionEvent::Follower(FollowerEventData {
                leader_node_id: leader.into_inner(),
            }),
        }
    }
}
