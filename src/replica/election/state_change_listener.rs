use crate::replica::ReplicaId;
use tokio::sync::watch;

/// The externally visible part of an election role.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(ReplicaId),
    FollowerNoLeader,
}

pub(super) fn new(initial: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (tx, rx) = watch::channel(initial.clone());
    (
        ElectionStateChangeNotifier { tx, last: initial },
        ElectionStateChangeListener { rx },
    )
}

pub(super) struct ElectionStateChangeNotifier {
    tx: watch::Sender<ElectionStateSnapshot>,
    last: ElectionStateSnapshot,
}

impl ElectionStateChangeNotifier {
    /// Re-entering the same role (a follower timing out into a new candidacy, say) counts as a
    /// change; publishing an identical follower snapshot twice does not.
    pub(super) fn notify_new_state(&mut self, state: ElectionStateSnapshot) {
        if state == self.last && matches!(state, ElectionStateSnapshot::Follower(_)) {
            return;
        }
        self.last = state.clone();
        // Nobody listening is fine.
        let _ = self.tx.send(state);
    }
}

/// ElectionStateChangeListener lets tasks outside the replica actor (write forwarding, cluster
/// formation, the node's event bus) follow who is leader without a round trip through the actor.
/// Only the latest state is kept; a slow listener skips intermediate ones.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rx: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    /// Waits for the next change. None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow().clone())
    }

    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_follower_state_is_not_republished() {
        let (mut notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);
        let leader = ElectionStateSnapshot::Follower(ReplicaId::new("scorer-b"));

        notifier.notify_new_state(leader.clone());
        assert_eq!(listener.next().await, Some(leader.clone()));

        notifier.notify_new_state(leader);
        notifier.notify_new_state(ElectionStateSnapshot::Candidate);
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Candidate));

        drop(notifier);
        assert_eq!(listener.next().await, None);
        assert_eq!(listener.current(), ElectionStateSnapshot::Candidate);
    }
}
