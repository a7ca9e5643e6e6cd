use crate::commitlog::Index;
use crate::replica::Term;
use bytes::Bytes;
use tokio::sync::mpsc;

pub(super) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<Committed>,
}

/// CommitStream hands committed entries to the state machine driver in log order. Each entry is
/// delivered once per process; after a restart the driver resumes from its own snapshot.
pub(crate) struct CommitStream {
    receiver: mpsc::UnboundedReceiver<Committed>,
}

#[derive(Debug)]
pub(crate) enum Committed {
    Entry(CommittedEntry),
    /// The log was replaced by a snapshot from the leader. Everything up to and including the
    /// point is covered by it; the next `Entry` follows it.
    Snapshot(SnapshotPoint),
}

#[derive(Debug)]
pub(crate) struct CommittedEntry {
    pub(crate) term: Term,
    pub(crate) index: Index,
    pub(crate) data: Bytes,
}

/// The last log entry a snapshot covers.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct SnapshotPoint {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

pub(super) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CommitStreamPublisher { sender }, CommitStream { receiver })
}

impl CommitStreamPublisher {
    pub(super) fn notify_commit(&self, logger: &slog::Logger, term: Term, index: Index, data: Bytes) {
        self.publish(logger, Committed::Entry(CommittedEntry { term, index, data }));
    }

    pub(super) fn notify_snapshot(&self, logger: &slog::Logger, point: SnapshotPoint) {
        self.publish(logger, Committed::Snapshot(point));
    }

    fn publish(&self, logger: &slog::Logger, committed: Committed) {
        if let Err(lost) = self.sender.send(committed) {
            slog::warn!(logger, "Nobody is applying commits. Dropped {:?}", lost.0);
        }
    }
}

impl CommitStream {
    pub(crate) async fn recv(&mut self) -> Option<Committed> {
        self.receiver.recv().await
    }
}
