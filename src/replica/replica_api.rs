use crate::commitlog::Index;
use crate::grpc::ProtoSnapshotChunk;
use crate::replica::local_state::Term;
use crate::replica::peers::{ReplicaId, ReplicaMetadata};
use crate::replica::write_ahead_log::SnapshotPoint;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use tokio::sync::mpsc;

// ------- Local writes --------

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) data: Bytes,
}

/// Position the write was given in the replicated log. It is not yet committed.
#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    pub(crate) enqueued_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("Writes go to leader {:?}", .0.replica_id)]
    LeaderRedirect(LeaderRedirectInfo),
    /// Usually an election in progress. Worth retrying after a short wait.
    #[error("No leader is currently elected")]
    NoLeader,
    #[error("Failed to append to the local log: {0}")]
    LocalIoError(io::Error),
    #[error("Replica actor has stopped")]
    ActorExited,
}

/// Where clients should send writes instead.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) ip_addr: Ipv4Addr,
    pub(crate) sync_port: u16,
}

// ------- Inbound RPCs --------

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Candidate is not a cluster member")]
    CandidateNotInCluster,
    #[error("Candidate term is behind ours ({:?})", .0.current_term)]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Local storage failure: {0}")]
    ServerIoError(io::Error),
    #[error("Replica actor has stopped")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    /// The entry right before `new_entries`. None when they start the log.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Leader is not a cluster member")]
    ClientNotInCluster,
    #[error("Leader term is behind ours ({:?})", .0.current_term)]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("No matching entry before the new ones; our log ends at {:?}", .0.last_log_index)]
    ServerMissingPreviousLogEntry(MissingLogInfo),
    #[error("Local storage failure: {0}")]
    ServerIoError(io::Error),
    #[error("Replica actor has stopped")]
    ActorExited,
}

pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: ReplicaId,
    pub(crate) last_included: SnapshotPoint,
    pub(crate) snapshot: Box<dyn StagedSnapshot>,
}

impl fmt::Debug for InstallSnapshotInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstallSnapshot(from={:?}, term={:?}, through={:?})",
            self.leader_id, self.leader_term, self.last_included
        )
    }
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Leader is not a cluster member")]
    ClientNotInCluster,
    #[error("Leader term is behind ours ({:?})", .0.current_term)]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Local storage failure: {0}")]
    ServerIoError(io::Error),
    #[error("Replica actor has stopped")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

/// Hint so the leader can jump `next` straight back to where our log ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MissingLogInfo {
    pub(crate) last_log_index: Option<Index>,
}

// ------- Snapshot plumbing --------

/// A snapshot the server layer has fully received and staged. Committing it makes it the node's
/// latest snapshot.
pub(crate) trait StagedSnapshot: Send {
    fn commit(self: Box<Self>) -> Result<(), io::Error>;
}

/// Where the leader reads snapshots from when a follower has fallen behind the compacted log.
pub(crate) trait SnapshotSource: Send + Sync {
    fn latest_point(&self) -> Option<SnapshotPoint>;

    /// Blocking. Sends the manifest record, then every entity in plaintext. Returns early once
    /// `sink` is closed.
    fn stream_chunks(
        &self,
        point: SnapshotPoint,
        client_node_id: String,
        term: Term,
        sink: mpsc::Sender<ProtoSnapshotChunk>,
    ) -> Result<(), io::Error>;
}

// ------- Replies to our own RPCs --------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

/// What the leader sent, echoed back with the reply so it can be matched to the peer's progress.
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry(MissingLogInfo),
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) last_included: SnapshotPoint,
    pub(crate) result: Result<(), InstallSnapshotReplyFromPeerError>,
}

#[derive(Debug)]
pub(crate) enum InstallSnapshotReplyFromPeerError {
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// One heartbeat of the leader's timer for a single peer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

// ------- Log and membership upkeep --------

/// Asks the replica to drop the log prefix a freshly written FSM snapshot covers.
#[derive(Debug)]
pub(crate) struct CompactLogInput {
    pub(crate) through: SnapshotPoint,
}

#[derive(Debug)]
pub(crate) struct CompactLogOutput {
    pub(crate) compacted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum CompactLogError {
    #[error("Failed to compact the local log: {0}")]
    LocalIoError(io::Error),
    #[error("Replica actor has stopped")]
    ActorExited,
}

/// A member that has been committed to the cluster membership.
#[derive(Debug)]
pub(crate) struct AddPeerInput {
    pub(crate) metadata: ReplicaMetadata,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AddPeerError {
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),
    #[error("Replica actor has stopped")]
    ActorExited,
}

/// The replica actor's channel is closed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorExited;

// ------- Conversions --------

macro_rules! actor_exited_into {
    ($($error:ident),+ $(,)?) => {
        $(
            impl From<ActorExited> for $error {
                fn from(_: ActorExited) -> Self {
                    $error::ActorExited
                }
            }
        )+
    };
}

actor_exited_into!(
    EnqueueForReplicationError,
    RequestVoteError,
    AppendEntriesError,
    InstallSnapshotError,
    CompactLogError,
    AddPeerError,
);
