mod election;
mod local_state;
mod peer_calls;
mod peer_client;
mod peers;
mod quorum;
mod replica;
mod replica_api;
mod replica_wiring;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use peer_client::ConnectError;
pub(crate) use peer_client::OutboundCredentials;
pub(crate) use peers::ClusterTracker;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::Replica;
pub(crate) use replica_api::ActorExited;
pub(crate) use replica_api::AddPeerError;
pub(crate) use replica_api::AddPeerInput;
pub(crate) use replica_api::AppendEntriesError;
pub(crate) use replica_api::AppendEntriesInput;
pub(crate) use replica_api::AppendEntriesLogEntry;
pub(crate) use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::AppendEntriesReplyFromPeerDescriptor;
pub(crate) use replica_api::AppendEntriesReplyFromPeerError;
pub(crate) use replica_api::CompactLogError;
pub(crate) use replica_api::CompactLogInput;
pub(crate) use replica_api::CompactLogOutput;
pub(crate) use replica_api::EnqueueForReplicationError;
pub(crate) use replica_api::EnqueueForReplicationInput;
pub(crate) use replica_api::EnqueueForReplicationOutput;
pub(crate) use replica_api::InstallSnapshotError;
pub(crate) use replica_api::InstallSnapshotInput;
pub(crate) use replica_api::InstallSnapshotOutput;
pub(crate) use replica_api::InstallSnapshotReplyFromPeer;
pub(crate) use replica_api::InstallSnapshotReplyFromPeerError;
pub(crate) use replica_api::LeaderRedirectInfo;
pub(crate) use replica_api::LeaderTimerTick;
pub(crate) use replica_api::MissingLogInfo;
pub(crate) use replica_api::RequestVoteError;
pub(crate) use replica_api::RequestVoteInput;
pub(crate) use replica_api::RequestVoteOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use replica_api::RequestVoteResult;
pub(crate) use replica_api::SnapshotSource;
pub(crate) use replica_api::StagedSnapshot;
pub(crate) use replica_api::TermOutOfDateInfo;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::CreateReplicaError;
pub(crate) use replica_wiring::ReplicaStorage;
pub(crate) use write_ahead_log::CommitStream;
pub(crate) use write_ahead_log::Committed;
pub(crate) use write_ahead_log::CommittedEntry;
pub(crate) use write_ahead_log::SnapshotPoint;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
