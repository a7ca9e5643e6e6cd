//! Outbound Raft RPCs. Each call runs in its own task and reports back to the replica actor
//! through the weak actor client; the actor never awaits a peer.

use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesReq,
    ProtoAppendEntriesResult, ProtoInstallSnapshotResult, ProtoLogEntry, ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::election::PeerState;
use crate::replica::peer_client::RaftClient;
use crate::replica::replica_api::{
    AppendEntriesReplyFromPeer, AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError,
    InstallSnapshotReplyFromPeer, InstallSnapshotReplyFromPeerError, MissingLogInfo, RequestVoteReplyFromPeer,
    RequestVoteResult, SnapshotSource,
};
use crate::replica::write_ahead_log::{SnapshotPoint, WriteAheadLog};
use crate::replica::{ReplicaId, Term, WriteAheadLogEntry};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// Most entries a single AppendEntries call carries.
const MAX_ENTRIES_PER_APPEND: usize = 64;
/// Snapshot chunks buffered between the blocking reader and the gRPC stream.
const SNAPSHOT_CHUNK_BUFFER: usize = 16;
/// Pause before reporting an unreachable peer, so the retry doesn't spin.
const UNREACHABLE_PEER_PAUSE: Duration = Duration::from_millis(50);

/// Why a leader tick didn't produce an AppendEntries call.
#[derive(Debug)]
pub(super) enum BatchError {
    /// One request per peer at a time; the reply triggers the next batch.
    PeerBusy,
    LogRead(Index, io::Error),
    MissingEntry(Index),
}

/// Builds the next AppendEntries for `peer_state`: everything from its `next` index, capped at
/// `MAX_ENTRIES_PER_APPEND`, or an empty heartbeat when it's caught up.
pub(super) fn next_append_entries<L>(
    term: Term,
    my_id: &ReplicaId,
    peer_id: ReplicaId,
    peer_state: &mut PeerState,
    log: &WriteAheadLog<L>,
) -> Result<(ProtoAppendEntriesReq, AppendEntriesReplyFromPeerDescriptor), BatchError>
where
    L: Log<WriteAheadLogEntry>,
{
    if peer_state.has_outstanding_request() || peer_state.is_installing_snapshot() {
        return Err(BatchError::PeerBusy);
    }

    let (next_index, previous_index) = peer_state.next_and_previous_log_index();
    let previous_term = match previous_index {
        None => None,
        Some(index) => Some(
            log.term_at(index)
                .map_err(|e| BatchError::LogRead(index, e))?
                .ok_or(BatchError::MissingEntry(index))?,
        ),
    };
    let entries = log
        .read_batch(next_index, MAX_ENTRIES_PER_APPEND)
        .map_err(|e| BatchError::LogRead(next_index, e))?;

    let descriptor = AppendEntriesReplyFromPeerDescriptor {
        peer_id,
        term,
        seq_no: peer_state.next_seq_no(),
        previous_log_entry_index: previous_index,
        num_log_entries: entries.len(),
    };
    let request = ProtoAppendEntriesReq {
        client_node_id: my_id.as_str().to_string(),
        term: term.as_u64(),
        commit_index: log.commit_index().map_or(0, |i| i.as_u64()),
        previous_log_entry_term: previous_term.map_or(0, |t| t.as_u64()),
        previous_log_entry_index: previous_index.map_or(0, |i| i.as_u64()),
        new_entries: entries
            .into_iter()
            .map(|entry| ProtoLogEntry {
                term: entry.term.as_u64(),
                data: entry.data,
            })
            .collect(),
    };

    Ok((request, descriptor))
}

pub(super) async fn append_entries(
    logger: slog::Logger,
    mut client: RaftClient,
    request: ProtoAppendEntriesReq,
    timeout: Duration,
    actor: WeakActorClient,
    descriptor: AppendEntriesReplyFromPeerDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", request);
    let reply = tokio::time::timeout(timeout, client.append_entries(request)).await;
    slog::debug!(logger, "ClientWire - {:?}", reply);

    let _ = actor
        .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer {
            descriptor,
            result: append_entries_outcome(reply),
        })
        .await;
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn install_snapshot(
    logger: slog::Logger,
    mut client: RaftClient,
    peer_id: ReplicaId,
    source: Arc<dyn SnapshotSource>,
    point: SnapshotPoint,
    my_id: ReplicaId,
    term: Term,
    timeout: Duration,
    actor: WeakActorClient,
) {
    let logger = logger.new(slog::o!("Peer" => format!("{:?}", peer_id)));
    let (chunk_tx, chunk_rx) = mpsc::channel(SNAPSHOT_CHUNK_BUFFER);
    let reader = tokio::task::spawn_blocking(move || source.stream_chunks(point, my_id.into_inner(), term, chunk_tx));

    slog::debug!(logger, "ClientWire - InstallSnapshot {:?}", point);
    let reply = tokio::time::timeout(timeout, client.install_snapshot(ReceiverStream::new(chunk_rx))).await;
    slog::debug!(logger, "ClientWire - {:?}", reply);

    // A reader failure means the peer got a truncated stream, whatever it replied.
    let result = match reader.await {
        Ok(Ok(())) => install_snapshot_outcome(reply),
        Ok(Err(e)) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
            "Failed to read snapshot: {}",
            e
        ))),
        Err(e) => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(format!(
            "Snapshot reader panicked: {}",
            e
        ))),
    };

    let _ = actor
        .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
            peer_id,
            term,
            last_included: point,
            result,
        })
        .await;
}

pub(super) async fn request_vote(
    logger: slog::Logger,
    mut client: RaftClient,
    peer_id: ReplicaId,
    request: ProtoRequestVoteReq,
    term: Term,
    actor: WeakActorClient,
) {
    slog::debug!(logger, "ClientWire - {:?}", request);
    let reply = client.request_vote(request).await;
    slog::debug!(logger, "ClientWire - {:?}", reply);

    let result = match reply {
        Ok(reply) => request_vote_outcome(&logger, reply),
        Err(status) => {
            slog::warn!(logger, "RequestVote to {:?} failed: {}", peer_id, status);
            tokio::time::sleep(UNREACHABLE_PEER_PAUSE).await;
            RequestVoteResult::RetryableFailure
        }
    };

    let _ = actor
        .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
        .await;
}

// ------- Reply conversions --------

/// Transport failures and timeouts are always worth retrying.
fn delivered<T>(reply: Result<Result<T, Status>, Elapsed>, rpc: &str) -> Result<T, String> {
    match reply {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(status)) => Err(format!("{} failed: {}", rpc, status)),
        Err(_) => Err(format!("{} timed out", rpc)),
    }
}

fn append_entries_outcome(
    reply: Result<Result<ProtoAppendEntriesResult, Status>, Elapsed>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    use proto_append_entries_error::Err as ProtoErr;
    use AppendEntriesReplyFromPeerError::*;

    let reply = delivered(reply, "AppendEntries").map_err(RetryableFailure)?;
    let err = match reply.result {
        Some(proto_append_entries_result::Result::Ok(_)) => return Ok(()),
        Some(proto_append_entries_result::Result::Err(e)) => e.err,
        None => None,
    };
    Err(match err {
        Some(ProtoErr::StaleTerm(e)) => StaleTerm {
            new_term: Term::new(e.current_term),
        },
        Some(ProtoErr::MissingLog(e)) => PeerMissingPreviousLogEntry(MissingLogInfo {
            last_log_index: Index::from_u64_opt(e.last_log_index),
        }),
        Some(ProtoErr::ServerFault(e)) => RetryableFailure(format!("Peer fault: {}", e.message)),
        // The peer hasn't applied the membership entry that adds us yet.
        Some(ProtoErr::ClientNotInCluster(_)) => RetryableFailure("Peer doesn't know us yet".into()),
        None => RetryableFailure("Malformed AppendEntries reply".into()),
    })
}

fn install_snapshot_outcome(
    reply: Result<Result<ProtoInstallSnapshotResult, Status>, Elapsed>,
) -> Result<(), InstallSnapshotReplyFromPeerError> {
    use InstallSnapshotReplyFromPeerError::*;

    let reply = delivered(reply, "InstallSnapshot").map_err(RetryableFailure)?;
    match reply.result {
        Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(()),
        Some(proto_install_snapshot_result::Result::Err(e)) => match e.err {
            Some(proto_install_snapshot_error::Err::StaleTerm(e)) => Err(StaleTerm {
                new_term: Term::new(e.current_term),
            }),
            other => Err(RetryableFailure(format!("InstallSnapshot rejected: {:?}", other))),
        },
        None => Err(RetryableFailure("Malformed InstallSnapshot reply".into())),
    }
}

fn request_vote_outcome(logger: &slog::Logger, reply: ProtoRequestVoteResult) -> RequestVoteResult {
    match reply.result {
        Some(proto_request_vote_result::Result::Ok(ok)) if ok.vote_granted => RequestVoteResult::VoteGranted,
        Some(proto_request_vote_result::Result::Ok(_)) => RequestVoteResult::VoteNotGranted,
        Some(proto_request_vote_result::Result::Err(e)) => match e.err {
            Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                slog::warn!(logger, "RequestVote server fault: {}", fault.message);
                RequestVoteResult::RetryableFailure
            }
            None => RequestVoteResult::MalformedReply,
        },
        None => RequestVoteResult::MalformedReply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{ProtoAppendEntriesError, ProtoClientStaleTerm, ProtoServerMissingPreviousLog};

    fn ae_error(err: proto_append_entries_error::Err) -> Result<Result<ProtoAppendEntriesResult, Status>, Elapsed> {
        Ok(Ok(ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }))
    }

    #[test]
    fn append_entries_rejections_map_to_peer_errors() {
        let stale = append_entries_outcome(ae_error(proto_append_entries_error::Err::StaleTerm(
            ProtoClientStaleTerm { current_term: 9 },
        )));
        assert!(matches!(stale, Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) if new_term == Term::new(9)));

        let missing = append_entries_outcome(ae_error(proto_append_entries_error::Err::MissingLog(
            ProtoServerMissingPreviousLog { last_log_index: 0 },
        )));
        match missing {
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry(hint)) => {
                assert_eq!(hint.last_log_index, None)
            }
            other => panic!("Unexpected {:?}", other),
        }

        let unavailable = append_entries_outcome(Ok(Err(Status::unavailable("connection refused"))));
        assert!(matches!(unavailable, Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))));

        let empty = append_entries_outcome(Ok(Ok(ProtoAppendEntriesResult { result: None })));
        assert!(matches!(empty, Err(AppendEntriesReplyFromPeerError::RetryableFailure(_))));
    }
}
