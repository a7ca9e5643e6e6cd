use crate::action::EntityId;
use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::proto_snapshot_chunk::Record as ProtoRecord;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientNotInCluster,
    ProtoClientStaleTerm, ProtoInstallSnapshotError, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess,
    ProtoInvalidRequest, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess,
    ProtoServerFault, ProtoServerMissingPreviousLog, ProtoSnapshotChunk, ProtoSnapshotManifest,
};
use crate::membership::MemberRecord;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    SnapshotPoint, Term,
};
use crate::server::peer_auth::PeerAuthenticator;
use crate::server::RpcServerShutdownSignal;
use crate::snapshot::{SnapshotManifest, SnapshotStore};
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

/// RaftServer is the type that implements the Raft gRPC interface. Only authenticated cluster
/// members get through to the replica.
pub(crate) struct RaftServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
    auth: PeerAuthenticator,
    snapshots: Arc<SnapshotStore>,
}

impl RaftServer {
    pub(crate) fn new(
        logger: slog::Logger,
        local_replica: WeakActorClient,
        auth: PeerAuthenticator,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        RaftServer {
            logger,
            local_replica,
            auth,
            snapshots,
        }
    }

    /// Serves over mutual TLS: peers without a certificate from the cluster CA never get as far as
    /// request authentication.
    pub(crate) async fn run(
        self,
        socket_addr: SocketAddr,
        tls: ServerTlsConfig,
        shutdown_signal: RpcServerShutdownSignal,
    ) {
        let logger = self.logger.clone();
        let mut builder = match Server::builder().tls_config(tls) {
            Ok(builder) => builder,
            Err(e) => {
                slog::error!(logger, "Raft server TLS setup failed: {:?}", e);
                return;
            }
        };
        slog::info!(logger, "Raft server listening on '{:?}' over mutual TLS", socket_addr);

        let result = builder
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Raft server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = match self.local_replica.upgrade() {
            Ok(replica) => replica.request_vote(app_input).await,
            Err(_) => Err(RequestVoteError::ActorExited),
        };
        Ok(Self::convert_request_vote_result(app_result))
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let vote = |vote_granted| ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted,
            })),
        };
        let fault = |message: &str| ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                    message: message.to_string(),
                })),
            })),
        };

        match app_result {
            Ok(ok) => vote(ok.vote_granted),
            Err(RequestVoteError::CandidateNotInCluster) => vote(false),
            Err(RequestVoteError::RequestTermOutOfDate(_)) => vote(false),
            Err(RequestVoteError::ServerIoError(_)) => fault("Local IO failure"),
            Err(RequestVoteError::ActorExited) => fault("Server internal replica task has exited"),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = match self.local_replica.upgrade() {
            Ok(replica) => replica.append_entries(app_input).await,
            Err(_) => Err(AppendEntriesError::ActorExited),
        };
        Ok(Self::convert_append_entries_result(app_result))
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let new_entries = rpc_request
            .new_entries
            .into_iter()
            .map(|proto_entry| AppendEntriesLogEntry {
                term: Term::new(proto_entry.term),
                data: Bytes::from(proto_entry.data),
            })
            .collect();

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index: Index::from_u64_opt(rpc_request.commit_index),
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = |err| ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        };

        match app_result {
            Ok(_) => ProtoAppendEntriesResult {
                result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
                    // Empty
                })),
            },
            Err(AppendEntriesError::ClientNotInCluster) => err(proto_append_entries_error::Err::ClientNotInCluster(
                ProtoClientNotInCluster {},
            )),
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                err(proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                }))
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry(info)) => {
                err(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: info.last_log_index.map_or(0, |i| i.as_u64()),
                }))
            }
            Err(AppendEntriesError::ServerIoError(_)) => {
                err(proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                }))
            }
            Err(AppendEntriesError::ActorExited) => err(proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            })),
        }
    }

    /// Stages the streamed snapshot on disk, sealing each entity under this node's key, and only
    /// then hands it to the replica.
    async fn handle_install_snapshot(
        &self,
        manifest: ProtoSnapshotManifest,
        mut chunks: Streaming<ProtoSnapshotChunk>,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let last_included = match Index::from_u64_opt(manifest.last_included_index) {
            Some(index) => SnapshotPoint {
                term: Term::new(manifest.last_included_term),
                index,
            },
            None => return Ok(malformed("Snapshot must include at least one entry")),
        };
        let members: Vec<MemberRecord> = match serde_json::from_slice(&manifest.membership) {
            Ok(members) => members,
            Err(e) => return Ok(malformed(&format!("Invalid membership: {}", e))),
        };

        let staged_manifest = SnapshotManifest {
            last_included_term: manifest.last_included_term,
            last_included_index: manifest.last_included_index,
            members,
            entity_count: manifest.entity_count,
        };
        let mut writer = match self.snapshots.stage(&staged_manifest) {
            Ok(writer) => writer,
            Err(e) => return Ok(install_fault(&format!("Failed to stage snapshot: {}", e))),
        };

        while let Some(chunk) = chunks.next().await {
            let entity = match chunk?.record {
                Some(ProtoRecord::Entity(entity)) => entity,
                Some(ProtoRecord::Manifest(_)) => return Ok(malformed("Manifest sent twice")),
                None => return Ok(malformed("Empty snapshot chunk")),
            };
            let entity_id = match EntityId::parse(&entity.entity_id) {
                Ok(id) => id,
                Err(e) => return Ok(malformed(&format!("Invalid entity id {:?}: {}", entity.entity_id, e))),
            };
            if let Err(e) = writer.add_entity(&entity_id, &entity.record) {
                return Ok(malformed(&format!("Rejected entity {}: {}", entity_id, e)));
            }
        }

        let staged = match writer.finish() {
            Ok(staged) => staged,
            Err(e) => return Ok(malformed(&format!("Incomplete snapshot: {}", e))),
        };

        let app_input = InstallSnapshotInput {
            leader_term: Term::new(manifest.term),
            leader_id: ReplicaId::new(manifest.client_node_id),
            last_included,
            snapshot: Box::new(staged),
        };
        let app_result = match self.local_replica.upgrade() {
            Ok(replica) => replica.install_snapshot(app_input).await,
            Err(_) => Err(InstallSnapshotError::ActorExited),
        };
        Ok(Self::convert_install_snapshot_result(app_result))
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        match app_result {
            Ok(_) => ProtoInstallSnapshotResult {
                result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {})),
            },
            Err(InstallSnapshotError::ClientNotInCluster) => install_err(
                proto_install_snapshot_error::Err::ClientNotInCluster(ProtoClientNotInCluster {}),
            ),
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                install_err(proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                }))
            }
            Err(InstallSnapshotError::ServerIoError(e)) => install_fault(&format!("Local IO failure: {}", e)),
            Err(InstallSnapshotError::ActorExited) => install_fault("Server internal replica task has exited"),
        }
    }
}

fn install_err(err: proto_install_snapshot_error::Err) -> ProtoInstallSnapshotResult {
    ProtoInstallSnapshotResult {
        result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
            err: Some(err),
        })),
    }
}

fn install_fault(message: &str) -> ProtoInstallSnapshotResult {
    install_err(proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
        message: message.to_string(),
    }))
}

fn malformed(message: &str) -> ProtoInstallSnapshotResult {
    install_err(proto_install_snapshot_error::Err::Malformed(ProtoInvalidRequest {
        message: message.to_string(),
    }))
}

#[async_trait::async_trait]
impl GrpcRaft for RaftServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        self.auth.authenticate(
            rpc_request_wrapped.metadata(),
            &rpc_request_wrapped.get_ref().client_node_id,
        )?;
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        self.auth.authenticate(
            rpc_request_wrapped.metadata(),
            &rpc_request_wrapped.get_ref().client_node_id,
        )?;
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - AppendEntries from {} term {} with {} entries",
            rpc_request.client_node_id,
            rpc_request.term,
            rpc_request.new_entries.len()
        );
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<Streaming<ProtoSnapshotChunk>>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let metadata = rpc_request_wrapped.metadata().clone();
        let mut chunks = rpc_request_wrapped.into_inner();

        let manifest = match chunks.next().await {
            Some(chunk) => match chunk?.record {
                Some(ProtoRecord::Manifest(manifest)) => manifest,
                _ => return Ok(Response::new(malformed("First record must be the manifest"))),
            },
            None => return Ok(Response::new(malformed("Empty snapshot stream"))),
        };
        self.auth.authenticate(&metadata, &manifest.client_node_id)?;

        slog::info!(
            self.logger,
            "ServerWire - InstallSnapshot from {} through index {} ({} entities)",
            manifest.client_node_id,
            manifest.last_included_index,
            manifest.entity_count
        );
        let rpc_result = self.handle_install_snapshot(manifest, chunks).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}
