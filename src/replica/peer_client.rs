use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoInstallSnapshotResult, ProtoRequestVoteReq,
    ProtoRequestVoteResult, ProtoSnapshotChunk,
};
use crate::membership::NodeIdentity;
use crate::replica::peers::ReplicaMetadata;
use crate::server::NodeTls;
use futures::Stream;
use std::sync::Arc;
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

/// What this node presents to peers: a signing identity for every request and a certificate for
/// the channel.
#[derive(Clone)]
pub(crate) struct OutboundCredentials {
    pub(crate) identity: Arc<NodeIdentity>,
    pub(crate) tls: NodeTls,
}

/// RaftClient calls a peer's Raft service over mutual TLS. Every request is also signed with this
/// node's identity.
///
/// The channel connects lazily, so a peer that is down when it's added is retried on each call.
#[derive(Clone)]
pub(crate) struct RaftClient {
    inner: GrpcRaftClient<Channel>,
    identity: Arc<NodeIdentity>,
}

impl RaftClient {
    pub(crate) fn new(peer: &ReplicaMetadata, credentials: &OutboundCredentials) -> Result<Self, ConnectError> {
        let url = format!("https://{}:{}", peer.ip_addr, peer.raft_port);
        let endpoint = Endpoint::from_shared(url)?.tls_config(credentials.tls.peer_client(peer.replica_id.as_str()))?;
        let channel = endpoint.connect_lazy()?;

        Ok(RaftClient {
            inner: GrpcRaftClient::new(channel),
            identity: credentials.identity.clone(),
        })
    }

    pub(crate) async fn request_vote(
        &mut self,
        message: ProtoRequestVoteReq,
    ) -> Result<ProtoRequestVoteResult, Status> {
        let request = self.signed(message)?;
        self.inner.request_vote(request).await.map(Response::into_inner)
    }

    pub(crate) async fn append_entries(
        &mut self,
        message: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let request = self.signed(message)?;
        self.inner.append_entries(request).await.map(Response::into_inner)
    }

    pub(crate) async fn install_snapshot<S>(&mut self, chunks: S) -> Result<ProtoInstallSnapshotResult, Status>
    where
        S: Stream<Item = ProtoSnapshotChunk> + Send + Sync + 'static,
    {
        let request = self.signed(chunks)?;
        self.inner.install_snapshot(request).await.map(Response::into_inner)
    }

    fn signed<T>(&self, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        self.identity
            .peer_credentials()
            .attach(request.metadata_mut())
            .map_err(|e| Status::internal(format!("Failed to sign request: {}", e)))?;
        Ok(request)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnectError {
    #[error("Invalid peer address: {0}")]
    InvalidUri(#[from] uri::InvalidUri),
    #[error("Failed to create channel: {0}")]
    ConnectFailure(#[from] tonic::transport::Error),
}
