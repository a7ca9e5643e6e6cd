use crate::grpc::grpc_membership_client::GrpcMembershipClient;
use crate::grpc::proto_add_node_result::Result as AddNodeResult;
use crate::grpc::proto_membership_error::Err as MembershipErr;
use crate::grpc::{ProtoAddNodeReq, ProtoDescribeNodeReq, ProtoNodeInfo};
use crate::membership::member::{InvalidNodeInfo, MemberRecord};
use crate::server::ClusterTls;
use std::convert::TryFrom;
use std::net::SocketAddr;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

pub(crate) const CLUSTER_SECRET_HEADER: &str = "x-cluster-secret";

/// MembershipClient talks to a node's membership service, which is served over TLS on its sync
/// port. The cluster secret never leaves the encrypted channel.
pub struct MembershipClient {
    inner: GrpcMembershipClient<Channel>,
    cluster_secret: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),
    #[error("Rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("Node returned invalid info: {0}")]
    InvalidNodeInfo(#[from] InvalidNodeInfo),
    #[error("Node is not leader, try {leader_id} at {ip_addr}:{sync_port}")]
    LeaderRedirect {
        leader_id: String,
        ip_addr: String,
        sync_port: u32,
    },
    #[error("Cluster has no leader")]
    NoLeader,
    #[error("Server fault: {0}")]
    ServerFault(String),
    #[error("Request rejected: {0}")]
    Invalid(String),
    #[error("Empty result")]
    EmptyResult,
}

impl MembershipClient {
    pub async fn connect(
        addr: SocketAddr,
        cluster_secret: impl Into<String>,
        tls: &ClusterTls,
    ) -> Result<Self, MembershipClientError> {
        let channel = Endpoint::from_shared(format!("https://{}", addr))
            .map_err(|e| MembershipClientError::InvalidAddress(e.to_string()))?
            .tls_config(tls.sync_client())?
            .connect()
            .await?;
        let inner = GrpcMembershipClient::new(channel);
        Ok(MembershipClient {
            inner,
            cluster_secret: cluster_secret.into(),
        })
    }

    pub async fn describe_node(&mut self) -> Result<MemberRecord, MembershipClientError> {
        let request = self.with_secret(ProtoDescribeNodeReq {})?;
        let info = self.inner.describe_node(request).await?.into_inner();
        Ok(MemberRecord::try_from(info)?)
    }

    /// Proposes `member` as a new cluster member. Must be sent to the leader.
    pub async fn add_node(&mut self, member: &MemberRecord) -> Result<MemberRecord, MembershipClientError> {
        let request = self.with_secret(ProtoAddNodeReq {
            node: Some(ProtoNodeInfo::from(member)),
        })?;
        let result = self.inner.add_node(request).await?.into_inner();

        match result.result {
            Some(AddNodeResult::Ok(info)) => Ok(MemberRecord::try_from(info)?),
            Some(AddNodeResult::Err(err)) => Err(match err.err {
                Some(MembershipErr::LeaderRedirect(redirect)) => MembershipClientError::LeaderRedirect {
                    leader_id: redirect.leader_id,
                    ip_addr: redirect.ip_addr,
                    sync_port: redirect.sync_port,
                },
                Some(MembershipErr::NoLeader(_)) => MembershipClientError::NoLeader,
                Some(MembershipErr::ServerFault(fault)) => MembershipClientError::ServerFault(fault.message),
                Some(MembershipErr::Invalid(invalid)) => MembershipClientError::Invalid(invalid.message),
                None => MembershipClientError::EmptyResult,
            }),
            None => Err(MembershipClientError::EmptyResult),
        }
    }

    fn with_secret<T>(&self, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        let secret = MetadataValue::from_str(&self.cluster_secret)
            .map_err(|_| Status::invalid_argument("Cluster secret is not a valid header value"))?;
        request.metadata_mut().insert(CLUSTER_SECRET_HEADER, secret);
        Ok(request)
    }
}
