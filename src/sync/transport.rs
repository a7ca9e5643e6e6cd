use crate::action::{Action, EntityId, EntityKind, Revision, UserId};
use crate::grpc::grpc_sync_client::GrpcSyncClient;
use crate::grpc::proto_sync_message::Msg;
use crate::grpc::proto_write_result::Result as WriteResult;
use crate::grpc::{ProtoFetchReq, ProtoJoin, ProtoSyncMessage, ProtoWriteMode, ProtoWriteReq, ProtoWriteResult};
use crate::server::ClusterTls;
use crate::sync::wire::{attach_user_id, decode_actions, encode_actions};
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

#[derive(Clone, Debug, PartialEq)]
pub enum WriteMode {
    Append,
    ForceSave,
    Fork { source_entity_id: EntityId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub team_id: Option<EntityId>,
    pub base_revision: Revision,
    pub actions: Vec<Action>,
    pub mode: WriteMode,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteResponse {
    Accepted { revision: Revision },
    Conflict { current_revision: Revision },
    RateLimited { retry_after: Duration },
    NoLeader,
    Rejected { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    pub actions: Vec<Action>,
    pub revision: Revision,
    /// False when the server didn't recognize the revision and `actions` is its whole log.
    pub revision_known: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncMessage {
    /// Catch-up after JOIN, or the whole log after it was replaced.
    Update(FetchResponse),
    Action { action: Action, revision: Revision },
    Error(String),
}

pub type Subscription = Pin<Box<dyn Stream<Item = Result<SyncMessage, TransportError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
    #[error("Rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("Server sent a malformed message: {0}")]
    Malformed(String),
}

/// SyncTransport is how a client session reaches the cluster.
#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    async fn write(&self, request: WriteRequest) -> Result<WriteResponse, TransportError>;

    async fn fetch_since(&self, entity_id: EntityId, since: Revision) -> Result<FetchResponse, TransportError>;

    /// JOIN. The first message on the subscription is the catch-up update.
    async fn subscribe(&self, entity_id: EntityId, last_revision: Revision) -> Result<Subscription, TransportError>;
}

/// GrpcTransport talks to any node's sync service over TLS, verified against the cluster CA.
/// Followers forward writes to the leader.
#[derive(Clone)]
pub struct GrpcTransport {
    client: GrpcSyncClient<Channel>,
    user_id: UserId,
}

impl GrpcTransport {
    pub fn new(addr: SocketAddr, user_id: UserId, tls: &ClusterTls) -> Result<Self, TransportError> {
        let endpoint = Endpoint::from_shared(format!("https://{}", addr))
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))?
            .tls_config(tls.sync_client())?;
        Ok(GrpcTransport {
            client: GrpcSyncClient::new(endpoint.connect_lazy()?),
            user_id,
        })
    }

    fn request<T>(&self, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);
        attach_user_id(request.metadata_mut(), &self.user_id)?;
        Ok(request)
    }
}

#[async_trait::async_trait]
impl SyncTransport for GrpcTransport {
    async fn write(&self, request: WriteRequest) -> Result<WriteResponse, TransportError> {
        let message = to_proto_write(&request)?;
        let request = self.request(message)?;
        let result = self.client.clone().write(request).await?.into_inner();
        from_proto_write_result(result)
    }

    async fn fetch_since(&self, entity_id: EntityId, since: Revision) -> Result<FetchResponse, TransportError> {
        let request = self.request(ProtoFetchReq {
            entity_id: entity_id.to_string(),
            since_revision: since.to_wire(),
        })?;
        let result = self.client.clone().fetch_since(request).await?.into_inner();
        fetch_response(&result.actions, &result.revision, result.revision_known)
    }

    async fn subscribe(&self, entity_id: EntityId, last_revision: Revision) -> Result<Subscription, TransportError> {
        let request = self.request(ProtoJoin {
            entity_id: entity_id.to_string(),
            last_revision: last_revision.to_wire(),
        })?;
        let stream = self.client.clone().subscribe(request).await?.into_inner();
        Ok(Box::pin(stream.map(|message| match message {
            Ok(message) => from_proto_sync_message(message),
            Err(status) => Err(TransportError::Rpc(status)),
        })))
    }
}

fn to_proto_write(request: &WriteRequest) -> Result<ProtoWriteReq, TransportError> {
    let actions = encode_actions(&request.actions).map_err(|e| TransportError::Malformed(e.to_string()))?;
    let (mode, source_entity_id) = match &request.mode {
        WriteMode::Append => (ProtoWriteMode::Append, String::new()),
        WriteMode::ForceSave => (ProtoWriteMode::ForceSave, String::new()),
        WriteMode::Fork { source_entity_id } => (ProtoWriteMode::Fork, source_entity_id.to_string()),
    };
    Ok(ProtoWriteReq {
        entity_id: request.entity_id.to_string(),
        entity_kind: request.kind.as_str().to_string(),
        base_revision: request.base_revision.to_wire(),
        actions,
        mode: mode as i32,
        source_entity_id,
        team_id: request.team_id.map(|id| id.to_string()).unwrap_or_default(),
    })
}

fn from_proto_write_result(result: ProtoWriteResult) -> Result<WriteResponse, TransportError> {
    let revision = |s: &str| Revision::parse(s).map_err(|e| TransportError::Malformed(e.to_string()));
    match result.result {
        Some(WriteResult::Accepted(accepted)) => Ok(WriteResponse::Accepted {
            revision: revision(&accepted.revision)?,
        }),
        Some(WriteResult::Conflict(conflict)) => Ok(WriteResponse::Conflict {
            current_revision: revision(&conflict.current_revision)?,
        }),
        Some(WriteResult::RateLimited(limited)) => Ok(WriteResponse::RateLimited {
            retry_after: Duration::from_millis(limited.retry_after_ms),
        }),
        Some(WriteResult::NoLeader(_)) => Ok(WriteResponse::NoLeader),
        Some(WriteResult::Invalid(invalid)) => Ok(WriteResponse::Rejected {
            reason: invalid.message,
        }),
        Some(WriteResult::ServerFault(fault)) => Err(TransportError::Rpc(Status::internal(fault.message))),
        None => Err(TransportError::Malformed("Empty write result".into())),
    }
}

fn from_proto_sync_message(message: ProtoSyncMessage) -> Result<SyncMessage, TransportError> {
    match message.msg {
        Some(Msg::SyncUpdate(update)) => Ok(SyncMessage::Update(fetch_response(
            &update.actions,
            &update.revision,
            update.revision_known,
        )?)),
        Some(Msg::Action(broadcast)) => Ok(SyncMessage::Action {
            action: Action::from_json_bytes(&broadcast.action).map_err(|e| TransportError::Malformed(e.to_string()))?,
            revision: Revision::parse(&broadcast.revision).map_err(|e| TransportError::Malformed(e.to_string()))?,
        }),
        Some(Msg::Error(error)) => Ok(SyncMessage::Error(error.message)),
        None => Err(TransportError::Malformed("Empty sync message".into())),
    }
}

fn fetch_response(actions: &[Vec<u8>], revision: &str, revision_known: bool) -> Result<FetchResponse, TransportError> {
    Ok(FetchResponse {
        actions: decode_actions(actions).map_err(|e| TransportError::Malformed(e.to_string()))?,
        revision: Revision::parse(revision).map_err(|e| TransportError::Malformed(e.to_string()))?,
        revision_known,
    })
}
