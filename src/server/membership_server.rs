use crate::fsm::{ApplyOutcome, FsmCommand, ProposeError, Proposer, RequestId};
use crate::grpc::grpc_membership_server::GrpcMembership;
use crate::grpc::proto_add_node_result::Result as AddNodeResult;
use crate::grpc::proto_membership_error::Err as MembershipErr;
use crate::grpc::{
    ProtoAddNodeReq, ProtoAddNodeResult, ProtoDescribeNodeReq, ProtoInvalidRequest, ProtoLeaderRedirect,
    ProtoMembershipError, ProtoNoLeader, ProtoNodeInfo, ProtoServerFault,
};
use crate::membership::{MemberRecord, CLUSTER_SECRET_HEADER};
use std::convert::TryFrom;
use subtle::ConstantTimeEq;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};

/// MembershipServer lets operators and bootstrapping peers describe a node and add new ones.
/// Every call must carry the cluster secret.
pub(crate) struct MembershipServer {
    logger: slog::Logger,
    me: MemberRecord,
    cluster_secret: String,
    proposer: Proposer,
}

impl MembershipServer {
    pub(crate) fn new(logger: slog::Logger, me: MemberRecord, cluster_secret: String, proposer: Proposer) -> Self {
        MembershipServer {
            logger,
            me,
            cluster_secret,
            proposer,
        }
    }

    fn check_secret(&self, metadata: &MetadataMap) -> Result<(), Status> {
        let presented = metadata
            .get(CLUSTER_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("Missing cluster secret"))?;
        if bool::from(presented.as_bytes().ct_eq(self.cluster_secret.as_bytes())) {
            Ok(())
        } else {
            Err(Status::unauthenticated("Wrong cluster secret"))
        }
    }

    async fn handle_add_node(&self, rpc_request: ProtoAddNodeReq) -> ProtoAddNodeResult {
        let member = match rpc_request.node.map(MemberRecord::try_from) {
            Some(Ok(member)) => member,
            Some(Err(e)) => return add_node_err(MembershipErr::Invalid(invalid(e.to_string()))),
            None => return add_node_err(MembershipErr::Invalid(invalid("Missing node".to_string()))),
        };

        let command = FsmCommand::AddMember {
            request_id: RequestId::new_random(),
            member: member.clone(),
        };
        match self.proposer.propose(command).await {
            Ok(ApplyOutcome::MembershipChanged { .. }) => {
                slog::info!(self.logger, "Added member {}", member.node_id);
                ProtoAddNodeResult {
                    result: Some(AddNodeResult::Ok(ProtoNodeInfo::from(&member))),
                }
            }
            Ok(ApplyOutcome::Rejected { reason }) => add_node_err(MembershipErr::Invalid(invalid(reason))),
            Ok(other) => add_node_err(MembershipErr::ServerFault(ProtoServerFault {
                message: format!("Unexpected outcome {:?}", other),
            })),
            Err(ProposeError::Invalid(e)) => add_node_err(MembershipErr::Invalid(invalid(e.to_string()))),
            Err(ProposeError::NotLeader(leader)) => add_node_err(MembershipErr::LeaderRedirect(ProtoLeaderRedirect {
                leader_id: leader.replica_id.into_inner(),
                ip_addr: leader.ip_addr.to_string(),
                sync_port: u32::from(leader.sync_port),
            })),
            Err(ProposeError::NoLeader) => add_node_err(MembershipErr::NoLeader(ProtoNoLeader {})),
            Err(e) => add_node_err(MembershipErr::ServerFault(ProtoServerFault { message: e.to_string() })),
        }
    }
}

fn invalid(message: String) -> ProtoInvalidRequest {
    ProtoInvalidRequest { message }
}

fn add_node_err(err: MembershipErr) -> ProtoAddNodeResult {
    ProtoAddNodeResult {
        result: Some(AddNodeResult::Err(ProtoMembershipError { err: Some(err) })),
    }
}

#[async_trait::async_trait]
impl GrpcMembership for MembershipServer {
    async fn add_node(&self, request: Request<ProtoAddNodeReq>) -> Result<Response<ProtoAddNodeResult>, Status> {
        self.check_secret(request.metadata())?;
        let rpc_request = request.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_add_node(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        Ok(Response::new(rpc_result))
    }

    async fn describe_node(&self, request: Request<ProtoDescribeNodeReq>) -> Result<Response<ProtoNodeInfo>, Status> {
        self.check_secret(request.metadata())?;
        Ok(Response::new(ProtoNodeInfo::from(&self.me)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::fsm::PendingApplies;
    use crate::membership::test_support::member;
    use crate::membership::NodeIdentity;
    use crate::replica::{EnqueueForReplicationError, LeaderRedirectInfo, ReplicaId};
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tonic::metadata::MetadataValue;

    fn server(secret: &str) -> (MembershipServer, tokio::sync::mpsc::Receiver<Event>) {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (actor_client, rx) = ActorClient::new(8);
        let proposer = Proposer::new(
            logger.clone(),
            actor_client,
            PendingApplies::new(),
            4,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let me = member(&NodeIdentity::generate(), 3000);
        (MembershipServer::new(logger, me, secret.to_string(), proposer), rx)
    }

    fn with_secret<T>(message: T, secret: &str) -> Request<T> {
        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(CLUSTER_SECRET_HEADER, MetadataValue::from_str(secret).unwrap());
        request
    }

    #[tokio::test]
    async fn describe_requires_the_secret() {
        let (server, _rx) = server("hunter2");

        let err = server
            .describe_node(Request::new(ProtoDescribeNodeReq {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let err = server
            .describe_node(with_secret(ProtoDescribeNodeReq {}, "hunter3"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let info = server
            .describe_node(with_secret(ProtoDescribeNodeReq {}, "hunter2"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info, ProtoNodeInfo::from(&server.me));
    }

    #[tokio::test]
    async fn add_node_validates_and_redirects() {
        let (server, mut rx) = server("s3cret");

        let mut forged = ProtoNodeInfo::from(&member(&NodeIdentity::generate(), 3001));
        forged.public_key = NodeIdentity::generate().public_key_hex();
        let result = server
            .add_node(with_secret(ProtoAddNodeReq { node: Some(forged) }, "s3cret"))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(
            result.result,
            Some(AddNodeResult::Err(ProtoMembershipError {
                err: Some(MembershipErr::Invalid(_))
            }))
        ));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::EnqueueForReplication(_, callback) = event {
                    callback.send(Err(EnqueueForReplicationError::LeaderRedirect(LeaderRedirectInfo {
                        replica_id: ReplicaId::new("leader"),
                        ip_addr: Ipv4Addr::LOCALHOST,
                        sync_port: 4000,
                    })));
                }
            }
        });
        let joining = member(&NodeIdentity::generate(), 3002);
        let result = server
            .add_node(with_secret(
                ProtoAddNodeReq {
                    node: Some(ProtoNodeInfo::from(&joining)),
                },
                "s3cret",
            ))
            .await
            .unwrap()
            .into_inner();
        match result.result {
            Some(AddNodeResult::Err(ProtoMembershipError {
                err: Some(MembershipErr::LeaderRedirect(redirect)),
            })) => {
                assert_eq!(redirect.leader_id, "leader");
                assert_eq!(redirect.sync_port, 4000);
            }
            other => panic!("Unexpected {:?}", other),
        }
    }
}
