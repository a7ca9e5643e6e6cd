use crate::action::{Action, ActionId, EntityId, EntityKind, EntityRecord, Revision, UserId};
use crate::fsm::{ApplyOutcome, EntityEvent, FsmCommand, ProposeError, Proposer, RequestId};
use crate::grpc::grpc_sync_client::GrpcSyncClient;
use crate::grpc::grpc_sync_server::GrpcSync;
use crate::grpc::proto_sync_message::Msg;
use crate::grpc::proto_write_result::Result as WriteResult;
use crate::grpc::{
    ProtoActionBroadcast, ProtoFetchReq, ProtoFetchResult, ProtoInvalidRequest, ProtoJoin, ProtoNoLeader,
    ProtoRateLimited, ProtoServerFault, ProtoSyncError, ProtoSyncMessage, ProtoSyncUpdate, ProtoWriteAccepted,
    ProtoWriteConflict, ProtoWriteMode, ProtoWriteReq, ProtoWriteResult,
};
use crate::replica::LeaderRedirectInfo;
use crate::server::NodeTls;
use crate::storage::EntityStore;
use crate::sync::{decode_actions, encode_actions, parse_revision, user_id_from_metadata, USER_ID_HEADER};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

/// Set on writes a follower forwards, so a write never bounces between two stale nodes.
const FORWARDED_HEADER: &str = "x-forwarded-by";

const SUBSCRIBER_BUFFER: usize = 64;

/// SyncServer is the client facing service. Writes are proposed on the leader; any node serves
/// subscriptions and reads from its own applied state.
pub(crate) struct SyncServer {
    logger: slog::Logger,
    my_node_id: String,
    entities: Arc<EntityStore>,
    proposer: Proposer,
    events: broadcast::Sender<EntityEvent>,
    tls: NodeTls,
    leader_clients: Mutex<HashMap<SocketAddr, GrpcSyncClient<Channel>>>,
}

/// A catch-up answer: everything after the client's revision, or the whole log if the revision
/// isn't in it.
struct CatchUp {
    actions: Vec<Vec<u8>>,
    revision: Revision,
    revision_known: bool,
}

impl SyncServer {
    pub(crate) fn new(
        logger: slog::Logger,
        my_node_id: String,
        entities: Arc<EntityStore>,
        proposer: Proposer,
        events: broadcast::Sender<EntityEvent>,
        tls: NodeTls,
    ) -> Self {
        SyncServer {
            logger,
            my_node_id,
            entities,
            proposer,
            events,
            tls,
            leader_clients: Mutex::new(HashMap::new()),
        }
    }

    async fn handle_write(
        &self,
        user_id: UserId,
        forwarded: bool,
        rpc_request: ProtoWriteReq,
    ) -> Result<ProtoWriteResult, Status> {
        let command = Self::convert_write_input(user_id.clone(), rpc_request.clone())?;

        let outcome = match self.proposer.propose(command).await {
            Ok(outcome) => outcome,
            Err(ProposeError::NotLeader(leader)) if !forwarded => {
                return self.forward_write(leader, user_id, rpc_request).await;
            }
            Err(e) => return Ok(Self::convert_propose_error(e)),
        };

        Ok(match outcome {
            ApplyOutcome::Accepted { revision } | ApplyOutcome::Forked { revision, .. } => {
                write_result(WriteResult::Accepted(ProtoWriteAccepted {
                    revision: revision.to_wire(),
                }))
            }
            ApplyOutcome::Conflict { current_revision } => write_result(WriteResult::Conflict(ProtoWriteConflict {
                current_revision: current_revision.to_wire(),
            })),
            ApplyOutcome::Rejected { reason } => write_result(WriteResult::Invalid(ProtoInvalidRequest { message: reason })),
            ApplyOutcome::MembershipChanged { .. } => write_result(WriteResult::ServerFault(ProtoServerFault {
                message: "Write applied as a membership change".to_string(),
            })),
        })
    }

    fn convert_write_input(owner: UserId, rpc_request: ProtoWriteReq) -> Result<FsmCommand, Status> {
        let entity_id = parse_entity_id(&rpc_request.entity_id)?;
        let actions = decode_actions(&rpc_request.actions)
            .map_err(|e| Status::invalid_argument(format!("Invalid action: {}", e)))?;
        let request_id = RequestId::new_random();

        let mode = ProtoWriteMode::from_i32(rpc_request.mode)
            .ok_or_else(|| Status::invalid_argument(format!("Unknown write mode {}", rpc_request.mode)))?;
        Ok(match mode {
            ProtoWriteMode::Append => {
                let kind = EntityKind::parse(&rpc_request.entity_kind).ok_or_else(|| {
                    Status::invalid_argument(format!("Unknown entity kind {:?}", rpc_request.entity_kind))
                })?;
                let team_id = match rpc_request.team_id.as_str() {
                    "" => None,
                    team_id => Some(parse_entity_id(team_id)?),
                };
                FsmCommand::AppendActions {
                    request_id,
                    entity_id,
                    kind,
                    owner,
                    team_id,
                    base_revision: parse_revision(&rpc_request.base_revision)?,
                    actions,
                }
            }
            ProtoWriteMode::ForceSave => FsmCommand::ForceSave {
                request_id,
                entity_id,
                owner,
                actions,
            },
            ProtoWriteMode::Fork => FsmCommand::CreateFork {
                request_id,
                source_entity_id: parse_entity_id(&rpc_request.source_entity_id)?,
                new_entity_id: entity_id,
                owner,
                actions,
            },
        })
    }

    fn convert_propose_error(e: ProposeError) -> ProtoWriteResult {
        match e {
            ProposeError::Invalid(e) => write_result(WriteResult::Invalid(ProtoInvalidRequest {
                message: e.to_string(),
            })),
            ProposeError::RateLimited { retry_after } => write_result(WriteResult::RateLimited(ProtoRateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            })),
            // Already forwarded once. The leader we were pointed at moved on.
            ProposeError::NotLeader(_) | ProposeError::NoLeader => write_result(WriteResult::NoLeader(ProtoNoLeader {})),
            ProposeError::Timeout(_) | ProposeError::Internal(_) => {
                write_result(WriteResult::ServerFault(ProtoServerFault { message: e.to_string() }))
            }
        }
    }

    /// Sends the write to the leader's sync service on behalf of the same user.
    async fn forward_write(
        &self,
        leader: LeaderRedirectInfo,
        user_id: UserId,
        rpc_request: ProtoWriteReq,
    ) -> Result<ProtoWriteResult, Status> {
        let addr = SocketAddr::new(leader.ip_addr.into(), leader.sync_port);
        slog::debug!(self.logger, "Forwarding write to leader {:?} at {}", leader.replica_id, addr);

        let mut client = self.leader_client(addr)?;
        let mut request = Request::new(rpc_request);
        insert_header(request.metadata_mut(), USER_ID_HEADER, user_id.as_str())?;
        insert_header(request.metadata_mut(), FORWARDED_HEADER, &self.my_node_id)?;

        match client.write(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) => {
                slog::warn!(self.logger, "Forwarding to {} failed: {}", addr, status);
                self.leader_clients
                    .lock()
                    .expect("SyncServer lock poisoned")
                    .remove(&addr);
                Ok(write_result(WriteResult::NoLeader(ProtoNoLeader {})))
            }
        }
    }

    fn leader_client(&self, addr: SocketAddr) -> Result<GrpcSyncClient<Channel>, Status> {
        let mut clients = self.leader_clients.lock().expect("SyncServer lock poisoned");
        if let Some(client) = clients.get(&addr) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(format!("https://{}", addr))
            .map_err(|e| Status::internal(format!("Invalid leader address: {}", e)))?
            .tls_config(self.tls.sync_client())
            .map_err(|e| Status::internal(format!("Leader TLS setup failed: {}", e)))?
            .connect_lazy()
            .map_err(|e| Status::internal(format!("Invalid leader address: {}", e)))?;
        let client = GrpcSyncClient::new(channel);
        clients.insert(addr, client.clone());
        Ok(client)
    }

    fn load(&self, entity_id: &EntityId) -> Result<Option<EntityRecord>, Status> {
        self.entities.load(entity_id).map_err(|e| {
            slog::error!(self.logger, "Failed to load entity {}: {}", entity_id, e);
            Status::internal(format!("Failed to load entity {}", entity_id))
        })
    }

    fn catch_up(record: Option<&EntityRecord>, since: &Revision) -> Result<CatchUp, Status> {
        let (actions, revision, revision_known) = match record {
            None => (&[][..], Revision::empty(), since.is_empty()),
            Some(record) => match record.log.since(since) {
                Some(actions) => (actions, record.revision(), true),
                None => (record.log.actions(), record.revision(), false),
            },
        };
        Ok(CatchUp {
            actions: encode_actions(actions).map_err(|e| Status::internal(e.to_string()))?,
            revision,
            revision_known,
        })
    }

    async fn handle_subscribe(&self, join: ProtoJoin) -> Result<ReceiverStream<Result<ProtoSyncMessage, Status>>, Status> {
        let entity_id = parse_entity_id(&join.entity_id)?;
        let last_revision = parse_revision(&join.last_revision)?;

        // Subscribe before reading so nothing applied in between is missed. Duplicates are
        // filtered against what the catch-up already covered.
        let events = self.events.subscribe();
        let record = self.load(&entity_id)?;
        let catch_up = Self::catch_up(record.as_ref(), &last_revision)?;
        let covered: HashSet<ActionId> = record
            .map(|r| r.log.actions().iter().map(|a| a.id).collect())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let last_sent = catch_up.revision;
        if tx.send(Ok(sync_update(catch_up))).await.is_err() {
            return Ok(ReceiverStream::new(rx));
        }

        let subscriber = Subscriber {
            logger: self.logger.new(slog::o!("EntityId" => entity_id.to_string())),
            entity_id,
            entities: self.entities.clone(),
            events,
            tx,
            covered,
            last_sent,
        };
        tokio::spawn(subscriber.run());
        Ok(ReceiverStream::new(rx))
    }

    async fn handle_fetch_since(&self, rpc_request: ProtoFetchReq) -> Result<ProtoFetchResult, Status> {
        let entity_id = parse_entity_id(&rpc_request.entity_id)?;
        let since = parse_revision(&rpc_request.since_revision)?;
        let record = self.load(&entity_id)?;
        let catch_up = Self::catch_up(record.as_ref(), &since)?;
        Ok(ProtoFetchResult {
            actions: catch_up.actions,
            revision: catch_up.revision.to_wire(),
            revision_known: catch_up.revision_known,
        })
    }
}

/// Streams one entity's applied actions to one client until either side goes away.
struct Subscriber {
    logger: slog::Logger,
    entity_id: EntityId,
    entities: Arc<EntityStore>,
    events: broadcast::Receiver<EntityEvent>,
    tx: mpsc::Sender<Result<ProtoSyncMessage, Status>>,
    covered: HashSet<ActionId>,
    last_sent: Revision,
}

impl Subscriber {
    async fn run(mut self) {
        loop {
            let message = match self.events.recv().await {
                Ok(event) if event.entity_id() != self.entity_id => continue,
                Ok(EntityEvent::Appended { actions, .. }) => {
                    if !self.send_appended(actions).await {
                        return;
                    }
                    continue;
                }
                Ok(EntityEvent::Replaced { actions, revision, .. }) => {
                    self.covered.clear();
                    self.last_sent = revision;
                    match encode_actions(&actions) {
                        Ok(actions) => Msg::SyncUpdate(ProtoSyncUpdate {
                            actions,
                            revision: revision.to_wire(),
                            revision_known: false,
                        }),
                        Err(e) => Msg::Error(ProtoSyncError {
                            message: format!("Failed to encode log: {}", e),
                        }),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    slog::warn!(self.logger, "Subscriber lagged by {} events. Resyncing.", skipped);
                    match self.resync() {
                        Ok(msg) => msg,
                        Err(message) => Msg::Error(ProtoSyncError { message }),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            if !self.send(message).await {
                return;
            }
        }
    }

    fn resync(&mut self) -> Result<Msg, String> {
        let record = self
            .entities
            .load(&self.entity_id)
            .map_err(|e| format!("Failed to load entity: {}", e))?;
        let catch_up = SyncServer::catch_up(record.as_ref(), &self.last_sent).map_err(|s| s.message().to_string())?;
        self.last_sent = catch_up.revision;
        self.covered = record
            .map(|r| r.log.actions().iter().map(|a| a.id).collect())
            .unwrap_or_default();
        match sync_update(catch_up).msg {
            Some(msg) => Ok(msg),
            None => Err("Empty update".to_string()),
        }
    }

    /// Broadcasts each action the client hasn't seen yet. False once the client is gone.
    async fn send_appended(&mut self, actions: Vec<Action>) -> bool {
        for action in actions {
            if self.covered.contains(&action.id) {
                continue;
            }
            // Anything after the first unseen action is past the catch-up.
            self.covered.clear();
            self.last_sent = Revision::at(action.id);
            let bytes = match action.to_json_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    slog::error!(self.logger, "Failed to encode action {}: {}", action.id, e);
                    continue;
                }
            };
            let broadcast = ProtoActionBroadcast {
                action: bytes,
                revision: self.last_sent.to_wire(),
            };
            if !self.send(Msg::Action(broadcast)).await {
                return false;
            }
        }
        true
    }

    async fn send(&self, msg: Msg) -> bool {
        self.tx.send(Ok(ProtoSyncMessage { msg: Some(msg) })).await.is_ok()
    }
}

fn sync_update(catch_up: CatchUp) -> ProtoSyncMessage {
    ProtoSyncMessage {
        msg: Some(Msg::SyncUpdate(ProtoSyncUpdate {
            actions: catch_up.actions,
            revision: catch_up.revision.to_wire(),
            revision_known: catch_up.revision_known,
        })),
    }
}

fn write_result(result: WriteResult) -> ProtoWriteResult {
    ProtoWriteResult { result: Some(result) }
}

fn parse_entity_id(s: &str) -> Result<EntityId, Status> {
    EntityId::parse(s).map_err(|e| Status::invalid_argument(format!("Invalid entity id {:?}: {}", s, e)))
}

fn insert_header(metadata: &mut MetadataMap, name: &'static str, value: &str) -> Result<(), Status> {
    let value = MetadataValue::from_str(value).map_err(|_| Status::invalid_argument(format!("Invalid {}", name)))?;
    metadata.insert(name, value);
    Ok(())
}

#[async_trait::async_trait]
impl GrpcSync for SyncServer {
    async fn write(&self, request: Request<ProtoWriteReq>) -> Result<Response<ProtoWriteResult>, Status> {
        let user_id = user_id_from_metadata(request.metadata())?;
        let forwarded = request.metadata().get(FORWARDED_HEADER).is_some();
        let rpc_request = request.into_inner();

        slog::debug!(
            self.logger,
            "ServerWire - Write {} actions to {} from {:?}",
            rpc_request.actions.len(),
            rpc_request.entity_id,
            user_id
        );
        let rpc_result = self.handle_write(user_id, forwarded, rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    type SubscribeStream = ReceiverStream<Result<ProtoSyncMessage, Status>>;

    async fn subscribe(&self, request: Request<ProtoJoin>) -> Result<Response<Self::SubscribeStream>, Status> {
        user_id_from_metadata(request.metadata())?;
        let join = request.into_inner();
        slog::debug!(self.logger, "ServerWire - {:?}", join);
        self.handle_subscribe(join).await.map(Response::new)
    }

    async fn fetch_since(&self, request: Request<ProtoFetchReq>) -> Result<Response<ProtoFetchResult>, Status> {
        user_id_from_metadata(request.metadata())?;
        let rpc_request = request.into_inner();
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        self.handle_fetch_since(rpc_request).await.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, EntityMetadata, RecordNote};
    use crate::actor::{ActorClient, Event};
    use crate::crypto::KeyRingHandle;
    use crate::fsm::PendingApplies;
    use crate::replica::{EnqueueForReplicationError, ReplicaId};
    use crate::server::test_support::TestCa;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    struct Fixture {
        server: SyncServer,
        events: broadcast::Sender<EntityEvent>,
        actor_rx: mpsc::Receiver<Event>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let dir = tempfile::tempdir().unwrap();
        let entities = Arc::new(EntityStore::open(dir.path().to_path_buf(), KeyRingHandle::ephemeral()).unwrap());
        let (actor_client, actor_rx) = ActorClient::new(8);
        let proposer = Proposer::new(
            logger.clone(),
            actor_client,
            PendingApplies::new(),
            4,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let (events, _) = broadcast::channel(16);
        Fixture {
            server: SyncServer::new(
                logger,
                "me".to_string(),
                entities,
                proposer,
                events.clone(),
                TestCa::new().issue("me"),
            ),
            events,
            actor_rx,
            _dir: dir,
        }
    }

    fn note(text: &str) -> Action {
        Action::new(
            ActionKind::RecordNote(RecordNote { text: text.into() }),
            UserId::new("coach"),
            Utc::now(),
        )
    }

    fn stored_game(server: &SyncServer, actions: Vec<Action>) -> EntityRecord {
        let mut record = EntityRecord::new(
            EntityId::new_random(),
            EntityKind::Game,
            EntityMetadata {
                owner: UserId::new("coach"),
                team_id: None,
                forked_from: None,
                created_at: Utc::now(),
            },
        );
        record.apply_write(&Revision::empty(), actions);
        server.entities.save(&record).unwrap();
        record
    }

    fn as_user<T>(message: T) -> Request<T> {
        let mut request = Request::new(message);
        insert_header(request.metadata_mut(), USER_ID_HEADER, "coach").unwrap();
        request
    }

    #[tokio::test]
    async fn subscribe_catches_up_then_streams_new_actions() {
        let f = fixture();
        let first = note("first");
        let record = stored_game(&f.server, vec![first.clone()]);

        let mut stream = f
            .server
            .subscribe(as_user(ProtoJoin {
                entity_id: record.id.to_string(),
                last_revision: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        match stream.next().await.unwrap().unwrap().msg {
            Some(Msg::SyncUpdate(update)) => {
                assert_eq!(update.actions.len(), 1);
                assert!(update.revision_known);
                assert_eq!(update.revision, Revision::at(first.id).to_wire());
            }
            other => panic!("Unexpected {:?}", other),
        }

        // Another entity's traffic is filtered out, and actions already in the catch-up are not
        // sent twice.
        f.events
            .send(EntityEvent::Appended {
                entity_id: EntityId::new_random(),
                revision: Revision::empty(),
                actions: vec![note("elsewhere")],
            })
            .unwrap();
        let second = note("second");
        f.events
            .send(EntityEvent::Appended {
                entity_id: record.id,
                revision: Revision::at(second.id),
                actions: vec![first.clone(), second.clone()],
            })
            .unwrap();

        match stream.next().await.unwrap().unwrap().msg {
            Some(Msg::Action(broadcast)) => {
                assert_eq!(Action::from_json_bytes(&broadcast.action).unwrap(), second);
                assert_eq!(broadcast.revision, Revision::at(second.id).to_wire());
            }
            other => panic!("Unexpected {:?}", other),
        }

        f.events
            .send(EntityEvent::Replaced {
                entity_id: record.id,
                revision: Revision::at(first.id),
                actions: vec![first],
            })
            .unwrap();
        match stream.next().await.unwrap().unwrap().msg {
            Some(Msg::SyncUpdate(update)) => {
                assert_eq!(update.actions.len(), 1);
                assert!(!update.revision_known);
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_since_unknown_revision_returns_the_full_log() {
        let f = fixture();
        let actions = vec![note("a"), note("b"), note("c")];
        let record = stored_game(&f.server, actions.clone());

        let result = f
            .server
            .fetch_since(as_user(ProtoFetchReq {
                entity_id: record.id.to_string(),
                since_revision: Revision::at(actions[0].id).to_wire(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(result.actions.len(), 2);
        assert!(result.revision_known);

        let result = f
            .server
            .fetch_since(as_user(ProtoFetchReq {
                entity_id: record.id.to_string(),
                since_revision: Revision::at(note("never stored").id).to_wire(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(result.actions.len(), 3);
        assert!(!result.revision_known);
        assert_eq!(result.revision, record.revision().to_wire());

        let result = f
            .server
            .fetch_since(as_user(ProtoFetchReq {
                entity_id: EntityId::new_random().to_string(),
                since_revision: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(result.actions.is_empty());
        assert!(result.revision_known);
    }

    #[tokio::test]
    async fn writes_need_a_user_and_are_not_forwarded_twice() {
        let mut f = fixture();
        let write = ProtoWriteReq {
            entity_id: EntityId::new_random().to_string(),
            entity_kind: "game".to_string(),
            base_revision: String::new(),
            actions: encode_actions(&[note("tip off")]).unwrap(),
            mode: ProtoWriteMode::Append as i32,
            source_entity_id: String::new(),
            team_id: String::new(),
        };

        let err = f.server.write(Request::new(write.clone())).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let bad_kind = as_user(ProtoWriteReq {
            entity_kind: "league".to_string(),
            ..write.clone()
        });
        let err = f.server.write(bad_kind).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let mut actor_rx = std::mem::replace(&mut f.actor_rx, mpsc::channel(1).1);
        tokio::spawn(async move {
            while let Some(event) = actor_rx.recv().await {
                if let Event::EnqueueForReplication(_, callback) = event {
                    callback.send(Err(EnqueueForReplicationError::LeaderRedirect(LeaderRedirectInfo {
                        replica_id: ReplicaId::new("leader"),
                        ip_addr: Ipv4Addr::LOCALHOST,
                        sync_port: 4000,
                    })));
                }
            }
        });

        let mut forwarded = as_user(write);
        insert_header(forwarded.metadata_mut(), FORWARDED_HEADER, "other").unwrap();
        let result = f.server.write(forwarded).await.unwrap().into_inner();
        assert_eq!(result.result, Some(WriteResult::NoLeader(ProtoNoLeader {})));
    }
}
