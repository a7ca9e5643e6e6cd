use crate::action::{Action, EntityId, Revision};
use crate::sync::backoff::Backoff;
use crate::sync::local::LocalEntity;
use crate::sync::resolver::{fork_of, reconcile, ConflictChoice, ConflictResolver, Divergence, Reconciliation};
use crate::sync::transport::{
    FetchResponse, Subscription, SyncMessage, SyncTransport, TransportError, WriteMode, WriteRequest, WriteResponse,
};
use futures::StreamExt;

/// Where a session is in its connection lifecycle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SessionState {
    /// Subscribed, waiting for the catch-up update. Local writes are held.
    Connecting,
    /// Catch-up applied. Held writes may go out.
    CaughtUp,
    /// Nothing held back. Live actions are arriving.
    Streaming,
    Disconnected,
}

#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    Nothing,
    /// Local writes are held until catch-up completes.
    Held,
    Accepted { revision: Revision },
    FastForwarded { revision: Revision },
    Resolved { choice: ConflictChoice, fork: Option<EntityId> },
}

/// What `next_event` observed on the subscription.
#[derive(Debug, PartialEq)]
pub enum SessionEvent {
    /// The server's broadcast of an action this client wrote.
    Acknowledged { revision: Revision },
    /// Someone else's action, appended locally.
    Applied { revision: Revision },
    /// The server's log changed under us and was reconciled.
    Reconciled(SyncOutcome),
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Server closed the subscription: {0}")]
    Closed(String),
    #[error("Subscription didn't start with a catch-up update")]
    MissingCatchUp,
    #[error("Not subscribed")]
    NotConnected,
    #[error("Write rejected: {0}")]
    Rejected(String),
    #[error("Gave up after {0} attempts")]
    RetriesExhausted(u32),
}

/// SyncSession keeps one client-side entity in step with the cluster.
///
/// Local actions are recorded optimistically and queued. They go out only once the catch-up
/// update that follows JOIN has been applied. Losing the connection only ends the subscription;
/// the queue stays intact for the next `connect`.
pub struct SyncSession<T: SyncTransport> {
    logger: slog::Logger,
    transport: T,
    entity: LocalEntity,
    resolver: Box<dyn ConflictResolver>,
    state: SessionState,
    subscription: Option<Subscription>,
    backoff: Backoff,
    max_attempts: u32,
    forks: Vec<LocalEntity>,
}

impl<T: SyncTransport> SyncSession<T> {
    pub fn new(
        logger: slog::Logger,
        transport: T,
        entity: LocalEntity,
        resolver: Box<dyn ConflictResolver>,
        backoff: Backoff,
        max_attempts: u32,
    ) -> Self {
        let logger = logger.new(slog::o!("EntityId" => entity.entity_id.to_string()));
        SyncSession {
            logger,
            transport,
            entity,
            resolver,
            state: SessionState::Disconnected,
            subscription: None,
            backoff,
            max_attempts: max_attempts.max(1),
            forks: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn entity(&self) -> &LocalEntity {
        &self.entity
    }

    /// Entities created by resolving divergences with a fork.
    pub fn forks(&self) -> &[LocalEntity] {
        &self.forks
    }

    /// Records a local action. Nothing is sent until `flush`.
    pub fn record(&mut self, action: Action) -> bool {
        self.entity.record(action)
    }

    /// JOINs with the last synced revision and applies the catch-up update.
    pub async fn connect(&mut self) -> Result<SyncOutcome, SessionError> {
        self.state = SessionState::Connecting;
        self.subscription = None;

        let mut subscription = match self
            .transport
            .subscribe(self.entity.entity_id, self.entity.synced_revision())
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e.into());
            }
        };

        let catch_up = match subscription.next().await {
            Some(Ok(SyncMessage::Update(update))) => update,
            Some(Ok(SyncMessage::Error(message))) => {
                self.state = SessionState::Disconnected;
                return Err(SessionError::Closed(message));
            }
            Some(Err(e)) => {
                self.state = SessionState::Disconnected;
                return Err(e.into());
            }
            Some(Ok(SyncMessage::Action { .. })) | None => {
                self.state = SessionState::Disconnected;
                return Err(SessionError::MissingCatchUp);
            }
        };

        slog::debug!(
            self.logger,
            "ClientWire - Catch-up with {} actions at {:?}",
            catch_up.actions.len(),
            catch_up.revision
        );
        self.subscription = Some(subscription);
        self.state = SessionState::CaughtUp;
        self.backoff.reset();
        self.absorb(catch_up).await
    }

    /// `connect`, retried with jittered backoff.
    pub async fn connect_with_backoff(&mut self) -> Result<SyncOutcome, SessionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.connect().await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempts >= self.max_attempts => {
                    slog::warn!(self.logger, "Giving up connecting: {}", e);
                    return Err(SessionError::RetriesExhausted(attempts));
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    slog::debug!(self.logger, "Connect failed, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.subscription = None;
        self.state = SessionState::Disconnected;
    }

    /// Sends queued actions as one batch against the last synced revision.
    pub async fn flush(&mut self) -> Result<SyncOutcome, SessionError> {
        match self.state {
            SessionState::Connecting | SessionState::Disconnected => return Ok(SyncOutcome::Held),
            SessionState::CaughtUp | SessionState::Streaming => {}
        }

        if !self.entity.has_pending() {
            self.state = SessionState::Streaming;
            return Ok(SyncOutcome::Nothing);
        }

        let request = WriteRequest {
            entity_id: self.entity.entity_id,
            kind: self.entity.kind,
            team_id: self.entity.team_id,
            base_revision: self.entity.synced_revision(),
            actions: self.entity.pending().to_vec(),
            mode: WriteMode::Append,
        };
        let outcome = match self.send_write(request).await? {
            WriteResponse::Accepted { revision } if self.knows(&revision) => {
                self.entity.confirm(revision);
                SyncOutcome::Accepted { revision }
            }
            // Accepted as a retry of something that already landed, behind newer server actions.
            WriteResponse::Accepted { .. } | WriteResponse::Conflict { .. } => self.refetch().await?,
            other => return Err(unexpected(other)),
        };

        if !self.entity.has_pending() {
            self.state = SessionState::Streaming;
        }
        Ok(outcome)
    }

    /// Waits for the next message on the subscription and folds it into the local copy.
    pub async fn next_event(&mut self) -> Result<SessionEvent, SessionError> {
        let subscription = self.subscription.as_mut().ok_or(SessionError::NotConnected)?;
        let message = subscription.next().await;

        match message {
            None => {
                slog::info!(self.logger, "Subscription ended");
                self.disconnect();
                Ok(SessionEvent::Disconnected)
            }
            Some(Err(e)) => {
                self.disconnect();
                Err(e.into())
            }
            Some(Ok(SyncMessage::Error(message))) => {
                self.disconnect();
                Err(SessionError::Closed(message))
            }
            Some(Ok(SyncMessage::Update(update))) => Ok(SessionEvent::Reconciled(self.absorb(update).await?)),
            Some(Ok(SyncMessage::Action { action, revision })) => {
                slog::debug!(self.logger, "ClientWire - Action {} at {:?}", action.id, revision);
                if self.entity.log().contains(&action.id) {
                    self.entity.confirm(revision);
                    Ok(SessionEvent::Acknowledged { revision })
                } else if !self.entity.has_pending() {
                    self.entity.fast_forward(&[action]);
                    Ok(SessionEvent::Applied { revision })
                } else {
                    Ok(SessionEvent::Reconciled(self.refetch().await?))
                }
            }
        }
    }

    fn knows(&self, revision: &Revision) -> bool {
        match revision.action_id() {
            None => true,
            Some(id) => self.entity.log().contains(&id),
        }
    }

    async fn refetch(&mut self) -> Result<SyncOutcome, SessionError> {
        let fetched = self
            .transport
            .fetch_since(self.entity.entity_id, self.entity.synced_revision())
            .await?;
        self.absorb(fetched).await
    }

    async fn absorb(&mut self, server: FetchResponse) -> Result<SyncOutcome, SessionError> {
        match reconcile(&self.entity, &server) {
            Reconciliation::InSync => Ok(SyncOutcome::Nothing),
            Reconciliation::FastForward {
                server_log,
                still_pending,
            } => {
                self.entity.adopt_server_log(server_log);
                let revision = self.entity.synced_revision();
                for action in still_pending {
                    self.entity.record(action);
                }
                slog::debug!(self.logger, "Fast-forwarded to {:?}", revision);
                Ok(SyncOutcome::FastForwarded { revision })
            }
            Reconciliation::Diverged(divergence) => {
                let choice = self.resolver.choose(&self.entity, &divergence);
                slog::info!(
                    self.logger,
                    "Diverged with {} local-only actions. Resolving with {:?}",
                    divergence.local_only.len(),
                    choice
                );
                self.resolve(choice, divergence).await
            }
        }
    }

    async fn resolve(&mut self, choice: ConflictChoice, divergence: Divergence) -> Result<SyncOutcome, SessionError> {
        match choice {
            ConflictChoice::OverwriteLocal => {
                self.entity.adopt_server_log(divergence.server_log);
                Ok(SyncOutcome::Resolved { choice, fork: None })
            }
            ConflictChoice::ForceSave => {
                let request = WriteRequest {
                    entity_id: self.entity.entity_id,
                    kind: self.entity.kind,
                    team_id: self.entity.team_id,
                    base_revision: divergence.server_log.last().map_or(Revision::empty(), |a| Revision::at(a.id)),
                    actions: self.entity.log().actions().to_vec(),
                    mode: WriteMode::ForceSave,
                };
                match self.send_write(request).await? {
                    WriteResponse::Accepted { revision } => {
                        self.entity.confirm(revision);
                        Ok(SyncOutcome::Resolved { choice, fork: None })
                    }
                    other => Err(unexpected(other)),
                }
            }
            ConflictChoice::Fork => {
                let mut fork = fork_of(&self.entity, EntityId::new_random());
                let request = WriteRequest {
                    entity_id: fork.entity_id,
                    kind: fork.kind,
                    team_id: fork.team_id,
                    base_revision: Revision::empty(),
                    actions: fork.pending().to_vec(),
                    mode: WriteMode::Fork {
                        source_entity_id: self.entity.entity_id,
                    },
                };
                match self.send_write(request).await? {
                    WriteResponse::Accepted { revision } => {
                        fork.confirm(revision);
                        let fork_id = fork.entity_id;
                        slog::info!(self.logger, "Forked local log into {}", fork_id);
                        self.forks.push(fork);
                        self.entity.adopt_server_log(divergence.server_log);
                        Ok(SyncOutcome::Resolved {
                            choice,
                            fork: Some(fork_id),
                        })
                    }
                    other => Err(unexpected(other)),
                }
            }
        }
    }

    /// Sends `request`, waiting out rate limiting and leader elections. Transport failures end
    /// the subscription but leave the queue alone.
    async fn send_write(&mut self, request: WriteRequest) -> Result<WriteResponse, SessionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let response = match self.transport.write(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    self.disconnect();
                    return Err(e.into());
                }
            };

            let delay = match response {
                WriteResponse::RateLimited { retry_after } => self.backoff.next_delay_at_least(retry_after),
                WriteResponse::NoLeader => self.backoff.next_delay(),
                WriteResponse::Rejected { reason } => return Err(SessionError::Rejected(reason)),
                other => {
                    self.backoff.reset();
                    return Ok(other);
                }
            };
            if attempts >= self.max_attempts {
                return Err(SessionError::RetriesExhausted(attempts));
            }
            slog::debug!(self.logger, "Write deferred, retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

fn unexpected(response: WriteResponse) -> SessionError {
    SessionError::Rejected(format!("Unexpected response {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, EntityKind, EntityMetadata, EntityRecord, RecordNote, UserId, WriteOutcome};
    use crate::sync::transport::Subscription;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct FakeServerState {
        entities: HashMap<EntityId, EntityRecord>,
        subscribers: Vec<(EntityId, mpsc::UnboundedSender<Result<SyncMessage, TransportError>>)>,
        rate_limited_writes: u32,
    }

    /// An in-memory stand-in for the cluster's sync service.
    #[derive(Clone, Default)]
    struct FakeServer {
        state: Arc<Mutex<FakeServerState>>,
    }

    impl FakeServer {
        fn seed(&self, entity_id: EntityId, actions: Vec<Action>) {
            let mut record = EntityRecord::new(entity_id, EntityKind::Game, metadata());
            record.log = crate::action::ActionLog::from_actions(actions);
            self.state.lock().unwrap().entities.insert(entity_id, record);
        }

        fn log(&self, entity_id: &EntityId) -> Option<Vec<Action>> {
            let state = self.state.lock().unwrap();
            state.entities.get(entity_id).map(|r| r.log.actions().to_vec())
        }

        fn entity(&self, entity_id: &EntityId) -> Option<EntityRecord> {
            self.state.lock().unwrap().entities.get(entity_id).cloned()
        }

        fn rate_limit_next(&self, writes: u32) {
            self.state.lock().unwrap().rate_limited_writes = writes;
        }

        fn drop_subscribers(&self) {
            self.state.lock().unwrap().subscribers.clear();
        }

        /// Another client's write, broadcast to subscribers.
        fn external_append(&self, entity_id: EntityId, action: Action) {
            let mut state = self.state.lock().unwrap();
            let record = state.entities.get_mut(&entity_id).unwrap();
            let base = record.revision();
            record.apply_write(&base, vec![action.clone()]);
            broadcast(&mut state, entity_id, &[action]);
        }
    }

    fn broadcast(state: &mut FakeServerState, entity_id: EntityId, actions: &[Action]) {
        for (subscribed, tx) in state.subscribers.iter() {
            if *subscribed == entity_id {
                for action in actions {
                    let _ = tx.send(Ok(SyncMessage::Action {
                        action: action.clone(),
                        revision: Revision::at(action.id),
                    }));
                }
            }
        }
    }

    fn metadata() -> EntityMetadata {
        EntityMetadata {
            owner: UserId::new("scorer"),
            team_id: None,
            forked_from: None,
            created_at: Utc::now(),
        }
    }

    fn fetch(record: Option<&EntityRecord>, since: &Revision) -> FetchResponse {
        match record {
            None => FetchResponse {
                actions: vec![],
                revision: Revision::empty(),
                revision_known: since.is_empty(),
            },
            Some(record) => match record.log.since(since) {
                Some(actions) => FetchResponse {
                    actions: actions.to_vec(),
                    revision: record.revision(),
                    revision_known: true,
                },
                None => FetchResponse {
                    actions: record.log.actions().to_vec(),
                    revision: record.revision(),
                    revision_known: false,
                },
            },
        }
    }

    #[async_trait::async_trait]
    impl SyncTransport for FakeServer {
        async fn write(&self, request: WriteRequest) -> Result<WriteResponse, TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.rate_limited_writes > 0 {
                state.rate_limited_writes -= 1;
                return Ok(WriteResponse::RateLimited {
                    retry_after: Duration::from_millis(20),
                });
            }

            match request.mode {
                WriteMode::Append => {
                    let record = state
                        .entities
                        .entry(request.entity_id)
                        .or_insert_with(|| EntityRecord::new(request.entity_id, request.kind, metadata()));
                    match record.apply_write(&request.base_revision, request.actions) {
                        WriteOutcome::Conflict { current_revision } => Ok(WriteResponse::Conflict { current_revision }),
                        WriteOutcome::Accepted { revision, appended } => {
                            broadcast(&mut state, request.entity_id, &appended);
                            Ok(WriteResponse::Accepted { revision })
                        }
                    }
                }
                WriteMode::ForceSave => {
                    let record = state.entities.get_mut(&request.entity_id).unwrap();
                    let revision = record.force_save(request.actions);
                    Ok(WriteResponse::Accepted { revision })
                }
                WriteMode::Fork { source_entity_id } => {
                    let source = state.entities.get(&source_entity_id).unwrap();
                    let fork = source.fork(request.entity_id, UserId::new("scorer"), request.actions, Utc::now());
                    let revision = fork.revision();
                    state.entities.insert(request.entity_id, fork);
                    Ok(WriteResponse::Accepted { revision })
                }
            }
        }

        async fn fetch_since(&self, entity_id: EntityId, since: Revision) -> Result<FetchResponse, TransportError> {
            let state = self.state.lock().unwrap();
            Ok(fetch(state.entities.get(&entity_id), &since))
        }

        async fn subscribe(&self, entity_id: EntityId, last_revision: Revision) -> Result<Subscription, TransportError> {
            let mut state = self.state.lock().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Ok(SyncMessage::Update(fetch(state.entities.get(&entity_id), &last_revision))));
            state.subscribers.push((entity_id, tx));
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }
    }

    fn note(text: &str) -> Action {
        Action::new(
            ActionKind::RecordNote(RecordNote { text: text.into() }),
            UserId::new("scorer"),
            Utc::now(),
        )
    }

    fn session(server: &FakeServer, entity: LocalEntity, choice: ConflictChoice) -> SyncSession<FakeServer> {
        SyncSession::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            server.clone(),
            entity,
            Box::new(choice),
            Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            10,
        )
    }

    fn ids(actions: &[Action]) -> Vec<crate::action::ActionId> {
        actions.iter().map(|a| a.id).collect()
    }

    #[tokio::test]
    async fn unsynced_actions_are_pushed_to_an_empty_server() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let (a, b) = (note("a"), note("b"));

        let mut local = LocalEntity::new(entity_id, EntityKind::Game, UserId::new("scorer"));
        local.record(a.clone());
        local.record(b.clone());
        let mut session = session(&server, local, ConflictChoice::OverwriteLocal);

        // Held until catch-up.
        assert_eq!(session.flush().await.unwrap(), SyncOutcome::Held);
        assert_eq!(server.log(&entity_id), None);

        assert_eq!(session.connect().await.unwrap(), SyncOutcome::Nothing);
        assert_eq!(session.state(), SessionState::CaughtUp);

        assert_eq!(
            session.flush().await.unwrap(),
            SyncOutcome::Accepted {
                revision: Revision::at(b.id)
            }
        );
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.entity().synced_revision(), Revision::at(b.id));
        assert_eq!(ids(&server.log(&entity_id).unwrap()), vec![a.id, b.id]);

        // Our own writes come back as acknowledgments.
        assert_eq!(
            session.next_event().await.unwrap(),
            SessionEvent::Acknowledged {
                revision: Revision::at(a.id)
            }
        );
        assert_eq!(
            session.next_event().await.unwrap(),
            SessionEvent::Acknowledged {
                revision: Revision::at(b.id)
            }
        );
    }

    #[tokio::test]
    async fn server_ahead_fast_forwards_on_catch_up() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let (a, b, c) = (note("a"), note("b"), note("c"));
        server.seed(entity_id, vec![a.clone(), b.clone(), c.clone()]);

        let local = LocalEntity::from_server(entity_id, EntityKind::Game, UserId::new("scorer"), vec![a.clone(), b]);
        let mut session = session(&server, local, ConflictChoice::OverwriteLocal);

        assert_eq!(
            session.connect().await.unwrap(),
            SyncOutcome::FastForwarded {
                revision: Revision::at(c.id)
            }
        );
        assert_eq!(session.entity().log().actions(), server.log(&entity_id).unwrap().as_slice());
    }

    #[tokio::test]
    async fn lost_acknowledgment_fast_forwards_on_write() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let (a, b, c) = (note("a"), note("b"), note("c"));
        server.seed(entity_id, vec![a.clone()]);

        let local = LocalEntity::from_server(entity_id, EntityKind::Game, UserId::new("scorer"), vec![a.clone()]);
        let mut session = session(&server, local, ConflictChoice::OverwriteLocal);
        session.connect().await.unwrap();

        // b landed but its acknowledgment was lost, and c came after it.
        session.record(b.clone());
        server.external_append(entity_id, b.clone());
        server.external_append(entity_id, c.clone());

        assert_eq!(
            session.flush().await.unwrap(),
            SyncOutcome::FastForwarded {
                revision: Revision::at(c.id)
            }
        );
        assert_eq!(ids(session.entity().log().actions()), vec![a.id, b.id, c.id]);
        assert!(!session.entity().has_pending());
    }

    #[tokio::test]
    async fn divergence_resolved_by_fork() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let (a, b, c, d) = (note("a"), note("b"), note("c"), note("d"));
        server.seed(entity_id, vec![a.clone(), b.clone(), c.clone()]);

        let mut local =
            LocalEntity::from_server(entity_id, EntityKind::Game, UserId::new("scorer"), vec![a.clone(), b.clone()]);
        local.record(d.clone());
        let mut session = session(&server, local, ConflictChoice::Fork);

        let fork_id = match session.connect().await.unwrap() {
            SyncOutcome::Resolved {
                choice: ConflictChoice::Fork,
                fork: Some(fork_id),
            } => fork_id,
            other => panic!("Unexpected {:?}", other),
        };

        // Original keeps the server's log.
        assert_eq!(ids(&server.log(&entity_id).unwrap()), vec![a.id, b.id, c.id]);
        assert_eq!(ids(session.entity().log().actions()), vec![a.id, b.id, c.id]);

        // The fork holds A', B', D' with fresh ids.
        let forked = server.entity(&fork_id).unwrap();
        assert_eq!(forked.metadata.forked_from, Some(entity_id));
        let forked_actions = forked.log.actions();
        assert_eq!(forked_actions.len(), 3);
        for (copy, original) in forked_actions.iter().zip([&a, &b, &d].iter()) {
            assert_ne!(copy.id, original.id);
            assert_eq!(copy.kind, original.kind);
        }
        assert_eq!(session.forks().len(), 1);
        assert_eq!(session.forks()[0].synced_revision(), forked.revision());
    }

    #[tokio::test]
    async fn divergence_resolved_by_force_save() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let (a, c, d) = (note("a"), note("c"), note("d"));
        server.seed(entity_id, vec![a.clone(), c]);

        let mut local = LocalEntity::from_server(entity_id, EntityKind::Game, UserId::new("scorer"), vec![a.clone()]);
        local.record(d.clone());
        let mut session = session(&server, local, ConflictChoice::ForceSave);

        assert_eq!(
            session.connect().await.unwrap(),
            SyncOutcome::Resolved {
                choice: ConflictChoice::ForceSave,
                fork: None
            }
        );
        assert_eq!(ids(&server.log(&entity_id).unwrap()), vec![a.id, d.id]);
        assert_eq!(session.entity().synced_revision(), Revision::at(d.id));
    }

    #[tokio::test]
    async fn rate_limited_writes_wait_for_the_hint() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let mut local = LocalEntity::new(entity_id, EntityKind::Game, UserId::new("scorer"));
        local.record(note("a"));
        let mut session = session(&server, local, ConflictChoice::OverwriteLocal);
        session.connect().await.unwrap();

        server.rate_limit_next(2);
        let started = Instant::now();
        assert!(matches!(session.flush().await.unwrap(), SyncOutcome::Accepted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn dropped_subscription_keeps_the_queue() {
        let server = FakeServer::default();
        let entity_id = EntityId::new_random();
        let a = note("a");
        server.seed(entity_id, vec![a.clone()]);
        let local = LocalEntity::from_server(entity_id, EntityKind::Game, UserId::new("scorer"), vec![a]);
        let mut session = session(&server, local, ConflictChoice::OverwriteLocal);
        session.connect().await.unwrap();

        let foreign = note("from another scorer");
        server.external_append(entity_id, foreign.clone());
        assert_eq!(
            session.next_event().await.unwrap(),
            SessionEvent::Applied {
                revision: Revision::at(foreign.id)
            }
        );

        let queued = note("queued");
        session.record(queued.clone());
        server.drop_subscribers();
        assert_eq!(session.next_event().await.unwrap(), SessionEvent::Disconnected);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.entity().pending(), &[queued.clone()]);

        session.connect().await.unwrap();
        assert_eq!(
            session.flush().await.unwrap(),
            SyncOutcome::Accepted {
                revision: Revision::at(queued.id)
            }
        );
    }
}
