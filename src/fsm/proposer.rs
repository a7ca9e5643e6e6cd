use crate::actor::ActorClient;
use crate::fsm::command::{FsmCommand, InvalidCommand, RequestId};
use crate::fsm::entity_fsm::ApplyOutcome;
use crate::replica::{EnqueueForReplicationError, EnqueueForReplicationInput, LeaderRedirectInfo};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};

/// Waiters for commands this node proposed, keyed by request id. The FSM driver completes them
/// as it applies.
#[derive(Clone, Default)]
pub(crate) struct PendingApplies {
    waiters: Arc<Mutex<HashMap<RequestId, oneshot::Sender<ApplyOutcome>>>>,
}

impl PendingApplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, request_id: RequestId) -> oneshot::Receiver<ApplyOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("PendingApplies lock poisoned")
            .insert(request_id, tx);
        rx
    }

    fn forget(&self, request_id: &RequestId) {
        self.waiters
            .lock()
            .expect("PendingApplies lock poisoned")
            .remove(request_id);
    }

    /// No-op for commands another node proposed.
    pub(crate) fn complete(&self, request_id: &RequestId, outcome: ApplyOutcome) {
        let waiter = self
            .waiters
            .lock()
            .expect("PendingApplies lock poisoned")
            .remove(request_id);
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.lock().expect("PendingApplies lock poisoned").len()
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProposeError {
    #[error("Invalid command: {0}")]
    Invalid(#[from] InvalidCommand),
    #[error("Too many writes in flight, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("Not leader")]
    NotLeader(LeaderRedirectInfo),
    #[error("No leader")]
    NoLeader,
    #[error("Command wasn't applied within {0:?}")]
    Timeout(Duration),
    #[error("Internal failure: {0}")]
    Internal(String),
}

/// Proposer turns commands into log entries on the leader and waits for them to be applied.
///
/// Admission is bounded. Once `max_in_flight` proposals are outstanding, new ones are shed
/// immediately with a retry hint instead of queueing.
#[derive(Clone)]
pub(crate) struct Proposer {
    logger: slog::Logger,
    actor_client: ActorClient,
    pending: PendingApplies,
    admission: Arc<Semaphore>,
    retry_after: Duration,
    apply_timeout: Duration,
}

impl Proposer {
    pub(crate) fn new(
        logger: slog::Logger,
        actor_client: ActorClient,
        pending: PendingApplies,
        max_in_flight: usize,
        retry_after: Duration,
        apply_timeout: Duration,
    ) -> Self {
        Proposer {
            logger,
            actor_client,
            pending,
            admission: Arc::new(Semaphore::new(max_in_flight)),
            retry_after,
            apply_timeout,
        }
    }

    pub(crate) async fn propose(&self, command: FsmCommand) -> Result<ApplyOutcome, ProposeError> {
        command.validate()?;

        let _permit = self.admission.try_acquire().map_err(|_| ProposeError::RateLimited {
            retry_after: self.retry_after,
        })?;

        let request_id = command.request_id();
        let data = command
            .encode()
            .map_err(|e| ProposeError::Internal(format!("Failed to encode command: {}", e)))?;

        let applied = self.pending.register(request_id);
        let enqueued = self
            .actor_client
            .enqueue_for_replication(EnqueueForReplicationInput { data: Bytes::from(data) })
            .await;

        match enqueued {
            Ok(output) => {
                slog::debug!(
                    self.logger,
                    "Enqueued {:?} at {:?} term {:?}",
                    request_id,
                    output.enqueued_index,
                    output.enqueued_term
                );
            }
            Err(e) => {
                self.pending.forget(&request_id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.apply_timeout, applied).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ProposeError::Internal("State machine stopped".into())),
            Err(_) => {
                // The entry may still commit later. Whoever retries will see it through the
                // revision check.
                self.pending.forget(&request_id);
                Err(ProposeError::Timeout(self.apply_timeout))
            }
        }
    }
}

// ------- Conversions --------

impl From<EnqueueForReplicationError> for ProposeError {
    fn from(e: EnqueueForReplicationError) -> Self {
        match e {
            EnqueueForReplicationError::LeaderRedirect(info) => ProposeError::NotLeader(info),
            EnqueueForReplicationError::NoLeader => ProposeError::NoLeader,
            EnqueueForReplicationError::LocalIoError(e) => ProposeError::Internal(format!("Local IO error: {}", e)),
            EnqueueForReplicationError::ActorExited => ProposeError::Internal("Replica actor exited".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Revision;
    use crate::actor::Event;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn completes_when_applied() {
        let (actor_client, mut rx) = ActorClient::new(8);
        let pending = PendingApplies::new();
        let proposer = Proposer::new(
            logger(),
            actor_client,
            pending.clone(),
            4,
            Duration::from_millis(500),
            Duration::from_secs(5),
        );

        // Stand-in for the replica plus the FSM driver.
        let driver_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::EnqueueForReplication(input, callback) = event {
                    let command = FsmCommand::decode(&input.data).unwrap();
                    callback.send(Ok(crate::replica::EnqueueForReplicationOutput {
                        enqueued_term: crate::replica::Term::new(1),
                        enqueued_index: crate::commitlog::Index::new(1),
                    }));
                    driver_pending.complete(
                        &command.request_id(),
                        ApplyOutcome::Accepted {
                            revision: Revision::empty(),
                        },
                    );
                }
            }
        });

        let outcome = proposer
            .propose(crate::fsm::command::tests_support::form_cluster())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Accepted {
                revision: Revision::empty()
            }
        );
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn sheds_load_when_saturated() {
        let (actor_client, _rx) = ActorClient::new(8);
        let proposer = Proposer::new(
            logger(),
            actor_client,
            PendingApplies::new(),
            1,
            Duration::from_millis(250),
            Duration::from_secs(5),
        );

        let first = proposer.clone();
        let blocked = tokio::spawn(async move {
            first
                .propose(crate::fsm::command::tests_support::form_cluster())
                .await
        });
        // Let the first proposal take the only permit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = proposer
            .propose(crate::fsm::command::tests_support::form_cluster())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProposeError::RateLimited { retry_after } if retry_after == Duration::from_millis(250)
        ));
        blocked.abort();
    }

    #[tokio::test]
    async fn leader_redirect_is_surfaced() {
        let (actor_client, mut rx) = ActorClient::new(8);
        let pending = PendingApplies::new();
        let proposer = Proposer::new(
            logger(),
            actor_client,
            pending.clone(),
            4,
            Duration::from_millis(500),
            Duration::from_secs(5),
        );

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Event::EnqueueForReplication(_, callback) = event {
                    callback.send(Err(EnqueueForReplicationError::NoLeader));
                }
            }
        });

        let err = proposer
            .propose(crate::fsm::command::tests_support::form_cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, ProposeError::NoLeader));
        assert_eq!(pending.len(), 0);
    }
}
