use crate::api::types::LeaderInfo;
use crate::fsm::{ApplyOutcome, FsmCommand, InvalidCommand, ProposeError, Proposer};
use std::time::Duration;

/// WriteHandle lets the embedding application propose commands on this node directly, without
/// going through the sync service.
#[derive(Clone)]
pub struct WriteHandle {
    proposer: Proposer,
}

impl WriteHandle {
    pub(crate) fn new(proposer: Proposer) -> Self {
        WriteHandle { proposer }
    }

    /// Proposes `command` and waits until it has been applied locally. Only succeeds on the
    /// leader; followers answer with a redirect.
    pub async fn submit(&self, command: FsmCommand) -> Result<ApplyOutcome, SubmitCommandError> {
        self.proposer.propose(command).await.map_err(SubmitCommandError::from)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitCommandError {
    #[error("Invalid command: {0}")]
    Invalid(InvalidCommand),

    #[error("Too many writes in flight. Retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("This node is not leader; {0:?} is")]
    LeaderRedirect(LeaderInfo),

    /// Usually an election in progress. Worth retrying after a short wait.
    #[error("No leader is currently elected")]
    NoLeader,

    // The entry may still commit. Retrying is safe: the revision check rejects a duplicate.
    #[error("Command wasn't applied within {0:?}")]
    Timeout(Duration),

    #[error("Internal failure: {0}")]
    Internal(String),
}

// ------- Conversions --------

impl From<ProposeError> for SubmitCommandError {
    fn from(internal_error: ProposeError) -> Self {
        match internal_error {
            ProposeError::Invalid(e) => SubmitCommandError::Invalid(e),
            ProposeError::RateLimited { retry_after } => SubmitCommandError::RateLimited { retry_after },
            ProposeError::NotLeader(leader) => SubmitCommandError::LeaderRedirect(LeaderInfo::from(leader)),
            ProposeError::NoLeader => SubmitCommandError::NoLeader,
            ProposeError::Timeout(timeout) => SubmitCommandError::Timeout(timeout),
            ProposeError::Internal(message) => SubmitCommandError::Internal(message),
        }
    }
}
