use crate::replica::peers::ReplicaId;
use crate::storage::StableStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;

const TERM_VOTE_KEY: &str = "term_vote";

/// A Raft election term. Zero before the first election.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash, Default)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The current term and this node's vote in it. Both must survive a restart before the node
/// acts on them, or it could vote twice in one term.
///
/// Every `store_*` method is a compare-and-set: it returns true if it changed anything, and the
/// in-memory copy only changes once the durable write has succeeded.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: ReplicaId)
        -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>);
}

#[derive(Serialize, Deserialize)]
struct TermVote {
    term: u64,
    voted_for: Option<String>,
}

/// DurableLocalState writes term and vote through to a stable store (encrypted in production) and
/// serves reads from memory.
pub(crate) struct DurableLocalState {
    store: Arc<dyn StableStore>,
    current_term: Term,
    voted_for_this_term: Option<Arc<ReplicaId>>,
    my_replica_id: Arc<ReplicaId>,
}

impl DurableLocalState {
    pub(crate) fn open(store: Arc<dyn StableStore>, my_replica_id: ReplicaId) -> Result<Self, io::Error> {
        let (current_term, voted_for_this_term) = match store.get(TERM_VOTE_KEY)? {
            None => (Term::new(0), None),
            Some(bytes) => {
                let stored: TermVote =
                    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                (Term::new(stored.term), stored.voted_for.map(|v| Arc::new(ReplicaId::new(v))))
            }
        };

        Ok(DurableLocalState {
            store,
            current_term,
            voted_for_this_term,
            my_replica_id: Arc::new(my_replica_id),
        })
    }

    fn persist(&self, term: Term, voted_for: Option<&ReplicaId>) -> Result<(), io::Error> {
        let stored = TermVote {
            term: term.as_u64(),
            voted_for: voted_for.map(|v| v.as_str().to_string()),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        self.store.put(TERM_VOTE_KEY, &bytes)
    }
}

impl PersistentLocalState for DurableLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        if new_term <= self.current_term {
            return Ok(false);
        }

        self.persist(new_term, None)?;
        self.current_term = new_term;
        self.voted_for_this_term = None;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> Result<bool, io::Error> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return Ok(false);
        }

        self.persist(self.current_term, Some(&vote))?;
        self.voted_for_this_term.replace(Arc::new(vote));
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        let mut new_term = self.current_term;
        new_term.incr();

        self.persist(new_term, Some(&self.my_replica_id))?;
        self.current_term = new_term;
        self.voted_for_this_term.replace(self.my_replica_id.clone());

        Ok(self.current_term)
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<ReplicaId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}
