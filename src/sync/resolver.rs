use crate::action::{Action, ActionId, ActionKind, EntityId, Undo};
use crate::sync::local::LocalEntity;
use crate::sync::transport::FetchResponse;
use std::collections::{HashMap, HashSet};

/// How a client's copy relates to what the server has after a stale-revision rejection.
#[derive(Clone, Debug, PartialEq)]
pub enum Reconciliation {
    /// The server has nothing the client lacks. Queued actions stay queued.
    InSync,
    /// Everything new on the server is either the client's own or the client has nothing of its
    /// own: take `server_log`, then queue `still_pending` after it.
    FastForward {
        server_log: Vec<Action>,
        still_pending: Vec<Action>,
    },
    /// Both sides have actions the other doesn't.
    Diverged(Divergence),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Divergence {
    /// The server's full log.
    pub server_log: Vec<Action>,
    /// Local actions the server doesn't have, oldest first.
    pub local_only: Vec<Action>,
}

/// One of the three ways out of a true divergence.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ConflictChoice {
    /// Drop local-only actions and take the server's log.
    OverwriteLocal,
    /// Replace the server's log with the local one.
    ForceSave,
    /// Keep the local log as a brand new entity. The original takes the server's log.
    Fork,
}

/// Picks a way out of a divergence. A fixed `ConflictChoice` always answers itself.
pub trait ConflictResolver: Send {
    fn choose(&mut self, local: &LocalEntity, divergence: &Divergence) -> ConflictChoice;
}

impl ConflictResolver for ConflictChoice {
    fn choose(&mut self, _local: &LocalEntity, _divergence: &Divergence) -> ConflictChoice {
        *self
    }
}

/// Compares the local copy with what the server returned for the local synced revision.
///
/// When the server knew the revision, `server` holds only what came after it, and the synced
/// prefix is shared by definition. Otherwise `server` is the whole log and the shared part is
/// whatever both logs contain.
pub fn reconcile(local: &LocalEntity, server: &FetchResponse) -> Reconciliation {
    let server_ids: HashSet<ActionId> = server.actions.iter().map(|a| a.id).collect();
    let foreign = server.actions.iter().any(|a| !local.log().contains(&a.id));

    let (server_log, unsynced) = if server.revision_known {
        let mut server_log = local.log().actions()[..synced_len(local)].to_vec();
        server_log.extend(server.actions.iter().cloned());
        (server_log, local.pending())
    } else {
        (server.actions.clone(), local.log().actions())
    };
    let local_only: Vec<Action> = unsynced
        .iter()
        .filter(|a| !server_ids.contains(&a.id))
        .cloned()
        .collect();

    if server.revision_known && server.actions.is_empty() {
        return Reconciliation::InSync;
    }
    if !server.revision_known && local_only.is_empty() && server_log.as_slice() == local.log().actions() {
        return if local.synced_revision() == local.local_revision() {
            Reconciliation::InSync
        } else {
            Reconciliation::FastForward {
                server_log,
                still_pending: Vec::new(),
            }
        };
    }
    if local_only.is_empty() || (server.revision_known && !foreign) {
        return Reconciliation::FastForward {
            server_log,
            still_pending: local_only,
        };
    }

    Reconciliation::Diverged(Divergence { server_log, local_only })
}

fn synced_len(local: &LocalEntity) -> usize {
    local.log().len() - local.pending().len()
}

/// Copies `actions` with fresh ids. UNDO targets inside the batch are pointed at the new ids so
/// the fork undoes the same things the original did.
pub fn remint_actions(actions: &[Action]) -> Vec<Action> {
    let mut renamed: HashMap<ActionId, ActionId> = HashMap::with_capacity(actions.len());
    actions
        .iter()
        .map(|action| {
            let new_id = ActionId::new_random();
            renamed.insert(action.id, new_id);
            let kind = match &action.kind {
                ActionKind::Undo(undo) => ActionKind::Undo(Undo {
                    target: renamed.get(&undo.target).copied().unwrap_or(undo.target),
                }),
                other => other.clone(),
            };
            Action {
                id: new_id,
                kind,
                timestamp: action.timestamp,
                user_id: action.user_id.clone(),
                schema_version: action.schema_version,
            }
        })
        .collect()
}

/// The local log re-minted as a fork of `local`, ready to be written under `new_entity_id`.
pub fn fork_of(local: &LocalEntity, new_entity_id: EntityId) -> LocalEntity {
    let mut fork = LocalEntity::new(new_entity_id, local.kind, local.owner.clone());
    fork.team_id = local.team_id;
    for action in remint_actions(local.log().actions()) {
        fork.record(action);
    }
    fork
}
