use crate::action::{Action, EntityId, EntityKind, Revision, UserId};
use crate::membership::MemberRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Identifies one proposal, so the node that proposed it can hand the apply outcome back to its
/// caller. Every node applies the command; only the proposer has a waiter for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new_random() -> Self {
        RequestId(Uuid::new_v4())
    }
}

/// FsmCommand is the payload of one committed log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsmCommand {
    /// Optimistic append against `base_revision`. Creates the entity if it doesn't exist yet and
    /// the base is empty.
    AppendActions {
        request_id: RequestId,
        entity_id: EntityId,
        kind: EntityKind,
        owner: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        team_id: Option<EntityId>,
        base_revision: Revision,
        actions: Vec<Action>,
    },
    /// Replaces the entity's log with the client's copy.
    ForceSave {
        request_id: RequestId,
        entity_id: EntityId,
        owner: UserId,
        actions: Vec<Action>,
    },
    /// Creates `new_entity_id` from a diverged client log. Action ids are already re-minted.
    CreateFork {
        request_id: RequestId,
        source_entity_id: EntityId,
        new_entity_id: EntityId,
        owner: UserId,
        actions: Vec<Action>,
    },
    AddMember {
        request_id: RequestId,
        member: MemberRecord,
    },
    /// Records the founding members as the authoritative membership.
    FormCluster {
        request_id: RequestId,
        members: Vec<MemberRecord>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum InvalidCommand {
    #[error("Command carries no actions")]
    NoActions,
    #[error("Action {0} appears more than once")]
    DuplicateAction(String),
    #[error("A fork must name a new entity")]
    ForkOntoSource,
    #[error("A cluster needs at least one member")]
    NoMembers,
    #[error("Invalid member {0}: {1}")]
    InvalidMember(String, String),
}

impl FsmCommand {
    pub fn request_id(&self) -> RequestId {
        match self {
            FsmCommand::AppendActions { request_id, .. }
            | FsmCommand::ForceSave { request_id, .. }
            | FsmCommand::CreateFork { request_id, .. }
            | FsmCommand::AddMember { request_id, .. }
            | FsmCommand::FormCluster { request_id, .. } => *request_id,
        }
    }

    /// The entity this command writes to, if any.
    pub fn entity_id(&self) -> Option<EntityId> {
        match self {
            FsmCommand::AppendActions { entity_id, .. } | FsmCommand::ForceSave { entity_id, .. } => Some(*entity_id),
            FsmCommand::CreateFork { new_entity_id, .. } => Some(*new_entity_id),
            FsmCommand::AddMember { .. } | FsmCommand::FormCluster { .. } => None,
        }
    }

    /// Rejects malformed commands before they are proposed. Apply never sees one of these.
    pub fn validate(&self) -> Result<(), InvalidCommand> {
        match self {
            FsmCommand::AppendActions { actions, .. } | FsmCommand::ForceSave { actions, .. } => {
                validate_actions(actions)
            }
            FsmCommand::CreateFork {
                source_entity_id,
                new_entity_id,
                actions,
                ..
            } => {
                if source_entity_id == new_entity_id {
                    return Err(InvalidCommand::ForkOntoSource);
                }
                validate_actions(actions)
            }
            FsmCommand::AddMember { member, .. } => validate_member(member),
            FsmCommand::FormCluster { members, .. } => {
                if members.is_empty() {
                    return Err(InvalidCommand::NoMembers);
                }
                members.iter().try_for_each(validate_member)
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn validate_actions(actions: &[Action]) -> Result<(), InvalidCommand> {
    if actions.is_empty() {
        return Err(InvalidCommand::NoActions);
    }
    let mut seen = HashSet::with_capacity(actions.len());
    for action in actions {
        if !seen.insert(action.id) {
            return Err(InvalidCommand::DuplicateAction(action.id.to_string()));
        }
    }
    Ok(())
}

fn validate_member(member: &MemberRecord) -> Result<(), InvalidCommand> {
    member
        .validate()
        .map_err(|e| InvalidCommand::InvalidMember(member.node_id.clone(), e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::membership::test_support::member;
    use crate::membership::NodeIdentity;

    pub(crate) fn form_cluster() -> FsmCommand {
        FsmCommand::FormCluster {
            request_id: RequestId::new_random(),
            members: vec![member(&NodeIdentity::generate(), 3000)],
        }
    }
}
