use crate::action::{Action, ActionId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Revision is the optimistic concurrency token of an action log: the id of its last action, or
/// empty for an empty log. On the wire it is the action id string, or "" when empty.
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct Revision(Option<ActionId>);

impl Revision {
    pub fn empty() -> Self {
        Revision(None)
    }

    pub fn at(action_id: ActionId) -> Self {
        Revision(Some(action_id))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn action_id(&self) -> Option<ActionId> {
        self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        if s.is_empty() {
            Ok(Revision::empty())
        } else {
            ActionId::parse(s).map(Revision::at)
        }
    }

    pub fn to_wire(&self) -> String {
        match self.0 {
            None => String::new(),
            Some(id) => id.to_string(),
        }
    }
}

impl Default for Revision {
    fn default() -> Self {
        Revision::empty()
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => write!(f, "Revision(<empty>)"),
            Some(id) => write!(f, "Revision({})", id),
        }
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Revision::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// ActionLog is the append-only, ordered log of an entity. Appending an id that is already present
/// is a no-op.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionLog {
    actions: Vec<Action>,
    positions: HashMap<ActionId, usize>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from actions in order, dropping repeated ids.
    pub fn from_actions<I: IntoIterator<Item = Action>>(actions: I) -> Self {
        let mut log = Self::new();
        for action in actions {
            log.append(action);
        }
        log
    }

    /// Returns true if the action was appended, false if its id was already in the log.
    pub fn append(&mut self, action: Action) -> bool {
        if self.positions.contains_key(&action.id) {
            return false;
        }

        self.positions.insert(action.id, self.actions.len());
        self.actions.push(action);
        true
    }

    pub fn revision(&self) -> Revision {
        match self.actions.last() {
            None => Revision::empty(),
            Some(last) => Revision::at(last.id),
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn contains(&self, id: &ActionId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn position(&self, id: &ActionId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.position(id).map(|i| &self.actions[i])
    }

    /// Every action strictly after `revision`. `None` if the revision is not in this log, in which
    /// case the caller can't tell what it is missing.
    pub fn since(&self, revision: &Revision) -> Option<&[Action]> {
        match revision.action_id() {
            None => Some(&self.actions[..]),
            Some(id) => self.position(&id).map(|i| &self.actions[i + 1..]),
        }
    }

    /// Drops every action after `revision`, keeping `revision` as the new tail. Returns the
    /// dropped actions, oldest first, or `None` if the revision is unknown.
    pub fn split_off_after(&mut self, revision: &Revision) -> Option<Vec<Action>> {
        let keep = match revision.action_id() {
            None => 0,
            Some(id) => self.position(&id)? + 1,
        };

        let dropped = self.actions.split_off(keep);
        for action in dropped.iter() {
            self.positions.remove(&action.id);
        }

        Some(dropped)
    }
}

impl Serialize for ActionLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.actions.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActionLog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let actions = Vec::<Action>::deserialize(deserializer)?;
        Ok(ActionLog::from_actions(actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, RecordNote, UserId};
    use chrono::Utc;

    fn note(text: &str) -> Action {
        Action::new(
            ActionKind::RecordNote(RecordNote { text: text.to_string() }),
            UserId::new("u"),
            Utc::now(),
        )
    }

    #[test]
    fn duplicate_ids_are_idempotent() {
        let a = note("a");
        let mut log = ActionLog::new();

        assert!(log.append(a.clone()));
        assert!(!log.append(a.clone()));
        assert_eq!(log.len(), 1);
        assert_eq!(log.revision(), Revision::at(a.id));
    }

    #[test]
    fn since_known_and_unknown_revisions() {
        let (a, b, c) = (note("a"), note("b"), note("c"));
        let log = ActionLog::from_actions(vec![a.clone(), b.clone(), c.clone()]);

        assert_eq!(log.since(&Revision::empty()).unwrap().len(), 3);
        assert_eq!(log.since(&Revision::at(b.id)).unwrap(), &[c.clone()]);
        assert!(log.since(&Revision::at(c.id)).unwrap().is_empty());
        assert!(log.since(&Revision::at(ActionId::new_random())).is_none());
    }

    #[test]
    fn split_off_after_rewinds_the_tail() {
        let (a, b, c) = (note("a"), note("b"), note("c"));
        let mut log = ActionLog::from_actions(vec![a.clone(), b.clone(), c.clone()]);

        let dropped = log.split_off_after(&Revision::at(a.id)).unwrap();
        assert_eq!(dropped, vec![b.clone(), c.clone()]);
        assert_eq!(log.revision(), Revision::at(a.id));
        assert!(!log.contains(&b.id));

        // Re-appending a dropped action works again.
        assert!(log.append(b));
    }

    #[test]
    fn revision_wire_form() {
        assert_eq!(Revision::empty().to_wire(), "");
        assert_eq!(Revision::parse("").unwrap(), Revision::empty());

        let id = ActionId::new_random();
        assert_eq!(Revision::parse(&Revision::at(id).to_wire()).unwrap(), Revision::at(id));
        assert!(Revision::parse("not-a-uuid").is_err());
    }
}
