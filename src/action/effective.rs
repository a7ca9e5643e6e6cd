//! Undo and redo are plain actions. An UNDO neutralizes its target; an UNDO of an UNDO neutralizes
//! that UNDO, which reinstates the original (a redo). Resolution walks the log newest to oldest so
//! that by the time an UNDO is reached we already know whether something later neutralized it.

use crate::action::{Action, ActionId};
use std::collections::{HashMap, HashSet};

/// Resolution is the outcome of resolving undo/redo over a log.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    neutralized: HashSet<ActionId>,
    dangling_undos: Vec<ActionId>,
}

impl Resolution {
    pub fn resolve(actions: &[Action]) -> Self {
        let positions: HashMap<ActionId, usize> = actions.iter().enumerate().map(|(i, a)| (a.id, i)).collect();

        let mut neutralized = HashSet::new();
        let mut dangling_undos = Vec::new();

        for (i, action) in actions.iter().enumerate().rev() {
            let target = match action.undo_target() {
                Some(target) => target,
                None => continue,
            };
            if neutralized.contains(&action.id) {
                continue;
            }

            // The target has to come before the UNDO. Anything else is a dangling reference.
            match positions.get(&target) {
                Some(&target_position) if target_position < i => {
                    neutralized.insert(target);
                }
                _ => dangling_undos.push(action.id),
            }
        }

        dangling_undos.reverse();
        Resolution {
            neutralized,
            dangling_undos,
        }
    }

    pub fn is_neutralized(&self, id: &ActionId) -> bool {
        self.neutralized.contains(id)
    }

    /// UNDO actions whose target is not earlier in the log. They are no-ops.
    pub fn dangling_undos(&self) -> &[ActionId] {
        &self.dangling_undos
    }

    fn is_dangling(&self, id: &ActionId) -> bool {
        self.dangling_undos.contains(id)
    }
}

/// Actions that reach the reducer: not neutralized, and not an UNDO themselves.
pub fn effective_actions<'a>(actions: &'a [Action], resolution: &'a Resolution) -> impl Iterator<Item = &'a Action> {
    actions
        .iter()
        .filter(move |action| !action.kind.is_undo() && !resolution.is_neutralized(&action.id))
}

enum UndoRole {
    Generative,
    PrimaryUndo,
    Redo,
    Dangling,
}

fn role(actions_by_id: &HashMap<ActionId, &Action>, resolution: &Resolution, action: &Action) -> UndoRole {
    let target = match action.undo_target() {
        None => return UndoRole::Generative,
        Some(target) => target,
    };
    if resolution.is_dangling(&action.id) {
        return UndoRole::Dangling;
    }

    match actions_by_id.get(&target) {
        Some(target_action) if target_action.kind.is_undo() => UndoRole::Redo,
        Some(_) => UndoRole::PrimaryUndo,
        None => UndoRole::Dangling,
    }
}

/// The action an "undo" command should target next: the newest effective generative action, or
/// the newest effective redo (undoing a redo re-applies the original undo).
pub fn next_undo_candidate<'a>(actions: &'a [Action], resolution: &Resolution) -> Option<&'a Action> {
    let actions_by_id: HashMap<ActionId, &Action> = actions.iter().map(|a| (a.id, a)).collect();

    for action in actions.iter().rev() {
        if resolution.is_neutralized(&action.id) {
            continue;
        }
        match role(&actions_by_id, resolution, action) {
            UndoRole::Generative | UndoRole::Redo => return Some(action),
            UndoRole::PrimaryUndo | UndoRole::Dangling => continue,
        }
    }

    None
}

/// The UNDO a "redo" command should target next. Any effective generative action newer than the
/// last primary undo ends the redo chain.
pub fn next_redo_candidate<'a>(actions: &'a [Action], resolution: &Resolution) -> Option<&'a Action> {
    let actions_by_id: HashMap<ActionId, &Action> = actions.iter().map(|a| (a.id, a)).collect();

    for action in actions.iter().rev() {
        if resolution.is_neutralized(&action.id) {
            continue;
        }
        match role(&actions_by_id, resolution, action) {
            UndoRole::PrimaryUndo => return Some(action),
            UndoRole::Redo | UndoRole::Dangling => continue,
            UndoRole::Generative => return None,
        }
    }

    None
}
