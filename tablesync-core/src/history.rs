//! Local undo/redo log.
//!
//! Linear discipline: pushing an action clears the redo stack, undo moves
//! the newest action to redo, redo moves it back. Each action stores a
//! `before` and `after` fragment, a slice of the document large enough to
//! restore either side.
//!
//! ```text
//!   push(a3)          undo()            redo()
//! undo: a1 a2 a3    undo: a1 a2       undo: a1 a2 a3
//! redo: -           redo: a3          redo: -
//! ```
//!
//! Only locally originated actions are recorded. A remote mutation that
//! touches an entity some recorded action also touches drops that action,
//! since its `before` no longer describes the live document.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::document::{
    now_millis, CanvasElement, CombatState, ElementId, ElementPatch, FogState, GridSettings,
    SessionDocument,
};
use crate::store::StateStore;

/// Default number of retained undo steps.
pub const DEFAULT_DEPTH: usize = 100;

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Delete,
    Move,
    Update,
    Fog,
    Combat,
    Grid,
}

impl ActionKind {
    /// Classify an element patch. `None` means the edit is not recorded.
    pub fn for_patch(patch: &ElementPatch, existed: bool) -> Option<Self> {
        if !existed {
            Some(Self::Create)
        } else if patch.is_move_only() {
            Some(Self::Move)
        } else if patch.touches_recorded_property() {
            Some(Self::Update)
        } else {
            None
        }
    }
}

/// The part of the document an action or remote mutation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Element(ElementId),
    Fog,
    Combat,
    Grid,
}

/// A restorable slice of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Fragment {
    /// One element slot. `element: None` means the id is absent.
    Element {
        id: ElementId,
        element: Option<CanvasElement>,
        position: usize,
    },
    Fog { fog: FogState },
    Combat { combat: Option<CombatState> },
    Grid { grid: GridSettings },
}

impl Fragment {
    /// Capture the current slot for `id`.
    pub fn element_of(document: &SessionDocument, id: &str) -> Self {
        match document.element_position(id) {
            Some(position) => Self::Element {
                id: id.to_string(),
                element: Some(document.elements[position].clone()),
                position,
            },
            None => Self::Element {
                id: id.to_string(),
                element: None,
                position: document.elements.len(),
            },
        }
    }

    pub fn fog_of(document: &SessionDocument) -> Self {
        Self::Fog {
            fog: document.fog.clone(),
        }
    }

    pub fn combat_of(document: &SessionDocument) -> Self {
        Self::Combat {
            combat: document.combat.clone(),
        }
    }

    pub fn grid_of(document: &SessionDocument) -> Self {
        Self::Grid {
            grid: document.grid.clone(),
        }
    }

    pub fn target(&self) -> Target {
        match self {
            Self::Element { id, .. } => Target::Element(id.clone()),
            Self::Fog { .. } => Target::Fog,
            Self::Combat { .. } => Target::Combat,
            Self::Grid { .. } => Target::Grid,
        }
    }

    /// Write this slice back into `document`.
    pub fn apply(&self, document: &mut SessionDocument) {
        match self {
            Self::Element {
                element: Some(element),
                position,
                ..
            } => document.put_element(element.clone(), *position),
            Self::Element { id, element: None, .. } => {
                document.remove_element(id);
            }
            Self::Fog { fog } => document.fog = fog.clone(),
            Self::Combat { combat } => document.set_combat(combat.clone()),
            Self::Grid { grid } => document.grid = grid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAction {
    pub kind: ActionKind,
    pub timestamp: u64,
    pub before: Fragment,
    pub after: Fragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<ElementId>,
    pub description: String,
}

impl HistoryAction {
    pub fn new(kind: ActionKind, before: Fragment, after: Fragment, description: impl Into<String>) -> Self {
        let entity_id = match &after {
            Fragment::Element { id, .. } => Some(id.clone()),
            _ => None,
        };
        Self {
            kind,
            timestamp: now_millis(),
            before,
            after,
            entity_id,
            description: description.into(),
        }
    }

    pub fn target(&self) -> Target {
        self.after.target()
    }
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    undo_stack: VecDeque<HistoryAction>,
    redo_stack: Vec<HistoryAction>,
    max_depth: usize,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

impl HistoryLog {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::with_capacity(max_depth.min(1024)),
            redo_stack: Vec::new(),
            max_depth,
        }
    }

    /// Append an action, clearing redo. Oldest entries fall off past the cap.
    pub fn push(&mut self, action: HistoryAction) {
        self.redo_stack.clear();
        if self.max_depth == 0 {
            return;
        }
        self.undo_stack.push_back(action);
        while self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }

    /// Push only when the mutation was local. Returns whether it was kept.
    pub fn record(&mut self, origin: Origin, action: HistoryAction) -> bool {
        match origin {
            Origin::Local => {
                log::debug!("History: recorded {}", action.description);
                self.push(action);
                true
            }
            Origin::Remote => false,
        }
    }

    /// Restore the newest action's `before` and move it to redo.
    pub fn undo(&mut self, store: &mut StateStore) -> Option<HistoryAction> {
        let action = self.undo_stack.pop_back()?;
        store.update(|doc| action.before.apply(doc));
        log::debug!("History: undo {}", action.description);
        self.redo_stack.push(action.clone());
        Some(action)
    }

    /// Re-apply the newest undone action's `after` and move it back.
    pub fn redo(&mut self, store: &mut StateStore) -> Option<HistoryAction> {
        let action = self.redo_stack.pop()?;
        store.update(|doc| action.after.apply(doc));
        log::debug!("History: redo {}", action.description);
        self.undo_stack.push_back(action.clone());
        Some(action)
    }

    /// Drop every recorded action touching `target`.
    pub fn invalidate(&mut self, target: &Target) -> usize {
        let before = self.undo_stack.len() + self.redo_stack.len();
        self.undo_stack.retain(|a| &a.target() != target);
        self.redo_stack.retain(|a| &a.target() != target);
        before - self.undo_stack.len() - self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }
}
