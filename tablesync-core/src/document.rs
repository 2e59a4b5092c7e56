//! Session document: the single shared aggregate every peer holds a copy of.
//!
//! ```text
//! SessionDocument
//! ├── grid: GridSettings
//! ├── elements: Vec<CanvasElement>      (insertion order, ids unique)
//! ├── fog: FogState                     (replaced wholesale on sync)
//! ├── players: BTreeMap<PeerId, Player> (roster)
//! ├── combat: Option<CombatState>       (replaced wholesale on sync)
//! ├── dice_log: Vec<DiceRoll>           (bounded)
//! └── chat_log: Vec<ChatMessage>        (bounded)
//! ```
//!
//! Field names serialize in camelCase so payloads interoperate with
//! peers that speak the same JSON channel contract.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque per-membership peer identity assigned by the transport.
pub type PeerId = String;

/// Canvas element identifier, unique within a document.
pub type ElementId = String;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// 2D position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Closed polygon, vertices in order.
pub type Polygon = Vec<Point>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSettings {
    pub enabled: bool,
    /// Cell size in scene units
    pub size: f64,
    pub color: String,
    pub opacity: f64,
    pub snap: bool,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 50.0,
            color: "#000000".to_string(),
            opacity: 0.2,
            snap: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    #[default]
    Token,
    Image,
    Shape,
    Text,
    Drawing,
}

/// Who may see an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    All,
    Host,
    Hidden,
}

/// A token, image, shape, text block or freehand drawing on the canvas.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasElement {
    pub id: ElementId,
    #[serde(default)]
    pub kind: ElementKind,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub color: String,
    /// Image source for `image` and `token` elements
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub font_size: f64,
    /// Vertices for `shape` and `drawing` elements
    #[serde(default)]
    pub points: Vec<Point>,
}

impl CanvasElement {
    /// Create an element with a default 50×50 footprint.
    pub fn new(id: impl Into<ElementId>, kind: ElementKind, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width: 50.0,
            height: 50.0,
            ..Self::default()
        }
    }

    /// Build a fresh element from a patch; absent fields take defaults.
    pub fn from_patch(patch: &ElementPatch) -> Self {
        let mut element = Self {
            id: patch.id.clone(),
            width: 50.0,
            height: 50.0,
            ..Self::default()
        };
        element.apply_patch(patch);
        element
    }

    /// Overwrite the fields present in `patch`, leave the rest untouched.
    pub fn apply_patch(&mut self, patch: &ElementPatch) {
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(width) = patch.width {
            self.width = width;
        }
        if let Some(height) = patch.height {
            self.height = height;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(z_index) = patch.z_index {
            self.z_index = z_index;
        }
        if let Some(visibility) = patch.visibility {
            self.visibility = visibility;
        }
        if let Some(locked) = patch.locked {
            self.locked = locked;
        }
        if let Some(label) = &patch.label {
            self.label = label.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some(src) = &patch.src {
            self.src = src.clone();
        }
        if let Some(text) = &patch.text {
            self.text = text.clone();
        }
        if let Some(font_size) = patch.font_size {
            self.font_size = font_size;
        }
        if let Some(points) = &patch.points {
            self.points = points.clone();
        }
    }
}

/// Partial element payload carried by `elUpdate`.
///
/// Only `id` is mandatory. `{"id":"t1","x":5,"y":5}` moves `t1` and
/// changes nothing else.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPatch {
    pub id: ElementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ElementKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
}

impl ElementPatch {
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Patch that only moves an element.
    pub fn position(id: impl Into<ElementId>, x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::new(id)
        }
    }

    /// Patch carrying every field of `element`.
    pub fn from_element(element: &CanvasElement) -> Self {
        Self {
            id: element.id.clone(),
            kind: Some(element.kind),
            x: Some(element.x),
            y: Some(element.y),
            width: Some(element.width),
            height: Some(element.height),
            rotation: Some(element.rotation),
            z_index: Some(element.z_index),
            visibility: Some(element.visibility),
            locked: Some(element.locked),
            label: Some(element.label.clone()),
            color: Some(element.color.clone()),
            src: Some(element.src.clone()),
            text: Some(element.text.clone()),
            font_size: Some(element.font_size),
            points: Some(element.points.clone()),
        }
    }

    fn touches_position(&self) -> bool {
        self.x.is_some() || self.y.is_some()
    }

    /// True when the patch changes position and nothing else.
    pub fn is_move_only(&self) -> bool {
        self.touches_position()
            && !self.touches_recorded_property()
            && self.kind.is_none()
            && self.src.is_none()
            && self.font_size.is_none()
            && self.points.is_none()
    }

    /// True when the patch edits a property on the undo allow-list.
    ///
    /// Freehand point streams, image sources and font sizes are not on the
    /// list; they change too often while a tool is active.
    pub fn touches_recorded_property(&self) -> bool {
        self.width.is_some()
            || self.height.is_some()
            || self.rotation.is_some()
            || self.z_index.is_some()
            || self.visibility.is_some()
            || self.locked.is_some()
            || self.label.is_some()
            || self.color.is_some()
            || self.text.is_some()
    }
}

/// Fog of war: enabled flag plus the polygons that have been revealed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FogState {
    pub enabled: bool,
    #[serde(default)]
    pub revealed: Vec<Polygon>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    #[default]
    Player,
}

/// Roster entry for a participant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PeerId,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Point>,
}

impl Player {
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>, color: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
            role,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Combatant {
    pub id: String,
    pub name: String,
    pub initiative: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp: Option<i32>,
}

/// Initiative order. `turn_index` always points into `combatants`, or is
/// zero and ignored when the list is empty.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatState {
    pub active: bool,
    pub round: u32,
    pub turn_index: usize,
    #[serde(default)]
    pub combatants: Vec<Combatant>,
}

impl CombatState {
    /// Start an encounter, ordered by descending initiative.
    pub fn start(mut combatants: Vec<Combatant>) -> Self {
        combatants.sort_by(|a, b| b.initiative.cmp(&a.initiative));
        Self {
            active: true,
            round: 1,
            turn_index: 0,
            combatants,
        }
    }

    /// Clamp `turn_index` back into range.
    pub fn normalize(&mut self) {
        if self.combatants.is_empty() {
            self.turn_index = 0;
        } else if self.turn_index >= self.combatants.len() {
            self.turn_index = self.combatants.len() - 1;
        }
    }

    /// Move to the next combatant, wrapping into a new round.
    pub fn advance(&mut self) {
        if self.combatants.is_empty() {
            return;
        }
        self.turn_index += 1;
        if self.turn_index >= self.combatants.len() {
            self.turn_index = 0;
            self.round += 1;
        }
    }

    pub fn current(&self) -> Option<&Combatant> {
        if !self.active {
            return None;
        }
        self.combatants.get(self.turn_index)
    }
}

/// A finished dice roll. Formula parsing happens before this point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiceRoll {
    pub id: String,
    pub peer_id: PeerId,
    pub player_name: String,
    pub formula: String,
    pub results: Vec<i64>,
    pub total: i64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub peer_id: PeerId,
    pub author: String,
    pub text: String,
    pub timestamp: u64,
}

/// Result of applying an element patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub id: Uuid,
    pub name: String,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub grid: GridSettings,
    #[serde(default)]
    pub elements: Vec<CanvasElement>,
    #[serde(default)]
    pub fog: FogState,
    #[serde(default)]
    pub players: BTreeMap<PeerId, Player>,
    #[serde(default)]
    pub combat: Option<CombatState>,
    #[serde(default)]
    pub dice_log: Vec<DiceRoll>,
    #[serde(default)]
    pub chat_log: Vec<ChatMessage>,
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self::new("Untitled session")
    }
}

impl SessionDocument {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            grid: GridSettings::default(),
            elements: Vec::new(),
            fog: FogState::default(),
            players: BTreeMap::new(),
            combat: None,
            dice_log: Vec::new(),
            chat_log: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    pub fn element(&self, id: &str) -> Option<&CanvasElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn element_position(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Merge into an existing element, or insert when the id is new.
    pub fn upsert_element(&mut self, patch: &ElementPatch) -> Upsert {
        match self.elements.iter_mut().find(|e| e.id == patch.id) {
            Some(existing) => {
                existing.apply_patch(patch);
                Upsert::Updated
            }
            None => {
                self.elements.push(CanvasElement::from_patch(patch));
                Upsert::Inserted
            }
        }
    }

    /// Put a whole element at `position`, replacing any element with the
    /// same id in place.
    pub fn put_element(&mut self, element: CanvasElement, position: usize) {
        match self.element_position(&element.id) {
            Some(existing) => self.elements[existing] = element,
            None => {
                let position = position.min(self.elements.len());
                self.elements.insert(position, element);
            }
        }
    }

    /// Remove by id. Returns the former position and element.
    pub fn remove_element(&mut self, id: &str) -> Option<(usize, CanvasElement)> {
        let position = self.element_position(id)?;
        Some((position, self.elements.remove(position)))
    }

    /// Z-index one above the current top element.
    pub fn next_z_index(&self) -> i32 {
        self.elements
            .iter()
            .map(|e| e.z_index)
            .max()
            .map_or(0, |z| z.saturating_add(1))
    }

    pub fn set_combat(&mut self, combat: Option<CombatState>) {
        self.combat = combat.map(|mut c| {
            c.normalize();
            c
        });
    }

    /// Append a roll unless one with the same id is already logged.
    pub fn push_dice_roll(&mut self, roll: DiceRoll, cap: usize) -> bool {
        if self.dice_log.iter().any(|r| r.id == roll.id) {
            return false;
        }
        self.dice_log.push(roll);
        trim_front(&mut self.dice_log, cap);
        true
    }

    /// Append a chat message unless its id is already logged.
    pub fn push_chat(&mut self, message: ChatMessage, cap: usize) -> bool {
        if self.chat_log.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.chat_log.push(message);
        trim_front(&mut self.chat_log, cap);
        true
    }

    pub fn upsert_player(&mut self, player: Player) {
        self.players.insert(player.id.clone(), player);
    }

    pub fn remove_player(&mut self, peer_id: &str) -> Option<Player> {
        self.players.remove(peer_id)
    }
}

fn trim_front<T>(log: &mut Vec<T>, cap: usize) {
    if log.len() > cap {
        let excess = log.len() - cap;
        log.drain(..excess);
    }
}
