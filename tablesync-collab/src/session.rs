//! Session controller: room lifecycle, full and incremental sync, desync
//! detection, and the local mutation API.
//!
//! ```text
//!             local API                      transport events
//!                 │                                 │
//!                 ▼                                 ▼
//!   ┌───────────────────────────┐     ┌───────────────────────────┐
//!   │ StateStore::update        │     │ Action::decode            │
//!   │ HistoryLog::record(Local) │     │ StateStore::update/replace│
//!   │ broadcast on channel      │     │ HistoryLog::invalidate    │
//!   └─────────────┬─────────────┘     └─────────────┬─────────────┘
//!                 └──────────► mark dirty ◄─────────┘ (remote: host only)
//! ```
//!
//! One controller runs per peer and every handler takes `&mut self`, so two
//! mutations never interleave. [`SessionController::process_next`] waits for
//! the next transport event, digest tick or persistence deadline and handles
//! it to completion.
//!
//! Roles are fixed per room. The host answers joins and `reqSync` with a
//! targeted full sync and broadcasts a digest on a fixed timer; followers
//! replace their document on sync and flag, but never repair, a digest
//! mismatch.

use std::collections::{BTreeSet, HashMap};
use std::future::pending;

use tablesync_core::{
    now_millis, ActionKind, ChatMessage, CombatState, DiceRoll, ElementPatch, FogState, Fragment,
    GridSettings, HistoryAction, HistoryLog, Origin, PeerId, Player, Point, Polygon, Role,
    SessionDocument, StateStore, Target,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::persistence::{SessionStore, StoreError};
use crate::protocol::{Action, ChannelKind, DigestPayload, FullSync, PingPayload};
use crate::transport::{PeerTransport, TransportError, TransportEvent, TransportSession};

/// Connection state as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Follower waiting for its first peer contact
    Connecting,
    Connected,
    /// Terminal until the next create/join
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Host,
    Follower,
}

/// Events emitted to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    /// A full sync replaced the whole document
    DocumentReplaced,
    /// A remote incremental message changed the document
    DocumentChanged(ChannelKind),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Cursor { peer_id: PeerId, point: Point },
    Ping { peer_id: PeerId, ping: PingPayload },
    DesyncChanged(bool),
    /// The host went away; the local document is kept as is
    HostLost,
}

/// Session errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    Transport(TransportError),
    Persistence(StoreError),
    NoSessionStore,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Persistence(e) => write!(f, "Persistence error: {e}"),
            Self::NoSessionStore => write!(f, "No session store configured"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Persistence(e)
    }
}

enum Wake {
    Event(Option<TransportEvent>),
    DigestTick,
    Persist,
}

pub struct SessionController<T: PeerTransport> {
    transport: T,
    config: SessionConfig,
    store: StateStore,
    history: HistoryLog,
    persistence: Option<Box<dyn SessionStore>>,

    session: Option<T::Session>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    subscriber: Option<mpsc::UnboundedSender<SessionEvent>>,

    room_id: Option<String>,
    role: Option<PeerRole>,
    state: ConnectionState,
    local_player: Option<Player>,
    host_peer: Option<PeerId>,
    peers: BTreeSet<PeerId>,
    cursors: HashMap<PeerId, Point>,
    desynced: bool,

    /// Host: sequence of the last full sync sent
    sync_seq: u64,
    /// Follower: sequence of the last full sync applied
    applied_sync_seq: u64,
    /// Follower: peer the last targeted `reqSync` went to
    sync_requested_from: Option<PeerId>,
    last_digest_sent_at: Option<u64>,
    digest_timer: Option<Interval>,
    persist_deadline: Option<Instant>,
}

impl<T: PeerTransport> SessionController<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let store = StateStore::with_limits(SessionDocument::default(), config.log_limits);
        let history = HistoryLog::new(config.history_depth);
        Self {
            transport,
            config,
            store,
            history,
            persistence: None,
            session: None,
            events_rx: None,
            subscriber: None,
            room_id: None,
            role: None,
            state: ConnectionState::Disconnected,
            local_player: None,
            host_peer: None,
            peers: BTreeSet::new(),
            cursors: HashMap::new(),
            desynced: false,
            sync_seq: 0,
            applied_sync_seq: 0,
            sync_requested_from: None,
            last_digest_sent_at: None,
            digest_timer: None,
            persist_deadline: None,
        }
    }

    /// Attach a store for debounced saves.
    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.persistence = Some(Box::new(store));
        self
    }

    /// Replace the event subscription. Earlier receivers stop getting events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn document(&self) -> &SessionDocument {
        self.store.document()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(PeerRole::Host)
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn local_peer_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.local_peer_id())
    }

    pub fn host_peer(&self) -> Option<&str> {
        self.host_peer.as_deref()
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    /// Last known cursor per remote peer. Never part of the document.
    pub fn cursors(&self) -> &HashMap<PeerId, Point> {
        &self.cursors
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    /// Milliseconds timestamp of the last digest this host sent.
    pub fn last_digest_sent_at(&self) -> Option<u64> {
        self.last_digest_sent_at
    }

    pub fn sync_seq(&self) -> u64 {
        self.sync_seq
    }

    pub fn has_pending_save(&self) -> bool {
        self.persist_deadline.is_some()
    }

    // ─── Room lifecycle ───────────────────────────────────────────────

    /// Open `room_id` as host.
    pub async fn create_room(&mut self, room_id: &str) -> Result<(), SessionError> {
        let session = self.open_session(room_id).await?;
        let peer_id = session.local_peer_id().to_string();

        let player = Player::new(
            peer_id.clone(),
            self.config.display_name.clone(),
            self.config.color.clone(),
            Role::Host,
        );
        self.store.update(|doc| doc.upsert_player(player.clone()));
        self.local_player = Some(player);
        self.role = Some(PeerRole::Host);
        self.host_peer = Some(peer_id.clone());
        self.digest_timer = self.new_digest_timer();

        log::info!("Hosting room {room_id} as {peer_id}");
        self.set_state(ConnectionState::Connected);
        self.mark_dirty();
        Ok(())
    }

    /// Open `room_id` as follower. Stays `Connecting` until a peer appears.
    pub async fn join_room(
        &mut self,
        room_id: &str,
        display_name: &str,
        color: &str,
    ) -> Result<(), SessionError> {
        let session = self.open_session(room_id).await?;
        let peer_id = session.local_peer_id().to_string();

        let player = Player::new(peer_id.clone(), display_name, color, Role::Player);
        self.store.update(|doc| doc.upsert_player(player.clone()));
        self.local_player = Some(player);
        self.role = Some(PeerRole::Follower);

        log::info!("Joined room {room_id} as {peer_id}, waiting for peers");
        Ok(())
    }

    async fn open_session(&mut self, room_id: &str) -> Result<&T::Session, SessionError> {
        self.leave_room();
        self.set_state(ConnectionState::Connecting);

        match self.transport.open(&self.config.app_namespace, room_id).await {
            Ok(mut session) => {
                self.events_rx = session.take_events();
                self.room_id = Some(room_id.to_string());
                Ok(self.session.insert(session))
            }
            Err(e) => {
                log::warn!("Failed to open room {room_id}: {e}");
                self.set_state(ConnectionState::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Leave the current room. Safe to call at any time.
    pub fn leave_room(&mut self) {
        if let Some(mut session) = self.session.take() {
            let peer_id = session.local_peer_id().to_string();
            let goodbye = Action::PlayerLeave(peer_id.clone());
            if let Ok(payload) = goodbye.encode() {
                if let Err(e) = session.send(goodbye.channel().name(), payload, None) {
                    log::debug!("plyLeave not delivered: {e}");
                }
            }
            session.leave();
            log::info!(
                "Left room {} as {peer_id}",
                self.room_id.as_deref().unwrap_or_default()
            );

            // Every roster id belonged to this membership
            if !self.store.document().players.is_empty() {
                self.store.update(|doc| doc.players.clear());
                self.mark_dirty();
            }
        }
        self.flush();

        self.events_rx = None;
        self.digest_timer = None;
        self.room_id = None;
        self.role = None;
        self.local_player = None;
        self.host_peer = None;
        self.peers.clear();
        self.cursors.clear();
        self.applied_sync_seq = 0;
        self.sync_requested_from = None;
        self.set_desynced(false);
        self.set_state(ConnectionState::Disconnected);
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Wait for one transport event, digest tick or save deadline and
    /// handle it. Returns `false` at once when there is nothing to wait for.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn process_next(&mut self) -> bool {
        if self.events_rx.is_none() && self.digest_timer.is_none() && self.persist_deadline.is_none() {
            return false;
        }

        let events = &mut self.events_rx;
        let timer = &mut self.digest_timer;
        let deadline = self.persist_deadline;

        let wake = tokio::select! {
            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => pending().await,
                }
            } => Wake::Event(event),
            _ = async {
                match timer.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => pending::<()>().await,
                }
            } => Wake::DigestTick,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => pending::<()>().await,
                }
            } => Wake::Persist,
        };

        match wake {
            Wake::Event(Some(event)) => self.handle_transport_event(event),
            Wake::Event(None) => self.handle_closed(None),
            Wake::DigestTick => {
                self.broadcast_digest();
            }
            Wake::Persist => self.flush(),
        }
        true
    }

    /// Handle every transport event that is already queued, without waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_transport_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerJoined(peer_id) => self.handle_peer_joined(peer_id),
            TransportEvent::PeerLeft(peer_id) => self.handle_peer_left(peer_id),
            TransportEvent::Message { channel, payload, from } => {
                self.handle_message(&channel, &payload, from)
            }
            TransportEvent::Closed(reason) => self.handle_closed(reason),
        }
    }

    fn handle_peer_joined(&mut self, peer_id: PeerId) {
        if !self.peers.insert(peer_id.clone()) {
            return;
        }
        log::info!("Peer {peer_id} joined");
        self.emit(SessionEvent::PeerJoined(peer_id.clone()));

        match self.role {
            Some(PeerRole::Host) => self.send_full_sync(&peer_id),
            Some(PeerRole::Follower) if self.state == ConnectionState::Connecting => {
                // plyJoin goes first so the requested sync already lists us
                if let Some(player) = self.local_player.clone() {
                    self.send_action(&Action::PlayerJoin(player), None);
                }
                self.send_action(&Action::RequestSync, Some(&[peer_id.clone()]));
                self.sync_requested_from = Some(peer_id);
                self.set_state(ConnectionState::Connected);
            }
            Some(PeerRole::Follower) => {
                // Late arrivals (possibly the host) still need our roster entry
                if let Some(player) = self.local_player.clone() {
                    self.send_action(&Action::PlayerJoin(player), Some(&[peer_id]));
                }
            }
            None => {}
        }
    }

    fn handle_peer_left(&mut self, peer_id: PeerId) {
        if !self.peers.remove(&peer_id) {
            return;
        }
        log::info!("Peer {peer_id} left");
        self.cursors.remove(&peer_id);

        let was_host = self.host_peer.as_deref() == Some(peer_id.as_str())
            || self
                .store
                .document()
                .players
                .get(&peer_id)
                .is_some_and(|p| p.role == Role::Host);
        self.remove_roster_entry(&peer_id);
        self.emit(SessionEvent::PeerLeft(peer_id));

        if was_host && self.role == Some(PeerRole::Follower) {
            log::warn!("Host left the room; keeping the last known document");
            self.host_peer = None;
            self.emit(SessionEvent::HostLost);
        }
    }

    fn handle_closed(&mut self, reason: Option<String>) {
        log::warn!("Transport closed: {}", reason.as_deref().unwrap_or("no reason"));
        if let Some(mut session) = self.session.take() {
            session.leave();
        }
        self.events_rx = None;
        self.digest_timer = None;
        self.peers.clear();
        self.cursors.clear();
        self.flush();
        self.set_state(ConnectionState::Error(
            reason.unwrap_or_else(|| "transport closed".to_string()),
        ));
    }

    fn handle_message(&mut self, channel: &str, payload: &[u8], from: PeerId) {
        let action = match Action::decode(channel, payload) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("Dropping message from {from}: {e}");
                return;
            }
        };
        let kind = action.channel();
        if !kind.is_transient() {
            log::debug!("Received {kind} from {from}");
        }

        match action {
            Action::Sync(sync) => self.apply_full_sync(*sync, from),
            Action::RequestSync => {
                if self.is_host() {
                    self.send_full_sync(&from);
                }
            }
            Action::Digest(digest) => self.check_digest(digest, from),
            Action::Cursor(point) => {
                self.cursors.insert(from.clone(), point);
                self.emit(SessionEvent::Cursor { peer_id: from, point });
            }
            Action::Ping(ping) => self.emit(SessionEvent::Ping { peer_id: from, ping }),
            other => self.apply_remote(other, from),
        }
    }

    /// Apply an incremental message from a peer. Never recorded in history.
    fn apply_remote(&mut self, action: Action, from: PeerId) {
        let channel = action.channel();
        let (changed, target) = match action {
            Action::ElementUpdate(patch) => {
                let target = Target::Element(patch.id.clone());
                self.store.update(|doc| doc.upsert_element(&patch));
                (true, Some(target))
            }
            Action::ElementDelete(id) => {
                if self.store.document().element(&id).is_none() {
                    log::debug!("elDelete for unknown element {id}");
                    (false, None)
                } else {
                    self.store.update(|doc| doc.remove_element(&id));
                    (true, Some(Target::Element(id)))
                }
            }
            Action::FogUpdate(fog) => {
                self.store.update(|doc| doc.fog = fog);
                (true, Some(Target::Fog))
            }
            Action::Combat(combat) => {
                self.store.update(|doc| doc.set_combat(combat));
                (true, Some(Target::Combat))
            }
            Action::Grid(grid) => {
                self.store.update(|doc| doc.grid = grid);
                (true, Some(Target::Grid))
            }
            Action::DiceRoll(roll) => (self.store.append_dice_roll(roll), None),
            Action::Chat(message) => (self.store.append_chat(message), None),
            Action::PlayerJoin(mut player) => {
                // Identity comes from the transport, not the payload. Only
                // followers announce themselves; the host entry rides in syncs.
                player.id = from.clone();
                if player.role != Role::Player {
                    log::warn!(
                        "plyJoin from {from} claims {:?}; recording as player",
                        player.role
                    );
                    player.role = Role::Player;
                }
                self.store.update(|doc| doc.upsert_player(player));
                (true, None)
            }
            Action::PlayerLeave(peer_id) => {
                if peer_id != from {
                    log::debug!("plyLeave from {from} names {peer_id}; using sender");
                }
                self.cursors.remove(&from);
                (self.remove_roster_entry(&from), None)
            }
            other => {
                log::debug!("Ignoring {} in incremental path", other.channel());
                (false, None)
            }
        };

        if let Some(target) = target {
            let dropped = self.history.invalidate(&target);
            if dropped > 0 {
                log::debug!("Dropped {dropped} history entries after remote {channel}");
            }
        }
        if changed {
            if self.is_host() {
                self.mark_dirty();
            }
            self.emit(SessionEvent::DocumentChanged(channel));
        }
    }

    fn remove_roster_entry(&mut self, peer_id: &str) -> bool {
        if !self.store.document().players.contains_key(peer_id) {
            return false;
        }
        self.store.update(|doc| doc.remove_player(peer_id));
        if self.is_host() {
            self.mark_dirty();
        }
        true
    }

    // ─── Full sync ────────────────────────────────────────────────────

    fn send_full_sync(&mut self, peer_id: &str) {
        self.sync_seq += 1;
        let sync = FullSync {
            document: self.store.snapshot(),
            sync_seq: self.sync_seq,
        };
        let target = [peer_id.to_string()];
        if self.send_action(&Action::Sync(Box::new(sync)), Some(&target)) {
            log::info!("Sent full sync #{} to {peer_id}", self.sync_seq);
        }
    }

    fn apply_full_sync(&mut self, sync: FullSync, from: PeerId) {
        if self.role != Some(PeerRole::Follower) {
            log::debug!("Ignoring full sync from {from}: not a follower");
            return;
        }
        let same_host = self.host_peer.as_deref() == Some(from.as_str());
        if sync.sync_seq != 0 && same_host && sync.sync_seq <= self.applied_sync_seq {
            log::debug!(
                "Dropping stale full sync #{} (applied #{})",
                sync.sync_seq,
                self.applied_sync_seq
            );
            return;
        }

        self.store.replace(sync.document);
        self.history.clear();
        self.applied_sync_seq = sync.sync_seq;
        self.host_peer = Some(from.clone());

        log::info!("Applied full sync #{} from {from}", sync.sync_seq);
        self.set_desynced(false);
        self.emit(SessionEvent::DocumentReplaced);

        // The first peer we asked may not have been the host. Our plyJoin
        // already reached the sender, so its answer to this request lists us.
        let unlisted = match &self.local_player {
            Some(player) => !self.store.document().players.contains_key(&player.id),
            None => false,
        };
        if unlisted && self.sync_requested_from.as_ref() != Some(&from) {
            log::debug!("Full sync from {from} predates our plyJoin; asking again");
            self.send_action(&Action::RequestSync, Some(&[from.clone()]));
            self.sync_requested_from = Some(from);
        }
    }

    /// Ask the host for a corrective full sync. Followers only.
    pub fn request_sync(&mut self) -> bool {
        if self.role != Some(PeerRole::Follower) {
            return false;
        }
        self.sync_requested_from = self.host_peer.clone();
        match self.host_peer.clone() {
            Some(host) => self.send_action(&Action::RequestSync, Some(&[host])),
            None => self.send_action(&Action::RequestSync, None),
        }
    }

    // ─── Desync detection ─────────────────────────────────────────────

    /// Broadcast the current digest. Hosts only; driven by the digest timer.
    pub fn broadcast_digest(&mut self) -> bool {
        if !self.is_host() {
            return false;
        }
        let sent_at = now_millis();
        let payload = DigestPayload {
            digest: self.store.digest(),
            sync_seq: self.sync_seq,
            sent_at,
        };
        self.last_digest_sent_at = Some(sent_at);
        self.send_action(&Action::Digest(payload), None)
    }

    fn check_digest(&mut self, payload: DigestPayload, from: PeerId) {
        if self.role != Some(PeerRole::Follower) {
            return;
        }
        if self.host_peer.is_none() {
            self.host_peer = Some(from);
        }
        let local = self.store.digest();
        self.set_desynced(!local.matches(&payload.digest));
    }

    fn set_desynced(&mut self, desynced: bool) {
        if self.desynced != desynced {
            self.desynced = desynced;
            if desynced {
                log::warn!("Local document diverged from host");
            }
            self.emit(SessionEvent::DesyncChanged(desynced));
        }
    }

    fn new_digest_timer(&self) -> Option<Interval> {
        let period = self.config.digest_interval;
        if period.is_zero() {
            return None;
        }
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(timer)
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Merge `patch` into its element, creating it when the id is new.
    ///
    /// A new element without a z-index is stacked above everything else.
    pub fn upsert_element(&mut self, mut patch: ElementPatch) {
        let existed = self.store.document().element(&patch.id).is_some();
        if !existed && patch.z_index.is_none() {
            patch.z_index = Some(self.store.document().next_z_index());
        }
        let before = Fragment::element_of(self.store.document(), &patch.id);
        self.store.update(|doc| doc.upsert_element(&patch));
        let after = Fragment::element_of(self.store.document(), &patch.id);

        if let Some(kind) = ActionKind::for_patch(&patch, existed) {
            let description = format!("{kind:?} {}", patch.id);
            self.history
                .record(Origin::Local, HistoryAction::new(kind, before, after, description));
        }
        self.broadcast(&Action::ElementUpdate(patch));
        self.mark_dirty();
    }

    /// Returns false when no element has this id.
    pub fn delete_element(&mut self, id: &str) -> bool {
        if self.store.document().element(id).is_none() {
            return false;
        }
        let before = Fragment::element_of(self.store.document(), id);
        self.store.update(|doc| doc.remove_element(id));
        let after = Fragment::element_of(self.store.document(), id);
        self.history.record(
            Origin::Local,
            HistoryAction::new(ActionKind::Delete, before, after, format!("Delete {id}")),
        );
        self.broadcast(&Action::ElementDelete(id.to_string()));
        self.mark_dirty();
        true
    }

    /// Returns false when no element has this id.
    pub fn move_element(&mut self, id: &str, x: f64, y: f64) -> bool {
        if self.store.document().element(id).is_none() {
            return false;
        }
        self.upsert_element(ElementPatch::position(id, x, y));
        true
    }

    pub fn set_fog(&mut self, fog: FogState) {
        let before = Fragment::fog_of(self.store.document());
        self.store.update(|doc| doc.fog = fog.clone());
        let after = Fragment::fog_of(self.store.document());
        self.history
            .record(Origin::Local, HistoryAction::new(ActionKind::Fog, before, after, "Fog"));
        self.broadcast(&Action::FogUpdate(fog));
        self.mark_dirty();
    }

    /// Add one revealed polygon, enabling fog if it was off.
    pub fn reveal_fog(&mut self, polygon: Polygon) {
        let mut fog = self.store.document().fog.clone();
        fog.enabled = true;
        fog.revealed.push(polygon);
        self.set_fog(fog);
    }

    pub fn set_combat(&mut self, combat: Option<CombatState>) {
        let before = Fragment::combat_of(self.store.document());
        self.store.update(|doc| doc.set_combat(combat));
        let after = Fragment::combat_of(self.store.document());
        self.history
            .record(Origin::Local, HistoryAction::new(ActionKind::Combat, before, after, "Combat"));
        // Broadcast the normalized value
        self.broadcast(&Action::Combat(self.store.document().combat.clone()));
        self.mark_dirty();
    }

    /// Returns false when no combat is running.
    pub fn advance_turn(&mut self) -> bool {
        let Some(mut combat) = self.store.document().combat.clone() else {
            return false;
        };
        combat.advance();
        self.set_combat(Some(combat));
        true
    }

    pub fn set_grid(&mut self, grid: GridSettings) {
        let before = Fragment::grid_of(self.store.document());
        self.store.update(|doc| doc.grid = grid.clone());
        let after = Fragment::grid_of(self.store.document());
        self.history
            .record(Origin::Local, HistoryAction::new(ActionKind::Grid, before, after, "Grid"));
        self.broadcast(&Action::Grid(grid));
        self.mark_dirty();
    }

    /// Log an already rolled formula and share it.
    pub fn roll_dice(&mut self, formula: &str, results: Vec<i64>) -> DiceRoll {
        let roll = DiceRoll {
            id: Uuid::new_v4().to_string(),
            peer_id: self.local_peer_id().unwrap_or_default().to_string(),
            player_name: self.local_name(),
            formula: formula.to_string(),
            total: results.iter().sum(),
            results,
            timestamp: now_millis(),
        };
        self.store.append_dice_roll(roll.clone());
        self.broadcast(&Action::DiceRoll(roll.clone()));
        self.mark_dirty();
        roll
    }

    pub fn send_chat(&mut self, text: &str) -> ChatMessage {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            peer_id: self.local_peer_id().unwrap_or_default().to_string(),
            author: self.local_name(),
            text: text.to_string(),
            timestamp: now_millis(),
        };
        self.store.append_chat(message.clone());
        self.broadcast(&Action::Chat(message.clone()));
        self.mark_dirty();
        message
    }

    /// Transient; the document is not touched.
    pub fn send_cursor(&mut self, point: Point) -> bool {
        self.broadcast(&Action::Cursor(point))
    }

    /// Transient; the document is not touched.
    pub fn send_ping(&mut self, point: Point) -> bool {
        let color = self
            .local_player
            .as_ref()
            .map_or_else(|| self.config.color.clone(), |p| p.color.clone());
        self.broadcast(&Action::Ping(PingPayload {
            x: point.x,
            y: point.y,
            color,
        }))
    }

    fn local_name(&self) -> String {
        self.local_player
            .as_ref()
            .map_or_else(|| self.config.display_name.clone(), |p| p.name.clone())
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    /// Undo the newest local action. Peers are not told; see [`Self::rebroadcast`].
    pub fn undo(&mut self) -> Option<HistoryAction> {
        let action = self.history.undo(&mut self.store)?;
        self.mark_dirty();
        Some(action)
    }

    pub fn redo(&mut self) -> Option<HistoryAction> {
        let action = self.history.redo(&mut self.store)?;
        self.mark_dirty();
        Some(action)
    }

    /// Send the current state of whatever `action` touched through the
    /// normal incremental channel.
    pub fn rebroadcast(&mut self, action: &HistoryAction) -> bool {
        let doc = self.store.document();
        let message = match action.target() {
            Target::Element(id) => match doc.element(&id) {
                Some(element) => Action::ElementUpdate(ElementPatch::from_element(element)),
                None => Action::ElementDelete(id),
            },
            Target::Fog => Action::FogUpdate(doc.fog.clone()),
            Target::Combat => Action::Combat(doc.combat.clone()),
            Target::Grid => Action::Grid(doc.grid.clone()),
        };
        self.broadcast(&message)
    }

    // ─── Saved sessions ───────────────────────────────────────────────

    /// Start a blank document.
    pub fn new_session(&mut self, name: &str) {
        let mut document = SessionDocument::new(name);
        if let Some(player) = &self.local_player {
            document.upsert_player(player.clone());
        }
        self.store.replace(document);
        self.history.clear();
        self.mark_dirty();
    }

    /// Load a saved session into the store.
    pub fn open_saved(&mut self, id: Uuid) -> Result<(), SessionError> {
        let store = self.persistence.as_ref().ok_or(SessionError::NoSessionStore)?;
        let mut document = store.load(id)?;
        document.players.clear();
        if let Some(player) = &self.local_player {
            document.upsert_player(player.clone());
        }
        self.store.replace(document);
        self.history.clear();
        log::info!("Opened saved session {id}");
        Ok(())
    }

    /// Save now if a save is pending.
    pub fn flush(&mut self) {
        if self.persist_deadline.take().is_none() {
            return;
        }
        let Some(store) = &self.persistence else {
            return;
        };
        let is_host = self.role != Some(PeerRole::Follower);
        match store.save(self.store.document(), is_host) {
            Ok(summary) => log::debug!("Saved session {} ({} elements)", summary.id, summary.element_count),
            Err(e) => log::warn!("Failed to save session: {e}"),
        }
    }

    fn mark_dirty(&mut self) {
        if self.persistence.is_some() {
            self.persist_deadline = Some(Instant::now() + self.config.persist_debounce);
        }
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    fn broadcast(&self, action: &Action) -> bool {
        self.send_action(action, None)
    }

    fn send_action(&self, action: &Action, targets: Option<&[PeerId]>) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let payload = match action.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to encode {}: {e}", action.channel());
                return false;
            }
        };
        match session.send(action.channel().name(), payload, targets) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send {}: {e}", action.channel());
                false
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::debug!("Connection state {:?} -> {state:?}", self.state);
            self.state = state.clone();
            self.emit(SessionEvent::ConnectionChanged(state));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(tx) = &self.subscriber {
            if tx.send(event).is_err() {
                self.subscriber = None;
            }
        }
    }
}

impl<T: PeerTransport> Drop for SessionController<T> {
    fn drop(&mut self) {
        self.flush();
    }
}
