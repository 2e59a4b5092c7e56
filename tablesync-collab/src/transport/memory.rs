//! In-process transport.
//!
//! A `MemoryNetwork` is a hub of rooms keyed by `(namespace, room)`. Each
//! member owns an unbounded FIFO queue, so per-sender ordering holds the same
//! way it does on a real reliable channel. Cloning the network shares the hub.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tablesync_core::PeerId;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{validate_channel, PeerTransport, TransportError, TransportEvent, TransportSession};

type RoomKey = (String, String);
type Members = BTreeMap<PeerId, mpsc::UnboundedSender<TransportEvent>>;

#[derive(Default)]
struct NetworkState {
    rooms: HashMap<RoomKey, Members>,
    /// When set, every `open` fails with this cause
    unavailable: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `open` calls fail (`Some`) or succeed again (`None`).
    pub fn set_unavailable(&self, reason: Option<&str>) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = reason.map(str::to_string);
        }
    }

    pub fn peer_count(&self, namespace: &str, room: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.rooms.get(&(namespace.to_string(), room.to_string())).map(|m| m.len()))
            .unwrap_or(0)
    }

    /// Tear a room down, delivering `Closed` to every member.
    pub fn close_room(&self, namespace: &str, room: &str, reason: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(members) = state.rooms.remove(&(namespace.to_string(), room.to_string())) {
            for tx in members.values() {
                let _ = tx.send(TransportEvent::Closed(Some(reason.to_string())));
            }
        }
    }

    fn join(&self, namespace: &str, room: &str) -> Result<MemorySession, TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::OpenFailed("network lock poisoned".into()))?;
        if let Some(reason) = &state.unavailable {
            return Err(TransportError::OpenFailed(reason.clone()));
        }

        let peer_id = short_peer_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (namespace.to_string(), room.to_string());
        let members = state.rooms.entry(key.clone()).or_default();

        for (existing, existing_tx) in members.iter() {
            let _ = existing_tx.send(TransportEvent::PeerJoined(peer_id.clone()));
            let _ = tx.send(TransportEvent::PeerJoined(existing.clone()));
        }
        members.insert(peer_id.clone(), tx);
        log::debug!("Memory transport: {peer_id} joined {namespace}/{room}");

        Ok(MemorySession {
            network: self.clone(),
            key,
            peer_id,
            events: Some(rx),
            joined: true,
        })
    }
}

impl PeerTransport for MemoryNetwork {
    type Session = MemorySession;

    fn open(
        &self,
        app_namespace: &str,
        room_id: &str,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send {
        std::future::ready(self.join(app_namespace, room_id))
    }
}

/// 12 hex characters, unique per membership.
fn short_peer_id() -> PeerId {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

pub struct MemorySession {
    network: MemoryNetwork,
    key: RoomKey,
    peer_id: PeerId,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    joined: bool,
}

impl TransportSession for MemorySession {
    fn local_peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(
        &self,
        channel: &str,
        payload: Vec<u8>,
        targets: Option<&[PeerId]>,
    ) -> Result<(), TransportError> {
        validate_channel(channel)?;
        if !self.joined {
            return Err(TransportError::NotConnected);
        }
        let state = self
            .network
            .state
            .lock()
            .map_err(|_| TransportError::SendFailed("network lock poisoned".into()))?;
        let members = state
            .rooms
            .get(&self.key)
            .filter(|m| m.contains_key(&self.peer_id))
            .ok_or(TransportError::NotConnected)?;

        let message = |tx: &mpsc::UnboundedSender<TransportEvent>| {
            let _ = tx.send(TransportEvent::Message {
                channel: channel.to_string(),
                payload: payload.clone(),
                from: self.peer_id.clone(),
            });
        };
        match targets {
            Some(targets) => {
                for target in targets {
                    if target == &self.peer_id {
                        continue;
                    }
                    if let Some(tx) = members.get(target) {
                        message(tx);
                    }
                }
            }
            None => {
                for (peer, tx) in members {
                    if peer != &self.peer_id {
                        message(tx);
                    }
                }
            }
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn leave(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;
        let Ok(mut state) = self.network.state.lock() else {
            return;
        };
        if let Some(members) = state.rooms.get_mut(&self.key) {
            members.remove(&self.peer_id);
            for tx in members.values() {
                let _ = tx.send(TransportEvent::PeerLeft(self.peer_id.clone()));
            }
            if members.is_empty() {
                state.rooms.remove(&self.key);
            }
        }
        log::debug!("Memory transport: {} left {}/{}", self.peer_id, self.key.0, self.key.1);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.leave();
    }
}
