//! Relay server: accepts WebSocket peers and routes frames within rooms.
//!
//! Each connection runs one task that `select!`s between frames arriving
//! from its socket and frames queued for it by other peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tablesync_core::PeerId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{RelayError, RelayFrame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this are rejected
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            max_peers_per_room: 16,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `TABLESYNC_RELAY_ADDR` and `TABLESYNC_MAX_PEERS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TABLESYNC_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("TABLESYNC_MAX_PEERS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.max_peers_per_room = n,
                _ => log::warn!("Ignoring invalid TABLESYNC_MAX_PEERS={raw}"),
            }
        }
        config
    }
}

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_routed: u64,
    pub rejected_joins: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_routed: AtomicU64,
    rejected_joins: AtomicU64,
}

type RoomKey = (String, String);
type PeerQueues = HashMap<PeerId, mpsc::UnboundedSender<Arc<Vec<u8>>>>;
type Rooms = Arc<RwLock<HashMap<RoomKey, PeerQueues>>>;

pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let max_peers = self.config.max_peers_per_room;

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, rooms, stats.clone(), max_peers).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_routed: self.stats.frames_routed.load(Ordering::Relaxed),
            rejected_joins: self.stats.rejected_joins.load(Ordering::Relaxed),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<AtomicRelayStats>,
    max_peers: usize,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first binary frame must be Hello
    let (namespace, room) = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                Ok(RelayFrame::Hello { namespace, room }) => break (namespace, room),
                Ok(other) => {
                    log::warn!("Expected Hello from {addr}, got {other:?}");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Failed to decode frame from {addr}: {e}");
                    return Ok(());
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(_)) => {}
        }
    };

    let key = (namespace, room);
    let peer_id: PeerId = Uuid::new_v4().simple().to_string()[..12].to_string();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

    let admitted = {
        let mut rooms_w = rooms.write().await;
        let peers = rooms_w.entry(key.clone()).or_default();
        if peers.len() >= max_peers {
            if peers.is_empty() {
                rooms_w.remove(&key);
            }
            None
        } else {
            let existing: Vec<PeerId> = peers.keys().cloned().collect();
            let joined = Arc::new(RelayFrame::PeerJoined(peer_id.clone()).encode()?);
            for tx in peers.values() {
                let _ = tx.send(joined.clone());
            }
            peers.insert(peer_id.clone(), out_tx);
            Some(existing)
        }
    };

    let Some(existing) = admitted else {
        stats.rejected_joins.fetch_add(1, Ordering::Relaxed);
        log::info!("Rejected {addr}: room {}/{} is full", key.0, key.1);
        let reject = RelayFrame::Rejected {
            reason: format!("room is full ({max_peers} peers)"),
        };
        ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
        let _ = ws_sender.close().await;
        return Ok(());
    };

    let welcome = RelayFrame::Welcome {
        peer_id: peer_id.clone(),
        peers: existing,
    };
    ws_sender.send(Message::Binary(welcome.encode()?.into())).await?;
    log::info!("Peer {peer_id} ({addr}) joined {}/{}", key.0, key.1);

    let result = route_loop(&mut ws_sender, &mut ws_receiver, &mut out_rx, &rooms, &key, &peer_id, &stats).await;

    // Cleanup runs whatever the loop's outcome
    {
        let mut rooms_w = rooms.write().await;
        if let Some(peers) = rooms_w.get_mut(&key) {
            peers.remove(&peer_id);
            if let Ok(left) = RelayFrame::PeerLeft(peer_id.clone()).encode() {
                let left = Arc::new(left);
                for tx in peers.values() {
                    let _ = tx.send(left.clone());
                }
            }
            if peers.is_empty() {
                rooms_w.remove(&key);
            }
        }
    }
    log::info!("Peer {peer_id} left {}/{}", key.0, key.1);
    result
}

type WsSink = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;
type WsSource = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

async fn route_loop(
    ws_sender: &mut WsSink,
    ws_receiver: &mut WsSource,
    out_rx: &mut mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    rooms: &Rooms,
    key: &RoomKey,
    peer_id: &PeerId,
    stats: &AtomicRelayStats,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                        Ok(RelayFrame::Send { channel, targets, payload }) => {
                            let deliver = Arc::new(
                                RelayFrame::Deliver { from: peer_id.clone(), channel, payload }.encode()?,
                            );
                            let rooms_r = rooms.read().await;
                            let Some(peers) = rooms_r.get(key) else { continue };
                            match targets {
                                Some(targets) => {
                                    for target in targets.iter().filter(|t| *t != peer_id) {
                                        if let Some(tx) = peers.get(target) {
                                            let _ = tx.send(deliver.clone());
                                        }
                                    }
                                }
                                None => {
                                    for (other, tx) in peers.iter() {
                                        if other != peer_id {
                                            let _ = tx.send(deliver.clone());
                                        }
                                    }
                                }
                            }
                            stats.frames_routed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(other) => log::debug!("Ignoring {other:?} from {peer_id}"),
                        Err(e) => log::warn!("Failed to decode frame from {peer_id}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {peer_id}: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }

            queued = out_rx.recv() => {
                match queued {
                    Some(bytes) => ws_sender.send(Message::Binary(bytes.to_vec().into())).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}
