//! Relay client: a [`PeerTransport`] backed by a WebSocket connection to a
//! [`RelayServer`](super::RelayServer).

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tablesync_core::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::RelayFrame;
use crate::transport::{validate_channel, PeerTransport, TransportError, TransportEvent, TransportSession};

/// Opens room sessions through a relay at `url` (e.g. `ws://127.0.0.1:9470`).
#[derive(Debug, Clone)]
pub struct RelayTransport {
    url: String,
}

impl RelayTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl PeerTransport for RelayTransport {
    type Session = RelaySession;

    fn open(
        &self,
        app_namespace: &str,
        room_id: &str,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send {
        let url = self.url.clone();
        let namespace = app_namespace.to_string();
        let room = room_id.to_string();
        async move { RelaySession::connect(&url, namespace, room).await }
    }
}

pub struct RelaySession {
    peer_id: PeerId,
    /// Encoded frames for the writer task; `None` after leave
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    reader: JoinHandle<()>,
}

impl RelaySession {
    async fn connect(url: &str, namespace: String, room: String) -> Result<Self, TransportError> {
        let open_failed = |e: String| TransportError::OpenFailed(e);

        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| open_failed(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = RelayFrame::Hello { namespace, room }
            .encode()
            .map_err(|e| open_failed(e.to_string()))?;
        ws_writer
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|e| open_failed(e.to_string()))?;

        let (peer_id, peers) = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Welcome { peer_id, peers }) => break (peer_id, peers),
                    Ok(RelayFrame::Rejected { reason }) => return Err(open_failed(reason)),
                    Ok(other) => log::debug!("Ignoring {other:?} before Welcome"),
                    Err(e) => return Err(open_failed(e.to_string())),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(open_failed("relay closed the connection".into()))
                }
                Some(Err(e)) => return Err(open_failed(e.to_string())),
                Some(Ok(_)) => {}
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        for peer in peers {
            let _ = event_tx.send(TransportEvent::PeerJoined(peer));
        }

        // Writer task: drains outgoing frames, closes the socket once the
        // sender is dropped
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let event = match RelayFrame::decode(&data) {
                            Ok(RelayFrame::Deliver { from, channel, payload }) => {
                                TransportEvent::Message { channel, payload, from }
                            }
                            Ok(RelayFrame::PeerJoined(peer)) => TransportEvent::PeerJoined(peer),
                            Ok(RelayFrame::PeerLeft(peer)) => TransportEvent::PeerLeft(peer),
                            Ok(other) => {
                                log::debug!("Ignoring unexpected relay frame {other:?}");
                                continue;
                            }
                            Err(e) => {
                                log::warn!("Failed to decode relay frame: {e}");
                                continue;
                            }
                        };
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break frame.map(|f| f.reason.to_string()),
                    None => break None,
                    Some(Err(e)) => break Some(e.to_string()),
                    Some(Ok(_)) => {}
                }
            };
            let _ = event_tx.send(TransportEvent::Closed(reason));
        });

        log::info!("Joined relay {url} as {peer_id}");
        Ok(Self {
            peer_id,
            outgoing: Some(out_tx),
            events: Some(event_rx),
            reader,
        })
    }
}

impl TransportSession for RelaySession {
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
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        let frame = RelayFrame::Send {
            channel: channel.to_string(),
            targets: targets.map(<[PeerId]>::to_vec),
            payload,
        }
        .encode()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        outgoing
            .send(frame)
            .map_err(|_| TransportError::SendFailed("relay connection closed".into()))
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    fn leave(&mut self) {
        if self.outgoing.take().is_some() {
            self.reader.abort();
            log::debug!("Left relay session as {}", self.peer_id);
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.leave();
    }
}
