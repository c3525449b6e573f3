//! WebSocket [`NetworkProvider`] talking to a relay server.
//!
//! One socket per document channel. The socket is split into a writer
//! task fed from an unbounded queue, so `send` never blocks the editor,
//! and a reader task that decodes frames and forwards everything not
//! sent by us.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use playpen_core::DocumentId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::provider::{ConnectionState, Inbound, NetworkProvider, StateCell};

pub struct SyncClient {
    server_url: String,
    state: StateCell,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    /// Reader of the previous socket, aborted but maybe not yet stopped.
    retired: Option<JoinHandle<()>>,
    connected_once: bool,
}

impl SyncClient {
    /// `server_url` is the relay base, e.g. `ws://127.0.0.1:9090`; the
    /// document id is appended as the last path segment.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            state: StateCell::new(),
            outgoing: None,
            reader: None,
            retired: None,
            connected_once: false,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn channel_url(&self, doc_id: DocumentId) -> String {
        format!("{}/{doc_id}", self.server_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl NetworkProvider for SyncClient {
    async fn connect(
        &mut self,
        doc_id: DocumentId,
        peer: &PeerInfo,
    ) -> Result<Inbound, ProtocolError> {
        self.disconnect();
        if let Some(task) = self.retired.take() {
            let _ = task.await;
        }
        self.state.set(if self.connected_once {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let url = self.channel_url(doc_id);
        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Could not reach relay at {url}: {e}");
                self.state.set(ConnectionState::Disconnected);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        // Runs until the sender is dropped, then closes the socket so
        // anything queued before disconnect still goes out.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = SyncMessage::peer_joined(doc_id, peer)?.encode()?;
        out_tx
            .send(join)
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        self.outgoing = Some(out_tx);
        self.connected_once = true;
        // Set before the reader exists so a socket that closes at once
        // still ends up Disconnected.
        self.state.set(ConnectionState::Connected);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer_id = peer.peer_id;
        let state = self.state.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) if msg.peer_id == peer_id => {}
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable message: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket error: {e}");
                        break;
                    }
                }
            }
            log::info!("Relay connection for {peer_id} closed");
            state.set(ConnectionState::Disconnected);
        });

        self.reader = Some(reader);
        log::info!("Connected to {url} as {}", peer.name);
        Ok(inbound_rx)
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        if self.state.get() != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let tx = self
            .outgoing
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn disconnect(&mut self) {
        self.outgoing = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
            self.retired = Some(reader);
        }
        self.state.set(ConnectionState::Disconnected);
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
