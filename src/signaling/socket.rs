//! # Signaling Socket
//!
//! Persistent WebSocket to the signaling server. A single owned task
//! multiplexes three streams: outgoing messages from the client, incoming
//! JSON frames from the server, and the heartbeat interval. The socket never
//! reconnects on its own; [`MeshClient::reconnect`](crate::MeshClient)
//! builds a fresh one.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::MeshOptions;
use crate::error::{Error, Result};
use crate::PeerId;

use super::{ClientMessage, ServerMessage};

/// Events surfaced to the owning client.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// A signaling message arrived.
    Message(ServerMessage),
    /// The transport failed; a `Closed` event follows.
    Error(String),
    /// The socket is gone (remote close, local shutdown, or failure).
    Closed,
}

/// Build the WebSocket endpoint for a session.
pub(crate) fn socket_url(options: &MeshOptions, id: &PeerId, token: &str) -> String {
    let (_, ws_scheme) = options.schemes();
    format!(
        "{ws_scheme}://{host}:{port}{path}peerjs?key={key}&id={id}&token={token}",
        host = options.host,
        port = options.port,
        path = options.normalized_path(),
        key = options.key,
    )
}

/// Handle to the socket task.
pub struct Socket {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

impl Socket {
    /// Connect and spawn the socket task. Incoming traffic and lifecycle
    /// transitions are delivered through `events`.
    pub async fn connect(
        options: &MeshOptions,
        id: &PeerId,
        token: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> Result<Self> {
        let url = socket_url(options, id, token);
        tracing::debug!("Connecting signaling socket: {}", url);

        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let ping_interval = options.ping_interval;

        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval_at(
                tokio::time::Instant::now() + ping_interval,
                ping_interval,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = outgoing_rx.recv() => match command {
                        Some(message) => {
                            let frame = match serde_json::to_string(&message) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    tracing::warn!("Dropping unencodable signaling message: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                                tracing::warn!("Signaling send failed: {}", e);
                                let _ = events.send(SocketEvent::Error(e.to_string()));
                                let _ = events.send(SocketEvent::Closed);
                                break;
                            }
                        }
                        // All senders dropped: shut down cleanly.
                        None => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },

                    incoming = source.next() => match incoming {
                        Some(Ok(WsMessage::Text(frame))) => {
                            match serde_json::from_str::<ServerMessage>(&frame) {
                                Ok(message) => {
                                    tracing::trace!("Signaling message: {:?}", message);
                                    let _ = events.send(SocketEvent::Message(message));
                                }
                                Err(e) => {
                                    tracing::warn!("Discarding malformed signaling frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::info!("Signaling socket closed by server");
                            let _ = events.send(SocketEvent::Closed);
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/pong and binary frames carry nothing for us.
                        }
                        Some(Err(e)) => {
                            tracing::warn!("Signaling socket error: {}", e);
                            let _ = events.send(SocketEvent::Error(e.to_string()));
                            let _ = events.send(SocketEvent::Closed);
                            break;
                        }
                    },

                    _ = heartbeat.tick() => {
                        let frame = match serde_json::to_string(&ClientMessage::Heartbeat) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        };
                        if sink.send(WsMessage::Text(frame)).await.is_err() {
                            let _ = events.send(SocketEvent::Closed);
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Signaling socket task stopped");
        });

        Ok(Self { outgoing, task })
    }

    /// Queue a message for the server.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        self.outgoing
            .send(message)
            .map_err(|_| Error::SocketClosed("signaling socket task is gone".into()))
    }

    /// Stop the socket task. Safe to call repeatedly.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_shape() {
        let options = MeshOptions::default();
        let url = socket_url(&options, &"alice".to_string(), "tok123");
        assert_eq!(
            url,
            "wss://0.peerjs.com:443/peerjs?key=peerjs&id=alice&token=tok123"
        );
    }

    #[test]
    fn test_socket_url_insecure_custom_path() {
        let options = MeshOptions {
            host: "localhost".to_string(),
            port: 9000,
            path: "/myapp".to_string(),
            secure: false,
            ..Default::default()
        };
        let url = socket_url(&options, &"a".to_string(), "t");
        assert_eq!(url, "ws://localhost:9000/myapp/peerjs?key=peerjs&id=a&token=t");
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_socket_error() {
        // Port 9 (discard) is almost certainly closed; connect must fail
        // with a transport error rather than hanging.
        let options = MeshOptions {
            host: "127.0.0.1".to_string(),
            port: 9,
            secure: false,
            ..Default::default()
        };
        let (events, _events_rx) = mpsc::unbounded_channel();
        let result = Socket::connect(&options, &"a".to_string(), "t", events).await;
        assert!(matches!(result, Err(Error::SocketError(_))));
    }
}
