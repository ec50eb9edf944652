//! # Mesh Discovery
//!
//! Transitive peer discovery over established data channels. When a node
//! opens, we send it the list of peers we can already reach; the recipient
//! acknowledges and connects to everyone it did not know yet. Unacknowledged
//! handshakes are retried with exponential back-off, then silently abandoned.
//!
//! ```text
//! A opens B ──► {type: "mesh-peers", peers: ["c"], timestamp, requiresAck}
//!        B ──► {type: "mesh-peers-ack", timestamp}
//!        B ──► connect("c")          (unknown peer from the list)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::serializer::{Payload, INTERNAL_SENTINEL};
use crate::time;
use crate::PeerId;

use super::node::SendOptions;
use super::ClientInner;

/// First retry delay; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_secs(1);
/// Retries after the initial send before the handshake is abandoned.
const MAX_RETRIES: u32 = 3;

/// Delay before retry number `attempt + 1`.
fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE * 2u32.pow(attempt)
}

// ============================================================================
// CONTROL MESSAGES
// ============================================================================

/// In-band mesh control messages, carried inside the internal envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum MeshControl {
    /// The sender's current peer list.
    MeshPeers {
        /// Open peers on the sender's side, excluding the recipient.
        peers: Vec<PeerId>,
        /// Sender timestamp; echoed in the ack.
        timestamp: i64,
        /// Whether the sender expects an ack.
        #[serde(rename = "requiresAck", default)]
        requires_ack: bool,
    },
    /// Acknowledges a `mesh-peers` message.
    MeshPeersAck {
        /// The timestamp of the message being acknowledged.
        timestamp: i64,
    },
}

/// Wrap a control message in the internal envelope that survives every
/// serializer round-trip.
pub(crate) fn envelope(control: &MeshControl) -> Payload {
    let mut value = match serde_json::to_value(control) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Mesh control encoding failed: {}", e);
            Value::Null
        }
    };
    if let Value::Object(ref mut map) = value {
        map.insert(INTERNAL_SENTINEL.to_string(), Value::Bool(true));
    }
    Payload::Json(value)
}

// ============================================================================
// HANDSHAKE STATE
// ============================================================================

struct Handshake {
    timestamp: i64,
    retries: u32,
    completed: bool,
    timer: Option<JoinHandle<()>>,
}

/// Per-peer handshake bookkeeping for the owning client.
pub(crate) struct MeshDiscovery {
    handshakes: Mutex<HashMap<PeerId, Handshake>>,
}

impl MeshDiscovery {
    pub fn new() -> Self {
        Self {
            handshakes: Mutex::new(HashMap::new()),
        }
    }

    /// A node reached open: start the handshake unless one is already
    /// running (a second connection opening re-enters here).
    pub fn node_opened(&self, client: &Arc<ClientInner>, peer: &PeerId) {
        {
            let mut handshakes = self.handshakes.lock();
            if handshakes.contains_key(peer) {
                return;
            }
            handshakes.insert(
                peer.clone(),
                Handshake {
                    timestamp: time::unix_millis(),
                    retries: 0,
                    completed: false,
                    timer: None,
                },
            );
        }
        self.send_handshake(client, peer, 0);
    }

    /// Send (or resend) the peer list and arm the retry timer.
    fn send_handshake(&self, client: &Arc<ClientInner>, peer: &PeerId, attempt: u32) {
        let timestamp = match self.handshakes.lock().get(peer) {
            Some(handshake) => handshake.timestamp,
            None => return,
        };

        let Some(node) = client.node_inner(peer) else {
            self.forget(peer);
            return;
        };

        // Sent even when empty: it exercises the ack path and tells a fresh
        // peer it is first in the mesh.
        let peers = client.open_peer_ids_excluding(peer);
        tracing::debug!(
            "Sending mesh-peers to {} (attempt {}): {:?}",
            peer,
            attempt,
            peers
        );
        let message = envelope(&MeshControl::MeshPeers {
            peers,
            timestamp,
            requires_ack: true,
        });
        let send_peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = node
                .send(message, SendOptions { reliable: true })
                .await
            {
                tracing::warn!("Mesh handshake send to {} failed: {}", send_peer, e);
            }
        });

        let weak_client = Arc::downgrade(client);
        let retry_peer = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(retry_delay(attempt)).await;
            if let Some(client) = weak_client.upgrade() {
                client.discovery().retry(&client, &retry_peer);
            }
        });

        let mut handshakes = self.handshakes.lock();
        match handshakes.get_mut(peer) {
            Some(handshake) => {
                if let Some(old) = handshake.timer.replace(timer) {
                    old.abort();
                }
            }
            // Handshake was dropped while we were arming the timer.
            None => timer.abort(),
        }
    }

    /// Retry timer fired: resend until the retry budget is spent.
    fn retry(&self, client: &Arc<ClientInner>, peer: &PeerId) {
        let attempt = {
            let mut handshakes = self.handshakes.lock();
            let Some(handshake) = handshakes.get_mut(peer) else { return };
            if handshake.completed {
                return;
            }
            if handshake.retries >= MAX_RETRIES {
                tracing::warn!(
                    "Mesh handshake with {} abandoned after {} retries",
                    peer,
                    MAX_RETRIES
                );
                handshakes.remove(peer);
                return;
            }
            handshake.retries += 1;
            handshake.retries
        };
        tracing::debug!("Retrying mesh handshake with {} (retry {})", peer, attempt);
        self.send_handshake(client, peer, attempt);
    }

    /// An in-band control message arrived from `from`.
    pub fn handle_control(&self, client: &Arc<ClientInner>, from: &PeerId, control: Value) {
        match serde_json::from_value::<MeshControl>(control) {
            Ok(MeshControl::MeshPeers {
                peers,
                timestamp,
                requires_ack,
            }) => {
                tracing::debug!("Mesh peers from {}: {:?}", from, peers);
                if requires_ack {
                    if let Some(node) = client.node_inner(from) {
                        let ack = envelope(&MeshControl::MeshPeersAck { timestamp });
                        let ack_peer = from.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                node.send(ack, SendOptions { reliable: true }).await
                            {
                                tracing::warn!(
                                    "Mesh ack to {} failed: {}",
                                    ack_peer,
                                    e
                                );
                            }
                        });
                    }
                }
                client.connect_to_peers(peers);
            }
            Ok(MeshControl::MeshPeersAck { timestamp }) => {
                self.acknowledge(from, timestamp);
            }
            Err(e) => {
                tracing::debug!("Ignoring unknown mesh control from {}: {}", from, e);
            }
        }
    }

    /// Ack received: stop retrying and mark the handshake complete.
    fn acknowledge(&self, from: &PeerId, timestamp: i64) {
        let mut handshakes = self.handshakes.lock();
        let Some(handshake) = handshakes.get_mut(from) else {
            tracing::debug!("Ack from {} without a pending handshake", from);
            return;
        };
        if handshake.timestamp != timestamp {
            tracing::debug!(
                "Stale mesh ack from {} (got {}, expected {})",
                from,
                timestamp,
                handshake.timestamp
            );
            return;
        }
        if let Some(timer) = handshake.timer.take() {
            timer.abort();
        }
        handshake.completed = true;
        tracing::debug!("Mesh handshake with {} complete", from);
    }

    /// Drop all handshake state for a peer (node closed).
    pub fn forget(&self, peer: &PeerId) {
        if let Some(handshake) = self.handshakes.lock().remove(peer) {
            if let Some(timer) = handshake.timer {
                timer.abort();
            }
        }
    }

    #[cfg(test)]
    fn is_completed(&self, peer: &PeerId) -> bool {
        self.handshakes
            .lock()
            .get(peer)
            .map(|h| h.completed)
            .unwrap_or(false)
    }
}

// ============================================================================
// TESTS
// ============================================================================
