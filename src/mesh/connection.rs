//! # Data Connection
//!
//! One WebRTC data channel to a peer, paired with the serializer both sides
//! agreed on in the offer. A connection is owned by its
//! [`RemoteNode`](crate::RemoteNode) and refers back to node and client by
//! weak handle, so teardown in any order never leaks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::serializer::{close_control, is_close_control, Payload, Serializer};
use crate::signaling::{ClientMessage, ServerMessage};
use crate::{ConnectionId, PeerId};

use super::negotiator::Negotiator;
use super::node::NodeInner;
use super::ClientInner;

/// Outgoing watermark: beyond this many buffered bytes, frames queue locally
/// and drain from the buffered-amount-low callback.
pub(crate) const MAX_BUFFERED_AMOUNT: usize = 8 * 1024 * 1024;

/// SDP rewrite hook applied before descriptions go out.
pub type SdpTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

pub(crate) struct DataConnection {
    peer: PeerId,
    connection_id: ConnectionId,
    label: String,
    reliable: bool,
    serialization: String,
    metadata: Option<Value>,
    serializer: Arc<dyn Serializer>,
    sdp_transform: Option<SdpTransform>,
    negotiator: Negotiator,
    channel: Mutex<Option<Arc<RTCDataChannel>>>,
    open: AtomicBool,
    destroyed: AtomicBool,
    buffer: Mutex<VecDeque<Bytes>>,
    node: Weak<NodeInner>,
    client: Weak<ClientInner>,
}

impl DataConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: PeerId,
        connection_id: ConnectionId,
        label: String,
        reliable: bool,
        serialization: String,
        metadata: Option<Value>,
        serializer: Arc<dyn Serializer>,
        sdp_transform: Option<SdpTransform>,
        node: Weak<NodeInner>,
        client: Weak<ClientInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            connection_id,
            label,
            reliable,
            serialization,
            metadata,
            serializer,
            sdp_transform,
            negotiator: Negotiator::new(),
            channel: Mutex::new(None),
            open: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            buffer: Mutex::new(VecDeque::new()),
            node,
            client,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reliable(&self) -> bool {
        self.reliable
    }

    pub fn serialization(&self) -> &str {
        &self.serialization
    }

    pub fn metadata(&self) -> Option<Value> {
        self.metadata.clone()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.negotiator.peer_connection()
    }

    pub fn node(&self) -> Option<Arc<NodeInner>> {
        self.node.upgrade()
    }

    pub fn client(&self) -> Option<Arc<ClientInner>> {
        self.client.upgrade()
    }

    // ========================================================================
    // NEGOTIATION ENTRY POINTS
    // ========================================================================

    /// Start the offering side of the connection.
    pub async fn start_originator(self: &Arc<Self>) -> Result<()> {
        self.negotiator.start_originator(self).await
    }

    /// Start the answering side from a received offer payload.
    pub async fn start_answerer(
        self: &Arc<Self>,
        offer: crate::signaling::OfferPayload,
    ) -> Result<()> {
        self.negotiator.start_answerer(self, offer).await
    }

    /// Route a signaling message that belongs to this connection.
    pub async fn handle_message(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Answer { payload, .. } => {
                if let Err(e) = self.negotiator.handle_sdp(self, payload.sdp).await {
                    self.surface_error(e);
                }
            }
            ServerMessage::Candidate { payload, .. } => {
                if let Err(e) = self.negotiator.handle_candidate(payload.candidate).await {
                    self.surface_error(e);
                }
            }
            other => {
                tracing::debug!(
                    "Connection {} ignoring unexpected signaling message: {:?}",
                    self.connection_id,
                    other
                );
            }
        }
    }

    /// Apply the configured SDP rewrite hook, if any.
    pub fn apply_sdp_transform(
        &self,
        description: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let Some(transform) = &self.sdp_transform else {
            return Ok(description);
        };
        let rewritten = transform(description.sdp.clone());
        let rebuilt = match description.sdp_type {
            RTCSdpType::Offer => RTCSessionDescription::offer(rewritten),
            RTCSdpType::Answer => RTCSessionDescription::answer(rewritten),
            RTCSdpType::Pranswer => RTCSessionDescription::pranswer(rewritten),
            _ => return Ok(description),
        };
        rebuilt.map_err(|e| Error::WebRtc(e.to_string()))
    }

    /// Forward a signaling message through the owning client's socket.
    pub fn send_signal(&self, message: ClientMessage) -> Result<()> {
        let client = self.client().ok_or(Error::Destroyed)?;
        client.send_signal(message)
    }

    // ========================================================================
    // CHANNEL LIFECYCLE
    // ========================================================================

    /// Bind handlers to a data channel (locally created or remotely
    /// announced) and adopt it as this connection's transport.
    pub async fn initialize_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        channel
            .set_buffered_amount_low_threshold(MAX_BUFFERED_AMOUNT)
            .await;

        let weak = Arc::downgrade(self);
        channel.on_open(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                if conn.is_destroyed() {
                    return;
                }
                conn.open.store(true, Ordering::SeqCst);
                conn.negotiator.set_established();
                tracing::info!(
                    "Data channel '{}' to {} open (connection {})",
                    conn.label,
                    conn.peer,
                    conn.connection_id
                );
                if let Some(node) = conn.node() {
                    node.connection_opened(&conn);
                }
            })
        }));

        let weak = Arc::downgrade(self);
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_frame(message.data).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    tracing::debug!("Data channel for connection {} closed", conn.connection_id);
                    conn.close(false).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        channel.on_error(Box::new(move |error| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    conn.surface_error(Error::WebRtc(error.to_string()));
                }
            })
        }));

        let weak = Arc::downgrade(self);
        channel
            .on_buffered_amount_low(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(conn) = weak.upgrade() {
                        conn.flush_buffer().await;
                    }
                })
            }))
            .await;

        *self.channel.lock() = Some(channel);
    }

    /// Decode one incoming frame and hand it to the node, intercepting the
    /// in-band close control message.
    async fn handle_frame(self: &Arc<Self>, frame: Bytes) {
        let payload = match self.serializer.decode(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                self.surface_error(Error::Serialization(format!(
                    "failed to decode frame from {}: {}",
                    self.peer, e
                )));
                return;
            }
        };

        if is_close_control(&payload) {
            tracing::debug!("Peer {} requested graceful close", self.peer);
            self.close(false).await;
            return;
        }

        if let Some(node) = self.node() {
            node.handle_payload(payload);
        }
    }

    // ========================================================================
    // SEND PATH
    // ========================================================================

    /// Encode and send one payload, queuing under backpressure.
    pub async fn send(&self, payload: &Payload) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpenYet(self.peer.clone()));
        }
        let frame = self.serializer.encode(payload)?;
        self.buffered_send(frame).await
    }

    async fn buffered_send(&self, frame: Bytes) -> Result<()> {
        let Some(channel) = self.channel.lock().clone() else {
            return Err(Error::NoOpenConnection(self.peer.clone()));
        };

        if channel.buffered_amount().await + frame.len() > MAX_BUFFERED_AMOUNT {
            tracing::debug!(
                "Backpressure on connection {}: queueing {} bytes",
                self.connection_id,
                frame.len()
            );
            self.buffer.lock().push_back(frame);
            return Ok(());
        }

        channel
            .send(&frame)
            .await
            .map_err(|e| Error::WebRtc(e.to_string()))?;
        Ok(())
    }

    /// Drain locally queued frames while the channel has headroom.
    pub(crate) async fn flush_buffer(&self) {
        loop {
            let Some(channel) = self.channel.lock().clone() else { return };
            let Some(frame) = self.buffer.lock().pop_front() else { return };

            if channel.buffered_amount().await + frame.len() > MAX_BUFFERED_AMOUNT {
                self.buffer.lock().push_front(frame);
                return;
            }
            if let Err(e) = channel.send(&frame).await {
                tracing::warn!("Flush on connection {} failed: {}", self.connection_id, e);
                self.buffer.lock().push_front(frame);
                return;
            }
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Close this connection. When `graceful`, an in-band close control
    /// message goes out first so the remote tears down even if the transport
    /// close races.
    pub async fn close(self: &Arc<Self>, graceful: bool) {
        if graceful && self.is_open() {
            if let Ok(frame) = self.serializer.encode(&close_control()) {
                let channel = self.channel.lock().clone();
                if let Some(channel) = channel {
                    let _ = channel.send(&frame).await;
                }
            }
        }
        self.close_internal();
    }

    /// Synchronous teardown: idempotent, never blocks.
    pub(crate) fn close_internal(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.negotiator.cleanup();
        self.buffer.lock().clear();

        if let Some(channel) = self.channel.lock().take() {
            tokio::spawn(async move {
                if let Err(e) = channel.close().await {
                    tracing::debug!("Data channel close: {}", e);
                }
            });
        }

        tracing::info!("Connection {} to {} closed", self.connection_id, self.peer);
        if let Some(node) = self.node() {
            node.remove_connection(&self.connection_id);
        }
    }

    /// Emit a non-fatal failure on the closest owning component.
    pub(crate) fn surface_error(&self, error: Error) {
        tracing::warn!(
            "Connection {} to {}: {}",
            self.connection_id,
            self.peer,
            error
        );
        if let Some(node) = self.node() {
            node.emit_error(error);
        } else if let Some(client) = self.client() {
            client.emit_error(error);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::BinarySerializer;

    fn test_connection() -> Arc<DataConnection> {
        DataConnection::new(
            "bob".to_string(),
            "dc_test1".to_string(),
            "reliable".to_string(),
            true,
            "binary".to_string(),
            None,
            Arc::new(BinarySerializer),
            None,
            Weak::new(),
            Weak::new(),
        )
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let conn = test_connection();
        let result = conn.send(&Payload::text("hello")).await;
        assert!(matches!(result, Err(Error::NotOpenYet(peer)) if peer == "bob"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = test_connection();
        conn.close(false).await;
        assert!(conn.is_destroyed());
        assert!(!conn.is_open());
        // Second close is a no-op.
        conn.close(true).await;
        assert!(conn.is_destroyed());
    }

    #[tokio::test]
    async fn test_close_control_frame_triggers_teardown() {
        let conn = test_connection();
        let frame = BinarySerializer.encode(&close_control()).unwrap();
        conn.handle_frame(frame).await;
        assert!(conn.is_destroyed());
    }

    #[tokio::test]
    async fn test_send_signal_without_client_fails() {
        let conn = test_connection();
        let result = conn.send_signal(ClientMessage::Heartbeat);
        assert!(matches!(result, Err(Error::Destroyed)));
    }

    #[test]
    fn test_sdp_transform_passthrough_without_hook() {
        let conn = test_connection();
        let description = RTCSessionDescription::default();
        let unchanged = conn.apply_sdp_transform(description.clone()).unwrap();
        assert_eq!(unchanged.sdp, description.sdp);
    }

    #[test]
    fn test_accessors() {
        let conn = test_connection();
        assert_eq!(conn.peer(), "bob");
        assert_eq!(conn.connection_id(), "dc_test1");
        assert_eq!(conn.label(), "reliable");
        assert!(conn.reliable());
        assert_eq!(conn.serialization(), "binary");
        assert!(conn.metadata().is_none());
        assert!(conn.peer_connection().is_none());
    }
}
