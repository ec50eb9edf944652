//! # Mesh Client
//!
//! The top-level coordinator. Owns the signaling session and the set of
//! remote nodes, routes signaling messages to the connection they belong to,
//! and reacts to mesh discovery by connecting to newly-learned peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          MESH CLIENT                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  Signaling socket ──► router ──► MeshClient ──► broadcast events    │
//! │                                   │                                 │
//! │                                   ├── RemoteNode (per peer)         │
//! │                                   │     ├── DataConnection          │
//! │                                   │     │     └── Negotiator        │
//! │                                   │     └── DataConnection          │
//! │                                   │                                 │
//! │                                   └── MeshDiscovery (handshakes)    │
//! │                                                                     │
//! │  Ownership is a one-way tree: the client owns nodes by peer id,     │
//! │  nodes own connections, and every back-reference is a weak handle.  │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

mod connection;
mod discovery;
mod events;
mod negotiator;
mod node;

pub use events::{ClientEvent, NodeEvent};
pub use node::{RemoteNode, SendOptions, LABEL_REALTIME, LABEL_RELIABLE};

pub use connection::SdpTransform;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;

use crate::config::{validate_peer_id, MeshOptions};
use crate::error::{Error, Result};
use crate::serializer::{Payload, SerializerRegistry, DEFAULT_SERIALIZATION};
use crate::signaling::{
    api, ClientMessage, OfferPayload, ServerMessage, Socket, SocketEvent,
};
use crate::PeerId;

use connection::DataConnection;
use discovery::MeshDiscovery;
use node::NodeInner;

const EVENT_CAPACITY: usize = 256;
const CONNECTION_ID_PREFIX: &str = "dc_";

// ============================================================================
// CONNECT OPTIONS
// ============================================================================

/// Options for [`MeshClient::connect`].
#[derive(Default, Clone)]
pub struct ConnectOptions {
    /// Channel label; derived from `reliable` when absent.
    pub label: Option<String>,
    /// Opaque metadata delivered to the remote side with the offer.
    pub metadata: Option<Value>,
    /// Serializer name (`raw` / `json` / `binary` / user-registered).
    pub serialization: Option<String>,
    /// Ordered + retransmitted delivery. Defaults to `true`.
    pub reliable: Option<bool>,
    /// SDP rewrite hook applied before descriptions go out.
    pub sdp_transform: Option<SdpTransform>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("label", &self.label)
            .field("metadata", &self.metadata)
            .field("serialization", &self.serialization)
            .field("reliable", &self.reliable)
            .field("sdp_transform", &self.sdp_transform.is_some())
            .finish()
    }
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

/// Handle to the mesh client. Cloneable; all clones drive the same session.
///
/// Construction starts asynchronous signaling bring-up (id retrieval when no
/// id was supplied, then the WebSocket session); progress is reported through
/// [`subscribe`](Self::subscribe). Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct MeshClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("disconnected", &self.is_disconnected())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl MeshClient {
    /// Create a client and start signaling bring-up.
    ///
    /// With `id: None` the signaling server assigns one; otherwise the given
    /// id is claimed (the server answers `ID-TAKEN` if it is in use).
    pub fn new(id: Option<PeerId>, options: MeshOptions) -> Result<Self> {
        options.validate()?;
        if let Some(id) = &id {
            validate_peer_id(id)?;
        }

        let inner = ClientInner::new(id, options);
        let starter = inner.clone();
        tokio::spawn(async move { starter.start().await });
        Ok(Self { inner })
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Our peer id, once known.
    pub fn id(&self) -> Option<PeerId> {
        self.inner.id()
    }

    /// Whether the signaling session is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Whether the client is disconnected from signaling (peer links live on).
    pub fn is_disconnected(&self) -> bool {
        self.inner.is_disconnected()
    }

    /// Whether the client is terminally destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Connect to a peer. Idempotent: a node that already exists (open or
    /// still negotiating) is returned as-is.
    pub fn connect(&self, peer: impl Into<PeerId>, options: ConnectOptions) -> Result<RemoteNode> {
        self.inner.connect_internal(peer.into(), options)
    }

    /// The node for a peer, if one exists.
    pub fn node(&self, peer: &str) -> Option<RemoteNode> {
        self.inner.node_inner(&peer.to_string()).map(RemoteNode::from_inner)
    }

    /// All current nodes.
    pub fn nodes(&self) -> Vec<RemoteNode> {
        self.inner
            .nodes
            .lock()
            .values()
            .cloned()
            .map(RemoteNode::from_inner)
            .collect()
    }

    /// Send a payload to every open node; returns how many sends succeeded.
    /// Per-peer failures are logged and never abort the batch.
    pub async fn broadcast(&self, payload: Payload, options: SendOptions) -> usize {
        self.inner.broadcast_internal(payload, options).await
    }

    /// Sever the signaling session, keeping open peer links. Idempotent.
    pub fn disconnect(&self) {
        self.inner.disconnect_internal();
    }

    /// Re-establish signaling with the previously-assigned id. Only legal
    /// while disconnected and not destroyed.
    pub fn reconnect(&self) -> Result<()> {
        self.inner.reconnect_internal()
    }

    /// Close everything. Terminal.
    pub fn destroy(&self) {
        self.inner.destroy_internal();
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

pub(crate) struct ClientInner {
    options: MeshOptions,
    serializers: SerializerRegistry,
    /// Socket token, stable across reconnects of this client instance.
    token: String,
    id: Mutex<Option<PeerId>>,
    /// Id confirmed by the server's `OPEN`; gates destroy-vs-disconnect on
    /// fatal errors and is the id `reconnect` resumes with.
    last_server_id: Mutex<Option<PeerId>>,
    open: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    nodes: Mutex<HashMap<PeerId, Arc<NodeInner>>>,
    connection_attempts: Mutex<HashSet<PeerId>>,
    lost_messages: Mutex<HashMap<PeerId, VecDeque<ServerMessage>>>,
    socket: Mutex<Option<Socket>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
    discovery: MeshDiscovery,
    events: broadcast::Sender<ClientEvent>,
    webrtc_api: OnceCell<Arc<API>>,
}

impl ClientInner {
    fn new(id: Option<PeerId>, options: MeshOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let token = options.token_generator.token();
        let serializers = SerializerRegistry::new(&options.serializers);
        Arc::new(Self {
            options,
            serializers,
            token,
            id: Mutex::new(id),
            last_server_id: Mutex::new(None),
            open: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            nodes: Mutex::new(HashMap::new()),
            connection_attempts: Mutex::new(HashSet::new()),
            lost_messages: Mutex::new(HashMap::new()),
            socket: Mutex::new(None),
            router_task: Mutex::new(None),
            discovery: MeshDiscovery::new(),
            events,
            webrtc_api: OnceCell::new(),
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> Option<PeerId> {
        self.id.lock().clone()
    }

    pub fn options(&self) -> &MeshOptions {
        &self.options
    }

    pub fn discovery(&self) -> &MeshDiscovery {
        &self.discovery
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_error(&self, error: Error) {
        self.emit(ClientEvent::Error { error });
    }

    pub fn node_inner(&self, peer: &PeerId) -> Option<Arc<NodeInner>> {
        self.nodes.lock().get(peer).cloned()
    }

    /// Open peers, excluding `exclude`; the payload of a mesh handshake.
    pub fn open_peer_ids_excluding(&self, exclude: &PeerId) -> Vec<PeerId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(peer, node)| *peer != exclude && node.is_open())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// The shared WebRTC API object, built on first use.
    pub fn webrtc_api(&self) -> Result<Arc<API>> {
        self.webrtc_api
            .get_or_try_init(|| {
                let mut media = MediaEngine::default();
                media.register_default_codecs()?;
                let registry = register_default_interceptors(Registry::new(), &mut media)?;
                Ok(Arc::new(
                    APIBuilder::new()
                        .with_media_engine(media)
                        .with_interceptor_registry(registry)
                        .build(),
                ))
            })
            .cloned()
    }

    // ========================================================================
    // BRING-UP
    // ========================================================================

    async fn start(self: Arc<Self>) {
        let result = async {
            let id = match self.id() {
                Some(id) => id,
                None => {
                    let id = api::retrieve_id(&self.options).await?;
                    validate_peer_id(&id)?;
                    *self.id.lock() = Some(id.clone());
                    id
                }
            };
            self.open_socket(&id).await
        }
        .await;

        if let Err(e) = result {
            self.abort(e);
        }
    }

    /// Connect the signaling socket and spawn the message router.
    async fn open_socket(self: &Arc<Self>, id: &PeerId) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let socket = Socket::connect(&self.options, id, &self.token, events_tx).await?;
        *self.socket.lock() = Some(socket);

        let weak = Arc::downgrade(self);
        let router = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(client) = weak.upgrade() else { break };
                client.handle_socket_event(event).await;
            }
        });
        if let Some(previous) = self.router_task.lock().replace(router) {
            previous.abort();
        }
        Ok(())
    }

    async fn handle_socket_event(self: &Arc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Message(message) => self.handle_server_message(message).await,
            SocketEvent::Error(e) => self.emit_error(Error::SocketError(e)),
            SocketEvent::Closed => {
                if self.is_destroyed() || self.is_disconnected() {
                    return;
                }
                self.abort(Error::SocketClosed(
                    "signaling socket closed unexpectedly".into(),
                ));
            }
        }
    }

    // ========================================================================
    // SIGNALING ROUTING
    // ========================================================================

    async fn handle_server_message(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Open => {
                if self.open.swap(true, Ordering::SeqCst) {
                    return;
                }
                let Some(id) = self.id() else {
                    tracing::warn!("Server opened a session before an id was set");
                    return;
                };
                *self.last_server_id.lock() = Some(id.clone());
                self.disconnected.store(false, Ordering::SeqCst);
                tracing::info!("Signaling session open as {}", id);
                self.emit(ClientEvent::Open { id });
            }

            ServerMessage::Error { payload } => {
                self.abort(Error::ServerError(payload.msg));
            }
            ServerMessage::IdTaken => {
                let id = self.id().unwrap_or_default();
                self.abort(Error::UnavailableId(id));
            }
            ServerMessage::InvalidKey => {
                self.abort(Error::InvalidKey(self.options.key.clone()));
            }

            ServerMessage::Leave { src } => {
                tracing::info!("Peer {} left", src);
                self.lost_messages.lock().remove(&src);
                if let Some(node) = self.node_inner(&src) {
                    node.close_internal();
                }
            }
            ServerMessage::Expire { src } => {
                // Error first, cleanup second: subscribers observe the
                // failure while the attempt is still visible.
                self.emit_error(Error::PeerUnavailable(src.clone()));
                self.attempt_settled(&src);
            }

            ServerMessage::Offer { src, payload } => {
                self.handle_offer(src, payload).await;
            }
            message @ (ServerMessage::Answer { .. } | ServerMessage::Candidate { .. }) => {
                self.route_to_connection(message).await;
            }

            ServerMessage::Heartbeat => {}
            ServerMessage::Unknown => {
                tracing::warn!("Ignoring signaling message of unknown type");
            }
        }
    }

    /// An offer arrived: find or create the node, replace any connection
    /// that already uses the offered id, and start answering.
    async fn handle_offer(self: &Arc<Self>, src: PeerId, payload: OfferPayload) {
        if self.is_destroyed() {
            return;
        }

        let mut node = self.get_or_create_node(&src, payload.metadata.clone(), true);
        if let Some(existing) = node.connection(&payload.connection_id) {
            tracing::warn!(
                "Offer reuses connection id {}; replacing the existing connection",
                payload.connection_id
            );
            existing.close_internal();
            // Closing the only connection closes the node; recreate it.
            if node.is_destroyed() {
                node = self.get_or_create_node(&src, payload.metadata.clone(), true);
            }
        }

        let Some(serializer) = self.serializers.get(&payload.serialization) else {
            self.emit_error(Error::Serialization(format!(
                "peer {} offered unknown serialization '{}'",
                src, payload.serialization
            )));
            return;
        };

        let conn = DataConnection::new(
            src.clone(),
            payload.connection_id.clone(),
            payload.label.clone(),
            payload.reliable,
            payload.serialization.clone(),
            payload.metadata.clone(),
            serializer,
            None,
            Arc::downgrade(&node),
            Arc::downgrade(self),
        );
        node.add_connection(conn.clone());

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.start_answerer(payload).await {
                tracing::warn!("Answering offer from {} failed: {}", conn.peer(), e);
                client.emit_error(e);
                conn.close_internal();
            }
        });
    }

    /// Deliver an `ANSWER`/`CANDIDATE` to its connection, or park it until
    /// that connection exists.
    async fn route_to_connection(self: &Arc<Self>, message: ServerMessage) {
        let Some(src) = message.src().cloned() else { return };
        let Some(connection_id) = message.connection_id().cloned() else { return };

        let Some(node) = self.node_inner(&src) else {
            tracing::debug!(
                "Queueing signaling message for unknown peer {} (connection {})",
                src,
                connection_id
            );
            self.lost_messages
                .lock()
                .entry(src)
                .or_default()
                .push_back(message);
            return;
        };

        match node.connection(&connection_id) {
            Some(conn) => conn.handle_message(message).await,
            None => node.store_lost_message(connection_id, message),
        }
    }

    fn get_or_create_node(
        self: &Arc<Self>,
        peer: &PeerId,
        metadata: Option<Value>,
        remote_initiated: bool,
    ) -> Arc<NodeInner> {
        let (node, created) = {
            let mut nodes = self.nodes.lock();
            match nodes.get(peer) {
                Some(node) => (node.clone(), false),
                None => {
                    let node = NodeInner::new(peer.clone(), metadata, Arc::downgrade(self));
                    nodes.insert(peer.clone(), node.clone());
                    (node, true)
                }
            }
        };

        if created {
            tracing::info!("Created node for {}", peer);
            if remote_initiated {
                self.emit(ClientEvent::Connection {
                    node: RemoteNode::from_inner(node.clone()),
                });
            }
            self.replay_lost_messages(peer);
        }
        node
    }

    /// Re-route messages that arrived before this peer's node existed.
    fn replay_lost_messages(self: &Arc<Self>, peer: &PeerId) {
        let Some(queued) = self.lost_messages.lock().remove(peer) else { return };
        tracing::debug!(
            "Replaying {} queued signaling messages for {}",
            queued.len(),
            peer
        );
        let client = self.clone();
        tokio::spawn(async move {
            for message in queued {
                client.route_to_connection(message).await;
            }
        });
    }

    // ========================================================================
    // OUTGOING CONNECTIONS
    // ========================================================================

    fn connect_internal(
        self: &Arc<Self>,
        peer: PeerId,
        options: ConnectOptions,
    ) -> Result<RemoteNode> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        if self.is_disconnected() {
            return Err(Error::Disconnected);
        }
        validate_peer_id(&peer)?;
        if self.id().as_ref() == Some(&peer) {
            return Err(Error::InvalidId(format!("cannot connect to self ({peer})")));
        }

        // Idempotent per peer: an in-flight attempt or existing node (open
        // or still negotiating) is returned as-is.
        if let Some(existing) = self.node_inner(&peer) {
            return Ok(RemoteNode::from_inner(existing));
        }

        let reliable = options.reliable.unwrap_or(true);
        let label = options.label.clone().unwrap_or_else(|| {
            if reliable {
                LABEL_RELIABLE.to_string()
            } else {
                LABEL_REALTIME.to_string()
            }
        });
        let serialization = options
            .serialization
            .clone()
            .unwrap_or_else(|| DEFAULT_SERIALIZATION.to_string());
        let serializer = self.serializers.get(&serialization).ok_or_else(|| {
            Error::Serialization(format!("unknown serialization '{serialization}'"))
        })?;

        let node = self.get_or_create_node(&peer, options.metadata.clone(), false);
        self.connection_attempts.lock().insert(peer.clone());

        let connection_id = format!(
            "{CONNECTION_ID_PREFIX}{}",
            self.options.token_generator.token()
        );
        tracing::info!("Connecting to {} (connection {})", peer, connection_id);
        let conn = DataConnection::new(
            peer,
            connection_id,
            label,
            reliable,
            serialization,
            options.metadata,
            serializer,
            options.sdp_transform,
            Arc::downgrade(&node),
            Arc::downgrade(self),
        );
        node.add_connection(conn.clone());

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.start_originator().await {
                tracing::warn!("Connect to {} failed: {}", conn.peer(), e);
                client.attempt_settled(conn.peer());
                client.emit_error(e);
                conn.close_internal();
            }
        });

        Ok(RemoteNode::from_inner(node))
    }

    /// Negotiate an additional labeled channel on an existing open node.
    pub(crate) fn open_channel(self: &Arc<Self>, node: &Arc<NodeInner>, label: &str, reliable: bool) {
        if self.is_destroyed() {
            return;
        }
        let serialization = node
            .first_serialization()
            .unwrap_or_else(|| DEFAULT_SERIALIZATION.to_string());
        let Some(serializer) = self.serializers.get(&serialization) else { return };

        let connection_id = format!(
            "{CONNECTION_ID_PREFIX}{}",
            self.options.token_generator.token()
        );
        let conn = DataConnection::new(
            node.peer().clone(),
            connection_id,
            label.to_string(),
            reliable,
            serialization,
            None,
            serializer,
            None,
            Arc::downgrade(node),
            Arc::downgrade(self),
        );
        node.add_connection(conn.clone());

        tokio::spawn(async move {
            if let Err(e) = conn.start_originator().await {
                tracing::warn!(
                    "Opening '{}' channel to {} failed: {}",
                    conn.label(),
                    conn.peer(),
                    e
                );
                conn.close_internal();
            }
        });
    }

    /// Mesh discovery handed us a peer list: connect to everyone we do not
    /// already know. Individual failures are logged; the batch continues.
    pub(crate) fn connect_to_peers(self: &Arc<Self>, peers: Vec<PeerId>) {
        for peer in peers {
            if self.id().as_ref() == Some(&peer) {
                continue;
            }
            if self.nodes.lock().contains_key(&peer) {
                continue;
            }
            if self.connection_attempts.lock().contains(&peer) {
                continue;
            }
            tracing::info!("Mesh discovery: connecting to {}", peer);
            if let Err(e) = self.connect_internal(peer.clone(), ConnectOptions::default()) {
                tracing::warn!("Mesh connect to {} failed: {}", peer, e);
            }
        }
    }

    // ========================================================================
    // BROADCAST
    // ========================================================================

    async fn broadcast_internal(self: &Arc<Self>, payload: Payload, options: SendOptions) -> usize {
        let nodes: Vec<Arc<NodeInner>> = self
            .nodes
            .lock()
            .values()
            .filter(|node| node.is_open())
            .cloned()
            .collect();

        let mut delivered = 0;
        for node in nodes {
            match node.send(payload.clone(), options).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Broadcast to {} failed: {}", node.peer(), e),
            }
        }
        delivered
    }

    // ========================================================================
    // NODE / ATTEMPT BOOKKEEPING
    // ========================================================================

    /// A connect attempt resolved (open, close, or error).
    pub(crate) fn attempt_settled(&self, peer: &PeerId) {
        self.connection_attempts.lock().remove(peer);
    }

    /// A node closed: drop every reference the client still holds.
    pub(crate) fn detach_node(&self, peer: &PeerId) {
        self.nodes.lock().remove(peer);
        self.connection_attempts.lock().remove(peer);
        self.lost_messages.lock().remove(peer);
        self.discovery.forget(peer);
    }

    /// Forward a message through the signaling socket.
    pub(crate) fn send_signal(&self, message: ClientMessage) -> Result<()> {
        match self.socket.lock().as_ref() {
            Some(socket) => socket.send(message),
            None => Err(Error::Disconnected),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Fatal-error path: emit, then destroy if the server never confirmed a
    /// session, else merely disconnect so peer links survive.
    fn abort(self: &Arc<Self>, error: Error) {
        tracing::error!("Aborting signaling session: {}", error);
        let ever_opened = self.last_server_id.lock().is_some();
        self.emit_error(error);
        if ever_opened {
            self.disconnect_internal();
        } else {
            self.destroy_internal();
        }
    }

    pub(crate) fn disconnect_internal(self: &Arc<Self>) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);

        if let Some(task) = self.router_task.lock().take() {
            task.abort();
        }
        if let Some(socket) = self.socket.lock().take() {
            socket.close();
        }

        let id = self.id().unwrap_or_default();
        tracing::info!("Disconnected from signaling server (id {})", id);
        self.emit(ClientEvent::Disconnected { id });
    }

    pub(crate) fn reconnect_internal(self: &Arc<Self>) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }
        if !self.is_disconnected() {
            tracing::warn!("reconnect() called while signaling is still up; ignoring");
            return Ok(());
        }
        let Some(id) = self.last_server_id.lock().clone() else {
            return Err(Error::Disconnected);
        };

        tracing::info!("Reconnecting to signaling server as {}", id);
        self.disconnected.store(false, Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.open_socket(&id).await {
                client.disconnected.store(true, Ordering::SeqCst);
                client.abort(e);
            }
        });
        Ok(())
    }

    pub(crate) fn destroy_internal(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Destroying client");
        self.disconnect_internal();

        let nodes: Vec<Arc<NodeInner>> = self.nodes.lock().values().cloned().collect();
        for node in nodes {
            node.close_internal();
        }
        self.nodes.lock().clear();
        self.connection_attempts.lock().clear();
        self.lost_messages.lock().clear();

        self.emit(ClientEvent::Close);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    /// A client with no bring-up task: tests drive it by hand.
    fn detached_client() -> Arc<ClientInner> {
        ClientInner::new(Some("alice".to_string()), MeshOptions::default())
    }

    fn drain_events(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_per_peer() {
        let client = detached_client();
        let first = client
            .connect_internal("bob".to_string(), ConnectOptions::default())
            .unwrap();
        let second = client
            .connect_internal("bob".to_string(), ConnectOptions::default())
            .unwrap();

        assert!(Arc::ptr_eq(first.inner(), second.inner()));
        assert_eq!(client.nodes.lock().len(), 1);
        assert!(client.connection_attempts.lock().contains("bob"));
    }

    #[tokio::test]
    async fn test_connect_rejects_self() {
        let client = detached_client();
        let result = client.connect_internal("alice".to_string(), ConnectOptions::default());
        assert!(matches!(result, Err(Error::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_peer_id() {
        let client = detached_client();
        let result = client.connect_internal("not valid!".to_string(), ConnectOptions::default());
        assert!(matches!(result, Err(Error::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_serialization() {
        let client = detached_client();
        let result = client.connect_internal(
            "bob".to_string(),
            ConnectOptions {
                serialization: Some("msgpack".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(Error::Serialization(_))));
        assert!(client.nodes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connect_after_destroy_fails() {
        let client = detached_client();
        client.destroy_internal();
        let result = client.connect_internal("bob".to_string(), ConnectOptions::default());
        assert!(matches!(result, Err(Error::Destroyed)));
    }

    #[tokio::test]
    async fn test_destroy_emits_close_once() {
        let client = detached_client();
        let mut rx = client.events.subscribe();
        client.destroy_internal();
        client.destroy_internal();

        let events = drain_events(&mut rx);
        let closes = events
            .iter()
            .filter(|e| matches!(e, ClientEvent::Close))
            .count();
        assert_eq!(closes, 1);
        assert!(client.is_destroyed());
    }

    #[tokio::test]
    async fn test_disconnect_emits_disconnected_once() {
        let client = detached_client();
        let mut rx = client.events.subscribe();
        client.disconnect_internal();
        client.disconnect_internal();

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], ClientEvent::Disconnected { id } if id == "alice")
        );
    }

    #[tokio::test]
    async fn test_open_message_latches_session() {
        let client = detached_client();
        let mut rx = client.events.subscribe();

        client.handle_server_message(ServerMessage::Open).await;
        client.handle_server_message(ServerMessage::Open).await;

        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ClientEvent::Open { id } if id == "alice"));
        assert_eq!(client.last_server_id.lock().clone(), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_expire_emits_error_then_clears_attempt() {
        let client = detached_client();
        client.connection_attempts.lock().insert("bob".to_string());
        let mut rx = client.events.subscribe();

        client
            .handle_server_message(ServerMessage::Expire {
                src: "bob".to_string(),
            })
            .await;

        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[0],
            ClientEvent::Error {
                error: Error::PeerUnavailable(peer)
            } if peer == "bob"
        ));
        assert!(!client.connection_attempts.lock().contains("bob"));
    }

    #[tokio::test]
    async fn test_fatal_error_before_open_destroys() {
        let client = detached_client();
        let mut rx = client.events.subscribe();

        client
            .handle_server_message(ServerMessage::InvalidKey)
            .await;

        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[0],
            ClientEvent::Error {
                error: Error::InvalidKey(_)
            }
        ));
        assert!(client.is_destroyed());
    }

    #[tokio::test]
    async fn test_fatal_error_after_open_only_disconnects() {
        let client = detached_client();
        client.handle_server_message(ServerMessage::Open).await;
        let mut rx = client.events.subscribe();

        client
            .handle_server_message(ServerMessage::Error {
                payload: crate::signaling::ErrorPayload {
                    msg: "overloaded".to_string(),
                },
            })
            .await;

        assert!(!client.is_destroyed());
        assert!(client.is_disconnected());
        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[0],
            ClientEvent::Error {
                error: Error::ServerError(msg)
            } if msg == "overloaded"
        ));
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer_is_parked() {
        let client = detached_client();
        let message: ServerMessage = serde_json::from_str(
            r#"{
                "type": "ANSWER",
                "src": "bob",
                "payload": {
                    "sdp": {"type": "answer", "sdp": ""},
                    "type": "data",
                    "connectionId": "c1"
                }
            }"#,
        )
        .unwrap();

        client.route_to_connection(message).await;
        assert_eq!(
            client.lost_messages.lock().get("bob").map(|q| q.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_parked_messages_move_to_node_on_creation() {
        let client = detached_client();
        let message: ServerMessage = serde_json::from_str(
            r#"{
                "type": "ANSWER",
                "src": "bob",
                "payload": {
                    "sdp": {"type": "answer", "sdp": ""},
                    "type": "data",
                    "connectionId": "c1"
                }
            }"#,
        )
        .unwrap();
        client.route_to_connection(message).await;

        let node = client.get_or_create_node(&"bob".to_string(), None, false);
        // Replay runs on a spawned task; yield until it drains.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(client.lost_messages.lock().is_empty());
        // The connection "c1" still does not exist, so the message now waits
        // in the node-scoped queue.
        assert!(node.connection(&"c1".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_requires_disconnected_state() {
        let client = detached_client();
        client.handle_server_message(ServerMessage::Open).await;
        // Still connected: reconnect is a no-op.
        client.reconnect_internal().unwrap();
        assert!(!client.is_disconnected());
    }

    #[tokio::test]
    async fn test_reconnect_after_destroy_fails() {
        let client = detached_client();
        client.destroy_internal();
        assert!(matches!(
            client.reconnect_internal(),
            Err(Error::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_without_nodes_returns_zero() {
        let client = detached_client();
        let delivered = client
            .broadcast_internal(Payload::text("hi"), SendOptions::default())
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_connect_to_peers_skips_self_and_known() {
        let client = detached_client();
        client.get_or_create_node(&"carol".to_string(), None, false);
        client.connection_attempts.lock().insert("dave".to_string());

        client.connect_to_peers(vec![
            "alice".to_string(), // self
            "carol".to_string(), // existing node
            "dave".to_string(),  // in-flight attempt
        ]);

        assert_eq!(client.nodes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_detach_node_clears_bookkeeping() {
        let client = detached_client();
        client.get_or_create_node(&"bob".to_string(), None, false);
        client.connection_attempts.lock().insert("bob".to_string());

        client.detach_node(&"bob".to_string());
        assert!(client.nodes.lock().is_empty());
        assert!(client.connection_attempts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_signal_without_socket_fails() {
        let client = detached_client();
        assert!(matches!(
            client.send_signal(ClientMessage::Heartbeat),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn test_connect_options_debug_hides_transform_body() {
        let options = ConnectOptions {
            sdp_transform: Some(Arc::new(|sdp| sdp)),
            ..Default::default()
        };
        let debug = format!("{:?}", options);
        assert!(debug.contains("sdp_transform: true"));
    }

    #[tokio::test]
    async fn test_event_subscription_sees_drops_not_blocks() {
        let client = detached_client();
        let mut rx = client.events.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
