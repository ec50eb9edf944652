//! # Remote Node
//!
//! A logical peer endpoint. One node aggregates every data connection to a
//! peer (at most one per channel label), latches the `Open` event, replays
//! signaling messages that arrived before their connection existed, monitors
//! latency, and converges concurrent duplicate connections down to one per
//! label.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::ice::candidate::CandidatePairState;
use webrtc::stats::StatsReportType;

use crate::error::{Error, Result};
use crate::serializer::{internal_control, Payload};
use crate::signaling::ServerMessage;
use crate::{ConnectionId, PeerId};

use super::connection::DataConnection;
use super::events::NodeEvent;
use super::ClientInner;

/// Latency sampling cadence.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Settle delay before duplicate connections are closed, letting in-flight
/// messages drain so both sides converge on the same survivor.
pub(crate) const DEDUP_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Channel label carrying ordered, retransmitted traffic.
pub const LABEL_RELIABLE: &str = "reliable";
/// Channel label carrying unordered, lossy traffic.
pub const LABEL_REALTIME: &str = "realtime";

const EVENT_CAPACITY: usize = 256;

/// Per-send options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Ordered, retransmitted delivery. Defaults to `true`.
    pub reliable: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { reliable: true }
    }
}

/// The side with the lexicographically greater id closes duplicates; the
/// other side waits for the survivors to be picked remotely.
pub(crate) fn is_dedup_closer(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// Given `(label, connection_id)` pairs for the open connections, return the
/// ids to close: per label, everything but the smallest connection id. Both
/// sides sort identically, so they agree on the survivor.
pub(crate) fn dedup_losers(mut open: Vec<(String, ConnectionId)>) -> Vec<ConnectionId> {
    open.sort_by(|a, b| a.1.cmp(&b.1));
    let mut survivors: HashMap<String, ConnectionId> = HashMap::new();
    let mut losers = Vec::new();
    for (label, id) in open {
        if survivors.contains_key(&label) {
            losers.push(id);
        } else {
            survivors.insert(label, id);
        }
    }
    losers
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

/// Handle to a remote peer. Cloneable; all clones refer to the same node.
#[derive(Clone)]
pub struct RemoteNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("peer", &self.inner.peer)
            .field("open", &self.is_open())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl RemoteNode {
    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<NodeInner> {
        &self.inner
    }

    /// The remote peer's id.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Metadata attached when the node was created.
    pub fn metadata(&self) -> Option<Value> {
        self.inner.metadata.clone()
    }

    /// Whether any connection to the peer is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether the node is terminally closed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Latest latency measurement in milliseconds, if one completed.
    pub fn ping(&self) -> Option<u32> {
        *self.inner.ping.lock()
    }

    /// Channel labels currently mapped to a connection.
    pub fn channels(&self) -> Vec<String> {
        self.inner.channel_map.lock().keys().cloned().collect()
    }

    /// Subscribe to this node's events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Send a payload over the reliable channel.
    pub async fn send(&self, payload: Payload) -> Result<()> {
        self.inner.send(payload, SendOptions::default()).await
    }

    /// Send a payload with explicit delivery options.
    pub async fn send_with(&self, payload: Payload, options: SendOptions) -> Result<()> {
        self.inner.send(payload, options).await
    }

    /// Close every connection and detach from the client. Terminal.
    pub fn close(&self) {
        self.inner.close_internal();
    }
}

// ============================================================================
// NODE STATE
// ============================================================================

pub(crate) struct NodeInner {
    peer: PeerId,
    metadata: Option<Value>,
    client: Weak<ClientInner>,
    connections: Mutex<Vec<Arc<DataConnection>>>,
    channel_map: Mutex<HashMap<String, ConnectionId>>,
    open: AtomicBool,
    open_emitted: AtomicBool,
    destroyed: AtomicBool,
    lost_messages: Mutex<HashMap<ConnectionId, VecDeque<ServerMessage>>>,
    ping: Mutex<Option<u32>>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    dedup_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeInner {
    pub fn new(peer: PeerId, metadata: Option<Value>, client: Weak<ClientInner>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            peer,
            metadata,
            client,
            connections: Mutex::new(Vec::new()),
            channel_map: Mutex::new(HashMap::new()),
            open: AtomicBool::new(false),
            open_emitted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            lost_messages: Mutex::new(HashMap::new()),
            ping: Mutex::new(None),
            ping_task: Mutex::new(None),
            dedup_task: Mutex::new(None),
            events,
        })
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_error(&self, error: Error) {
        self.emit(NodeEvent::Error { error });
    }

    // ========================================================================
    // CONNECTION BOOKKEEPING
    // ========================================================================

    /// Adopt a connection. Idempotent on the connection id; queued signaling
    /// messages for that id are replayed in order.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<DataConnection>) {
        if self.is_destroyed() {
            tracing::warn!(
                "Node {} is destroyed; dropping connection {}",
                self.peer,
                conn.connection_id()
            );
            conn.close_internal();
            return;
        }

        {
            let mut connections = self.connections.lock();
            if connections
                .iter()
                .any(|existing| existing.connection_id() == conn.connection_id())
            {
                return;
            }
            connections.push(conn.clone());
        }
        self.channel_map
            .lock()
            .entry(conn.label().to_string())
            .or_insert_with(|| conn.connection_id().clone());

        let queued = self.lost_messages.lock().remove(conn.connection_id());
        if let Some(queued) = queued {
            tracing::debug!(
                "Replaying {} queued signaling messages for connection {}",
                queued.len(),
                conn.connection_id()
            );
            let replay_conn = conn.clone();
            tokio::spawn(async move {
                for message in queued {
                    replay_conn.handle_message(message).await;
                }
            });
        }
    }

    /// Drop a connection by id. Closing the last connection of a live node
    /// closes the node.
    pub fn remove_connection(self: &Arc<Self>, connection_id: &ConnectionId) {
        let remaining = {
            let mut connections = self.connections.lock();
            connections.retain(|conn| conn.connection_id() != connection_id);
            connections.len()
        };
        self.channel_map.lock().retain(|_, id| id != connection_id);

        if remaining == 0 && !self.is_destroyed() {
            tracing::debug!("Last connection to {} gone; closing node", self.peer);
            self.close_internal();
        }
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<DataConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|conn| conn.connection_id() == connection_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Serializer name of the oldest connection; secondary channels reuse it
    /// so both labels speak the same format.
    pub fn first_serialization(&self) -> Option<String> {
        self.connections
            .lock()
            .first()
            .map(|conn| conn.serialization().to_string())
    }

    /// Park a signaling message until the connection it belongs to exists.
    pub fn store_lost_message(&self, connection_id: ConnectionId, message: ServerMessage) {
        tracing::debug!(
            "Queueing signaling message for not-yet-existing connection {}",
            connection_id
        );
        self.lost_messages
            .lock()
            .entry(connection_id)
            .or_default()
            .push_back(message);
    }

    // ========================================================================
    // OPEN / DATA PATHS
    // ========================================================================

    /// A connection finished opening: latch the node open, settle the
    /// client's attempt bookkeeping, start telemetry, kick mesh discovery,
    /// and converge duplicates.
    pub fn connection_opened(self: &Arc<Self>, conn: &Arc<DataConnection>) {
        if self.is_destroyed() {
            return;
        }
        self.channel_map
            .lock()
            .entry(conn.label().to_string())
            .or_insert_with(|| conn.connection_id().clone());

        self.open.store(true, Ordering::SeqCst);
        if !self.open_emitted.swap(true, Ordering::SeqCst) {
            tracing::info!("Node {} open", self.peer);
            self.emit(NodeEvent::Open);
        }

        if let Some(client) = self.client.upgrade() {
            client.attempt_settled(&self.peer);
            client.discovery().node_opened(&client, &self.peer);
        }

        self.start_ping_task();
        self.dedup_check();
    }

    /// Route one decoded payload: mesh control messages go to discovery,
    /// everything else surfaces as application data.
    pub fn handle_payload(self: &Arc<Self>, payload: Payload) {
        if let Some(control) = internal_control(&payload) {
            if let Some(client) = self.client.upgrade() {
                client.discovery().handle_control(&client, &self.peer, control);
            }
            return;
        }
        self.emit(NodeEvent::Data { payload });
    }

    /// Send over the channel selected by `options.reliable`, falling back to
    /// any open connection while the labeled channel is still negotiating.
    pub async fn send(self: &Arc<Self>, payload: Payload, options: SendOptions) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotOpenYet(self.peer.clone()));
        }

        let label = if options.reliable {
            LABEL_RELIABLE
        } else {
            LABEL_REALTIME
        };

        let labeled = {
            let id = self.channel_map.lock().get(label).cloned();
            id.and_then(|id| self.connection(&id)).filter(|c| c.is_open())
        };

        let conn = match labeled {
            Some(conn) => conn,
            None => {
                // Negotiate the missing channel for future sends; this
                // payload rides whichever connection is already open.
                self.ensure_channel(label, options.reliable);
                self.connections
                    .lock()
                    .iter()
                    .find(|c| c.is_open())
                    .cloned()
                    .ok_or_else(|| Error::NoOpenConnection(self.peer.clone()))?
            }
        };

        conn.send(&payload).await
    }

    /// Lazily negotiate a channel for `label` if none is mapped yet.
    fn ensure_channel(self: &Arc<Self>, label: &str, reliable: bool) {
        if self.is_destroyed() || self.channel_map.lock().contains_key(label) {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            tracing::debug!("Negotiating '{}' channel to {}", label, self.peer);
            client.open_channel(self, label, reliable);
        }
    }

    // ========================================================================
    // DEDUPLICATION
    // ========================================================================

    /// When concurrent connects produced more than one open connection for a
    /// label, the side with the greater id waits out the settle delay and
    /// closes every open connection but the smallest id per label.
    fn dedup_check(self: &Arc<Self>) {
        let open: Vec<(String, ConnectionId)> = self
            .connections
            .lock()
            .iter()
            .filter(|c| c.is_open())
            .map(|c| (c.label().to_string(), c.connection_id().clone()))
            .collect();
        if dedup_losers(open).is_empty() {
            return;
        }

        let Some(client) = self.client.upgrade() else { return };
        let Some(local_id) = client.id() else { return };
        if !is_dedup_closer(&local_id, &self.peer) {
            return;
        }

        let mut dedup_task = self.dedup_task.lock();
        if dedup_task.is_some() {
            return;
        }
        tracing::debug!(
            "Duplicate connections to {}; settling for {:?} before closing extras",
            self.peer,
            DEDUP_SETTLE_DELAY
        );
        let weak = Arc::downgrade(self);
        *dedup_task = Some(tokio::spawn(async move {
            tokio::time::sleep(DEDUP_SETTLE_DELAY).await;
            let Some(node) = weak.upgrade() else { return };

            let open: Vec<(String, ConnectionId)> = node
                .connections
                .lock()
                .iter()
                .filter(|c| c.is_open())
                .map(|c| (c.label().to_string(), c.connection_id().clone()))
                .collect();
            for loser in dedup_losers(open) {
                if let Some(conn) = node.connection(&loser) {
                    tracing::info!(
                        "Closing duplicate connection {} to {}",
                        loser,
                        node.peer
                    );
                    conn.close(true).await;
                }
            }
            *node.dedup_task.lock() = None;
        }));
    }

    // ========================================================================
    // LATENCY MONITORING
    // ========================================================================

    /// Start the periodic latency probe. Idempotent.
    fn start_ping_task(self: &Arc<Self>) {
        let mut ping_task = self.ping_task.lock();
        if ping_task.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *ping_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would race the transport's first
            // candidate pair; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(node) = weak.upgrade() else { break };
                if node.is_destroyed() {
                    break;
                }
                node.measure_ping().await;
            }
        }));
    }

    /// One latency sample: average RTT over succeeded candidate pairs of any
    /// live peer connection. Failures leave the previous value in place.
    async fn measure_ping(self: &Arc<Self>) {
        let conn = self
            .connections
            .lock()
            .iter()
            .find(|c| c.is_open() && c.peer_connection().is_some())
            .cloned();
        let Some(conn) = conn else { return };
        let Some(pc) = conn.peer_connection() else { return };

        let report = pc.get_stats().await;
        let mut total_ms = 0.0f64;
        let mut pairs = 0u32;
        for stat in report.reports.values() {
            if let StatsReportType::CandidatePair(pair) = stat {
                if matches!(pair.state, CandidatePairState::Succeeded)
                    && pair.current_round_trip_time > 0.0
                {
                    total_ms += pair.current_round_trip_time * 1000.0;
                    pairs += 1;
                }
            }
        }
        if pairs == 0 {
            return;
        }

        let ms = (total_ms / pairs as f64).round() as u32;
        *self.ping.lock() = Some(ms);
        tracing::trace!("Ping to {}: {}ms over {} pairs", self.peer, ms, pairs);
        self.emit(NodeEvent::Ping { ms });
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Close the node: cancel timers, close every connection, detach from
    /// the client, emit `Close` exactly once. Terminal and idempotent.
    pub fn close_internal(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);

        if let Some(task) = self.ping_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.dedup_task.lock().take() {
            task.abort();
        }

        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        self.channel_map.lock().clear();
        self.lost_messages.lock().clear();
        for conn in connections {
            conn.close_internal();
        }

        if let Some(client) = self.client.upgrade() {
            client.detach_node(&self.peer);
        }

        tracing::info!("Node {} closed", self.peer);
        self.emit(NodeEvent::Close);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::BinarySerializer;

    fn test_node() -> Arc<NodeInner> {
        NodeInner::new("bob".to_string(), None, Weak::new())
    }

    fn test_conn(id: &str, label: &str) -> Arc<DataConnection> {
        DataConnection::new(
            "bob".to_string(),
            id.to_string(),
            label.to_string(),
            label == LABEL_RELIABLE,
            "binary".to_string(),
            None,
            Arc::new(BinarySerializer),
            None,
            Weak::new(),
            Weak::new(),
        )
    }

    #[test]
    fn test_dedup_closer_is_greater_id() {
        assert!(is_dedup_closer("z", "a"));
        assert!(!is_dedup_closer("a", "z"));
        assert!(!is_dedup_closer("a", "a"));
    }

    #[test]
    fn test_dedup_losers_keep_smallest_per_label() {
        let losers = dedup_losers(vec![
            ("reliable".to_string(), "dc_c".to_string()),
            ("reliable".to_string(), "dc_a".to_string()),
            ("reliable".to_string(), "dc_b".to_string()),
        ]);
        assert_eq!(losers, vec!["dc_b".to_string(), "dc_c".to_string()]);
    }

    #[test]
    fn test_dedup_losers_ignore_distinct_labels() {
        let losers = dedup_losers(vec![
            ("reliable".to_string(), "dc_a".to_string()),
            ("realtime".to_string(), "dc_b".to_string()),
        ]);
        assert!(losers.is_empty());
    }

    #[test]
    fn test_dedup_losers_empty() {
        assert!(dedup_losers(vec![]).is_empty());
    }

    #[tokio::test]
    async fn test_add_connection_is_idempotent() {
        let node = test_node();
        let conn = test_conn("dc_1", LABEL_RELIABLE);
        node.add_connection(conn.clone());
        node.add_connection(conn);
        assert_eq!(node.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_channel_map_keeps_first_per_label() {
        let node = test_node();
        node.add_connection(test_conn("dc_1", LABEL_RELIABLE));
        node.add_connection(test_conn("dc_2", LABEL_RELIABLE));
        assert_eq!(node.connection_count(), 2);
        assert_eq!(
            node.channel_map.lock().get(LABEL_RELIABLE),
            Some(&"dc_1".to_string())
        );
    }

    #[tokio::test]
    async fn test_removing_last_connection_closes_node() {
        let node = test_node();
        let mut events = node.events.subscribe();
        node.add_connection(test_conn("dc_1", LABEL_RELIABLE));
        node.remove_connection(&"dc_1".to_string());

        assert!(node.is_destroyed());
        assert!(!node.is_open());
        assert!(matches!(events.try_recv(), Ok(NodeEvent::Close)));
    }

    #[tokio::test]
    async fn test_close_emits_once() {
        let node = test_node();
        let mut events = node.events.subscribe();
        node.close_internal();
        node.close_internal();

        assert!(matches!(events.try_recv(), Ok(NodeEvent::Close)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let node = test_node();
        let result = node.send(Payload::text("hi"), SendOptions::default()).await;
        assert!(matches!(result, Err(Error::NotOpenYet(peer)) if peer == "bob"));
    }

    #[tokio::test]
    async fn test_lost_messages_replay_on_add() {
        let node = test_node();
        node.store_lost_message(
            "dc_1".to_string(),
            serde_json::from_str(r#"{"type":"LEAVE","src":"bob"}"#).unwrap(),
        );
        assert_eq!(node.lost_messages.lock().len(), 1);

        // Adding the matching connection consumes the queue.
        node.add_connection(test_conn("dc_1", LABEL_RELIABLE));
        assert!(node.lost_messages.lock().is_empty());
    }

    #[tokio::test]
    async fn test_destroyed_node_rejects_connections() {
        let node = test_node();
        node.close_internal();
        let conn = test_conn("dc_late", LABEL_RELIABLE);
        node.add_connection(conn.clone());
        assert_eq!(node.connection_count(), 0);
        assert!(conn.is_destroyed());
    }

    #[tokio::test]
    async fn test_ping_starts_unset() {
        let node = test_node();
        assert!(node.ping.lock().is_none());
    }

    #[test]
    fn test_send_options_default_reliable() {
        assert!(SendOptions::default().reliable);
    }
}
