//! # Mesh Events
//!
//! Typed events emitted by the client and by individual remote nodes.
//! Subscribers receive them through `tokio::sync::broadcast` channels
//! (multiple subscribers supported; slow subscribers miss old events rather
//! than blocking the mesh).

use crate::error::Error;
use crate::serializer::Payload;
use crate::{mesh::RemoteNode, PeerId};

/// Events emitted by a [`MeshClient`](crate::MeshClient).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The signaling session is established and the id is final.
    Open {
        /// Our peer id for this session.
        id: PeerId,
    },

    /// A remote peer initiated a connection to us.
    Connection {
        /// The node created for the remote peer.
        node: RemoteNode,
    },

    /// The signaling session is gone; established peer links survive.
    Disconnected {
        /// The id the session had.
        id: PeerId,
    },

    /// The client is destroyed. Terminal.
    Close,

    /// A failure was surfaced on the client.
    Error {
        /// What went wrong.
        error: Error,
    },
}

/// Events emitted by a [`RemoteNode`](crate::RemoteNode).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The first connection to this peer opened.
    Open,

    /// An application payload arrived.
    Data {
        /// The decoded payload.
        payload: Payload,
    },

    /// The node is closed. Terminal.
    Close,

    /// A failure was surfaced on this node.
    Error {
        /// What went wrong.
        error: Error,
    },

    /// A fresh latency measurement completed.
    Ping {
        /// Average round-trip time in milliseconds.
        ms: u32,
    },
}

impl NodeEvent {
    /// Whether this event ends the node's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Close)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_event_terminal() {
        assert!(NodeEvent::Close.is_terminal());
        assert!(!NodeEvent::Open.is_terminal());
        assert!(!NodeEvent::Ping { ms: 12 }.is_terminal());
        assert!(!NodeEvent::Data {
            payload: Payload::text("x")
        }
        .is_terminal());
    }

    #[test]
    fn test_events_are_cloneable() {
        let event = ClientEvent::Error {
            error: Error::PeerUnavailable("bob".into()),
        };
        let clone = event.clone();
        match clone {
            ClientEvent::Error { error } => {
                assert_eq!(error, Error::PeerUnavailable("bob".into()))
            }
            _ => panic!("Wrong variant"),
        }
    }
}
