//! # Lattice Core
//!
//! A peer-to-peer mesh networking library over WebRTC data channels. A
//! central signaling server brokers SDP/ICE exchange; once data channels are
//! up, peers gossip their peer lists to each other and the mesh fills in
//! transitively — the server never sees application data.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         LATTICE CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                          MeshClient                              │   │
//! │  │                                                                  │   │
//! │  │  connect() / broadcast() / disconnect() / reconnect() / destroy()│   │
//! │  └───────┬──────────────────────────────┬───────────────────────────┘   │
//! │          │                              │                               │
//! │          ▼                              ▼                               │
//! │  ┌───────────────┐              ┌───────────────────────────────────┐   │
//! │  │   Signaling   │              │          RemoteNode (× N)         │   │
//! │  │               │              │                                   │   │
//! │  │ - id fetch    │              │  ┌─────────────────────────────┐  │   │
//! │  │ - WebSocket   │              │  │ DataConnection (per label)  │  │   │
//! │  │ - heartbeat   │              │  │   └── Negotiator (SDP/ICE)  │  │   │
//! │  │ - JSON wire   │              │  └─────────────────────────────┘  │   │
//! │  └───────────────┘              │  - open latch / dedup / ping      │   │
//! │                                 └───────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌───────────────┐              ┌───────────────────────────────────┐   │
//! │  │  Serializers  │              │          Mesh Discovery           │   │
//! │  │               │              │                                   │   │
//! │  │ raw/json/bin  │◄────────────►│  mesh-peers / mesh-peers-ack      │   │
//! │  │ + user-defined│              │  retry with back-off              │   │
//! │  └───────────────┘              └───────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PEER CONNECTION FLOW                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. A: connect("b")     → RemoteNode + DataConnection + Negotiator      │
//! │  2. A → server: OFFER   → sdp, connectionId, label, serialization       │
//! │  3. B: Connection event → answers with ANSWER, exchanges CANDIDATEs     │
//! │  4. Data channel opens  → both nodes emit Open                          │
//! │  5. Mesh handshake      → B learns A's peers, connects transitively     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Client options, validation, token generation
//! - [`serializer`] - Payload framing (raw / json / binary / user-defined)
//! - [`signaling`] - Wire protocol, id retrieval, WebSocket session
//! - [`mesh`] - Client, nodes, connections, negotiation, discovery
//!
//! ## Example
//!
//! ```ignore
//! use lattice_core::{MeshClient, MeshOptions, ConnectOptions, Payload};
//!
//! let client = MeshClient::new(Some("alice".into()), MeshOptions::default())?;
//! let mut events = client.subscribe();
//! // ... wait for ClientEvent::Open ...
//! let node = client.connect("bob", ConnectOptions::default())?;
//! let mut node_events = node.subscribe();
//! // ... wait for NodeEvent::Open ...
//! node.send(Payload::text("hello")).await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod error;
pub mod mesh;
pub mod serializer;
pub mod signaling;
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::{MeshOptions, RandomTokenGenerator, TokenGenerator};
pub use error::{Error, Result};
pub use mesh::{
    ClientEvent, ConnectOptions, MeshClient, NodeEvent, RemoteNode, SdpTransform,
    SendOptions, LABEL_REALTIME, LABEL_RELIABLE,
};
pub use serializer::{Payload, Serializer};

/// Opaque peer identifier, assigned by the signaling server or chosen by the
/// client (alphanumeric plus dashes/underscores).
pub type PeerId = String;

/// Opaque identifier of one data connection, locally generated; correlates
/// out-of-order signaling messages with the connection they belong to.
pub type ConnectionId = String;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of the library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
