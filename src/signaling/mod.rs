//! # Signaling Protocol
//!
//! Wire types and transport for the rendezvous server that mediates SDP and
//! ICE exchange. The server never sees application data; it routes small JSON
//! messages between peers and assigns ids.
//!
//! ## Message Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      SIGNALING SESSION                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  Client                                   Server                │
//! │  ──────                                   ──────                │
//! │                                                                 │
//! │  1. GET /{key}/id  ──────────────────────►  (no id supplied)    │
//! │                    ◄──────────────────────  assigned id         │
//! │                                                                 │
//! │  2. WS /peerjs?key=&id=&token= ──────────►                      │
//! │                    ◄──────────────────────  {type: "OPEN"}      │
//! │                                                                 │
//! │  3. {type: "OFFER", dst, payload} ───────►  routed to dst       │
//! │     ◄──────────────  {type: "ANSWER", src, payload}             │
//! │     ◄─────────────►  {type: "CANDIDATE", ...}                   │
//! │                                                                 │
//! │  4. {type: "HEARTBEAT"} every ping interval                     │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod socket;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::{ConnectionId, PeerId};

pub use socket::{Socket, SocketEvent};

/// Connection kind carried in offer/answer/candidate payloads. Only data
/// connections exist here; media is out of scope.
pub const CONNECTION_KIND_DATA: &str = "data";

// ============================================================================
// PAYLOADS
// ============================================================================

/// Payload of an `ERROR` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable message from the server.
    pub msg: String,
}

/// Payload of an `OFFER` message. Carries everything the answering side needs
/// to build the matching connection: the SDP blob plus the channel contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// The SDP offer.
    pub sdp: RTCSessionDescription,
    /// Connection kind (`"data"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlates signaling messages with one connection.
    pub connection_id: ConnectionId,
    /// Opaque application metadata attached at connect time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Channel label (`"reliable"` / `"realtime"`).
    pub label: String,
    /// Ordered + retransmitted semantics.
    pub reliable: bool,
    /// Serializer name both sides use on this connection.
    pub serialization: String,
}

/// Payload of an `ANSWER` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// The SDP answer.
    pub sdp: RTCSessionDescription,
    /// Connection kind (`"data"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlates signaling messages with one connection.
    pub connection_id: ConnectionId,
}

/// Payload of a `CANDIDATE` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    /// The ICE candidate.
    pub candidate: RTCIceCandidateInit,
    /// Connection kind (`"data"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlates signaling messages with one connection.
    pub connection_id: ConnectionId,
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Messages received from the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ServerMessage {
    /// Session established; the client id is final.
    Open,
    /// Fatal server-side failure.
    Error {
        /// Error details.
        payload: ErrorPayload,
    },
    /// The requested id is already in use.
    IdTaken,
    /// The API key was rejected.
    InvalidKey,
    /// A peer left the mesh.
    Leave {
        /// The departing peer.
        src: PeerId,
    },
    /// A message to a peer expired undelivered.
    Expire {
        /// The unreachable peer.
        src: PeerId,
    },
    /// A peer wants to connect to us.
    Offer {
        /// The offering peer.
        src: PeerId,
        /// Offer details.
        payload: OfferPayload,
    },
    /// A peer answered our offer.
    Answer {
        /// The answering peer.
        src: PeerId,
        /// Answer details.
        payload: AnswerPayload,
    },
    /// A peer relayed an ICE candidate.
    Candidate {
        /// The sending peer.
        src: PeerId,
        /// Candidate details.
        payload: CandidatePayload,
    },
    /// Server heartbeat echo.
    Heartbeat,
    /// Anything this client version does not understand; logged and dropped.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// The sending peer, when the message has one.
    pub fn src(&self) -> Option<&PeerId> {
        match self {
            Self::Leave { src }
            | Self::Expire { src }
            | Self::Offer { src, .. }
            | Self::Answer { src, .. }
            | Self::Candidate { src, .. } => Some(src),
            _ => None,
        }
    }

    /// The connection this message belongs to, when it carries one.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        match self {
            Self::Offer { payload, .. } => Some(&payload.connection_id),
            Self::Answer { payload, .. } => Some(&payload.connection_id),
            Self::Candidate { payload, .. } => Some(&payload.connection_id),
            _ => None,
        }
    }
}

/// Messages sent to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ClientMessage {
    /// Offer a connection to `dst`.
    Offer {
        /// The target peer.
        dst: PeerId,
        /// Offer details.
        payload: OfferPayload,
    },
    /// Answer an offer from `dst`.
    Answer {
        /// The target peer.
        dst: PeerId,
        /// Answer details.
        payload: AnswerPayload,
    },
    /// Relay an ICE candidate to `dst`.
    Candidate {
        /// The target peer.
        dst: PeerId,
        /// Candidate details.
        payload: CandidatePayload,
    },
    /// Keep the session alive.
    Heartbeat,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_open() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"OPEN"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Open));
    }

    #[test]
    fn test_server_message_error() {
        let json = r#"{"type":"ERROR","payload":{"msg":"something broke"}}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::Error { payload } => assert_eq!(payload.msg, "something broke"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_message_id_taken() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ID-TAKEN"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::IdTaken));
    }

    #[test]
    fn test_server_message_invalid_key() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"INVALID-KEY"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::InvalidKey));
    }

    #[test]
    fn test_server_message_leave_and_expire() {
        let leave: ServerMessage =
            serde_json::from_str(r#"{"type":"LEAVE","src":"bob"}"#).unwrap();
        assert_eq!(leave.src().map(String::as_str), Some("bob"));
        assert!(leave.connection_id().is_none());

        let expire: ServerMessage =
            serde_json::from_str(r#"{"type":"EXPIRE","src":"carol"}"#).unwrap();
        assert_eq!(expire.src().map(String::as_str), Some("carol"));
    }

    #[test]
    fn test_server_message_offer_round_trip() {
        let json = r#"{
            "type": "OFFER",
            "src": "alice",
            "payload": {
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "type": "data",
                "connectionId": "dc_abc123",
                "metadata": {"room": "lobby"},
                "label": "reliable",
                "reliable": true,
                "serialization": "binary"
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match &msg {
            ServerMessage::Offer { src, payload } => {
                assert_eq!(src, "alice");
                assert_eq!(payload.connection_id, "dc_abc123");
                assert_eq!(payload.label, "reliable");
                assert!(payload.reliable);
                assert_eq!(payload.serialization, "binary");
                assert_eq!(payload.metadata.as_ref().unwrap()["room"], "lobby");
                assert_eq!(payload.sdp.sdp, "v=0\r\n");
            }
            _ => panic!("Wrong variant"),
        }
        assert_eq!(msg.connection_id().map(String::as_str), Some("dc_abc123"));

        let rewired = serde_json::to_string(&msg).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&rewired).unwrap();
        assert_eq!(
            parsed.connection_id().map(String::as_str),
            Some("dc_abc123")
        );
    }

    #[test]
    fn test_server_message_answer() {
        let json = r#"{
            "type": "ANSWER",
            "src": "bob",
            "payload": {
                "sdp": {"type": "answer", "sdp": "v=0\r\n"},
                "type": "data",
                "connectionId": "dc_xyz"
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.src().map(String::as_str), Some("bob"));
        assert_eq!(msg.connection_id().map(String::as_str), Some("dc_xyz"));
    }

    #[test]
    fn test_server_message_candidate() {
        let json = r#"{
            "type": "CANDIDATE",
            "src": "bob",
            "payload": {
                "candidate": {"candidate": "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host", "sdpMid": "0", "sdpMLineIndex": 0},
                "type": "data",
                "connectionId": "dc_xyz"
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::Candidate { payload, .. } => {
                assert!(payload.candidate.candidate.starts_with("candidate:1"));
                assert_eq!(payload.connection_id, "dc_xyz");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_server_message_unknown_type() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"SOMETHING-NEW"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
        assert!(msg.src().is_none());
        assert!(msg.connection_id().is_none());
    }

    #[test]
    fn test_client_message_wire_types() {
        let heartbeat = serde_json::to_string(&ClientMessage::Heartbeat).unwrap();
        assert_eq!(heartbeat, r#"{"type":"HEARTBEAT"}"#);

        let offer = ClientMessage::Offer {
            dst: "bob".to_string(),
            payload: OfferPayload {
                sdp: RTCSessionDescription::default(),
                kind: CONNECTION_KIND_DATA.to_string(),
                connection_id: "dc_1".to_string(),
                metadata: None,
                label: "reliable".to_string(),
                reliable: true,
                serialization: "binary".to_string(),
            },
        };
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains(r#""type":"OFFER""#));
        assert!(json.contains(r#""dst":"bob""#));
        assert!(json.contains(r#""connectionId":"dc_1""#));
        assert!(!json.contains("metadata"));
    }

    #[test]
    fn test_candidate_payload_wire_shape() {
        let payload = CandidatePayload {
            candidate: RTCIceCandidateInit {
                candidate: "candidate:0 1 UDP 1 198.51.100.5 4242 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            kind: CONNECTION_KIND_DATA.to_string(),
            connection_id: "dc_2".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""connectionId":"dc_2""#));
        assert!(json.contains(r#""type":"data""#));
    }
}
