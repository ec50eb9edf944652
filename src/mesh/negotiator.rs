//! # Negotiator
//!
//! Per-connection SDP/ICE state machine. Drives one `RTCPeerConnection` from
//! offer/answer exchange to an open data channel, relaying local ICE
//! candidates through the signaling socket.
//!
//! ```text
//! Originator:  Idle → Offering → Answered → Established → Closed
//! Answerer:    Idle → OfferReceived → Answering → Established → Closed
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{Error, Result};
use crate::signaling::{
    AnswerPayload, CandidatePayload, ClientMessage, OfferPayload, CONNECTION_KIND_DATA,
};

use super::connection::DataConnection;

/// Negotiation progress for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NegotiationState {
    /// Nothing has happened yet.
    Idle,
    /// We sent an offer and are waiting for the answer.
    Offering,
    /// We received an offer and are about to answer.
    OfferReceived,
    /// We sent our answer and are waiting for the transport.
    Answering,
    /// The remote answered our offer; ICE is completing.
    Answered,
    /// The data channel is open.
    Established,
    /// Torn down. Terminal.
    Closed,
}

/// Data-channel parameters for a label's delivery contract.
fn channel_init(reliable: bool) -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(reliable),
        max_retransmits: if reliable { None } else { Some(0) },
        ..Default::default()
    }
}

pub(crate) struct Negotiator {
    state: Mutex<NegotiationState>,
    peer_connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Set once ICE reaches `completed`; stops further candidate relays.
    candidates_suppressed: AtomicBool,
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NegotiationState::Idle),
            peer_connection: Mutex::new(None),
            candidates_suppressed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    pub fn set_established(&self) {
        *self.state.lock() = NegotiationState::Established;
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer_connection.lock().clone()
    }

    pub fn suppress_candidates(&self) {
        self.candidates_suppressed.store(true, Ordering::SeqCst);
    }

    fn candidates_suppressed(&self) -> bool {
        self.candidates_suppressed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // ORIGINATOR / ANSWERER PATHS
    // ========================================================================

    /// Drive the offering side: create the peer connection and data channel,
    /// then send the offer through the signaling socket.
    pub async fn start_originator(&self, conn: &Arc<DataConnection>) -> Result<()> {
        let pc = self.create_peer_connection(conn).await?;
        self.attach_listeners(conn, &pc);

        let channel = pc
            .create_data_channel(conn.label(), Some(channel_init(conn.reliable())))
            .await?;
        conn.initialize_channel(channel).await;

        *self.state.lock() = NegotiationState::Offering;

        let offer = pc.create_offer(None).await?;
        let offer = conn.apply_sdp_transform(offer)?;
        pc.set_local_description(offer.clone()).await?;

        tracing::debug!(
            "Sending offer for connection {} to {}",
            conn.connection_id(),
            conn.peer()
        );
        conn.send_signal(ClientMessage::Offer {
            dst: conn.peer().to_string(),
            payload: OfferPayload {
                sdp: offer,
                kind: CONNECTION_KIND_DATA.to_string(),
                connection_id: conn.connection_id().to_string(),
                metadata: conn.metadata(),
                label: conn.label().to_string(),
                reliable: conn.reliable(),
                serialization: conn.serialization().to_string(),
            },
        })
    }

    /// Drive the answering side: apply the remote offer and send our answer.
    pub async fn start_answerer(
        &self,
        conn: &Arc<DataConnection>,
        offer: OfferPayload,
    ) -> Result<()> {
        let pc = self.create_peer_connection(conn).await?;
        self.attach_listeners(conn, &pc);

        *self.state.lock() = NegotiationState::OfferReceived;
        pc.set_remote_description(offer.sdp).await?;

        *self.state.lock() = NegotiationState::Answering;
        let answer = pc.create_answer(None).await?;
        let answer = conn.apply_sdp_transform(answer)?;
        pc.set_local_description(answer.clone()).await?;

        tracing::debug!(
            "Sending answer for connection {} to {}",
            conn.connection_id(),
            conn.peer()
        );
        conn.send_signal(ClientMessage::Answer {
            dst: conn.peer().to_string(),
            payload: AnswerPayload {
                sdp: answer,
                kind: CONNECTION_KIND_DATA.to_string(),
                connection_id: conn.connection_id().to_string(),
            },
        })
    }

    // ========================================================================
    // REMOTE SIGNALING INPUT
    // ========================================================================

    /// Apply a remote session description. Offers (renegotiation) produce and
    /// send a fresh answer; answers complete our pending offer.
    pub async fn handle_sdp(
        &self,
        conn: &Arc<DataConnection>,
        sdp: RTCSessionDescription,
    ) -> Result<()> {
        let pc = self
            .peer_connection()
            .ok_or_else(|| Error::WebRtc("no peer connection to apply SDP to".into()))?;

        let is_offer = sdp.sdp_type == RTCSdpType::Offer;
        pc.set_remote_description(sdp).await?;

        if is_offer {
            *self.state.lock() = NegotiationState::Answering;
            let answer = pc.create_answer(None).await?;
            let answer = conn.apply_sdp_transform(answer)?;
            pc.set_local_description(answer.clone()).await?;
            conn.send_signal(ClientMessage::Answer {
                dst: conn.peer().to_string(),
                payload: AnswerPayload {
                    sdp: answer,
                    kind: CONNECTION_KIND_DATA.to_string(),
                    connection_id: conn.connection_id().to_string(),
                },
            })?;
        } else {
            *self.state.lock() = NegotiationState::Answered;
        }
        Ok(())
    }

    /// Apply a remote ICE candidate.
    pub async fn handle_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let pc = self
            .peer_connection()
            .ok_or_else(|| Error::WebRtc("no peer connection to add candidate to".into()))?;
        pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    // ========================================================================
    // SETUP / TEARDOWN
    // ========================================================================

    async fn create_peer_connection(
        &self,
        conn: &Arc<DataConnection>,
    ) -> Result<Arc<RTCPeerConnection>> {
        let client = conn.client().ok_or(Error::Destroyed)?;
        let api = client.webrtc_api()?;
        let config = RTCConfiguration {
            ice_servers: client.options().ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        *self.peer_connection.lock() = Some(pc.clone());
        Ok(pc)
    }

    fn attach_listeners(&self, conn: &Arc<DataConnection>, pc: &Arc<RTCPeerConnection>) {
        let weak = Arc::downgrade(conn);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                if conn.negotiator().candidates_suppressed() {
                    return;
                }
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let message = ClientMessage::Candidate {
                            dst: conn.peer().to_string(),
                            payload: CandidatePayload {
                                candidate: init,
                                kind: CONNECTION_KIND_DATA.to_string(),
                                connection_id: conn.connection_id().to_string(),
                            },
                        };
                        if let Err(e) = conn.send_signal(message) {
                            tracing::warn!(
                                "Failed to relay ICE candidate for {}: {}",
                                conn.peer(),
                                e
                            );
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let weak = Arc::downgrade(conn);
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(conn) = weak.upgrade() else { return };
                tracing::debug!(
                    "ICE state for connection {} to {}: {}",
                    conn.connection_id(),
                    conn.peer(),
                    state
                );
                match state {
                    RTCIceConnectionState::Failed => {
                        conn.surface_error(Error::NegotiationFailed(format!(
                            "negotiation with {} failed",
                            conn.peer()
                        )));
                        conn.close(false).await;
                    }
                    RTCIceConnectionState::Closed => {
                        conn.surface_error(Error::ConnectionClosed(format!(
                            "transport to {} closed",
                            conn.peer()
                        )));
                        conn.close(false).await;
                    }
                    RTCIceConnectionState::Disconnected => {
                        tracing::info!(
                            "ICE transport to {} disconnected; it may recover",
                            conn.peer()
                        );
                    }
                    RTCIceConnectionState::Completed => {
                        conn.negotiator().suppress_candidates();
                    }
                    _ => {}
                }
            })
        }));

        let weak = Arc::downgrade(conn);
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(conn) = weak.upgrade() {
                    tracing::debug!(
                        "Remote data channel '{}' arrived for {}",
                        channel.label(),
                        conn.peer()
                    );
                    conn.initialize_channel(channel).await;
                }
            })
        }));
    }

    /// Tear down the peer connection. Safe to call repeatedly; the in-flight
    /// close runs on its own task so synchronous teardown paths never block.
    pub fn cleanup(&self) {
        *self.state.lock() = NegotiationState::Closed;
        self.suppress_candidates();
        if let Some(pc) = self.peer_connection.lock().take() {
            tokio::spawn(async move {
                if let Err(e) = pc.close().await {
                    tracing::debug!("Peer connection close: {}", e);
                }
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
