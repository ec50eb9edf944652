//! # Client Configuration
//!
//! Immutable configuration threaded into [`MeshClient`](crate::MeshClient):
//! signaling endpoint coordinates, ICE server set, heartbeat cadence, and the
//! serializer registry. The random source used for connection ids and socket
//! tokens sits behind the [`TokenGenerator`] trait so tests can inject
//! deterministic sequences.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};
use crate::serializer::Serializer;

/// Default signaling host (the public cloud broker).
pub const DEFAULT_HOST: &str = "0.peerjs.com";
/// Default signaling port.
pub const DEFAULT_PORT: u16 = 443;
/// Default signaling mount path.
pub const DEFAULT_PATH: &str = "/";
/// Default API key.
pub const DEFAULT_KEY: &str = "peerjs";
/// Heartbeat cadence on the signaling socket.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);

/// STUN servers used when the caller supplies no ICE configuration.
const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ============================================================================
// TOKEN GENERATION
// ============================================================================

/// Source of the random tokens used for connection ids and socket tokens.
///
/// The default implementation draws from the thread RNG; tests swap in a
/// deterministic sequence to make id-ordering behavior reproducible.
pub trait TokenGenerator: Send + Sync {
    /// Produce a fresh token.
    fn token(&self) -> String;
}

/// Random alphanumeric tokens.
#[derive(Debug, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn token(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(11)
            .map(char::from)
            .collect::<String>()
            .to_lowercase()
    }
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Configuration for a [`MeshClient`](crate::MeshClient).
#[derive(Clone)]
pub struct MeshOptions {
    /// Signaling server host.
    pub host: String,
    /// Signaling server port.
    pub port: u16,
    /// Mount path of the signaling server (always `/`-wrapped).
    pub path: String,
    /// API key presented to the signaling server.
    pub key: String,
    /// Use TLS (`https`/`wss`) to reach the signaling server.
    pub secure: bool,
    /// ICE servers handed to every peer connection.
    pub ice_servers: Vec<RTCIceServer>,
    /// Heartbeat cadence on the signaling socket.
    pub ping_interval: Duration,
    /// User-supplied serializers, keyed by the name carried in offers.
    pub serializers: HashMap<String, Arc<dyn Serializer>>,
    /// Random source for connection ids and socket tokens.
    pub token_generator: Arc<dyn TokenGenerator>,
}

impl std::fmt::Debug for MeshOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("key", &self.key)
            .field("secure", &self.secure)
            .field("ice_servers", &self.ice_servers.len())
            .field("ping_interval", &self.ping_interval)
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            key: DEFAULT_KEY.to_string(),
            secure: true,
            ice_servers: default_ice_servers(),
            ping_interval: DEFAULT_PING_INTERVAL,
            serializers: HashMap::new(),
            token_generator: Arc::new(RandomTokenGenerator),
        }
    }
}

impl MeshOptions {
    /// URL scheme pair for the configured security mode.
    pub fn schemes(&self) -> (&'static str, &'static str) {
        if self.secure {
            ("https", "wss")
        } else {
            ("http", "ws")
        }
    }

    /// The mount path, normalized to start and end with `/`.
    pub fn normalized_path(&self) -> String {
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        path
    }

    /// Validate endpoint coordinates before bring-up.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Network("signaling host must not be empty".into()));
        }
        validate_key(&self.key)?;
        Ok(())
    }
}

/// Default ICE configuration: public STUN, no TURN.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }]
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Validate a peer id: non-empty, alphanumeric plus dashes/underscores.
pub fn validate_peer_id(id: &str) -> Result<()> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Validate an API key with the same alphabet as peer ids.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
