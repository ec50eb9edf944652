//! # Payloads & Serializers
//!
//! Application payloads cross a data channel as opaque byte frames. A
//! [`Serializer`] turns a [`Payload`] into one frame and back; three built-ins
//! cover the wire formats peers negotiate in offers:
//!
//! - `raw` — binary passthrough; text/JSON payloads are sent as UTF-8 JSON
//!   and decoded back as bytes.
//! - `json` — UTF-8 JSON with a fixed 16300-byte frame limit.
//! - `binary` — length-prefixed tagged frames that round-trip every payload
//!   variant exactly.
//!
//! User serializers register by name in
//! [`MeshOptions::serializers`](crate::MeshOptions) and are selected per
//! connection via the `serialization` field of the offer.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Error, Result};

/// Frame limit of the `json` serializer, in encoded bytes.
pub const JSON_MTU: usize = 16300;

/// Serializer name used when a connect option or offer names none.
pub const DEFAULT_SERIALIZATION: &str = "binary";

/// Sentinel field marking in-band mesh control messages.
pub(crate) const INTERNAL_SENTINEL: &str = "__peerJSInternal";

/// Sentinel field marking in-band connection control messages.
pub(crate) const CONTROL_SENTINEL: &str = "__peerData";

// ============================================================================
// PAYLOAD
// ============================================================================

/// An opaque application payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes.
    Binary(Bytes),
    /// A UTF-8 string.
    Text(String),
    /// A structured JSON value.
    Json(Value),
}

impl Payload {
    /// Build a binary payload from anything byte-like.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Binary(data.into())
    }

    /// Build a text payload.
    pub fn text(data: impl Into<String>) -> Self {
        Payload::Text(data.into())
    }

    /// Build a JSON payload.
    pub fn json(value: Value) -> Self {
        Payload::Json(value)
    }

    /// View the payload as a JSON value, parsing text/bytes when needed.
    ///
    /// Control-message detection uses this so the sentinel survives every
    /// serializer, including `raw` which decodes to bytes.
    pub fn as_json_value(&self) -> Option<Value> {
        match self {
            Payload::Json(value) => Some(value.clone()),
            Payload::Text(text) => serde_json::from_str(text).ok(),
            Payload::Binary(bytes) => serde_json::from_slice(bytes).ok(),
        }
    }
}

/// Extract the in-band mesh control object, if this payload carries one.
pub(crate) fn internal_control(payload: &Payload) -> Option<Value> {
    let value = payload.as_json_value()?;
    match value.get(INTERNAL_SENTINEL) {
        Some(Value::Bool(true)) => Some(value),
        _ => None,
    }
}

/// Whether this payload is the graceful-close control message.
pub(crate) fn is_close_control(payload: &Payload) -> bool {
    payload
        .as_json_value()
        .and_then(|value| value.get(CONTROL_SENTINEL).cloned())
        .map(|control| control.get("type") == Some(&Value::String("close".into())))
        .unwrap_or(false)
}

/// The graceful-close control message.
pub(crate) fn close_control() -> Payload {
    Payload::Json(serde_json::json!({ CONTROL_SENTINEL: { "type": "close" } }))
}

// ============================================================================
// SERIALIZER TRAIT
// ============================================================================

/// Encodes payloads into data-channel frames and back.
pub trait Serializer: Send + Sync {
    /// The name carried in offers to select this serializer on both sides.
    fn name(&self) -> &str;

    /// Encode one payload into one frame.
    fn encode(&self, payload: &Payload) -> Result<Bytes>;

    /// Decode one frame into one payload.
    fn decode(&self, frame: &Bytes) -> Result<Payload>;
}

// ============================================================================
// BUILT-IN SERIALIZERS
// ============================================================================

/// Binary passthrough. Non-binary payloads are encoded as UTF-8 JSON so the
/// in-band control messages still cross the channel; frames always decode as
/// bytes.
#[derive(Debug, Default)]
pub struct RawSerializer;

impl Serializer for RawSerializer {
    fn name(&self) -> &str {
        "raw"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes> {
        match payload {
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Text(text) => Ok(Bytes::from(serde_json::to_vec(text)?)),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }

    fn decode(&self, frame: &Bytes) -> Result<Payload> {
        Ok(Payload::Binary(frame.clone()))
    }
}

/// UTF-8 JSON frames with a fixed frame limit.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes> {
        let encoded = match payload {
            Payload::Json(value) => serde_json::to_vec(value)?,
            Payload::Text(text) => serde_json::to_vec(text)?,
            Payload::Binary(_) => {
                return Err(Error::Serialization(
                    "binary payloads require the raw or binary serializer".into(),
                ))
            }
        };
        if encoded.len() >= JSON_MTU {
            return Err(Error::MessageTooBig {
                size: encoded.len(),
                limit: JSON_MTU,
            });
        }
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, frame: &Bytes) -> Result<Payload> {
        let value: Value = serde_json::from_slice(frame)?;
        match value {
            Value::String(text) => Ok(Payload::Text(text)),
            other => Ok(Payload::Json(other)),
        }
    }
}

/// Payload-variant tags inside binary frames.
const TAG_BINARY: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_JSON: u8 = 2;

/// Length-prefixed tagged frames: `[len: u32 BE][tag: u8][body]` where `len`
/// covers the tag and body. Round-trips every payload variant exactly.
#[derive(Debug, Default)]
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn name(&self) -> &str {
        "binary"
    }

    fn encode(&self, payload: &Payload) -> Result<Bytes> {
        let (tag, body) = match payload {
            Payload::Binary(bytes) => (TAG_BINARY, bytes.to_vec()),
            Payload::Text(text) => (TAG_TEXT, text.as_bytes().to_vec()),
            Payload::Json(value) => (TAG_JSON, serde_json::to_vec(value)?),
        };
        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u32(1 + body.len() as u32);
        frame.put_u8(tag);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    fn decode(&self, frame: &Bytes) -> Result<Payload> {
        if frame.len() < 5 {
            return Err(Error::Serialization("binary frame too short".into()));
        }
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if declared != frame.len() - 4 {
            return Err(Error::Serialization(format!(
                "binary frame length mismatch: declared {}, got {}",
                declared,
                frame.len() - 4
            )));
        }
        let body = &frame[5..];
        match frame[4] {
            TAG_BINARY => Ok(Payload::Binary(Bytes::copy_from_slice(body))),
            TAG_TEXT => Ok(Payload::Text(
                String::from_utf8(body.to_vec())
                    .map_err(|e| Error::Serialization(e.to_string()))?,
            )),
            TAG_JSON => Ok(Payload::Json(serde_json::from_slice(body)?)),
            tag => Err(Error::Serialization(format!("unknown frame tag {tag}"))),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Serializers available to this client, keyed by offer name.
#[derive(Clone)]
pub(crate) struct SerializerRegistry {
    serializers: HashMap<String, Arc<dyn Serializer>>,
}

impl SerializerRegistry {
    /// Build the registry: the three built-ins plus user-supplied entries,
    /// which may shadow a built-in of the same name.
    pub fn new(user: &HashMap<String, Arc<dyn Serializer>>) -> Self {
        let mut serializers: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
        for serializer in [
            Arc::new(RawSerializer) as Arc<dyn Serializer>,
            Arc::new(JsonSerializer) as Arc<dyn Serializer>,
            Arc::new(BinarySerializer) as Arc<dyn Serializer>,
        ] {
            serializers.insert(serializer.name().to_string(), serializer);
        }
        for (name, serializer) in user {
            serializers.insert(name.clone(), serializer.clone());
        }
        Self { serializers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(name).cloned()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SerializerRegistry {
        SerializerRegistry::new(&HashMap::new())
    }

    #[test]
    fn test_registry_has_builtins() {
        let registry = registry();
        assert!(registry.get("raw").is_some());
        assert!(registry.get("json").is_some());
        assert!(registry.get("binary").is_some());
        assert!(registry.get("msgpack").is_none());
    }

    #[test]
    fn test_raw_binary_passthrough() {
        let serializer = RawSerializer;
        let payload = Payload::binary(vec![0u8, 1, 2, 255]);
        let frame = serializer.encode(&payload).unwrap();
        assert_eq!(serializer.decode(&frame).unwrap(), payload);
    }

    #[test]
    fn test_json_text_round_trip() {
        let serializer = JsonSerializer;
        let payload = Payload::text("hello");
        let frame = serializer.encode(&payload).unwrap();
        assert_eq!(serializer.decode(&frame).unwrap(), payload);
    }

    #[test]
    fn test_json_value_round_trip() {
        let serializer = JsonSerializer;
        let payload = Payload::json(json!({"kind": "move", "x": 3, "y": [1, 2]}));
        let frame = serializer.encode(&payload).unwrap();
        assert_eq!(serializer.decode(&frame).unwrap(), payload);
    }

    #[test]
    fn test_json_rejects_oversized_frames() {
        let serializer = JsonSerializer;
        let payload = Payload::text("x".repeat(JSON_MTU));
        match serializer.encode(&payload) {
            Err(Error::MessageTooBig { size, limit }) => {
                assert!(size >= JSON_MTU);
                assert_eq!(limit, JSON_MTU);
            }
            other => panic!("expected MessageTooBig, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_json_accepts_frames_under_limit() {
        let serializer = JsonSerializer;
        // 2 quote bytes of JSON overhead keeps this just below the limit.
        let payload = Payload::text("x".repeat(JSON_MTU - 3));
        assert!(serializer.encode(&payload).is_ok());
    }

    #[test]
    fn test_json_rejects_binary() {
        let serializer = JsonSerializer;
        let err = serializer.encode(&Payload::binary(vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_binary_round_trips_all_variants() {
        let serializer = BinarySerializer;
        let payloads = vec![
            Payload::binary(vec![0u8, 9, 8, 7]),
            Payload::text("hello"),
            Payload::json(json!({"peers": ["a", "b"], "n": 42})),
        ];
        for payload in payloads {
            let frame = serializer.encode(&payload).unwrap();
            assert_eq!(serializer.decode(&frame).unwrap(), payload, "frame {frame:?}");
        }
    }

    #[test]
    fn test_binary_length_prefix() {
        let serializer = BinarySerializer;
        let frame = serializer.encode(&Payload::binary(vec![1, 2, 3])).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 4]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_binary_rejects_corrupt_frames() {
        let serializer = BinarySerializer;
        assert!(serializer.decode(&Bytes::from_static(&[0, 0])).is_err());

        let mut frame = serializer
            .encode(&Payload::text("hi"))
            .unwrap()
            .to_vec();
        frame[3] += 1;
        assert!(serializer.decode(&Bytes::from(frame)).is_err());
    }

    #[test]
    fn test_internal_control_detection_across_serializers() {
        let message = Payload::Json(json!({
            INTERNAL_SENTINEL: true,
            "type": "mesh-peers",
            "peers": ["c"],
        }));

        for serializer in [
            Box::new(RawSerializer) as Box<dyn Serializer>,
            Box::new(JsonSerializer),
            Box::new(BinarySerializer),
        ] {
            let frame = serializer.encode(&message).unwrap();
            let decoded = serializer.decode(&frame).unwrap();
            let control = internal_control(&decoded)
                .unwrap_or_else(|| panic!("sentinel lost by {}", serializer.name()));
            assert_eq!(control["type"], "mesh-peers");
        }
    }

    #[test]
    fn test_internal_control_ignores_plain_payloads() {
        assert!(internal_control(&Payload::text("hello")).is_none());
        assert!(internal_control(&Payload::json(json!({"type": "mesh-peers"}))).is_none());
        assert!(
            internal_control(&Payload::json(json!({ INTERNAL_SENTINEL: false }))).is_none()
        );
    }

    #[test]
    fn test_close_control_round_trip() {
        let control = close_control();
        assert!(is_close_control(&control));
        assert!(!is_close_control(&Payload::text("close")));

        let serializer = BinarySerializer;
        let frame = serializer.encode(&control).unwrap();
        assert!(is_close_control(&serializer.decode(&frame).unwrap()));
    }
}
