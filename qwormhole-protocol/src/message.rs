//! Control messages exchanged in-band with application payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Handshake tag value: a string or a JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Text(String),
    Number(serde_json::Number),
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Text(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Text(s)
    }
}

impl From<i64> for TagValue {
    fn from(n: i64) -> Self {
        TagValue::Number(n.into())
    }
}

impl From<u64> for TagValue {
    fn from(n: u64) -> Self {
        TagValue::Number(n.into())
    }
}

/// Handshake tags, ordered by key.
pub type Tags = BTreeMap<String, TagValue>;

/// Control messages recognized on the wire.
///
/// Serialized with an inline `type` discriminator, e.g.
/// `{"type":"heartbeat","ts":1700000000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Handshake(HandshakeMessage),
    Heartbeat(Heartbeat),
}

impl ControlMessage {
    /// Classifies an inbound payload.
    ///
    /// Returns `Ok(None)` for application payloads (anything that is not a
    /// JSON object whose `type` names a control message), `Ok(Some(..))` for
    /// well-formed control messages, and `Err` when the `type` claims a
    /// control message but the body does not match it.
    pub fn parse(payload: &[u8]) -> Result<Option<ControlMessage>, serde_json::Error> {
        let first = payload.iter().find(|b| !b.is_ascii_whitespace());
        if first != Some(&b'{') {
            return Ok(None);
        }

        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };

        match value.get("type").and_then(Value::as_str) {
            Some("handshake") | Some("heartbeat") => serde_json::from_value(value).map(Some),
            _ => Ok(None),
        }
    }

    /// Serializes to compact JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, ControlMessage::Heartbeat(_))
    }
}

/// Handshake frame body.
///
/// Only `version` and `tags` are present in the plain variant; the signed
/// variant carries every field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,

    /// Raw Ed25519 public key, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// 16 random bytes, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_index: Option<f64>,

    /// Lowercase hex SHA-256.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neg_hash: Option<String>,

    /// Ed25519 signature over the canonical unsigned payload, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl HandshakeMessage {
    /// Returns whether any signed-variant field is present.
    pub fn is_signed(&self) -> bool {
        self.public_key.is_some() || self.signature.is_some()
    }

    /// Returns a copy with the signature removed.
    pub fn unsigned(&self) -> HandshakeMessage {
        HandshakeMessage {
            signature: None,
            ..self.clone()
        }
    }
}

/// Liveness probe, swallowed by receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub ts: i64,
}

impl Heartbeat {
    pub fn now() -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Verified handshake, attached to a connection once and never modified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,

    #[serde(default)]
    pub tags: Tags,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub neg_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_index: Option<f64>,
}

impl HandshakeRecord {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
