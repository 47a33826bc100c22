//! Handshake construction and verification.
//!
//! The plain variant carries a protocol version and tags. The signed variant
//! binds those to an Ed25519 key:
//!
//! - `nIndex` is a deterministic score derived from the public key bytes.
//! - `negHash` is `SHA256(key || key ^ floor(nIndex * 255) || "{nIndex:.6}")`.
//! - `signature` covers the canonical JSON of the message without the
//!   signature field (keys sorted recursively, no whitespace).
//!
//! Verification recomputes all three from the presented key. Any mismatch is
//! a hard reject.

use crate::error::HandshakeError;
use crate::message::{ControlMessage, HandshakeMessage, HandshakeRecord, Tags};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Floor applied to the entropy denominator of `nIndex`.
pub const N_INDEX_EPSILON: f64 = 1e-6;

/// Allowed difference between presented and derived `nIndex`.
pub const N_INDEX_TOLERANCE: f64 = 1e-9;

/// Nonce length in bytes before base64 encoding.
pub const NONCE_LEN: usize = 16;

/// Computes `clamp(coherence / max(entropy, ε), 0, 1)` over `bytes`.
///
/// `coherence` is the first byte divided by the byte sum; `entropy` is the
/// base-2 Shannon entropy of the byte histogram. Non-finite results are 0.
pub fn n_index(bytes: &[u8]) -> f64 {
    let first = match bytes.first() {
        Some(b) => *b as f64,
        None => return 0.0,
    };
    let sum: f64 = bytes.iter().map(|b| *b as f64).sum();
    let coherence = first / sum;

    let mut histogram = [0usize; 256];
    for b in bytes {
        histogram[*b as usize] += 1;
    }
    let total = bytes.len() as f64;
    let entropy: f64 = histogram
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / total;
            -p * p.log2()
        })
        .sum();

    let index = coherence / entropy.max(N_INDEX_EPSILON);
    if index.is_finite() {
        index.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Computes the hex `negHash` for a key and its `nIndex`.
pub fn neg_hash(key: &[u8], n_index: f64) -> String {
    let clamped = if n_index.is_finite() {
        n_index.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let salt = (clamped * 255.0).floor() as u8;

    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(key.iter().map(|b| b ^ salt).collect::<Vec<u8>>());
    hasher.update(format!("{:.6}", clamped).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serializes a JSON value with object keys sorted at every depth and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Returns the bytes a signature covers: the canonical JSON of the
/// handshake frame with `signature` removed.
pub fn signing_bytes(msg: &HandshakeMessage) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(ControlMessage::Handshake(msg.unsigned()))?;
    Ok(canonical_json(&value).into_bytes())
}

/// Ed25519 key used to sign outbound handshakes.
pub struct HandshakeIdentity {
    signing_key: SigningKey,
}

impl HandshakeIdentity {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Loads a 32-byte seed encoded as base64.
    pub fn from_base64_seed(encoded: &str) -> Result<Self, HandshakeError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| HandshakeError::InvalidEncoding {
                field: "seed",
                reason: e.to_string(),
            })?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| HandshakeError::InvalidEncoding {
                field: "seed",
                reason: format!("expected 32 bytes, got {}", v.len()),
            })?;
        Ok(Self::from_seed(seed))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }
}

impl fmt::Debug for HandshakeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeIdentity")
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

/// Builds a plain handshake.
pub fn build_plain(version: Option<&str>, tags: &Tags) -> HandshakeMessage {
    HandshakeMessage {
        version: version.map(str::to_string),
        tags: tags.clone(),
        ..Default::default()
    }
}

/// Builds and signs a handshake with a fresh nonce and the current time.
pub fn build_signed(
    version: Option<&str>,
    tags: &Tags,
    identity: &HandshakeIdentity,
) -> Result<HandshakeMessage, serde_json::Error> {
    let nonce: [u8; NONCE_LEN] = rand::random();
    build_signed_with(
        version,
        tags,
        identity,
        &nonce,
        chrono::Utc::now().timestamp_millis(),
    )
}

/// Builds and signs a handshake with caller-supplied nonce and timestamp.
pub fn build_signed_with(
    version: Option<&str>,
    tags: &Tags,
    identity: &HandshakeIdentity,
    nonce: &[u8],
    ts: i64,
) -> Result<HandshakeMessage, serde_json::Error> {
    let key = identity.public_key_bytes();
    let index = n_index(&key);

    let mut msg = HandshakeMessage {
        version: version.map(str::to_string),
        tags: tags.clone(),
        public_key: Some(BASE64.encode(key)),
        nonce: Some(BASE64.encode(nonce)),
        ts: Some(ts),
        n_index: Some(index),
        neg_hash: Some(neg_hash(&key, index)),
        signature: None,
    };

    let signature = identity.sign(&signing_bytes(&msg)?);
    msg.signature = Some(BASE64.encode(signature.to_bytes()));
    Ok(msg)
}

/// Caller-supplied predicate over a peer's handshake tags.
pub type TagCheck = Arc<dyn Fn(&Tags) -> bool + Send + Sync>;

/// Validates inbound handshakes.
#[derive(Clone, Default)]
pub struct HandshakeVerifier {
    /// Local protocol version. A peer that also sets one must match.
    pub expected_version: Option<String>,
    /// Reject plain handshakes.
    pub require_signed: bool,
    /// Runs after version and signature checks; `false` rejects.
    pub tag_check: Option<TagCheck>,
}

impl fmt::Debug for HandshakeVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeVerifier")
            .field("expected_version", &self.expected_version)
            .field("require_signed", &self.require_signed)
            .field("tag_check", &self.tag_check.is_some())
            .finish()
    }
}

impl HandshakeVerifier {
    pub fn new(expected_version: Option<String>) -> Self {
        Self {
            expected_version,
            require_signed: false,
            tag_check: None,
        }
    }

    pub fn require_signed(mut self, require: bool) -> Self {
        self.require_signed = require;
        self
    }

    pub fn with_tag_check(mut self, check: Option<TagCheck>) -> Self {
        self.tag_check = check;
        self
    }

    /// Parses the first frame of a connection and verifies it.
    pub fn verify_frame(&self, payload: &[u8]) -> Result<HandshakeRecord, HandshakeError> {
        match ControlMessage::parse(payload) {
            Ok(Some(ControlMessage::Handshake(msg))) => self.verify(&msg),
            Ok(Some(ControlMessage::Heartbeat(_))) => {
                Err(HandshakeError::UnexpectedMessage("heartbeat".to_string()))
            }
            Ok(None) => Err(HandshakeError::UnexpectedMessage(format!(
                "{} byte application payload",
                payload.len()
            ))),
            Err(e) => Err(HandshakeError::Malformed(e.to_string())),
        }
    }

    /// Verifies a parsed handshake and produces its record.
    pub fn verify(&self, msg: &HandshakeMessage) -> Result<HandshakeRecord, HandshakeError> {
        if let (Some(expected), Some(actual)) = (&self.expected_version, &msg.version) {
            if expected != actual {
                return Err(HandshakeError::VersionMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }

        let record = if msg.is_signed() {
            self.verify_signed(msg)?
        } else if self.require_signed {
            return Err(HandshakeError::SignatureRequired);
        } else {
            HandshakeRecord {
                protocol_version: msg.version.clone(),
                tags: msg.tags.clone(),
                ..Default::default()
            }
        };

        match &self.tag_check {
            Some(check) if !check(&record.tags) => Err(HandshakeError::Rejected),
            _ => Ok(record),
        }
    }

    fn verify_signed(&self, msg: &HandshakeMessage) -> Result<HandshakeRecord, HandshakeError> {
        let public_key = msg
            .public_key
            .as_deref()
            .ok_or(HandshakeError::MissingField("publicKey"))?;
        let signature = msg
            .signature
            .as_deref()
            .ok_or(HandshakeError::MissingField("signature"))?;
        let presented_index = msg.n_index.ok_or(HandshakeError::MissingField("nIndex"))?;
        let presented_hash = msg
            .neg_hash
            .as_deref()
            .ok_or(HandshakeError::MissingField("negHash"))?;
        let nonce = msg.nonce.as_deref().ok_or(HandshakeError::MissingField("nonce"))?;
        if msg.ts.is_none() {
            return Err(HandshakeError::MissingField("ts"));
        }

        decode_field("nonce", nonce)?;
        let key_bytes: [u8; 32] = decode_field("publicKey", public_key)?
            .try_into()
            .map_err(|v: Vec<u8>| {
                HandshakeError::InvalidPublicKey(format!("expected 32 bytes, got {}", v.len()))
            })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;

        let derived_index = n_index(&key_bytes);
        if !presented_index.is_finite() || (presented_index - derived_index).abs() > N_INDEX_TOLERANCE
        {
            return Err(HandshakeError::IndexMismatch {
                presented: presented_index,
                derived: derived_index,
            });
        }

        if !presented_hash.eq_ignore_ascii_case(&neg_hash(&key_bytes, derived_index)) {
            return Err(HandshakeError::HashMismatch);
        }

        let sig_bytes: [u8; 64] = decode_field("signature", signature)?
            .try_into()
            .map_err(|_| HandshakeError::BadSignature)?;
        let sig = Signature::from_bytes(&sig_bytes);
        let signed = signing_bytes(msg).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        verifying_key
            .verify_strict(&signed, &sig)
            .map_err(|_| HandshakeError::BadSignature)?;

        Ok(HandshakeRecord {
            protocol_version: msg.version.clone(),
            tags: msg.tags.clone(),
            public_key: Some(public_key.to_string()),
            signature: Some(signature.to_string()),
            neg_hash: Some(presented_hash.to_string()),
            n_index: Some(derived_index),
        })
    }
}

fn decode_field(field: &'static str, encoded: &str) -> Result<Vec<u8>, HandshakeError> {
    BASE64
        .decode(encoded)
        .map_err(|e| HandshakeError::InvalidEncoding {
            field,
            reason: e.to_string(),
        })
}
