//! Admission hooks.
//!
//! Every accepted socket is offered to [`ConnectionHooks::allow_connection`]
//! before any byte is read, and to [`ConnectionHooks::authorize_connection`]
//! once its handshake has been verified. Returning `Ok(false)` or an error
//! rejects the connection.

use crate::error::ServerError;
use crate::registry::ConnectionInfo;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::SocketAddr;

pub trait ConnectionHooks: Send + Sync + 'static {
    /// Called with the peer address only, before TLS and handshake.
    fn allow_connection(&self, _remote_addr: SocketAddr) -> Result<bool, ServerError> {
        Ok(true)
    }

    /// Called after the handshake, before the connection is registered.
    fn authorize_connection(&self, _info: &ConnectionInfo) -> Result<bool, ServerError> {
        Ok(true)
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionHooks for AllowAll {}

/// Admits only clients whose signed handshake carries a known public key.
///
/// Keys are stored as SHA-256 hashes of their base64 form so the
/// configuration never lists raw keys.
#[derive(Debug, Clone)]
pub struct KeyAllowList {
    hashes: HashSet<String>,
}

impl KeyAllowList {
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            hashes: hashes.into_iter().map(|h| h.to_lowercase()).collect(),
        }
    }

    pub fn key_count(&self) -> usize {
        self.hashes.len()
    }

    /// Hashes a base64 public key, returning a lowercase hex string.
    pub fn hash_key(public_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(public_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn allows(&self, public_key: &str) -> bool {
        self.hashes.contains(&Self::hash_key(public_key))
    }
}

impl ConnectionHooks for KeyAllowList {
    fn authorize_connection(&self, info: &ConnectionInfo) -> Result<bool, ServerError> {
        let key = info
            .handshake
            .as_ref()
            .filter(|h| h.is_signed())
            .and_then(|h| h.public_key.as_deref());
        match key {
            Some(key) if self.allows(key) => Ok(true),
            Some(_) => {
                tracing::warn!("[{}] Public key not in allow list", info.remote_addr);
                Ok(false)
            }
            None => Err(ServerError::Rejected(
                "signed handshake required by key allow list".into(),
            )),
        }
    }
}
