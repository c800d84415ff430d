//! Resumption material — the secrets a peer keeps to skip a full handshake.
//!
//! Three values survive a session: the resumption id both sides index by,
//! the derived shared secret, and the peer's authorization tags. The
//! handshake itself lives outside this crate; it hands us these values and
//! consumes them again on the next connect.
//!
//! Secret material derives ZeroizeOnDrop and is wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SessionError;

pub const RESUMPTION_ID_LEN: usize = 16;
pub const SESSION_SECRET_LEN: usize = 32;
pub const MAX_AUTH_TAGS: usize = 3;

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Resumption id ─────────────────────────────────────────────────────────────

/// Opaque token naming one resumable session.
///
/// A fresh id is issued on every successful handshake. Ids are never
/// reused, so an observer cannot correlate two sessions to the same peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumptionId(#[serde(with = "hex_serde")] [u8; RESUMPTION_ID_LEN]);

assert_eq_size!(ResumptionId, [u8; RESUMPTION_ID_LEN]);

impl ResumptionId {
    /// Generate a cryptographically random id.
    pub fn random() -> Self {
        let mut id = [0u8; RESUMPTION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; RESUMPTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; RESUMPTION_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ResumptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumptionId({})", self.to_hex())
    }
}

impl fmt::Display for ResumptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Half the id is plenty for log correlation.
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

// ── Session secret ────────────────────────────────────────────────────────────

/// Shared secret derived by a completed handshake.
///
/// Zeroized on drop. Debug output is redacted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionSecret(#[serde(with = "hex_serde")] [u8; SESSION_SECRET_LEN]);

impl SessionSecret {
    pub fn from_bytes(bytes: [u8; SESSION_SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random secret. Handshake stand-ins and tests use this.
    pub fn random() -> Self {
        let mut secret = [0u8; SESSION_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self(secret)
    }

    pub fn expose(&self) -> &[u8; SESSION_SECRET_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

// ── Auth tags ─────────────────────────────────────────────────────────────────

/// Authorization tags attached to a peer's identity.
///
/// Opaque to this layer; access control interprets them. A zero slot is
/// unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthTags([u32; MAX_AUTH_TAGS]);

impl AuthTags {
    pub const EMPTY: AuthTags = AuthTags([0; MAX_AUTH_TAGS]);

    pub fn new(tags: [u32; MAX_AUTH_TAGS]) -> Self {
        Self(tags)
    }

    /// Build from a variable-length list. Fails if it does not fit or
    /// contains the reserved zero tag.
    pub fn from_slice(tags: &[u32]) -> Result<Self, SessionError> {
        if tags.len() > MAX_AUTH_TAGS {
            return Err(SessionError::InvalidArgument("too many auth tags"));
        }
        if tags.contains(&0) {
            return Err(SessionError::InvalidArgument("auth tag 0 is reserved"));
        }
        let mut out = [0u32; MAX_AUTH_TAGS];
        out[..tags.len()].copy_from_slice(tags);
        Ok(Self(out))
    }

    /// Tags actually in use.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied().filter(|t| *t != 0)
    }

    pub fn contains(&self, tag: u32) -> bool {
        tag != 0 && self.0.contains(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

// ── Hex serde ─────────────────────────────────────────────────────────────────

/// Fixed-size byte arrays as hex strings in persisted blobs.
mod hex_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = Zeroizing::new(hex::encode(bytes));
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        let bytes = Zeroizing::new(hex::decode(s.as_str()).map_err(serde::de::Error::custom)?);
        if bytes.len() != N {
            return Err(serde::de::Error::custom(format!("expected {N} bytes")));
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
