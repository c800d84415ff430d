//! Error kinds surfaced by the session layer.

use thiserror::Error;

/// Everything a caller of the pool or the resumption cache can see.
///
/// Clone because one establishment failure fans out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("peer is not connected")]
    NotConnected,

    #[error("resumption storage is full")]
    StorageFull,

    #[error("resumption storage error: {0}")]
    StorageError(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("peer address could not be resolved")]
    AddressResolutionFailed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("session pool is shut down")]
    ShutDown,
}

impl SessionError {
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }
}
