//! Contracts for the collaborators the pool drives but does not implement.
//!
//! The handshake state machine, address discovery, and the live session
//! object all belong to other layers. The pool only needs to start an
//! attempt, learn where a peer is, and close a session it owns.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::BoxFuture;
use trellis_core::{AuthTags, PeerId, ResumptionId, SessionError, SessionSecret};

use crate::resumption::ResumptionHint;

/// A live, authenticated session owned by the pool.
pub trait SessionHandle: Send + Sync + fmt::Debug {
    /// Tear the session down. Must be safe to call more than once.
    fn close(&self);
}

/// Result of a completed handshake.
pub struct Establishment {
    pub session: Arc<dyn SessionHandle>,
    /// Freshly issued for this session; never a reused id.
    pub resumption_id: ResumptionId,
    pub secret: SessionSecret,
    pub tags: AuthTags,
    /// True if the peer accepted the resumption hint.
    pub resumed: bool,
}

impl fmt::Debug for Establishment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Establishment")
            .field("session", &self.session)
            .field("resumption_id", &self.resumption_id)
            .field("tags", &self.tags)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

/// Runs the secure handshake with a peer.
///
/// Every returned future must eventually resolve; the pool keeps no timers
/// of its own. If the peer rejects the resumption hint the establisher
/// falls back to a full handshake before giving up.
pub trait SecureChannelEstablisher: Send + Sync {
    fn establish(
        &self,
        peer: PeerId,
        address: SocketAddr,
        resumption: Option<ResumptionHint>,
    ) -> BoxFuture<'static, Result<Establishment, SessionError>>;
}

/// Maps a peer to a network address.
pub trait AddressResolver: Send + Sync {
    /// Resolve over the network. Not found is `AddressResolutionFailed`.
    fn resolve(&self, peer: PeerId) -> BoxFuture<'static, Result<SocketAddr, SessionError>>;

    /// Best-effort answer from a local discovery cache, without I/O.
    fn cached_address(&self, _peer: PeerId) -> Option<SocketAddr> {
        None
    }
}
