//! Session resumption cache — bounded, dual-indexed resumption records.
//!
//! Three kinds of record live in the backing store:
//!
//!   sr/index                        ordered list of peers holding a record
//!   sr/f/{fabric}/n/{node}          state: resumption id + secret + tags
//!   sr/id/{resumption id}           reverse link: resumption id → peer
//!
//! The store has no multi-key transactions, so `save` writes in a fixed
//! order (drop old link, index, state, new link) and every reverse lookup
//! cross-checks the link against the state it points at. A crash between
//! any two writes leaves at worst a dangling link or an indexed peer with
//! no state. Neither can produce a false match.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use trellis_core::{AuthTags, FabricIndex, PeerId, ResumptionId, SessionError, SessionSecret};
use zeroize::Zeroizing;

use crate::store::{RecordStore, StoreError};

/// Default number of peers whose resumption material is kept.
pub const DEFAULT_RESUMPTION_CAPACITY: usize = 64;

const INDEX_KEY: &str = "sr/index";

fn state_key(peer: PeerId) -> String {
    format!("sr/f/{:02x}/n/{:016X}", peer.fabric.0, peer.node.0)
}

fn link_key(id: &ResumptionId) -> String {
    format!("sr/id/{}", id.to_hex())
}

/// What an initiator presents to skip the full handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumptionHint {
    pub resumption_id: ResumptionId,
    pub secret: SessionSecret,
    pub tags: AuthTags,
}

/// What a responder learns from a resumption id offered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedPeer {
    pub peer: PeerId,
    pub secret: SessionSecret,
    pub tags: AuthTags,
}

/// Persisted state blob for one peer.
#[derive(Serialize, Deserialize)]
struct StoredState {
    resumption_id: ResumptionId,
    secret: SessionSecret,
    tags: AuthTags,
}

// ── Session index ─────────────────────────────────────────────────────────────

/// Fixed-capacity, insertion-ordered list of indexed peers.
///
/// Slot 0 is the oldest entry and the first to be evicted.
#[derive(Debug, Clone)]
pub struct SessionIndex<const N: usize> {
    peers: [PeerId; N],
    len: usize,
}

impl<const N: usize> Default for SessionIndex<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SessionIndex<N> {
    pub fn new() -> Self {
        Self {
            peers: [PeerId::default(); N],
            len: 0,
        }
    }

    /// Rebuild from a persisted list. Entries that no longer fit (the
    /// oldest ones) are returned separately so the caller can purge them.
    /// Repeated peers keep their first position.
    pub fn from_peers(peers: Vec<PeerId>) -> (Self, Vec<PeerId>) {
        let mut unique: Vec<PeerId> = Vec::with_capacity(peers.len());
        for peer in peers {
            if !unique.contains(&peer) {
                unique.push(peer);
            }
        }

        let keep = unique.split_off(unique.len().saturating_sub(N));
        let mut index = Self::new();
        for peer in keep {
            index.peers[index.len] = peer;
            index.len += 1;
        }
        (index, unique)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn as_slice(&self) -> &[PeerId] {
        &self.peers[..self.len]
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.as_slice().contains(&peer)
    }

    pub fn oldest(&self) -> Option<PeerId> {
        self.as_slice().first().copied()
    }

    /// Append a peer. Hands it back if the index is full.
    pub fn push(&mut self, peer: PeerId) -> Result<(), PeerId> {
        if self.is_full() {
            return Err(peer);
        }
        self.peers[self.len] = peer;
        self.len += 1;
        Ok(())
    }

    /// Remove a peer, keeping the order of the rest.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        match self.as_slice().iter().position(|p| *p == peer) {
            Some(pos) => {
                self.peers.copy_within(pos + 1..self.len, pos);
                self.len -= 1;
                self.peers[self.len] = PeerId::default();
                true
            }
            None => false,
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Capacity-bounded resumption store keyed both by peer and by resumption id.
///
/// Capacity `N` is fixed at compile time. The index is re-read from the
/// store on every operation, so two caches over the same store agree.
pub struct SessionResumptionCache<const N: usize = DEFAULT_RESUMPTION_CAPACITY> {
    store: Arc<dyn RecordStore>,
}

impl<const N: usize> Clone for SessionResumptionCache<N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

fn require_valid(peer: PeerId) -> Result<(), SessionError> {
    if peer.is_valid() {
        Ok(())
    } else {
        Err(SessionError::InvalidArgument("peer has undefined fabric or node id"))
    }
}

fn corrupt(key: &str, e: serde_json::Error) -> SessionError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

impl<const N: usize> SessionResumptionCache<N> {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Number of indexed peers.
    pub fn len(&self) -> Result<usize, SessionError> {
        Ok(self.load_index()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SessionError> {
        Ok(self.len()? == 0)
    }

    /// Indexed peers, oldest first.
    pub fn peers(&self) -> Result<Vec<PeerId>, SessionError> {
        Ok(self.load_index()?.as_slice().to_vec())
    }

    /// Resumption material to present when connecting to `peer`.
    pub fn find_by_peer(&self, peer: PeerId) -> Result<Option<ResumptionHint>, SessionError> {
        require_valid(peer)?;
        Ok(self.load_state(peer)?.map(|state| ResumptionHint {
            resumption_id: state.resumption_id,
            secret: state.secret.clone(),
            tags: state.tags,
        }))
    }

    /// Resolve a resumption id offered by a peer.
    ///
    /// The reverse link is only trusted if the peer's current state carries
    /// the same id.
    pub fn find_by_resumption_id(
        &self,
        id: &ResumptionId,
    ) -> Result<Option<ResumedPeer>, SessionError> {
        let key = link_key(id);
        let Some(blob) = self.store.get(&key)? else {
            return Ok(None);
        };
        let peer: PeerId = serde_json::from_slice(&blob).map_err(|e| corrupt(&key, e))?;

        match self.load_state(peer)? {
            Some(state) if state.resumption_id == *id => Ok(Some(ResumedPeer {
                peer,
                secret: state.secret.clone(),
                tags: state.tags,
            })),
            Some(_) => {
                tracing::debug!(peer = %peer, resumption_id = %id, "stale resumption link ignored");
                Ok(None)
            }
            None => {
                tracing::debug!(peer = %peer, resumption_id = %id, "dangling resumption link ignored");
                Ok(None)
            }
        }
    }

    /// Store fresh resumption material for `peer`, replacing any previous
    /// record. Evicts the oldest peer when the index is full.
    pub fn save(
        &self,
        peer: PeerId,
        id: ResumptionId,
        secret: &SessionSecret,
        tags: AuthTags,
    ) -> Result<(), SessionError> {
        require_valid(peer)?;
        if N == 0 {
            return Err(SessionError::StorageFull);
        }

        let mut index = self.load_index()?;

        // 1. Drop the reverse link of the id being replaced.
        match self.load_state(peer) {
            Ok(Some(old)) => self.store.delete(&link_key(&old.resumption_id))?,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "overwriting unreadable resumption state");
            }
        }

        // 2. Forward entry: make sure the peer is indexed.
        if !index.contains(peer) {
            if let Some(oldest) = index.oldest().filter(|_| index.is_full()) {
                self.remove_records(oldest)?;
                index.remove(oldest);
                tracing::debug!(evicted = %oldest, "resumption index full, evicted oldest peer");
            }
            if index.push(peer).is_err() {
                return Err(SessionError::StorageFull);
            }
            self.save_index(&index)?;
        }

        // 3. State blob.
        let state = StoredState {
            resumption_id: id,
            secret: secret.clone(),
            tags,
        };
        let blob = Zeroizing::new(
            serde_json::to_vec(&state).map_err(|e| SessionError::StorageError(e.to_string()))?,
        );
        self.store.set(&state_key(peer), &blob)?;

        // 4. Reverse link.
        let link = serde_json::to_vec(&peer).map_err(|e| SessionError::StorageError(e.to_string()))?;
        self.store.set(&link_key(&id), &link)?;

        tracing::debug!(peer = %peer, resumption_id = %id, "resumption record saved");
        Ok(())
    }

    /// Remove everything stored for `peer`. Deleting an absent peer succeeds.
    pub fn delete(&self, peer: PeerId) -> Result<(), SessionError> {
        require_valid(peer)?;
        self.remove_records(peer)?;

        let mut index = self.load_index()?;
        if index.remove(peer) {
            self.save_index(&index)?;
        }
        tracing::debug!(peer = %peer, "resumption record deleted");
        Ok(())
    }

    /// Remove every record belonging to `fabric`. Best effort: a record that
    /// fails to delete is logged and stays indexed. Returns the number removed.
    pub fn delete_all(&self, fabric: FabricIndex) -> Result<usize, SessionError> {
        let mut index = self.load_index()?;
        let victims: Vec<PeerId> = index
            .as_slice()
            .iter()
            .copied()
            .filter(|p| p.in_fabric(fabric))
            .collect();

        let mut removed = 0;
        for peer in victims {
            match self.remove_records(peer) {
                Ok(()) => {
                    index.remove(peer);
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "failed to delete resumption record");
                }
            }
        }

        if removed > 0 {
            self.save_index(&index)?;
        }
        tracing::info!(fabric = %fabric, removed, "resumption records purged for fabric");
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn load_state(&self, peer: PeerId) -> Result<Option<StoredState>, SessionError> {
        let key = state_key(peer);
        match self.store.get(&key)? {
            Some(blob) => serde_json::from_slice(&blob)
                .map(Some)
                .map_err(|e| corrupt(&key, e)),
            None => Ok(None),
        }
    }

    /// Link then state, so a crash never leaves a link whose state is gone
    /// but whose id could be reissued.
    fn remove_records(&self, peer: PeerId) -> Result<(), SessionError> {
        match self.load_state(peer) {
            Ok(Some(state)) => self.store.delete(&link_key(&state.resumption_id))?,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "removing unreadable resumption state");
            }
        }
        self.store.delete(&state_key(peer))?;
        Ok(())
    }

    fn load_index(&self) -> Result<SessionIndex<N>, SessionError> {
        let Some(blob) = self.store.get(INDEX_KEY)? else {
            return Ok(SessionIndex::new());
        };
        let peers: Vec<PeerId> =
            serde_json::from_slice(&blob).map_err(|e| corrupt(INDEX_KEY, e))?;
        let (index, overflow) = SessionIndex::from_peers(peers);

        if !overflow.is_empty() {
            // Persisted by a build with a larger capacity.
            for peer in &overflow {
                if let Err(e) = self.remove_records(*peer) {
                    tracing::warn!(peer = %peer, error = %e, "failed to purge overflow record");
                }
            }
            self.save_index(&index)?;
            tracing::info!(purged = overflow.len(), capacity = N, "resumption index trimmed");
        }
        Ok(index)
    }

    fn save_index(&self, index: &SessionIndex<N>) -> Result<(), SessionError> {
        let blob = serde_json::to_vec(index.as_slice())
            .map_err(|e| SessionError::StorageError(e.to_string()))?;
        self.store.set(INDEX_KEY, &blob)?;
        Ok(())
    }
}
