//! trellis-sessions — resumption cache and device session pool.
//!
//! Layering, bottom up:
//!   - `store`: flat key → blob persistence (memory or files)
//!   - `resumption`: bounded, dual-indexed cache of resumption records
//!   - `establish`: contracts for the handshake and address collaborators
//!   - `pool`: one session or one in-flight attempt per peer
//!   - `service`: the pool on its own task, driven through `PoolHandle`

pub mod establish;
pub mod pool;
pub mod resumption;
pub mod service;
pub mod store;

pub use establish::{AddressResolver, Establishment, SecureChannelEstablisher, SessionHandle};
pub use pool::{
    Callbacks, ConnectionCallback, DeviceInfo, DeviceSessionPool, EstablishedDevice, PeerState,
    WaiterId,
};
pub use resumption::{
    ResumedPeer, ResumptionHint, SessionIndex, SessionResumptionCache, DEFAULT_RESUMPTION_CAPACITY,
};
pub use service::{PoolCommand, PoolHandle, PoolService};
pub use store::{open_record_store, Blob, FileRecordStore, MemoryRecordStore, RecordStore, StoreError};
