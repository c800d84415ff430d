//! trellis-core — shared value types, errors, and configuration.
//! All other Trellis crates depend on this one.

pub mod config;
pub mod crypto;
pub mod error;
pub mod ids;

pub use crypto::{AuthTags, ResumptionId, SessionSecret};
pub use error::SessionError;
pub use ids::{FabricIndex, NodeId, PeerId};
