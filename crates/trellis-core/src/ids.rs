//! Peer identity — a node within one fabric.
//!
//! A device may belong to several fabrics at once and carries a distinct
//! node id in each. The (fabric, node) pair is therefore the only stable
//! key for a peer; the node id alone is ambiguous.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local index of a fabric (trust domain). 0 is reserved as "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FabricIndex(pub u8);

impl FabricIndex {
    pub const UNDEFINED: FabricIndex = FabricIndex(0);

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operational node id within a fabric. 0 is reserved as "undefined".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const UNDEFINED: NodeId = NodeId(0);

    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// A peer: one node in one fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PeerId {
    pub fabric: FabricIndex,
    pub node: NodeId,
}

impl PeerId {
    pub fn new(fabric: u8, node: u64) -> Self {
        Self {
            fabric: FabricIndex(fabric),
            node: NodeId(node),
        }
    }

    /// Both halves must be defined for the peer to be usable as a key.
    pub fn is_valid(&self) -> bool {
        self.fabric.is_defined() && self.node.is_defined()
    }

    pub fn in_fabric(&self, fabric: FabricIndex) -> bool {
        self.fabric == fabric
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fabric, self.node)
    }
}
