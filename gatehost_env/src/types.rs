//! Common types for the Gatehost environment abstraction.

use serde::{Deserialize, Serialize};

/// Identifier of a network endpoint (a server or a connected client).
///
/// Matches the 64-bit id carried in the packet envelope. The value `0`
/// is reserved for "unresolved" and never names a live endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The unresolved target. Resolves to the server at send time.
    pub const UNSET: NodeId = NodeId(0);

    /// Creates a deterministic, non-zero NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mixed = seed.wrapping_add(1).wrapping_mul(0x517cc1b727220a95);
        Self(if mixed == 0 { 1 } else { mixed })
    }

    /// Returns true for the reserved "unresolved" id.
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// Returns the raw id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// One frame moved by the raw transport.
///
/// The transport only knows about channels; everything above that
/// (kinds, namespaces, routing metadata) lives inside `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFrame {
    /// Logical channel the frame was sent on
    pub channel: u16,

    /// Serialized envelope bytes
    pub payload: Vec<u8>,
}

impl ChannelFrame {
    /// Creates a new frame.
    pub fn new(channel: u16, payload: Vec<u8>) -> Self {
        Self { channel, payload }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_ids_are_stable_and_nonzero() {
        for seed in 0..64 {
            let id = NodeId::from_seed(seed);
            assert!(!id.is_unset());
            assert_eq!(id, NodeId::from_seed(seed));
        }
        assert_ne!(NodeId::from_seed(1), NodeId::from_seed(2));
    }

    #[test]
    fn test_unset() {
        assert!(NodeId::UNSET.is_unset());
        assert_eq!(NodeId::default(), NodeId::UNSET);
    }
}
