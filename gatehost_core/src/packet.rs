//! Packet envelope.
//!
//! Every message travels on one logical channel, wrapped in a [`Packet`]
//! carrying routing metadata plus an opaque payload. The payload's decoded
//! type is a contract between the sender and the handlers registered for
//! the packet's [`PacketKind`]; the envelope never looks inside it.
//!
//! Wire layout (JSON):
//!
//! ```text
//! { kind, sender: u64, target: u64, broadcast: bool, namespace: string,
//!   epoch: u64 (100ns ticks since the Unix epoch), phase: u8,
//!   payload: base64 | null }
//! ```

use gatehost_env::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PacketError;

/// The single logical channel shared by every packet kind.
pub const CHANNEL: u16 = 0x4A47;

/// Epoch resolution: 100ns ticks per millisecond.
pub const EPOCH_TICKS_PER_MS: u64 = 10_000;

/// Message kinds. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Full registry sync (request at phase 1, snapshot set afterwards)
    SyncConstructs,
    /// Single construct sync by id
    SyncConstruct,
    /// Authority-initiated close of one construct
    CloseConstruct,
    /// Comm-link relationship query
    CommLinked,
    /// Beacon-link relationship query
    BeaconLinked,
    /// Full configuration push
    UpdateConfig,
    /// Replica request for the current configuration
    FetchConfig,
    /// Extension kinds owned by embedding code
    Custom(u16),
}

/// A routed message.
///
/// `sender`, `epoch` and `namespace` are stamped by the transport when the
/// packet is sent; there is no way to set them from outside the crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    sender: NodeId,
    /// Destination endpoint, [`NodeId::UNSET`] resolves to the server.
    pub target: NodeId,
    pub broadcast: bool,
    namespace: String,
    epoch: u64,
    phase: u8,
    #[serde(with = "payload_base64")]
    payload: Option<Vec<u8>>,
}

impl Packet {
    /// Creates an unaddressed packet of the given kind.
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            sender: NodeId::UNSET,
            target: NodeId::UNSET,
            broadcast: false,
            namespace: String::new(),
            epoch: 0,
            phase: 0,
            payload: None,
        }
    }

    /// Addresses the packet at one endpoint.
    pub fn to(mut self, target: NodeId) -> Self {
        self.target = target;
        self.broadcast = false;
        self
    }

    /// Marks the packet for delivery to every endpoint.
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Attaches a serialized payload.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, PacketError> {
        self.set_payload(Some(payload))?;
        Ok(self)
    }

    /// Replaces (or clears) the payload.
    pub fn set_payload<T: Serialize>(&mut self, payload: Option<&T>) -> Result<(), PacketError> {
        self.payload = match payload {
            Some(value) => Some(serde_json::to_vec(value).map_err(PacketError::Serialize)?),
            None => None,
        };
        Ok(())
    }

    /// Decodes the payload as `T`. `Ok(None)` for a null payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<Option<T>, PacketError> {
        match &self.payload {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(PacketError::Payload),
            None => Ok(None),
        }
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Builds the response to this packet: same kind and phase, addressed
    /// back at the sender. Sending it moves the conversation one phase on.
    pub fn reply<T: Serialize>(&self, payload: Option<&T>) -> Result<Packet, PacketError> {
        let mut response = self.clone();
        response.target = self.sender;
        response.broadcast = false;
        response.set_payload(payload)?;
        Ok(response)
    }

    /// Shallow copy for relaying. Phase and payload are preserved; the copy
    /// must go through `Transport::send` to be transmitted.
    pub fn forward(&self, target: NodeId, broadcast: bool) -> Packet {
        let mut copy = self.clone();
        copy.target = target;
        copy.broadcast = broadcast;
        copy
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> u8 {
        self.phase
    }

    /// True for the opening packet of a request/response conversation.
    pub fn is_request(&self) -> bool {
        self.phase == 1
    }

    /// Absolute distance between this packet's epoch and `now_epoch`.
    pub fn age(&self, now_epoch: u64) -> u64 {
        now_epoch.abs_diff(self.epoch)
    }

    pub(crate) fn stamp(&mut self, sender: NodeId, namespace: &str, epoch: u64) {
        self.sender = sender;
        self.epoch = epoch;
        if self.namespace != namespace {
            self.namespace = namespace.to_string();
        }
        self.phase = self.phase.wrapping_add(1);
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(PacketError::Serialize)
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        serde_json::from_slice(bytes).map_err(PacketError::Envelope)
    }

    #[cfg(test)]
    pub(crate) fn forge(sender: NodeId, namespace: &str, epoch: u64, phase: u8) -> Packet {
        let mut packet = Packet::new(PacketKind::Custom(0));
        packet.sender = sender;
        packet.namespace = namespace.to_string();
        packet.epoch = epoch;
        packet.phase = phase;
        packet
    }
}

/// Converts a wall-clock time into packet epoch ticks.
pub fn epoch_of(time: SystemTime) -> u64 {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_nanos() / 100) as u64
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
