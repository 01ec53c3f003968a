//! Error types for the Gatehost core.
//!
//! Two channels exist. [`LifecycleError`] is a caller-contract violation and
//! is returned straight to the caller, who is expected to treat it as fatal.
//! Every other error here is a recoverable fault: it is produced at an
//! isolation boundary, logged, and the tick carries on.

use thiserror::Error;

use crate::construct::ConstructId;
use crate::session::SessionState;

/// Caller-contract violations. Never swallowed by the core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("transport already registered")]
    AlreadyRegistered,

    #[error("transport is not registered")]
    NotRegistered,

    #[error("role {0} has no peer to exchange packets with")]
    NoPeers(&'static str),

    #[error("session is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

/// Envelope or payload could not be encoded/decoded.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("envelope decode failed: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("payload decode failed: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A registered packet handler failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("missing payload for {0}")]
    MissingPayload(&'static str),

    #[error("session dropped while handler was registered")]
    SessionGone,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("rejected configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

/// A construct update failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("construct {id} update failed: {reason}")]
pub struct ConstructError {
    pub id: ConstructId,
    pub reason: String,
}

impl ConstructError {
    pub fn new(id: ConstructId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

/// Configuration persistence or validation failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config format invalid: {0}")]
    Format(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    #[error("only the authority may change the configuration")]
    NotAuthority,
}
