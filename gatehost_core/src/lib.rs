//! Gatehost Core - authoritative construct replication and tick scheduling
//!
//! Two coupled subsystems:
//! 1. **Routing protocol**: request/response packets with staleness rejection
//!    and server relay, on top of an unordered best-effort frame transport
//! 2. **Tick scheduler**: deferred close queues, per-construct main-thread
//!    updates, bounded background sweeps and timed timelines, all against
//!    one shared construct registry
//!
//! The embedding game supplies constructs, gates and animations through the
//! traits in [`construct`]; a [`Session`] ties everything together and is
//! driven once per tick by an external loop.

pub mod callbacks;
pub mod config;
pub mod construct;
pub mod entity;
pub mod error;
pub mod fault;
pub mod packet;
pub mod queues;
pub mod registry;
pub mod replication;
pub mod session;
pub mod sweep;
pub mod timeline;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use callbacks::{handler, PacketHandler};
pub use config::Configuration;
pub use construct::{Animation, Construct, ConstructId, ConstructSnapshot, Gate, LinkKind};
pub use entity::{Body, Component, EntityId, EntityTable};
pub use error::{ConfigError, ConstructError, HandlerError, LifecycleError, PacketError};
pub use fault::Fault;
pub use packet::{Packet, PacketKind, CHANNEL};
pub use registry::{ConstructEntry, Registry, UpsertOutcome};
pub use session::{NoHooks, Session, SessionHooks, SessionOptions, SessionState, SessionStats};
pub use timeline::{AnimationPlay, EntityWarp, PlayOutcome, WarpOutcome};
pub use transport::{DropReason, Received, Role, Transport, TransportStats};
