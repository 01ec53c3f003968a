//! Collaborator interfaces.
//!
//! The core never simulates anything itself. Constructs, gates and
//! animations are supplied by the embedding game logic and are driven by
//! the scheduler through the traits below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::Configuration;
use crate::error::ConstructError;

/// Stable construct identifier.
pub type ConstructId = i64;

/// Serialized, self-contained state of one construct.
pub trait ConstructSnapshot: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn construct_id(&self) -> ConstructId;
}

/// Indirect relationships resolved by link queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    Comm,
    Beacon,
}

/// A mutable entity owned by the registry and replicated to clients.
///
/// The registry wraps every construct in a mutex, so implementations only
/// ever see one caller at a time.
pub trait Construct: Send + 'static {
    type Snapshot: ConstructSnapshot;

    fn id(&self) -> ConstructId;

    /// Background update, run by sweeps off the tick thread.
    fn update(&mut self) -> Result<(), ConstructError>;

    /// Update that must run on the tick thread.
    fn update_non_threadable(&mut self) -> Result<(), ConstructError>;

    /// Closes the construct. `override_replica` forces the close on a replica.
    fn close(&mut self, override_replica: bool);

    /// Releases everything the construct holds. Called once, after close.
    fn dispose(&mut self);

    fn to_snapshot(&self, full: bool) -> Self::Snapshot;

    /// Builds a fresh replica from a snapshot.
    fn from_snapshot(snapshot: &Self::Snapshot) -> Option<Self>
    where
        Self: Sized;

    /// Refreshes a live construct in place.
    fn apply_snapshot(&mut self, snapshot: &Self::Snapshot) -> bool;

    /// Re-hydrates a suspended construct in place.
    fn persist(&mut self, snapshot: &Self::Snapshot) -> bool;

    /// False while the construct cannot be used. Invalid constructs are
    /// neither updated nor replicated.
    fn is_valid(&self) -> bool;

    fn is_suspended(&self) -> bool;

    fn fully_initialized(&self) -> bool;

    /// True once the construct asked to be closed on the next opportunity.
    fn mark_closed(&self) -> bool;

    fn closed(&self) -> bool;

    /// Constructs reachable through `kind` links.
    fn linked(&self, kind: LinkKind) -> Vec<ConstructId> {
        let _ = kind;
        Vec::new()
    }

    /// Hook invoked after the session configuration changed.
    fn reload_config(&mut self, config: &Configuration) {
        let _ = config;
    }
}

/// A jump gate. Closing happens on the tick thread via the deferred queue.
pub trait Gate: Send + Sync {
    fn id(&self) -> ConstructId;
    fn close(&self);
    fn is_valid(&self) -> bool;
}

/// A timed animation owned by the animation timeline.
pub trait Animation: Send {
    /// Advances the animation; `index` counts ticks since it started.
    fn tick(&mut self, index: u64);
    fn stopped(&self, index: u64) -> bool;
    fn stop(&mut self);
    fn restart(&mut self, type_tag: u32);
}
