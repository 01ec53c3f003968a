//! Deferred close queues.
//!
//! Any thread may ask for a construct or gate to be closed; the request is
//! applied on the tick thread at the start of the next before-phase.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::construct::{ConstructId, Gate};

/// A queued construct close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRequest {
    pub id: ConstructId,
    /// Close even on a replica, where closes normally come from the authority.
    pub override_replica: bool,
    /// Tell replicas about it once applied (authority only).
    pub propagate: bool,
    /// Sync stamp the entry had when the close was decided. A later snapshot
    /// supersedes the close.
    pub sync_stamp: Option<u64>,
}

impl CloseRequest {
    /// A close issued by the local owner.
    pub fn local(id: ConstructId) -> Self {
        Self { id, override_replica: false, propagate: true, sync_stamp: None }
    }

    /// A close ordered by the authority, applied even on a replica.
    pub fn from_authority(id: ConstructId) -> Self {
        Self { id, override_replica: true, propagate: false, sync_stamp: None }
    }

    /// Only applies while the entry still carries `stamp`.
    pub fn unless_synced_since(mut self, stamp: u64) -> Self {
        self.sync_stamp = Some(stamp);
        self
    }
}

#[derive(Default)]
pub struct DeferredQueues {
    constructs: Mutex<VecDeque<CloseRequest>>,
    gates: Mutex<VecDeque<Arc<dyn Gate>>>,
}

impl DeferredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_construct(&self, request: CloseRequest) {
        lock(&self.constructs).push_back(request);
    }

    pub fn close_gate(&self, gate: Arc<dyn Gate>) {
        lock(&self.gates).push_back(gate);
    }

    /// Takes every queued construct close, oldest first.
    pub fn drain_constructs(&self) -> Vec<CloseRequest> {
        lock(&self.constructs).drain(..).collect()
    }

    /// Takes every queued gate close, oldest first.
    pub fn drain_gates(&self) -> Vec<Arc<dyn Gate>> {
        lock(&self.gates).drain(..).collect()
    }

    pub fn pending(&self) -> (usize, usize) {
        (lock(&self.constructs).len(), lock(&self.gates).len())
    }
}

fn lock<T>(queue: &Mutex<T>) -> MutexGuard<'_, T> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}
