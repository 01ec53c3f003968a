//! Demo game objects driven by the simulated sessions.
//!
//! `SimConstruct` is a small station that counts its own update cycles,
//! carries comm/beacon links and can be told to expire after a number of
//! cycles. Gates, animations and bodies are the minimum the timelines need.

use gatehost_core::{
    Animation, Body, Configuration, Construct, ConstructError, ConstructId, ConstructSnapshot,
    Gate, LinkKind,
};
use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSnapshot {
    pub id: ConstructId,
    pub cycles: u64,
    pub comm: Vec<ConstructId>,
    pub beacon: Vec<ConstructId>,
    pub expires_after: Option<u64>,
}

impl ConstructSnapshot for SimSnapshot {
    fn construct_id(&self) -> ConstructId {
        self.id
    }
}

#[derive(Debug, Clone)]
pub struct SimConstruct {
    pub id: ConstructId,
    pub cycles: u64,
    pub main_cycles: u64,
    pub comm: Vec<ConstructId>,
    pub beacon: Vec<ConstructId>,
    /// Asks for a close once `cycles` reaches this value
    pub expires_after: Option<u64>,
    /// Built from a snapshot; only an override close removes it
    pub replica: bool,
    pub suspended: bool,
    pub closed: bool,
    pub disposed: bool,
    pub reloads: u32,
}

impl SimConstruct {
    /// A fresh authority-side construct.
    pub fn new(id: ConstructId) -> Self {
        Self {
            id,
            cycles: 0,
            main_cycles: 0,
            comm: Vec::new(),
            beacon: Vec::new(),
            expires_after: None,
            replica: false,
            suspended: false,
            closed: false,
            disposed: false,
            reloads: 0,
        }
    }

    pub fn with_links(
        mut self,
        kind: LinkKind,
        ids: impl IntoIterator<Item = ConstructId>,
    ) -> Self {
        match kind {
            LinkKind::Comm => self.comm.extend(ids),
            LinkKind::Beacon => self.beacon.extend(ids),
        }
        self
    }

    pub fn expiring_after(mut self, cycles: u64) -> Self {
        self.expires_after = Some(cycles);
        self
    }
}

impl Construct for SimConstruct {
    type Snapshot = SimSnapshot;

    fn id(&self) -> ConstructId {
        self.id
    }

    fn update(&mut self) -> Result<(), ConstructError> {
        if self.closed {
            return Err(ConstructError::new(self.id, "updated after close"));
        }
        self.cycles += 1;
        Ok(())
    }

    fn update_non_threadable(&mut self) -> Result<(), ConstructError> {
        self.main_cycles += 1;
        Ok(())
    }

    fn close(&mut self, override_replica: bool) {
        if self.replica && !override_replica {
            return;
        }
        self.closed = true;
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.comm.clear();
        self.beacon.clear();
    }

    fn to_snapshot(&self, full: bool) -> SimSnapshot {
        SimSnapshot {
            id: self.id,
            cycles: self.cycles,
            comm: if full { self.comm.clone() } else { Vec::new() },
            beacon: if full { self.beacon.clone() } else { Vec::new() },
            expires_after: self.expires_after,
        }
    }

    fn from_snapshot(snapshot: &SimSnapshot) -> Option<Self> {
        Some(Self {
            cycles: snapshot.cycles,
            comm: snapshot.comm.clone(),
            beacon: snapshot.beacon.clone(),
            // Expiry is the authority's decision.
            expires_after: None,
            replica: true,
            ..Self::new(snapshot.id)
        })
    }

    fn apply_snapshot(&mut self, snapshot: &SimSnapshot) -> bool {
        if snapshot.id != self.id {
            return false;
        }
        self.cycles = snapshot.cycles;
        self.comm = snapshot.comm.clone();
        self.beacon = snapshot.beacon.clone();
        true
    }

    fn persist(&mut self, snapshot: &SimSnapshot) -> bool {
        let applied = self.apply_snapshot(snapshot);
        if applied {
            self.suspended = false;
        }
        applied
    }

    fn is_valid(&self) -> bool {
        !self.disposed
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn fully_initialized(&self) -> bool {
        true
    }

    fn mark_closed(&self) -> bool {
        matches!(self.expires_after, Some(limit) if self.cycles >= limit)
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn linked(&self, kind: LinkKind) -> Vec<ConstructId> {
        match kind {
            LinkKind::Comm => self.comm.clone(),
            LinkKind::Beacon => self.beacon.clone(),
        }
    }

    fn reload_config(&mut self, _config: &Configuration) {
        self.reloads += 1;
    }
}

/// A gate that stays open until closed once.
pub struct SimGate {
    id: ConstructId,
    open: AtomicBool,
    closes: AtomicUsize,
}

impl SimGate {
    pub fn new(id: ConstructId) -> Self {
        Self {
            id,
            open: AtomicBool::new(true),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Gate for SimGate {
    fn id(&self) -> ConstructId {
        self.id
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_valid(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Runs for a fixed number of ticks.
#[derive(Debug, Default)]
pub struct SimAnimation {
    pub length: u64,
    pub ticks: u64,
    pub stopped: bool,
    pub type_tag: u32,
}

impl SimAnimation {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            ..Default::default()
        }
    }
}

impl Animation for SimAnimation {
    fn tick(&mut self, _index: u64) {
        self.ticks += 1;
    }

    fn stopped(&self, index: u64) -> bool {
        self.stopped || index >= self.length
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn restart(&mut self, type_tag: u32) {
        self.ticks = 0;
        self.stopped = false;
        self.type_tag = type_tag;
    }
}

/// A rigid body that records what the warp timeline did to it.
pub struct SimBody {
    pose: Mutex<Isometry3<f64>>,
    velocity: Mutex<Vector3<f64>>,
}

impl SimBody {
    pub fn new(pose: Isometry3<f64>) -> Self {
        Self {
            pose: Mutex::new(pose),
            velocity: Mutex::new(Vector3::zeros()),
        }
    }

    pub fn pose(&self) -> Isometry3<f64> {
        *self.pose.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn velocity(&self) -> Vector3<f64> {
        *self.velocity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Body for SimBody {
    fn set_pose(&self, pose: Isometry3<f64>) {
        *self.pose.lock().unwrap_or_else(PoisonError::into_inner) = pose;
    }

    fn set_linear_velocity(&self, velocity: Vector3<f64>) {
        *self.velocity.lock().unwrap_or_else(PoisonError::into_inner) = velocity;
    }
}
