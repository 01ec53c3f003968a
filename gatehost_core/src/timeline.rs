//! Timed task tables advanced once per tick: animations and entity warps.
//!
//! Both tables are owned by the session and only touched on the tick thread.

use nalgebra::{Isometry3, Vector3};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::construct::{Animation, Gate};
use crate::entity::{EntityId, EntityTable};
use crate::fault::{isolate, Fault};

/// Per-tick continuation predicate. `Ok(false)` stops the animation.
pub type Continuation = Box<dyn FnMut(u64) -> Result<bool, String> + Send>;

/// Completion callback. Receives the fault that stopped the animation, if any.
pub type AnimationDone = Box<dyn FnOnce(Option<Fault>) + Send>;

/// An animation to start on the timeline.
pub struct AnimationPlay {
    animation: Box<dyn Animation>,
    type_tag: u32,
    continuation: Option<Continuation>,
    on_complete: Option<AnimationDone>,
}

impl AnimationPlay {
    pub fn new(animation: impl Animation + 'static, type_tag: u32) -> Self {
        Self {
            animation: Box::new(animation),
            type_tag,
            continuation: None,
            on_complete: None,
        }
    }

    pub fn continue_while<F>(mut self, predicate: F) -> Self
    where
        F: FnMut(u64) -> Result<bool, String> + Send + 'static,
    {
        self.continuation = Some(Box::new(predicate));
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Option<Fault>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

struct AnimationEntry {
    animation: Box<dyn Animation>,
    type_tag: u32,
    index: u64,
    continuation: Option<Continuation>,
    on_complete: Option<AnimationDone>,
    fault: Option<Fault>,
}

impl AnimationEntry {
    fn finish(mut self) {
        if let Some(callback) = self.on_complete.take() {
            let fault = self.fault.take();
            if let Err(e) = isolate(|| {
                callback(fault);
                Ok::<_, String>(())
            }) {
                warn!(fault = %e, "animation completion callback failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Started,
    /// Same key and type tag were already playing; the running animation was restarted.
    Restarted,
    /// A different animation was playing under the key; it was stopped and replaced.
    Replaced,
}

#[derive(Default)]
pub struct AnimationTimeline {
    entries: BTreeMap<u64, AnimationEntry>,
}

impl AnimationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play(&mut self, key: u64, play: AnimationPlay) -> PlayOutcome {
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.type_tag == play.type_tag {
                existing.animation.restart(play.type_tag);
                existing.index = 0;
                existing.fault = None;
                if play.continuation.is_some() {
                    existing.continuation = play.continuation;
                }
                if play.on_complete.is_some() {
                    existing.on_complete = play.on_complete;
                }
                return PlayOutcome::Restarted;
            }
        }

        let replaced = self.entries.remove(&key).map(|mut old| {
            old.animation.stop();
            old.finish();
        });

        self.entries.insert(
            key,
            AnimationEntry {
                animation: play.animation,
                type_tag: play.type_tag,
                index: 0,
                continuation: play.continuation,
                on_complete: play.on_complete,
                fault: None,
            },
        );
        if replaced.is_some() {
            PlayOutcome::Replaced
        } else {
            PlayOutcome::Started
        }
    }

    /// Requests a stop; the entry is removed on the next tick.
    pub fn stop(&mut self, key: u64) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.animation.stop();
                true
            }
            None => false,
        }
    }

    pub fn is_playing(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances every animation once. Returns how many completed.
    pub fn tick(&mut self) -> usize {
        let mut finished = Vec::new();

        for (key, entry) in self.entries.iter_mut() {
            let index = entry.index;

            let mut proceed = true;
            if let Some(predicate) = entry.continuation.as_mut() {
                match isolate(|| predicate(index)) {
                    Ok(true) => {}
                    Ok(false) => proceed = false,
                    Err(fault) => {
                        warn!(animation = key, %fault, "animation predicate failed");
                        entry.fault = Some(fault);
                        proceed = false;
                    }
                }
            }

            if proceed {
                let animation = &mut entry.animation;
                if let Err(fault) = isolate(|| {
                    animation.tick(index);
                    Ok::<_, String>(())
                }) {
                    warn!(animation = key, %fault, "animation tick failed");
                    entry.fault = Some(fault);
                    proceed = false;
                }
            }

            if !proceed {
                entry.animation.stop();
            }
            if entry.animation.stopped(index) {
                finished.push(*key);
            } else {
                entry.index = index + 1;
            }
        }

        for key in &finished {
            if let Some(entry) = self.entries.remove(key) {
                entry.finish();
            }
        }
        finished.len()
    }

    /// Stops everything and fires every pending completion callback.
    pub fn clear(&mut self) {
        for (_, mut entry) in std::mem::take(&mut self.entries) {
            entry.animation.stop();
            entry.finish();
        }
    }
}

/// How a warp ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpOutcome {
    Arrived,
    GateClosed,
    BodyMissing,
    Cancelled,
}

pub type WarpDone = Box<dyn FnOnce(WarpOutcome) + Send>;

/// One entity carried through a gate.
pub struct EntityWarp {
    pub lead: EntityId,
    pub gate: Arc<dyn Gate>,
    pub source: Isometry3<f64>,
    pub destination: Isometry3<f64>,
    pub duration_ticks: u32,
    /// Upper bound on the entity's speed when it leaves the warp (m/s)
    pub max_safe_speed: f64,
    pub on_complete: Option<WarpDone>,
}

struct WarpEntry {
    warp: EntityWarp,
    elapsed: u32,
}

impl WarpEntry {
    fn finish(mut self, outcome: WarpOutcome) {
        debug!(lead = self.warp.lead, gate = self.warp.gate.id(), ?outcome, "warp finished");
        if let Some(callback) = self.warp.on_complete.take() {
            if let Err(e) = isolate(|| {
                callback(outcome);
                Ok::<_, String>(())
            }) {
                warn!(lead = self.warp.lead, fault = %e, "warp completion callback failed");
            }
        }
    }
}

/// Warps keyed by lead entity id.
#[derive(Default)]
pub struct WarpTimeline {
    entries: BTreeMap<EntityId, WarpEntry>,
}

impl WarpTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a warp. Refused if the lead entity is already warping.
    pub fn start(&mut self, warp: EntityWarp) -> Result<(), EntityWarp> {
        if self.entries.contains_key(&warp.lead) {
            return Err(warp);
        }
        self.entries.insert(warp.lead, WarpEntry { warp, elapsed: 0 });
        Ok(())
    }

    pub fn cancel(&mut self, lead: EntityId) -> bool {
        match self.entries.remove(&lead) {
            Some(entry) => {
                entry.finish(WarpOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_warping(&self, lead: EntityId) -> bool {
        self.entries.contains_key(&lead)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Advances every warp by one tick of `tick_seconds`.
    pub fn tick(&mut self, entities: &EntityTable, tick_seconds: f64) -> usize {
        let mut finished = Vec::new();

        for (lead, entry) in self.entries.iter_mut() {
            let warp = &entry.warp;
            if !warp.gate.is_valid() {
                finished.push((*lead, WarpOutcome::GateClosed));
                continue;
            }
            let Some(body) = entities.body(*lead) else {
                finished.push((*lead, WarpOutcome::BodyMissing));
                continue;
            };

            entry.elapsed = entry.elapsed.saturating_add(1);
            let progress = if warp.duration_ticks == 0 {
                1.0
            } else {
                (entry.elapsed as f64 / warp.duration_ticks as f64).min(1.0)
            };

            let pose = warp
                .source
                .try_lerp_slerp(&warp.destination, progress, 1.0e-9)
                .unwrap_or_else(|| {
                    // Opposite rotations: slide the translation, snap the rotation.
                    let translation = warp
                        .source
                        .translation
                        .vector
                        .lerp(&warp.destination.translation.vector, progress);
                    Isometry3::from_parts(translation.into(), warp.destination.rotation)
                });
            body.set_pose(pose);

            let velocity = travel_velocity(warp, tick_seconds);
            if progress >= 1.0 {
                body.set_linear_velocity(clamp_speed(velocity, warp.max_safe_speed));
                finished.push((*lead, WarpOutcome::Arrived));
            } else {
                body.set_linear_velocity(velocity);
            }
        }

        for (lead, outcome) in &finished {
            if let Some(entry) = self.entries.remove(lead) {
                entry.finish(*outcome);
            }
        }
        finished.len()
    }

    /// Cancels every warp.
    pub fn clear(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            entry.finish(WarpOutcome::Cancelled);
        }
    }
}

fn travel_velocity(warp: &EntityWarp, tick_seconds: f64) -> Vector3<f64> {
    let seconds = warp.duration_ticks as f64 * tick_seconds;
    if seconds <= 0.0 {
        return Vector3::zeros();
    }
    (warp.destination.translation.vector - warp.source.translation.vector) / seconds
}

fn clamp_speed(velocity: Vector3<f64>, max_speed: f64) -> Vector3<f64> {
    let speed = velocity.norm();
    if speed > max_speed && speed > 0.0 {
        velocity * (max_speed.max(0.0) / speed)
    } else {
        velocity
    }
}
