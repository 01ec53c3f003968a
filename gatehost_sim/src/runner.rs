//! Scenario runner - executes the fault-injection scenarios.

use crate::constructs::{SimAnimation, SimBody, SimConstruct, SimGate};
use crate::error::SimError;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use gatehost_core::{
    AnimationPlay, Component, Configuration, EntityWarp, Fault, LinkKind, WarpOutcome,
};
use gatehost_env::NetworkController;
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Push-resync period used by every scenario.
const RESYNC_TICKS: u64 = 30;

/// Shortest run that still sees two resyncs.
const MIN_TICKS: u64 = 2 * RESYNC_TICKS + 2;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Constructs the authority held at the end
    pub final_construct_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Frames handed to the router
    pub frames_routed: u64,

    /// Frames dropped by partition, loss or an unknown recipient
    pub frames_dropped: u64,

    /// Push resyncs the authority sent
    pub resyncs: u64,

    /// Sweeps the authority completed
    pub sweeps: u64,

    /// Update faults across every session
    pub update_faults: u64,

    /// Replicas not matching the authority at the end
    pub divergent_replicas: usize,
}

/// Runs the scenarios against fresh worlds.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of client replicas
    num_replicas: usize,

    /// Ticks per scenario phase
    ticks: u64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_replicas: usize) -> Self {
        Self {
            seed,
            num_replicas: num_replicas.max(1),
            ticks: 600,
        }
    }

    /// Sets the length of the main phase of each scenario.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks.max(MIN_TICKS);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let config = SimConfig {
            seed: self.seed,
            num_replicas: self.num_replicas,
            resync_interval_ticks: RESYNC_TICKS,
            loss_rate: if scenario == ScenarioId::LossyLink { 0.3 } else { 0.0 },
            ..Default::default()
        };
        let mut world = match SimWorld::new(config) {
            Ok(world) => world,
            Err(e) => return self.failed_setup(scenario, e),
        };

        let outcome = match scenario {
            ScenarioId::SteadyState => self.run_steady_state(&mut world),
            ScenarioId::LossyLink => self.run_lossy_link(&mut world),
            ScenarioId::SplitBrain => self.run_split_brain(&mut world),
            ScenarioId::LateJoin => self.run_late_join(&mut world),
            ScenarioId::CloseStorm => self.run_close_storm(&mut world),
            ScenarioId::GateJump => self.run_gate_jump(&mut world),
        };
        let failure_reason = match outcome {
            Ok(()) => None,
            Err(Check::Failed(reason)) => Some(reason),
            Err(Check::Sim(e)) => Some(e.to_string()),
        };

        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            final_construct_count: world.authority().registry().len(),
            failure_reason,
            metrics: collect_metrics(&world),
        };
        if let Err(e) = world.shutdown() {
            debug!(error = %e, "shutdown after scenario failed");
        }
        result
    }

    fn failed_setup(&self, scenario: ScenarioId, error: SimError) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            final_construct_count: 0,
            failure_reason: Some(format!("setup failed: {}", error)),
            metrics: ScenarioMetrics::default(),
        }
    }

    /// Clean run. Also checks link queries and a config push.
    fn run_steady_state(&self, world: &mut SimWorld) -> Result<(), Check> {
        world.spawn_constructs(8);
        world.run(self.ticks)?;
        ensure_converged(world, "after main phase")?;

        world.replica(0)?.query_links(LinkKind::Comm, 2).map_err(SimError::from)?;
        world.run(2)?;
        let linked = world.replica(0)?.linked(LinkKind::Comm, 2);
        ensure(linked == Some(vec![1]), format!("comm links of construct 2: {:?}", linked))?;

        let mut config = Configuration::clone(&world.authority().config());
        config.gameplay = serde_json::json!({ "difficulty": 3 });
        world
            .authority()
            .update_config(config.clone())
            .map_err(|e| Check::Failed(e.to_string()))?;
        world.run(2)?;
        for index in 0..world.replica_count() {
            ensure(
                *world.replica(index)?.config() == config,
                format!("replica {} missed the config push", index),
            )?;
        }

        let faults = collect_metrics(world).update_faults;
        ensure(faults == 0, format!("{} update faults", faults))
    }

    /// 30% loss for the main phase, then a clean resync window.
    fn run_lossy_link(&self, world: &mut SimWorld) -> Result<(), Check> {
        world.spawn_constructs(8);
        world.run(self.ticks)?;
        ensure(world.router_stats().dropped_loss > 0, "no frame was lost".to_string())?;

        world.network_controller.clear_loss();
        world.run(RESYNC_TICKS + 2)?;
        ensure_converged(world, "after loss cleared")
    }

    /// Authority changes its registry while partitioned.
    fn run_split_brain(&self, world: &mut SimWorld) -> Result<(), Check> {
        world.spawn_constructs(8);
        world.run(RESYNC_TICKS + 2)?;
        ensure_converged(world, "before partition")?;

        let authority = world.authority_id();
        let replicas = world.replica_ids();
        world.network_controller.partition(&[authority], &replicas);
        for id in 1..=3 {
            world.authority().close_construct(id, false);
        }
        world.spawn_constructs(3);
        world.run(self.ticks / 2)?;

        let divergent = world.divergent_replicas();
        ensure(
            divergent == world.replica_count(),
            format!(
                "{} of {} replicas saw authority changes through the partition",
                world.replica_count() - divergent,
                world.replica_count()
            ),
        )?;

        world.network_controller.heal_all();
        world.run(RESYNC_TICKS + 2)?;
        ensure_converged(world, "after heal")?;
        ensure(
            world.authority_view() == (4..=11).collect::<Vec<_>>(),
            format!("authority view {:?}", world.authority_view()),
        )
    }

    /// New replica catches up from its own requests, not from a push.
    fn run_late_join(&self, world: &mut SimWorld) -> Result<(), Check> {
        world.spawn_constructs(6);
        world.run(RESYNC_TICKS + 2)?;

        world.add_replica()?;
        let index = world.replica_count() - 1;
        world.run(3)?;

        let view = world.replica_view(index)?;
        ensure(view == world.authority_view(), format!("late replica holds {:?}", view))?;
        ensure(
            *world.replica(index)?.config() == *world.authority().config(),
            "late replica did not fetch the configuration".to_string(),
        )?;

        world.run(self.ticks)?;
        ensure_converged(world, "after main phase")
    }

    /// Explicit closes plus self-expiring constructs, between two resyncs.
    fn run_close_storm(&self, world: &mut SimWorld) -> Result<(), Check> {
        let kept = world.spawn_constructs(8);
        for _ in 0..4 {
            let id = world.next_construct_id();
            world.add_construct(SimConstruct::new(id).expiring_after(RESYNC_TICKS + 10));
        }
        world.run(RESYNC_TICKS + 2)?;
        ensure_converged(world, "before storm")?;

        for id in &kept[2..] {
            world.authority().close_construct(*id, false);
        }
        // A replica cannot close an authority construct on its own.
        world.replica(0)?.close_construct(kept[0], false);
        world.run(20)?;

        ensure(
            world.authority_view() == kept[..2].to_vec(),
            format!("authority view {:?}", world.authority_view()),
        )?;
        ensure_converged(world, "after storm")?;

        world.run(self.ticks)?;
        ensure_converged(world, "after main phase")
    }

    /// Warps on the authority: one arrives, one loses its gate mid-flight.
    fn run_gate_jump(&self, world: &mut SimWorld) -> Result<(), Check> {
        const SPEED_LIMIT: f64 = 50.0;

        let outcomes: Arc<Mutex<Vec<(i64, WarpOutcome)>>> = Arc::default();
        let animation_done: Arc<Mutex<Option<Option<Fault>>>> = Arc::default();
        let destination = Isometry3::from_parts(
            Translation3::new(100.0, 0.0, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
        );

        let open_gate = Arc::new(SimGate::new(500));
        let doomed_gate = Arc::new(SimGate::new(501));
        let mut bodies = Vec::new();

        for (lead, gate) in [(1_i64, Arc::clone(&open_gate)), (2, Arc::clone(&doomed_gate))] {
            let body = Arc::new(SimBody::new(Isometry3::identity()));
            world.authority().entities().attach(lead, Component::Body(body.clone()));
            bodies.push(body);

            let log = Arc::clone(&outcomes);
            let warp = EntityWarp {
                lead,
                gate,
                source: Isometry3::identity(),
                destination,
                duration_ticks: 30,
                max_safe_speed: SPEED_LIMIT,
                on_complete: Some(Box::new(move |outcome| {
                    log.lock().unwrap_or_else(PoisonError::into_inner).push((lead, outcome));
                })),
            };
            if world.authority_mut().start_warp(warp).is_err() {
                return Err(Check::Failed(format!("entity {} already warping", lead)));
            }
        }

        let done = Arc::clone(&animation_done);
        world.authority_mut().play_animation(
            7,
            AnimationPlay::new(SimAnimation::new(20), 1).on_complete(move |fault| {
                *done.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
            }),
        );

        world.run(10)?;
        world.authority().close_gate(doomed_gate.clone());
        world.run(30)?;

        let mut outcomes = outcomes.lock().unwrap_or_else(PoisonError::into_inner).clone();
        outcomes.sort_by_key(|(lead, _)| *lead);
        ensure(
            outcomes == vec![(1, WarpOutcome::Arrived), (2, WarpOutcome::GateClosed)],
            format!("warp outcomes {:?}", outcomes),
        )?;
        ensure(doomed_gate.closes() == 1, "gate close was not applied once".to_string())?;

        let arrived = bodies[0].pose();
        let offset = (arrived.translation.vector - destination.translation.vector).norm();
        ensure(offset < 1e-6, format!("body ended {:.3}m from the destination", offset))?;
        let speed = bodies[0].velocity().norm();
        ensure(speed <= SPEED_LIMIT + 1e-9, format!("exit speed {:.1} m/s", speed))?;

        let animation = animation_done.lock().unwrap_or_else(PoisonError::into_inner).clone();
        ensure(animation == Some(None), format!("animation result {:?}", animation))?;

        world.run(self.ticks)?;
        Ok(())
    }
}

/// Why a scenario stopped.
enum Check {
    Failed(String),
    Sim(SimError),
}

impl From<SimError> for Check {
    fn from(e: SimError) -> Self {
        Check::Sim(e)
    }
}

fn ensure(condition: bool, reason: String) -> Result<(), Check> {
    if condition {
        Ok(())
    } else {
        Err(Check::Failed(reason))
    }
}

fn ensure_converged(world: &SimWorld, phase: &str) -> Result<(), Check> {
    let divergent = world.divergent_replicas();
    ensure(
        divergent == 0,
        format!("{} of {} replicas diverged {}", divergent, world.replica_count(), phase),
    )
}

fn collect_metrics(world: &SimWorld) -> ScenarioMetrics {
    let router = world.router_stats();
    let authority = world.authority().stats();
    let replica_faults: u64 = (0..world.replica_count())
        .filter_map(|i| world.replica(i).ok())
        .map(|r| r.stats().update_faults)
        .sum();

    ScenarioMetrics {
        frames_routed: router.routed,
        frames_dropped: router.dropped(),
        resyncs: authority.resyncs,
        sweeps: authority.sweeps_completed,
        update_faults: authority.update_faults + replica_faults,
        divergent_replicas: world.divergent_replicas(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_have_a_floor() {
        let runner = ScenarioRunner::new(1, 0).with_ticks(5);
        assert_eq!(runner.ticks, MIN_TICKS);
        assert_eq!(runner.num_replicas, 1);
    }

    #[test]
    fn test_result_serializes_scenario_name() {
        let result = ScenarioRunner::new(3, 1).with_ticks(MIN_TICKS).run(ScenarioId::SteadyState);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scenario"], "steady_state");
        assert_eq!(json["passed"], true, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_every_scenario_passes() {
        let runner = ScenarioRunner::new(7, 2).with_ticks(MIN_TICKS);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
            assert_eq!(result.metrics.divergent_replicas, 0, "{}", scenario);
        }
    }

    #[test]
    fn test_split_brain_drops_frames() {
        let result = ScenarioRunner::new(11, 3).with_ticks(MIN_TICKS).run(ScenarioId::SplitBrain);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.frames_dropped > 0);
        assert!(result.metrics.resyncs >= 2);
    }
}
