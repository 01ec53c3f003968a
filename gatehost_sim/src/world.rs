//! SimWorld - The simulation harness container.
//!
//! One `ListenServer` authority and any number of `Client` replicas share a
//! virtual clock and a central router. Every frame a session sends lands in
//! the router first; `step()` applies partitions, loss and latency before
//! handing it to the recipient's inbox.

use crate::constructs::SimConstruct;
use crate::context::SimContext;
use crate::error::SimError;
use crate::network::{Directory, NetworkMessage, SimNetwork, SimNetworkController};

use gatehost_core::{
    Configuration, ConstructId, LinkKind, Role, Session, SessionHooks, SessionOptions,
    SessionState,
};
use gatehost_env::{ChannelFrame, HostContext, NodeId};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type SimSession = Session<SimConstruct, SimContext, SimNetwork>;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of client replicas to spawn
    pub num_replicas: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Loss rate applied to every link (0.0 - 1.0)
    pub loss_rate: f64,

    /// Delivery delay applied to every link, in ticks
    pub latency_ticks: u64,

    /// Ticks between push resyncs from the authority
    pub resync_interval_ticks: u64,

    /// Background sweeps allowed at once per session
    pub max_concurrent_sweeps: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_replicas: 3,
            tick_rate_hz: 60,
            loss_rate: 0.0,
            latency_ticks: 0,
            resync_interval_ticks: 60,
            max_concurrent_sweeps: 1,
        }
    }
}

impl SimConfig {
    /// Session configuration every endpoint starts with.
    pub fn session_config(&self) -> Configuration {
        Configuration {
            max_concurrent_sweeps: self.max_concurrent_sweeps,
            resync_interval_ticks: self.resync_interval_ticks,
            tick_rate_hz: self.tick_rate_hz,
            startup_grace_ticks: 2,
            client_first_update_tick: 2,
            ..Default::default()
        }
    }
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RouterStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped_partition: u64,
    pub dropped_loss: u64,
    pub dropped_unknown: u64,
}

impl RouterStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_partition + self.dropped_loss + self.dropped_unknown
    }
}

struct NodeHooks {
    node: NodeId,
}

impl SessionHooks for NodeHooks {
    fn on_state_change(&self, from: SessionState, to: SessionState) {
        debug!(node = %self.node, ?from, ?to, "sim session state");
    }
}

/// Handle to a simulated endpoint.
pub struct SimNode {
    /// Endpoint's node ID
    pub id: NodeId,

    pub session: SimSession,

    /// Sender to deliver frames to this endpoint
    inbox_tx: mpsc::Sender<(NodeId, ChannelFrame)>,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network_controller: SimNetworkController,

    /// The authority followed by the replicas, in join order
    nodes: Vec<SimNode>,

    directory: Directory,

    /// Central router sender (receives all outgoing frames)
    router_tx: mpsc::Sender<NetworkMessage>,

    /// Central router receiver
    router_rx: mpsc::Receiver<NetworkMessage>,

    /// Frames held back by link latency, with their due tick
    in_flight: Vec<(u64, NetworkMessage)>,

    stats: RouterStats,

    /// Current tick count
    tick_count: u64,

    next_construct_id: ConstructId,
}

impl SimWorld {
    /// Creates a new SimWorld, loads the authority and every replica.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let context = SimContext::shared(config.seed);
        let network_controller = SimNetworkController::new();
        network_controller.set_default_loss(config.loss_rate);

        // Create central router channel
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(10000);

        let mut world = Self {
            config,
            context,
            network_controller,
            nodes: Vec::new(),
            directory: Arc::new(RwLock::new(Vec::new())),
            router_tx,
            router_rx,
            in_flight: Vec::new(),
            stats: RouterStats::default(),
            tick_count: 0,
            next_construct_id: 1,
        };

        world.spawn_node(Role::ListenServer)?;
        for _ in 0..world.config.num_replicas {
            world.spawn_node(Role::Client)?;
        }
        Ok(world)
    }

    /// Joins one more replica. It asks the authority for a full sync on start.
    pub fn add_replica(&mut self) -> Result<NodeId, SimError> {
        self.spawn_node(Role::Client)
    }

    fn spawn_node(&mut self, role: Role) -> Result<NodeId, SimError> {
        let id = NodeId::from_seed(self.nodes.len() as u64);
        let server_id = self.nodes.first().map(|n| n.id).unwrap_or(id);
        let (inbox_tx, inbox_rx) = mpsc::channel(1000);

        self.directory.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(id);
        let network = Arc::new(SimNetwork::new(
            id,
            server_id,
            self.router_tx.clone(),
            inbox_rx,
            Arc::clone(&self.directory),
        ));

        let options = SessionOptions::new(role)
            .namespace("gatehost-sim")
            .config(self.config.session_config())
            .hooks(Arc::new(NodeHooks { node: id }));
        let mut session = Session::new(Arc::clone(&self.context), network, options);
        session.load()?;
        session.before_start()?;

        debug!(node = %id, %role, "endpoint joined");
        self.nodes.push(SimNode { id, session, inbox_tx });
        Ok(id)
    }

    /// Registers `count` fresh constructs on the authority, each comm-linked
    /// to the one before it.
    pub fn spawn_constructs(&mut self, count: usize) -> Vec<ConstructId> {
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self.next_construct_id();
            let mut construct = SimConstruct::new(id);
            if id > 1 {
                construct = construct.with_links(LinkKind::Comm, [id - 1]);
            }
            if self.add_construct(construct) {
                spawned.push(id);
            }
        }
        spawned
    }

    /// Registers a construct on the authority. False if the id is taken.
    pub fn add_construct(&mut self, construct: SimConstruct) -> bool {
        let id = construct.id;
        self.next_construct_id = self.next_construct_id.max(id + 1);
        self.authority().add_construct(construct).is_ok()
    }

    /// Reserves the next unused construct id.
    pub fn next_construct_id(&mut self) -> ConstructId {
        let id = self.next_construct_id;
        self.next_construct_id += 1;
        id
    }

    /// Advances simulation by one tick.
    ///
    /// Frames sent during tick N are delivered and handled during tick N+1,
    /// before any session's before-phase.
    pub fn step(&mut self) -> Result<(), SimError> {
        let dt = 1.0 / self.config.tick_rate_hz.max(1) as f64;

        // Advance virtual time
        self.context.advance_time(Duration::from_secs_f64(dt));
        self.tick_count += 1;

        self.process_network();
        for node in &self.nodes {
            node.session.poll_network();
        }
        for node in &mut self.nodes {
            node.session.before_simulation()?;
        }
        let frame = self.tick_count;
        for node in &mut self.nodes {
            node.session.after_simulation(frame)?;
        }
        Ok(())
    }

    /// Runs `ticks` steps.
    pub fn run(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    /// Routes pending frames through partitions, loss and latency.
    pub fn process_network(&mut self) {
        // Drain all pending messages
        while let Ok(msg) = self.router_rx.try_recv() {
            self.stats.routed += 1;

            // Check partition
            if !self.network_controller.can_communicate(msg.from, msg.to) {
                self.stats.dropped_partition += 1;
                continue;
            }

            let loss = self.network_controller.get_loss(msg.from, msg.to);
            if loss > 0.0 && self.context.chance(loss) {
                self.stats.dropped_loss += 1;
                trace!(from = %msg.from, to = %msg.to, "frame lost");
                continue;
            }

            let latency = self
                .network_controller
                .get_latency(msg.from, msg.to)
                .max(self.config.latency_ticks);
            self.in_flight.push((self.tick_count + latency, msg));
        }

        let now = self.tick_count;
        let (due, held): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.in_flight = held;

        for (_, msg) in due {
            match self.nodes.iter().find(|n| n.id == msg.to) {
                Some(node) if node.inbox_tx.try_send((msg.from, msg.frame)).is_ok() => {
                    self.stats.delivered += 1;
                }
                _ => self.stats.dropped_unknown += 1,
            }
        }
    }

    /// Ids the authority is willing to replicate, sorted.
    pub fn authority_view(&self) -> Vec<ConstructId> {
        let mut ids: Vec<_> = self
            .authority()
            .registry()
            .replicable_snapshots(false)
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Open construct ids held by replica `index`, sorted.
    pub fn replica_view(&self, index: usize) -> Result<Vec<ConstructId>, SimError> {
        let replica = self.replica(index)?;
        let mut ids: Vec<_> = replica
            .registry()
            .entries()
            .into_iter()
            .filter(|entry| !entry.lock().closed)
            .map(|entry| entry.id())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Replicas whose view differs from the authority's.
    pub fn divergent_replicas(&self) -> usize {
        let expected = self.authority_view();
        (0..self.replica_count())
            .filter(|i| self.replica_view(*i).map_or(true, |view| view != expected))
            .count()
    }

    pub fn converged(&self) -> bool {
        self.divergent_replicas() == 0
    }

    /// Unloads every session, replicas first.
    pub fn shutdown(&mut self) -> Result<(), SimError> {
        for node in self.nodes.iter_mut().rev() {
            if node.session.state() != SessionState::Offline {
                node.session.unload()?;
            }
        }
        Ok(())
    }

    pub fn authority(&self) -> &SimSession {
        &self.nodes[0].session
    }

    pub fn authority_mut(&mut self) -> &mut SimSession {
        &mut self.nodes[0].session
    }

    pub fn authority_id(&self) -> NodeId {
        self.nodes[0].id
    }

    pub fn replica(&self, index: usize) -> Result<&SimSession, SimError> {
        self.nodes
            .get(index + 1)
            .map(|n| &n.session)
            .ok_or(SimError::NoSuchReplica(index))
    }

    pub fn replica_mut(&mut self, index: usize) -> Result<&mut SimSession, SimError> {
        self.nodes
            .get_mut(index + 1)
            .map(|n| &mut n.session)
            .ok_or(SimError::NoSuchReplica(index))
    }

    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().skip(1).map(|n| n.id).collect()
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn router_stats(&self) -> RouterStats {
        self.stats
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}
