//! Session context and tick scheduler.
//!
//! A [`Session`] bundles everything one endpoint needs: transport, registry,
//! configuration, deferred queues, timelines and the entity table. It is
//! driven by an external loop through the lifecycle methods below and never
//! calls them itself.
//!
//! ```text
//!   Offline ─load─► Loading ─(grace elapsed)─► Running
//!      ▲                                          │
//!      └──────────────── Unloading ◄────unload────┘
//! ```
//!
//! Per tick the driver calls [`Session::before_simulation`] and then
//! [`Session::after_simulation`] on one thread. Within a tick the queue
//! flush always precedes the non-threadable updates, which always precede
//! the timelines.

use gatehost_env::{HostContext, NetworkTransport, NodeId};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::construct::{Construct, ConstructId, Gate, LinkKind};
use crate::entity::EntityTable;
use crate::error::{ConfigError, LifecycleError};
use crate::fault::isolate;
use crate::packet::{PacketKind, CHANNEL};
use crate::queues::{CloseRequest, DeferredQueues};
use crate::registry::{ConstructEntry, Registry};
use crate::replication::{self, ConstructRef};
use crate::sweep::{sweep, SweepGate};
use crate::timeline::{AnimationPlay, AnimationTimeline, EntityWarp, PlayOutcome, WarpTimeline};
use crate::transport::{Role, Transport, TransportStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Offline,
    Loading,
    Running,
    Unloading,
}

/// Callbacks into the embedding application. Every method defaults to a no-op.
pub trait SessionHooks: Send + Sync {
    fn on_state_change(&self, from: SessionState, to: SessionState) {
        let _ = (from, to);
    }

    /// Periodic request to persist buffered logs.
    fn flush_logs(&self) {}

    fn on_config_reloaded(&self, config: &Configuration) {
        let _ = config;
    }

    fn draw(&self, tick: u64) {
        let _ = tick;
    }
}

/// Hooks that do nothing.
pub struct NoHooks;

impl SessionHooks for NoHooks {}

/// How to build a [`Session`].
pub struct SessionOptions {
    pub role: Role,
    /// Disambiguates traffic sharing the channel
    pub namespace: String,
    pub channel: u16,
    pub config: Configuration,
    /// Read on `load`, written on `save`
    pub config_path: Option<PathBuf>,
    pub hooks: Arc<dyn SessionHooks>,
}

impl SessionOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            namespace: "gatehost".to_string(),
            channel: CHANNEL,
            config: Configuration::default(),
            config_path: None,
            hooks: Arc::new(NoHooks),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn config(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) sweeps_launched: AtomicU64,
    pub(crate) sweeps_completed: AtomicU64,
    pub(crate) sweeps_skipped: AtomicU64,
    pub(crate) update_faults: AtomicU64,
    pub(crate) resyncs: AtomicU64,
}

/// State reachable from sweep workers and packet handlers.
pub(crate) struct Shared<C, Ctx, Net>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    pub(crate) role: Role,
    pub(crate) ctx: Arc<Ctx>,
    pub(crate) transport: Arc<Transport<Ctx, Net>>,
    pub(crate) registry: Registry<C>,
    pub(crate) queues: DeferredQueues,
    pub(crate) links: Mutex<HashMap<(LinkKind, ConstructId), Vec<ConstructId>>>,
    pub(crate) sweeps: Arc<SweepGate>,
    pub(crate) entities: EntityTable,
    pub(crate) counters: Counters,
    pub(crate) hooks: Arc<dyn SessionHooks>,
    config: RwLock<Arc<Configuration>>,
}

impl<C, Ctx, Net> Shared<C, Ctx, Net>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    pub(crate) fn config(&self) -> Arc<Configuration> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swaps the configuration in and runs every reload hook.
    pub(crate) fn apply_config(&self, config: Configuration) {
        self.sweeps.set_limit(config.max_concurrent_sweeps);
        self.transport.set_stale_threshold(config.stale_threshold());
        let config = Arc::new(config);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&config);

        for entry in self.registry.entries() {
            entry.lock().reload_config(&config);
        }
        self.hooks.on_config_reloaded(&config);
    }

    /// Applies every queued close. Tick thread only.
    fn flush_queues(&self) -> usize {
        let mut applied = 0;
        for request in self.queues.drain_constructs() {
            let Some(entry) = self.registry.get(request.id) else {
                continue;
            };
            if request.sync_stamp.is_some_and(|stamp| stamp != entry.sync_stamp()) {
                debug!(construct = request.id, "close superseded by a later sync");
                continue;
            }
            let closed = {
                let mut construct = entry.lock();
                construct.close(request.override_replica);
                construct.closed()
            };
            if !closed {
                debug!(construct = request.id, "close declined");
                continue;
            }
            if self.registry.remove_entry(&entry) {
                entry.lock().dispose();
                applied += 1;
            }
            self.forget_links(request.id);

            if request.propagate && self.role.is_server() && self.transport.is_registered() {
                let close = ConstructRef { id: request.id };
                if let Err(e) = replication::broadcast(self, PacketKind::CloseConstruct, &close) {
                    warn!(construct = request.id, error = %e, "close not propagated");
                }
            }
        }

        for gate in self.queues.drain_gates() {
            if gate.is_valid() {
                gate.close();
                applied += 1;
            }
        }
        applied
    }

    fn forget_links(&self, id: ConstructId) {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, owner), _| *owner != id);
    }

    /// One background pass. Runs on a worker.
    fn run_sweep(&self, resync: bool) {
        let report = sweep(&self.registry, &self.queues);
        self.counters
            .update_faults
            .fetch_add(report.faults as u64, Ordering::Relaxed);

        if resync && self.transport.is_registered() {
            match replication::push_full_sync(self) {
                Ok(_) => {
                    self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "push resync skipped"),
            }
        }
        self.counters.sweeps_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tick-thread state.
struct TickState {
    state: SessionState,
    tick: u64,
    grace: u64,
    resync_due: bool,
    last_frame: Option<u64>,
    redownloads: HashMap<ConstructId, u32>,
    animations: AnimationTimeline,
    warps: WarpTimeline,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub role: Role,
    pub state: SessionState,
    pub tick: u64,
    pub constructs: usize,
    pub active_sweeps: usize,
    pub sweeps_launched: u64,
    pub sweeps_completed: u64,
    pub sweeps_skipped: u64,
    pub update_faults: u64,
    pub resyncs: u64,
    pub animations: usize,
    pub warps: usize,
    pub transport: TransportStats,
}

/// One endpoint of a replicated construct session.
pub struct Session<C, Ctx, Net>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    shared: Arc<Shared<C, Ctx, Net>>,
    config_path: Option<PathBuf>,
    tick: TickState,
}

impl<C, Ctx, Net> Session<C, Ctx, Net>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    pub fn new(ctx: Arc<Ctx>, net: Arc<Net>, options: SessionOptions) -> Self {
        let SessionOptions {
            role,
            namespace,
            channel,
            config,
            config_path,
            hooks,
        } = options;

        let transport = Arc::new(Transport::new(Arc::clone(&ctx), net, role, channel, namespace));
        transport.set_stale_threshold(config.stale_threshold());
        let sweeps = SweepGate::new(config.max_concurrent_sweeps);

        let shared = Arc::new(Shared {
            role,
            ctx,
            transport,
            registry: Registry::new(),
            queues: DeferredQueues::new(),
            links: Mutex::new(HashMap::new()),
            sweeps,
            entities: EntityTable::new(),
            counters: Counters::default(),
            hooks,
            config: RwLock::new(Arc::new(config)),
        });

        Self {
            shared,
            config_path,
            tick: TickState {
                state: SessionState::Offline,
                tick: 0,
                grace: 0,
                resync_due: false,
                last_frame: None,
                redownloads: HashMap::new(),
                animations: AnimationTimeline::new(),
                warps: WarpTimeline::new(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Offline → Loading. Reads the configuration file if one is set and
    /// registers the transport when the role has peers.
    pub fn load(&mut self) -> Result<(), LifecycleError> {
        self.expect(SessionState::Offline)?;

        if let Some(path) = &self.config_path {
            let config = Configuration::load(path);
            self.shared.apply_config(config);
        }

        if self.shared.role.has_peers() {
            self.shared.transport.register()?;
            replication::install(&self.shared);
        }

        let config = self.shared.config();
        self.tick.tick = 0;
        self.tick.grace = config.startup_grace_ticks;
        self.tick.last_frame = None;
        self.transition(SessionState::Loading);
        info!(role = %self.shared.role, node = %self.local_id(), "session loading");
        Ok(())
    }

    /// Replicas ask the authority for its configuration and a full sync.
    pub fn before_start(&mut self) -> Result<(), LifecycleError> {
        self.expect(SessionState::Loading)?;
        if !self.shared.role.is_server() {
            replication::request(&self.shared, PacketKind::FetchConfig, None)?;
            replication::request(&self.shared, PacketKind::SyncConstructs, None)?;
        }
        Ok(())
    }

    /// First phase of a tick.
    pub fn before_simulation(&mut self) -> Result<(), LifecycleError> {
        self.expect_active()?;
        self.shared.flush_queues();

        if self.shared.role.is_server() {
            return Ok(());
        }

        let mut due = Vec::new();
        self.tick.redownloads.retain(|id, remaining| {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                due.push(*id);
                false
            } else {
                true
            }
        });
        due.sort_unstable();
        for id in due {
            replication::request(&self.shared, PacketKind::SyncConstruct, Some(id))?;
        }
        Ok(())
    }

    /// Second phase of a tick. `frame` is the driver's frame counter, used to
    /// detect a paused single-player world.
    pub fn after_simulation(&mut self, frame: u64) -> Result<(), LifecycleError> {
        self.expect_active()?;
        let config = self.shared.config();

        self.tick.tick = if self.tick.tick >= u64::MAX - 1 { 0 } else { self.tick.tick + 1 };
        self.tick.grace = self.tick.grace.saturating_sub(1);
        if self.tick.tick % config.resync_interval_ticks.max(1) == 0 {
            self.tick.resync_due = true;
        }

        if self.tick.state == SessionState::Loading && self.ready(&config) {
            self.transition(SessionState::Running);
        }

        self.launch_sweep();
        self.update_non_threadable();

        let paused = self.shared.role == Role::SinglePlayer && self.tick.last_frame == Some(frame);
        self.tick.last_frame = Some(frame);
        if !paused {
            self.tick.warps.tick(&self.shared.entities, config.tick_seconds());
            self.tick.animations.tick();
        }

        if self.tick.tick % config.log_flush_interval_ticks.max(1) == 0 {
            let stats = self.stats();
            debug!(
                tick = stats.tick,
                constructs = stats.constructs,
                sweeps = stats.sweeps_completed,
                skipped = stats.sweeps_skipped,
                faults = stats.update_faults,
                "scheduler summary"
            );
            self.shared.hooks.flush_logs();
        }
        Ok(())
    }

    pub fn draw(&self) -> Result<(), LifecycleError> {
        self.expect_active()?;
        self.shared.hooks.draw(self.tick.tick);
        Ok(())
    }

    /// Writes the configuration back to disk (authority only). A failed
    /// write is logged and does not interrupt the session.
    pub fn save(&self) -> Result<(), LifecycleError> {
        self.expect_active()?;
        if let (true, Some(path)) = (self.shared.role.is_server(), &self.config_path) {
            if let Err(e) = self.shared.config().save(path) {
                error!(path = %path.display(), error = %e, "failed to save configuration");
            }
        }
        Ok(())
    }

    /// Tears everything down and returns to Offline.
    pub fn unload(&mut self) -> Result<(), LifecycleError> {
        self.expect_active()?;
        self.transition(SessionState::Unloading);

        // No new sweeps; wait for running ones so none sees a torn-down registry.
        self.shared.sweeps.set_limit(0);
        self.shared.sweeps.wait_idle();

        self.shared.flush_queues();
        let mut disposed = 0;
        for entry in self.shared.registry.drain() {
            let mut construct = entry.lock();
            if !construct.closed() {
                construct.close(true);
            }
            construct.dispose();
            disposed += 1;
        }
        self.tick.animations.clear();
        self.tick.warps.clear();
        self.tick.redownloads.clear();
        self.shared.links.lock().unwrap_or_else(PoisonError::into_inner).clear();

        if self.shared.transport.is_registered() {
            self.shared.transport.unregister()?;
        }
        let config = self.shared.config();
        self.shared.sweeps.set_limit(config.max_concurrent_sweeps);

        info!(role = %self.shared.role, disposed, "session unloaded");
        self.transition(SessionState::Offline);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler internals
    // ------------------------------------------------------------------

    fn ready(&self, config: &Configuration) -> bool {
        if self.shared.role.is_server() {
            self.tick.grace == 0
        } else {
            self.tick.tick >= config.client_first_update_tick
        }
    }

    fn launch_sweep(&mut self) {
        let Some(permit) = self.shared.sweeps.try_acquire() else {
            self.shared.counters.sweeps_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let resync = std::mem::take(&mut self.tick.resync_due)
            && self.shared.role.is_server()
            && self.shared.role.has_peers();

        self.shared.counters.sweeps_launched.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        self.shared.ctx.spawn_blocking("registry-sweep", move || {
            let _permit = permit;
            shared.run_sweep(resync);
        });
    }

    fn update_non_threadable(&self) {
        for entry in self.shared.registry.entries() {
            let mut construct = entry.lock();
            if construct.is_suspended()
                || !construct.fully_initialized()
                || !construct.is_valid()
                || construct.closed()
            {
                continue;
            }
            if let Err(fault) = isolate(|| construct.update_non_threadable()) {
                self.shared.counters.update_faults.fetch_add(1, Ordering::Relaxed);
                error!(construct = entry.id(), %fault, "non-threadable update failed");
            }
        }
    }

    fn expect(&self, expected: SessionState) -> Result<(), LifecycleError> {
        if self.tick.state == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidState {
                expected,
                actual: self.tick.state,
            })
        }
    }

    /// Loading or Running.
    fn expect_active(&self) -> Result<(), LifecycleError> {
        match self.tick.state {
            SessionState::Loading | SessionState::Running => Ok(()),
            actual => Err(LifecycleError::InvalidState {
                expected: SessionState::Running,
                actual,
            }),
        }
    }

    fn transition(&mut self, to: SessionState) {
        let from = std::mem::replace(&mut self.tick.state, to);
        debug!(?from, ?to, "session state changed");
        self.shared.hooks.on_state_change(from, to);
    }

    // ------------------------------------------------------------------
    // Constructs, gates and timelines
    // ------------------------------------------------------------------

    /// Registers a new construct. A live construct with the same id wins and
    /// the argument is handed back.
    pub fn add_construct(&self, construct: C) -> Result<Arc<ConstructEntry<C>>, C> {
        self.shared.registry.insert(construct)
    }

    /// Queues a construct close for the next before-phase. Safe from any thread.
    pub fn close_construct(&self, id: ConstructId, override_replica: bool) {
        self.shared.queues.close_construct(CloseRequest {
            id,
            override_replica,
            propagate: self.shared.role.is_server(),
            sync_stamp: None,
        });
    }

    /// Queues a gate close for the next before-phase. Safe from any thread.
    pub fn close_gate(&self, gate: Arc<dyn Gate>) {
        self.shared.queues.close_gate(gate);
    }

    pub fn play_animation(&mut self, key: u64, play: AnimationPlay) -> PlayOutcome {
        self.tick.animations.play(key, play)
    }

    pub fn stop_animation(&mut self, key: u64) -> bool {
        self.tick.animations.stop(key)
    }

    pub fn start_warp(&mut self, warp: EntityWarp) -> Result<(), EntityWarp> {
        self.tick.warps.start(warp)
    }

    pub fn cancel_warp(&mut self, lead: i64) -> bool {
        self.tick.warps.cancel(lead)
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Asks the authority for every replicable construct.
    pub fn request_full_sync(&self) -> Result<usize, LifecycleError> {
        replication::request(&self.shared, PacketKind::SyncConstructs, None)
    }

    /// Asks the authority for one construct.
    pub fn request_construct(&self, id: ConstructId) -> Result<usize, LifecycleError> {
        replication::request(&self.shared, PacketKind::SyncConstruct, Some(id))
    }

    /// Re-downloads `id` after `ticks` before-phases (replicas only).
    pub fn schedule_redownload(&mut self, id: ConstructId, ticks: u32) {
        self.tick.redownloads.insert(id, ticks.max(1));
    }

    pub fn query_links(&self, kind: LinkKind, id: ConstructId) -> Result<usize, LifecycleError> {
        let packet_kind = match kind {
            LinkKind::Comm => PacketKind::CommLinked,
            LinkKind::Beacon => PacketKind::BeaconLinked,
        };
        replication::request(&self.shared, packet_kind, Some(id))
    }

    /// Linked ids: answered locally on the authority, from the link cache on a replica.
    pub fn linked(&self, kind: LinkKind, id: ConstructId) -> Option<Vec<ConstructId>> {
        if self.shared.role.is_server() {
            let mut linked = self.shared.registry.get(id)?.lock().linked(kind);
            linked.truncate(self.shared.config().max_link_depth);
            return Some(linked);
        }
        self.shared
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id))
            .cloned()
    }

    /// Validates, applies and broadcasts a new configuration (authority only).
    pub fn update_config(&self, config: Configuration) -> Result<(), ConfigError> {
        if !self.shared.role.is_server() {
            return Err(ConfigError::NotAuthority);
        }
        config.validate()?;
        self.shared.apply_config(config);

        if self.shared.transport.is_registered() {
            let config = self.shared.config();
            let sent =
                replication::broadcast(&self.shared, PacketKind::UpdateConfig, config.as_ref());
            if let Err(e) = sent {
                warn!(error = %e, "configuration not broadcast");
            }
        }
        info!("configuration updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Network pump
    // ------------------------------------------------------------------

    /// Processes every frame already received. For lockstep drivers.
    pub fn poll_network(&self) -> usize {
        self.shared.transport.pump()
    }

    /// Runs the receive loop on the context's executor.
    pub fn spawn_receive_loop(&self) {
        let transport = Arc::clone(&self.shared.transport);
        self.shared
            .ctx
            .spawn("packet-receive", async move { transport.run_receive_loop().await });
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.tick.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick.tick
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn local_id(&self) -> NodeId {
        self.shared.transport.local_id()
    }

    pub fn config(&self) -> Arc<Configuration> {
        self.shared.config()
    }

    pub fn registry(&self) -> &Registry<C> {
        &self.shared.registry
    }

    pub fn transport(&self) -> &Transport<Ctx, Net> {
        &self.shared.transport
    }

    pub fn entities(&self) -> &EntityTable {
        &self.shared.entities
    }

    pub fn active_sweeps(&self) -> usize {
        self.shared.sweeps.active()
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        SessionStats {
            role: self.shared.role,
            state: self.tick.state,
            tick: self.tick.tick,
            constructs: self.shared.registry.len(),
            active_sweeps: self.shared.sweeps.active(),
            sweeps_launched: counters.sweeps_launched.load(Ordering::Relaxed),
            sweeps_completed: counters.sweeps_completed.load(Ordering::Relaxed),
            sweeps_skipped: counters.sweeps_skipped.load(Ordering::Relaxed),
            update_faults: counters.update_faults.load(Ordering::Relaxed),
            resyncs: counters.resyncs.load(Ordering::Relaxed),
            animations: self.tick.animations.len(),
            warps: self.tick.warps.len(),
            transport: self.shared.transport.stats(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_tick(&mut self, tick: u64) {
        self.tick.tick = tick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::Animation;
    use crate::testing::{Block, ChannelHub, ChannelNet, LoopHub, LoopNet, ManualContext};
    use gatehost_env::TokioContext;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    type TestSession = Session<Block, ManualContext, LoopNet>;

    const SERVER: NodeId = NodeId(1);
    const CLIENT: NodeId = NodeId(2);

    fn quick_config() -> Configuration {
        Configuration {
            startup_grace_ticks: 0,
            client_first_update_tick: 1,
            ..Default::default()
        }
    }

    fn session(
        hub: &Arc<LoopHub>,
        ctx: &Arc<ManualContext>,
        id: NodeId,
        options: SessionOptions,
    ) -> TestSession {
        Session::new(Arc::clone(ctx), hub.endpoint(id), options)
    }

    /// A loaded authority and a loaded replica sharing one hub and clock.
    fn pair(config: Configuration) -> (Arc<LoopHub>, TestSession, TestSession) {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let server_options = SessionOptions::new(Role::ListenServer).config(config.clone());
        let mut server = session(&hub, &ctx, SERVER, server_options);
        let client_options = SessionOptions::new(Role::Client).config(config);
        let mut client = session(&hub, &ctx, CLIENT, client_options);
        server.load().unwrap();
        client.load().unwrap();
        (hub, server, client)
    }

    /// Pumps both endpoints until nothing is in flight.
    fn exchange(server: &TestSession, client: &TestSession) {
        while server.poll_network() + client.poll_network() > 0 {}
    }

    fn tick(session: &mut TestSession, frame: u64) {
        session.before_simulation().unwrap();
        session.after_simulation(frame).unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<(SessionState, SessionState)>>,
        flushes: AtomicUsize,
        reloads: AtomicUsize,
        draws: AtomicUsize,
    }

    impl SessionHooks for Recorder {
        fn on_state_change(&self, from: SessionState, to: SessionState) {
            self.states.lock().unwrap().push((from, to));
        }

        fn flush_logs(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_config_reloaded(&self, _config: &Configuration) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }

        fn draw(&self, _tick: u64) {
            self.draws.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Spin {
        ticks: Arc<AtomicUsize>,
    }

    impl Animation for Spin {
        fn tick(&mut self, _index: u64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn stopped(&self, _index: u64) -> bool {
            false
        }

        fn stop(&mut self) {}

        fn restart(&mut self, _type_tag: u32) {}
    }

    struct Portal {
        valid: AtomicBool,
    }

    impl Gate for Portal {
        fn id(&self) -> ConstructId {
            77
        }

        fn close(&self) {
            self.valid.store(false, Ordering::SeqCst);
        }

        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_lifecycle_state_machine() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let recorder = Arc::new(Recorder::default());
        let config = Configuration {
            startup_grace_ticks: 3,
            ..Default::default()
        };
        let mut server = session(
            &hub,
            &ctx,
            SERVER,
            SessionOptions::new(Role::DedicatedServer).config(config).hooks(recorder.clone()),
        );

        assert_eq!(
            server.before_simulation(),
            Err(LifecycleError::InvalidState {
                expected: SessionState::Running,
                actual: SessionState::Offline
            })
        );

        server.load().unwrap();
        assert_eq!(server.state(), SessionState::Loading);
        assert!(matches!(server.load(), Err(LifecycleError::InvalidState { .. })));
        server.before_start().unwrap();

        tick(&mut server, 1);
        tick(&mut server, 2);
        assert_eq!(server.state(), SessionState::Loading);
        tick(&mut server, 3);
        assert_eq!(server.state(), SessionState::Running);
        assert!(matches!(server.before_start(), Err(LifecycleError::InvalidState { .. })));

        server.draw().unwrap();
        server.unload().unwrap();
        assert_eq!(server.state(), SessionState::Offline);
        assert!(!server.transport().is_registered());

        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![
                (SessionState::Offline, SessionState::Loading),
                (SessionState::Loading, SessionState::Running),
                (SessionState::Running, SessionState::Unloading),
                (SessionState::Unloading, SessionState::Offline),
            ]
        );
        assert_eq!(recorder.draws.load(Ordering::SeqCst), 1);

        // A session can be loaded again after unloading
        server.load().unwrap();
    }

    #[test]
    fn test_client_runs_at_first_update_tick() {
        let (_hub, _server, mut client) = pair(Configuration {
            client_first_update_tick: 2,
            ..Default::default()
        });
        tick(&mut client, 1);
        assert_eq!(client.state(), SessionState::Loading);
        tick(&mut client, 2);
        assert_eq!(client.state(), SessionState::Running);
    }

    #[test]
    fn test_single_player_has_no_transport() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let options = SessionOptions::new(Role::SinglePlayer).config(quick_config());
        let mut solo = session(&hub, &ctx, SERVER, options);
        solo.load().unwrap();
        assert!(!solo.transport().is_registered());
        assert_eq!(solo.request_full_sync(), Err(LifecycleError::NotRegistered));

        let entry = solo.add_construct(Block::new(1)).ok().unwrap();
        solo.close_construct(1, false);
        tick(&mut solo, 1);
        assert!(entry.lock().disposed);
        assert!(solo.registry().is_empty());
    }

    #[test]
    fn test_full_sync_round_trip() {
        let (_hub, server, mut client) = pair(quick_config());

        let a = server.add_construct(Block::new(1)).ok().unwrap();
        let b = server.add_construct(Block::new(2)).ok().unwrap();
        let _c = server.add_construct(Block::new(3)).ok().unwrap();
        a.record_update();
        b.record_update();
        b.lock().closed = true;

        // Replica already holds stale copies of B and C
        let _ = client.add_construct(Block::new(2));
        let _ = client.add_construct(Block::new(3));

        client.before_start().unwrap();
        exchange(&server, &client);
        assert_eq!(client.registry().ids(), vec![1, 2, 3]);

        client.before_simulation().unwrap();
        assert_eq!(client.registry().ids(), vec![1]);
        assert_eq!(client.registry().get(1).unwrap().lock().tag, "remote");
    }

    #[test]
    fn test_upsert_keeps_live_replica_entry() {
        let (_hub, server, client) = pair(quick_config());
        let authority = server.add_construct(Block::new(5)).ok().unwrap();
        authority.lock().mass = 40;

        let local = client.add_construct(Block::new(5)).ok().unwrap();
        client.request_construct(5).unwrap();
        exchange(&server, &client);

        let current = client.registry().get(5).unwrap();
        assert!(Arc::ptr_eq(&local, &current));
        assert_eq!(current.lock().refreshed, 1);
        assert_eq!(current.lock().mass, 40);
        assert_eq!(client.registry().len(), 1);
    }

    #[test]
    fn test_partial_sync_of_missing_construct_removes_copy() {
        let (_hub, server, mut client) = pair(quick_config());
        let orphan = client.add_construct(Block::new(9)).ok().unwrap();

        client.request_construct(9).unwrap();
        exchange(&server, &client);
        client.before_simulation().unwrap();

        assert!(!client.registry().contains(9));
        assert!(orphan.lock().disposed);
    }

    #[test]
    fn test_later_sync_cancels_queued_orphan_close() {
        let (_hub, server, mut client) = pair(quick_config());
        let local = client.add_construct(Block::new(7)).ok().unwrap();

        // First answer does not know 7 yet
        client.request_full_sync().unwrap();
        exchange(&server, &client);
        assert_eq!(client.shared.queues.pending(), (1, 0));

        // Second answer, before the next tick, does
        let authority = server.add_construct(Block::new(7)).ok().unwrap();
        authority.record_update();
        client.request_full_sync().unwrap();
        exchange(&server, &client);

        client.before_simulation().unwrap();
        let current = client.registry().get(7).unwrap();
        assert!(Arc::ptr_eq(&local, &current));
        assert!(!current.lock().disposed);
    }

    #[test]
    fn test_orphan_close_applies_without_later_sync() {
        let (_hub, server, mut client) = pair(quick_config());
        let local = client.add_construct(Block::new(7)).ok().unwrap();
        let _ = server.add_construct(Block::new(7));

        // Partial sync refreshes 7, then a full sync without it arrives
        client.request_construct(7).unwrap();
        exchange(&server, &client);
        client.request_full_sync().unwrap();
        exchange(&server, &client);

        client.before_simulation().unwrap();
        assert!(!client.registry().contains(7));
        assert!(local.lock().disposed);
    }

    /// Polls `done` every 10ms for up to five seconds.
    async fn eventually(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_receive_loops_and_sweeps_on_tokio() {
        let hub = ChannelHub::new(SERVER);
        let ctx = TokioContext::shared();
        let mut server: Session<Block, TokioContext, ChannelNet> = Session::new(
            Arc::clone(&ctx),
            hub.endpoint(SERVER),
            SessionOptions::new(Role::ListenServer).config(quick_config()),
        );
        let mut client: Session<Block, TokioContext, ChannelNet> = Session::new(
            Arc::clone(&ctx),
            hub.endpoint(CLIENT),
            SessionOptions::new(Role::Client).config(quick_config()),
        );
        server.load().unwrap();
        client.load().unwrap();
        server.spawn_receive_loop();
        client.spawn_receive_loop();

        // Sweeps run on blocking workers; tick until both were updated
        let first = server.add_construct(Block::new(1)).ok().unwrap();
        let second = server.add_construct(Block::new(2)).ok().unwrap();
        let mut frame = 0;
        while first.update_count() == 0 || second.update_count() == 0 {
            frame += 1;
            assert!(frame < 500, "sweeps never updated both constructs");
            server.before_simulation().unwrap();
            server.after_simulation(frame).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.before_start().unwrap();
        assert!(eventually(|| client.registry().ids() == vec![1, 2]).await);

        server.close_construct(1, false);
        server.before_simulation().unwrap();
        assert!(eventually(|| client.shared.queues.pending().0 == 1).await);
        client.before_simulation().unwrap();
        assert_eq!(client.registry().ids(), vec![2]);

        server.unload().unwrap();
        client.unload().unwrap();
        assert_eq!(server.active_sweeps(), 0);
        assert!(server.stats().sweeps_completed > 0);
    }

    #[test]
    fn test_redownload_countdown() {
        let (hub, _server, mut client) = pair(quick_config());
        client.schedule_redownload(4, 2);

        client.before_simulation().unwrap();
        assert_eq!(hub.pending(SERVER), 0);
        client.before_simulation().unwrap();
        assert_eq!(hub.pending(SERVER), 1);
        client.before_simulation().unwrap();
        assert_eq!(hub.pending(SERVER), 1);
    }

    #[test]
    fn test_close_propagates_to_replica() {
        let (_hub, mut server, mut client) = pair(quick_config());
        server.add_construct(Block::new(1)).ok().unwrap().record_update();
        client.request_full_sync().unwrap();
        exchange(&server, &client);
        assert!(client.registry().contains(1));

        server.close_construct(1, false);
        server.before_simulation().unwrap();
        assert!(!server.registry().contains(1));

        exchange(&server, &client);
        let replica = client.registry().get(1).unwrap();
        client.before_simulation().unwrap();
        assert!(!client.registry().contains(1));
        assert!(replica.lock().disposed);
    }

    #[test]
    fn test_config_push() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let recorder = Arc::new(Recorder::default());
        let options = SessionOptions::new(Role::ListenServer).config(quick_config());
        let mut server = session(&hub, &ctx, SERVER, options);
        let mut client = session(
            &hub,
            &ctx,
            CLIENT,
            SessionOptions::new(Role::Client).hooks(recorder.clone()),
        );
        server.load().unwrap();
        client.load().unwrap();
        let replica = client.add_construct(Block::new(3)).ok().unwrap();

        let rejected = Configuration {
            tick_rate_hz: 0,
            ..quick_config()
        };
        assert!(matches!(server.update_config(rejected), Err(ConfigError::Invalid { .. })));
        assert!(matches!(client.update_config(quick_config()), Err(ConfigError::NotAuthority)));

        let next = Configuration {
            resync_interval_ticks: 42,
            ..quick_config()
        };
        server.update_config(next.clone()).unwrap();
        assert_eq!(*server.config(), next);

        exchange(&server, &client);
        assert_eq!(*client.config(), next);
        assert_eq!(replica.lock().reloads, 1);
        assert_eq!(recorder.reloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_out_of_range_stale_threshold_is_refused() {
        let (_hub, server, client) = pair(quick_config());
        let extreme = Configuration {
            stale_packet_threshold_ms: u64::MAX / 1000,
            max_concurrent_sweeps: 4,
            ..quick_config()
        };
        assert!(matches!(server.update_config(extreme.clone()), Err(ConfigError::Invalid { .. })));
        assert_eq!(*server.config(), quick_config());
        assert_eq!(server.shared.sweeps.limit(), 1);

        // A replica refuses the same values arriving over the wire
        replication::broadcast(&server.shared, PacketKind::UpdateConfig, &extreme).unwrap();
        exchange(&server, &client);
        assert_eq!(*client.config(), quick_config());
        assert_eq!(client.transport().stats().handler_faults, 1);
    }

    #[test]
    fn test_fetch_config_on_start() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let authority_config = Configuration {
            max_link_depth: 3,
            ..quick_config()
        };
        let options = SessionOptions::new(Role::DedicatedServer).config(authority_config.clone());
        let mut server = session(&hub, &ctx, SERVER, options);
        let mut client = session(&hub, &ctx, CLIENT, SessionOptions::new(Role::Client));
        server.load().unwrap();
        client.load().unwrap();

        client.before_start().unwrap();
        exchange(&server, &client);
        assert_eq!(*client.config(), authority_config);
    }

    #[test]
    fn test_link_queries() {
        let (_hub, server, client) = pair(quick_config());
        let hub_block = server.add_construct(Block::new(1)).ok().unwrap();
        hub_block.lock().links = vec![2, 3];

        assert_eq!(server.linked(LinkKind::Comm, 1), Some(vec![2, 3]));
        assert_eq!(client.linked(LinkKind::Comm, 1), None);

        client.query_links(LinkKind::Comm, 1).unwrap();
        client.query_links(LinkKind::Beacon, 8).unwrap();
        exchange(&server, &client);

        assert_eq!(client.linked(LinkKind::Comm, 1), Some(vec![2, 3]));
        assert_eq!(client.linked(LinkKind::Beacon, 8), Some(vec![]));
        assert_eq!(client.linked(LinkKind::Beacon, 1), None);
    }

    #[test]
    fn test_push_resync_reaches_replica_without_request() {
        let (_hub, mut server, client) = pair(Configuration {
            resync_interval_ticks: 2,
            ..quick_config()
        });
        server.add_construct(Block::new(1)).ok().unwrap();

        tick(&mut server, 1);
        exchange(&server, &client);
        assert!(client.registry().is_empty());

        tick(&mut server, 2);
        assert_eq!(server.stats().resyncs, 1);
        exchange(&server, &client);
        assert_eq!(client.registry().ids(), vec![1]);
    }

    #[test]
    fn test_non_threadable_update_isolates_faults() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let options = SessionOptions::new(Role::SinglePlayer).config(quick_config());
        let mut solo = session(&hub, &ctx, SERVER, options);
        solo.load().unwrap();

        let failing = solo.add_construct(Block::new(1)).ok().unwrap();
        failing.lock().fail_update = true;
        let healthy = solo.add_construct(Block::new(2)).ok().unwrap();
        let suspended = solo.add_construct(Block::new(3)).ok().unwrap();
        suspended.lock().suspended = true;
        let loading = solo.add_construct(Block::new(4)).ok().unwrap();
        loading.lock().initialized = false;
        let invalid = solo.add_construct(Block::new(5)).ok().unwrap();
        invalid.lock().valid = false;

        tick(&mut solo, 1);

        assert_eq!(healthy.lock().main_updates, 1);
        assert_eq!(healthy.lock().updates, 1);
        assert_eq!(suspended.lock().main_updates, 0);
        assert_eq!(loading.lock().main_updates, 0);
        assert_eq!(invalid.lock().main_updates, 0);
        assert_eq!(invalid.lock().updates, 0);
        // One sweep fault plus one main-thread fault
        assert_eq!(solo.stats().update_faults, 2);
    }

    #[test]
    fn test_sweep_limit_skips_when_full() {
        let (_hub, mut server, _client) = pair(Configuration {
            max_concurrent_sweeps: 2,
            ..quick_config()
        });
        let first = server.shared.sweeps.try_acquire().unwrap();
        let _second = server.shared.sweeps.try_acquire().unwrap();

        tick(&mut server, 1);
        let stats = server.stats();
        assert_eq!(stats.sweeps_launched, 0);
        assert_eq!(stats.sweeps_skipped, 1);

        drop(first);
        tick(&mut server, 2);
        let stats = server.stats();
        assert_eq!(stats.sweeps_launched, 1);
        assert_eq!(stats.sweeps_completed, 1);
        assert_eq!(stats.sweeps_skipped, 1);
        assert_eq!(server.active_sweeps(), 1);
    }

    #[test]
    fn test_closed_construct_skips_update_in_same_tick() {
        let (_hub, mut server, _client) = pair(quick_config());
        let doomed = server.add_construct(Block::new(2)).ok().unwrap();
        server.close_construct(2, false);

        tick(&mut server, 1);
        let block = doomed.lock();
        assert!(block.disposed);
        assert_eq!(block.main_updates, 0);
        assert_eq!(block.updates, 0);
    }

    #[test]
    fn test_gate_close_queue() {
        let (_hub, mut server, _client) = pair(quick_config());
        let portal = Arc::new(Portal {
            valid: AtomicBool::new(true),
        });
        server.close_gate(portal.clone());
        assert!(portal.is_valid());
        server.before_simulation().unwrap();
        assert!(!portal.is_valid());
    }

    #[test]
    fn test_paused_single_player_freezes_timelines() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let options = SessionOptions::new(Role::SinglePlayer).config(quick_config());
        let mut solo = session(&hub, &ctx, SERVER, options);
        solo.load().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        solo.play_animation(1, AnimationPlay::new(Spin { ticks: Arc::clone(&ticks) }, 0));

        tick(&mut solo, 10);
        tick(&mut solo, 10);
        tick(&mut solo, 11);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_networked_session_never_pauses() {
        let (_hub, _server, mut client) = pair(quick_config());
        let ticks = Arc::new(AtomicUsize::new(0));
        client.play_animation(1, AnimationPlay::new(Spin { ticks: Arc::clone(&ticks) }, 0));

        tick(&mut client, 10);
        tick(&mut client, 10);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_tick_counter_wraps() {
        let (_hub, mut server, _client) = pair(quick_config());
        server.set_tick(u64::MAX - 1);
        tick(&mut server, 1);
        assert_eq!(server.tick_count(), 0);
        tick(&mut server, 2);
        assert_eq!(server.tick_count(), 1);
    }

    #[test]
    fn test_log_flush_interval() {
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();
        let recorder = Arc::new(Recorder::default());
        let config = Configuration {
            log_flush_interval_ticks: 2,
            ..quick_config()
        };
        let mut server = session(
            &hub,
            &ctx,
            SERVER,
            SessionOptions::new(Role::DedicatedServer).config(config).hooks(recorder.clone()),
        );
        server.load().unwrap();
        for frame in 1..=5 {
            tick(&mut server, frame);
        }
        assert_eq!(recorder.flushes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unload_disposes_everything() {
        let (_hub, mut server, _client) = pair(quick_config());
        let entries: Vec<_> = (1..=3)
            .map(|id| server.add_construct(Block::new(id)).ok().unwrap())
            .collect();
        let ticks = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        server.play_animation(
            1,
            AnimationPlay::new(Spin { ticks }, 0)
                .on_complete(move |_| flag.store(true, Ordering::SeqCst)),
        );

        server.unload().unwrap();
        assert!(server.registry().is_empty());
        assert!(entries.iter().all(|e| e.lock().disposed));
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(server.stats().animations, 0);
    }

    #[test]
    fn test_save_writes_config_and_survives_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehost.json");
        let hub = LoopHub::new(SERVER);
        let ctx = ManualContext::shared();

        let mut server = session(
            &hub,
            &ctx,
            SERVER,
            SessionOptions::new(Role::DedicatedServer).config_path(&path),
        );
        server.load().unwrap();
        assert_eq!(*server.config(), Configuration::default());
        server.save().unwrap();
        assert!(Configuration::try_load(&path).is_ok());

        // Directory in place of the file: write fails, session carries on
        let mut broken = session(
            &hub,
            &ctx,
            NodeId(5),
            SessionOptions::new(Role::DedicatedServer).config_path(dir.path()),
        );
        broken.load().unwrap();
        assert!(broken.save().is_ok());
        assert_eq!(broken.state(), SessionState::Loading);
    }
}
