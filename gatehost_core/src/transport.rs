//! Routing layer on top of the raw frame transport.
//!
//! ```text
//!   Client ──send──► Server ──dispatch──► local handlers
//!                      │
//!                      └──relay (broadcast / unicast)──► other clients
//! ```
//!
//! Clients can only talk to the server. The server dispatches what is
//! addressed to it and relays everything else that is not addressed to it
//! alone. Server-role receivers also drop packets whose epoch is too far
//! from their own clock, which bounds replay and clock-skew exposure since
//! the raw transport provides neither ordering nor deduplication.

use gatehost_env::{ChannelFrame, HostContext, NetworkTransport, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use crate::callbacks::{CallbackRegistry, PacketHandler};
use crate::error::LifecycleError;
use crate::fault::isolate;
use crate::packet::{epoch_of, Packet, PacketKind, EPOCH_TICKS_PER_MS};

/// The part an endpoint plays in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Authority without a local player
    DedicatedServer,
    /// Authority hosting a local player
    ListenServer,
    /// Authority without any peer
    SinglePlayer,
    /// Replica connected to a server
    Client,
}

impl Role {
    /// Server-like roles hold the canonical registry.
    pub fn is_server(&self) -> bool {
        !matches!(self, Role::Client)
    }

    pub fn has_peers(&self) -> bool {
        !matches!(self, Role::SinglePlayer)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::DedicatedServer => "dedicated_server",
            Role::ListenServer => "listen_server",
            Role::SinglePlayer => "single_player",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Why an incoming frame did not reach any handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    WrongChannel,
    Unregistered,
    Undecodable,
    OwnPacket,
    NotAddressed,
    WrongNamespace,
    Stale,
}

/// Result of processing one incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Passed validation. `handlers` were invoked, `relayed` copies queued.
    Accepted { handlers: usize, relayed: usize },
    Dropped(DropReason),
}

/// Counters kept by a transport, readable from any thread.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    stale: AtomicU64,
    relayed: AtomicU64,
    handler_faults: AtomicU64,
    send_failures: AtomicU64,
}

/// Plain copy of the transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub stale: u64,
    pub relayed: u64,
    pub handler_faults: u64,
    pub send_failures: u64,
}

/// Request/response routing over an unreliable frame transport.
pub struct Transport<Ctx, Net>
where
    Ctx: HostContext,
    Net: NetworkTransport,
{
    ctx: Arc<Ctx>,
    net: Arc<Net>,
    role: Role,
    channel: u16,
    namespace: String,
    stale_after_ticks: AtomicU64,
    registered: AtomicBool,
    callbacks: CallbackRegistry,
    counters: Counters,
}

impl<Ctx, Net> Transport<Ctx, Net>
where
    Ctx: HostContext,
    Net: NetworkTransport,
{
    pub fn new(
        ctx: Arc<Ctx>,
        net: Arc<Net>,
        role: Role,
        channel: u16,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            net,
            role,
            channel,
            namespace: namespace.into(),
            stale_after_ticks: AtomicU64::new(10_000 * EPOCH_TICKS_PER_MS),
            registered: AtomicBool::new(false),
            callbacks: CallbackRegistry::new(),
            counters: Counters::default(),
        }
    }

    pub fn register(&self) -> Result<(), LifecycleError> {
        if !self.role.has_peers() {
            return Err(LifecycleError::NoPeers(self.role.name()));
        }
        self.registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LifecycleError::AlreadyRegistered)?;
        debug!(
            role = %self.role,
            channel = self.channel,
            namespace = %self.namespace,
            "transport registered"
        );
        Ok(())
    }

    /// Unregisters and forgets every handler.
    pub fn unregister(&self) -> Result<(), LifecycleError> {
        self.registered
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LifecycleError::NotRegistered)?;
        self.callbacks.clear();
        debug!(role = %self.role, "transport unregistered");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Registers `handler` for `kind`. No-op while unregistered or if the
    /// same handler is already registered for that kind.
    pub fn on(&self, kind: PacketKind, handler: PacketHandler) -> bool {
        self.is_registered() && self.callbacks.add(kind, handler)
    }

    pub fn off(&self, kind: PacketKind, handler: &PacketHandler) -> bool {
        self.is_registered() && self.callbacks.remove(kind, handler)
    }

    pub fn set_stale_threshold(&self, threshold: Duration) {
        let ticks = u64::try_from(threshold.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(EPOCH_TICKS_PER_MS);
        self.stale_after_ticks.store(ticks, Ordering::Relaxed);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_id(&self) -> NodeId {
        self.net.local_id()
    }

    pub fn server_id(&self) -> NodeId {
        self.net.server_id()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current time in packet epoch ticks.
    pub fn epoch_now(&self) -> u64 {
        epoch_of(self.ctx.system_time())
    }

    /// Stamps, addresses and transmits `packet`.
    ///
    /// Returns the number of endpoints the frame was queued for. Encoding
    /// and network failures are logged and yield `Ok(0)`; only lifecycle
    /// violations are errors.
    pub fn send(&self, packet: &mut Packet) -> Result<usize, LifecycleError> {
        self.send_routed(packet, None)
    }

    fn send_routed(
        &self,
        packet: &mut Packet,
        except: Option<NodeId>,
    ) -> Result<usize, LifecycleError> {
        if !self.is_registered() {
            return Err(LifecycleError::NotRegistered);
        }

        let me = self.net.local_id();
        let server = self.net.server_id();
        if packet.broadcast || packet.target.is_unset() {
            packet.target = server;
        }
        packet.stamp(me, &self.namespace, self.epoch_now());

        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(kind = ?packet.kind, error = %e, "failed to encode packet");
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                return Ok(0);
            }
        };
        let frame = ChannelFrame::new(self.channel, bytes);

        let queued = if self.role.is_server() && packet.broadcast {
            self.net.broadcast(frame, except)
        } else {
            // Clients always go through the server, whatever the target.
            let destination = if self.role.is_server() { packet.target } else { server };
            match self.net.send(destination, frame) {
                Ok(()) => 1,
                Err(e) => {
                    warn!(kind = ?packet.kind, target = %destination, error = %e, "send failed");
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    0
                }
            }
        };

        self.counters.sent.fetch_add(queued as u64, Ordering::Relaxed);
        trace!(
            kind = ?packet.kind,
            target = %packet.target,
            broadcast = packet.broadcast,
            phase = packet.phase(),
            queued,
            "packet sent"
        );
        Ok(queued)
    }

    /// Validates an incoming frame, dispatches it and, on a server, relays it.
    pub fn on_packet_received(&self, from: NodeId, frame: ChannelFrame) -> Received {
        let outcome = self.receive(from, frame);
        match outcome {
            Received::Accepted { .. } => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
            }
            Received::Dropped(DropReason::Stale) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
            }
            Received::Dropped(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    fn receive(&self, from: NodeId, frame: ChannelFrame) -> Received {
        if frame.channel != self.channel {
            return Received::Dropped(DropReason::WrongChannel);
        }
        if !self.is_registered() {
            return Received::Dropped(DropReason::Unregistered);
        }

        let packet = match Packet::decode(&frame.payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    from = %from,
                    bytes = frame.size(),
                    error = %e,
                    "dropping undecodable packet"
                );
                return Received::Dropped(DropReason::Undecodable);
            }
        };

        let me = self.net.local_id();
        if packet.sender() == me {
            return Received::Dropped(DropReason::OwnPacket);
        }
        let addressed = packet.broadcast || packet.target == me;
        if !addressed && !self.role.is_server() {
            return Received::Dropped(DropReason::NotAddressed);
        }
        if packet.namespace() != self.namespace {
            return Received::Dropped(DropReason::WrongNamespace);
        }
        if self.role.is_server()
            && packet.age(self.epoch_now()) > self.stale_after_ticks.load(Ordering::Relaxed)
        {
            // Expected under jitter; not logged.
            return Received::Dropped(DropReason::Stale);
        }

        let handlers = if addressed { self.dispatch(&packet) } else { 0 };

        let mut relayed = 0;
        if self.role.is_server() && (packet.broadcast || packet.target != me) {
            let mut copy = packet.forward(packet.target, packet.broadcast);
            let origin = packet.sender();
            match self.send_routed(&mut copy, Some(origin)) {
                Ok(n) => relayed = n,
                // Unregistered by a handler mid-dispatch; nothing to relay through.
                Err(_) => relayed = 0,
            }
            self.counters.relayed.fetch_add(relayed as u64, Ordering::Relaxed);
        }

        Received::Accepted { handlers, relayed }
    }

    fn dispatch(&self, packet: &Packet) -> usize {
        let handlers = self.callbacks.snapshot(packet.kind);
        for (index, handler) in handlers.iter().enumerate() {
            if let Err(fault) = isolate(|| handler(packet)) {
                self.counters.handler_faults.fetch_add(1, Ordering::Relaxed);
                error!(
                    kind = ?packet.kind,
                    sender = %packet.sender(),
                    target = %packet.target,
                    broadcast = packet.broadcast,
                    phase = packet.phase(),
                    handler = index,
                    %fault,
                    "packet handler failed"
                );
            }
        }
        handlers.len()
    }

    /// Drains every frame currently queued on the raw transport.
    pub fn pump(&self) -> usize {
        let mut processed = 0;
        while let Some((from, frame)) = self.net.try_recv() {
            self.on_packet_received(from, frame);
            processed += 1;
        }
        processed
    }

    /// Receives until the raw transport closes.
    pub async fn run_receive_loop(self: Arc<Self>) {
        while let Some((from, frame)) = self.net.recv().await {
            self.on_packet_received(from, frame);
        }
        debug!(role = %self.role, "receive loop ended");
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            sent: c.sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            relayed: c.relayed.load(Ordering::Relaxed),
            handler_faults: c.handler_faults.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
        }
    }
}
