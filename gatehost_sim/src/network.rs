//! Simulated network transport with fault injection.

use async_trait::async_trait;
use gatehost_env::{ChannelFrame, EnvError, NetworkController, NetworkTransport, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

/// Endpoints currently attached to the simulated network, in join order.
pub type Directory = Arc<RwLock<Vec<NodeId>>>;

/// Simulated network interface for one session endpoint.
pub struct SimNetwork {
    /// This node's ID
    local_id: NodeId,

    /// The authority every unresolved send goes to
    server_id: NodeId,

    /// Sender to central router
    tx: mpsc::Sender<NetworkMessage>,

    /// Receiver for incoming frames (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::Receiver<(NodeId, ChannelFrame)>>,

    /// Shared peer list used to expand broadcasts
    directory: Directory,
}

/// Internal message to the network router.
#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub frame: ChannelFrame,
}

impl SimNetwork {
    /// Creates a new simulated network interface.
    pub fn new(
        local_id: NodeId,
        server_id: NodeId,
        tx: mpsc::Sender<NetworkMessage>,
        rx: mpsc::Receiver<(NodeId, ChannelFrame)>,
        directory: Directory,
    ) -> Self {
        Self {
            local_id,
            server_id,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            directory,
        }
    }

    fn queue(&self, to: NodeId, frame: ChannelFrame) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            to,
            frame,
        };
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnvError::network("router queue full"),
            mpsc::error::TrySendError::Closed(_) => EnvError::network("Channel closed"),
        })
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    fn send(&self, target: NodeId, frame: ChannelFrame) -> Result<(), EnvError> {
        let known = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&target);
        if !known {
            return Err(EnvError::unreachable(target));
        }
        self.queue(target, frame)
    }

    fn broadcast(&self, frame: ChannelFrame, except: Option<NodeId>) -> usize {
        let peers = self.directory.read().unwrap_or_else(PoisonError::into_inner).clone();
        peers
            .into_iter()
            .filter(|id| *id != self.local_id && Some(*id) != except)
            .filter(|id| self.queue(*id, frame.clone()).is_ok())
            .count()
    }

    async fn recv(&self) -> Option<(NodeId, ChannelFrame)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(NodeId, ChannelFrame)> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn server_id(&self) -> NodeId {
        self.server_id
    }
}

/// Network controller for fault injection.
///
/// Latency is counted in ticks since the harness is tick-driven.
pub struct SimNetworkController {
    /// Per-link latency in ticks
    link_latency: Arc<Mutex<HashMap<(NodeId, NodeId), u64>>>,

    /// Per-link frame loss rate (0.0 - 1.0)
    link_loss: Arc<Mutex<HashMap<(NodeId, NodeId), f64>>>,

    /// Loss rate for links without an explicit entry
    default_loss: Arc<Mutex<f64>>,

    /// Active partitions (nodes that cannot communicate)
    partitions: Arc<Mutex<Vec<(Vec<NodeId>, Vec<NodeId>)>>>,
}

impl SimNetworkController {
    /// Creates a new network controller.
    pub fn new() -> Self {
        Self {
            link_latency: Arc::new(Mutex::new(HashMap::new())),
            link_loss: Arc::new(Mutex::new(HashMap::new())),
            default_loss: Arc::new(Mutex::new(0.0)),
            partitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sets latency for a specific link.
    pub fn set_latency(&self, from: NodeId, to: NodeId, latency_ticks: u64) {
        let mut latencies = self.link_latency.lock().unwrap_or_else(PoisonError::into_inner);
        latencies.insert((from, to), latency_ticks);
    }

    /// Sets the loss rate of every link without its own setting.
    pub fn set_default_loss(&self, loss_rate: f64) {
        let mut default_loss = self.default_loss.lock().unwrap_or_else(PoisonError::into_inner);
        *default_loss = loss_rate.clamp(0.0, 1.0);
    }

    /// Drops every per-link loss setting and the default loss.
    pub fn clear_loss(&self) {
        self.link_loss.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.set_default_loss(0.0);
    }

    /// Checks if two nodes can communicate (not partitioned).
    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);

        !partitions.iter().any(|(group_a, group_b)| {
            (group_a.contains(&from) && group_b.contains(&to))
                || (group_b.contains(&from) && group_a.contains(&to))
        })
    }

    /// Number of partitions in force.
    pub fn partition_count(&self) -> usize {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Gets the latency for a link (default 0).
    pub fn get_latency(&self, from: NodeId, to: NodeId) -> u64 {
        let latencies = self.link_latency.lock().unwrap_or_else(PoisonError::into_inner);
        latencies.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Gets the loss rate for a link (falls back to the default loss).
    pub fn get_loss(&self, from: NodeId, to: NodeId) -> f64 {
        let losses = self.link_loss.lock().unwrap_or_else(PoisonError::into_inner);
        match losses.get(&(from, to)) {
            Some(rate) => *rate,
            None => *self.default_loss.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl NetworkController for SimNetworkController {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions.push((group_a.to_vec(), group_b.to_vec()));
    }

    fn heal_all(&self) {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64) {
        let mut losses = self.link_loss.lock().unwrap_or_else(PoisonError::into_inner);
        losses.insert((from, to), loss_rate.clamp(0.0, 1.0));
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new()
    }
}
