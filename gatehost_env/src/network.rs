//! Network transport abstraction for Gatehost endpoints.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{ChannelFrame, NodeId};

/// Abstraction for raw frame delivery between endpoints.
///
/// # Implementations
///
/// - **Production**: wraps the host engine's multiplayer messaging
/// - **Simulation**: channel-based router with configurable loss/partitions
///
/// # Frame Flow
///
/// ```text
/// Client A                   Network                    Server
///   |                           |                          |
///   |-- send(server, frame) --->|                          |
///   |                           |-- [loss / partition] --->|
///   |                           |                          |-- recv() -> frame
/// ```
///
/// Delivery is best-effort: no ordering, retries or encryption.
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Queues a frame for a single endpoint.
    ///
    /// # Returns
    /// * `Ok(())` - Frame queued for delivery
    /// * `Err(EnvError::NetworkError)` - Immediate failure (router gone)
    ///
    /// # Note
    /// Success does not guarantee delivery.
    fn send(&self, target: NodeId, frame: ChannelFrame) -> Result<(), EnvError>;

    /// Queues a frame for every other endpoint, optionally skipping one.
    ///
    /// # Returns
    /// Number of endpoints the frame was queued for.
    fn broadcast(&self, frame: ChannelFrame, except: Option<NodeId>) -> usize;

    /// Receives the next frame addressed to this endpoint.
    ///
    /// # Returns
    /// * `Some((sender, frame))` - A frame was received
    /// * `None` - The transport was closed (shutdown)
    async fn recv(&self) -> Option<(NodeId, ChannelFrame)>;

    /// Non-blocking receive used by lockstep drivers.
    fn try_recv(&self) -> Option<(NodeId, ChannelFrame)>;

    /// Returns this endpoint's ID.
    fn local_id(&self) -> NodeId;

    /// Returns the ID of the authoritative endpoint of the session.
    fn server_id(&self) -> NodeId;
}

/// Marker trait for network controllers in simulation.
///
/// Allows injecting faults like partitions and packet loss.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions.
    fn heal_all(&self);

    /// Sets frame loss probability for a link (0.0 - 1.0).
    fn set_link_loss(&self, from: NodeId, to: NodeId, loss_rate: f64);
}
