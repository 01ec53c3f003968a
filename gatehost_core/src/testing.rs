//! Shared fixtures for unit tests: an in-memory hub, a manual clock and a
//! small construct type.

use async_trait::async_trait;
use gatehost_env::{ChannelFrame, EnvError, HostContext, NetworkTransport, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::construct::{Construct, ConstructId, ConstructSnapshot, LinkKind};
use crate::config::Configuration;
use crate::error::ConstructError;

pub(crate) struct LoopHub {
    server: NodeId,
    inboxes: Mutex<HashMap<NodeId, VecDeque<(NodeId, ChannelFrame)>>>,
}

impl LoopHub {
    pub(crate) fn new(server: NodeId) -> Arc<Self> {
        Arc::new(Self {
            server,
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn endpoint(self: &Arc<Self>, id: NodeId) -> Arc<LoopNet> {
        self.inboxes.lock().unwrap().entry(id).or_default();
        Arc::new(LoopNet {
            id,
            hub: Arc::clone(self),
        })
    }

    pub(crate) fn pending(&self, id: NodeId) -> usize {
        self.inboxes.lock().unwrap().get(&id).map_or(0, VecDeque::len)
    }

    /// Injects a raw frame as if `from` had sent it to `to`.
    pub(crate) fn inject(&self, from: NodeId, to: NodeId, frame: ChannelFrame) {
        if let Some(inbox) = self.inboxes.lock().unwrap().get_mut(&to) {
            inbox.push_back((from, frame));
        }
    }
}

pub(crate) struct LoopNet {
    id: NodeId,
    hub: Arc<LoopHub>,
}

#[async_trait]
impl NetworkTransport for LoopNet {
    fn send(&self, target: NodeId, frame: ChannelFrame) -> Result<(), EnvError> {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        let inbox = inboxes.get_mut(&target).ok_or_else(|| EnvError::unreachable(target))?;
        inbox.push_back((self.id, frame));
        Ok(())
    }

    fn broadcast(&self, frame: ChannelFrame, except: Option<NodeId>) -> usize {
        let mut inboxes = self.hub.inboxes.lock().unwrap();
        let mut count = 0;
        for (id, inbox) in inboxes.iter_mut() {
            if *id == self.id || Some(*id) == except {
                continue;
            }
            inbox.push_back((self.id, frame.clone()));
            count += 1;
        }
        count
    }

    async fn recv(&self) -> Option<(NodeId, ChannelFrame)> {
        self.try_recv()
    }

    fn try_recv(&self) -> Option<(NodeId, ChannelFrame)> {
        self.hub.inboxes.lock().unwrap().get_mut(&self.id)?.pop_front()
    }

    fn local_id(&self) -> NodeId {
        self.id
    }

    fn server_id(&self) -> NodeId {
        self.hub.server
    }
}

/// Hub whose endpoints block in `recv` until a frame arrives, for tests that
/// run the receive loop on a real runtime.
pub(crate) struct ChannelHub {
    server: NodeId,
    senders: Mutex<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, ChannelFrame)>>>,
}

impl ChannelHub {
    pub(crate) fn new(server: NodeId) -> Arc<Self> {
        Arc::new(Self {
            server,
            senders: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn endpoint(self: &Arc<Self>, id: NodeId) -> Arc<ChannelNet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(id, tx);
        Arc::new(ChannelNet {
            id,
            hub: Arc::clone(self),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }
}

pub(crate) struct ChannelNet {
    id: NodeId,
    hub: Arc<ChannelHub>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(NodeId, ChannelFrame)>>,
}

#[async_trait]
impl NetworkTransport for ChannelNet {
    fn send(&self, target: NodeId, frame: ChannelFrame) -> Result<(), EnvError> {
        let senders = self.hub.senders.lock().unwrap();
        let tx = senders.get(&target).ok_or_else(|| EnvError::unreachable(target))?;
        tx.send((self.id, frame)).map_err(|_| EnvError::unreachable(target))
    }

    fn broadcast(&self, frame: ChannelFrame, except: Option<NodeId>) -> usize {
        let senders = self.hub.senders.lock().unwrap();
        senders
            .iter()
            .filter(|(id, _)| **id != self.id && Some(**id) != except)
            .filter(|(_, tx)| tx.send((self.id, frame.clone())).is_ok())
            .count()
    }

    async fn recv(&self) -> Option<(NodeId, ChannelFrame)> {
        self.inbox.lock().await.recv().await
    }

    fn try_recv(&self) -> Option<(NodeId, ChannelFrame)> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }

    fn local_id(&self) -> NodeId {
        self.id
    }

    fn server_id(&self) -> NodeId {
        self.hub.server
    }
}

pub(crate) struct ManualContext {
    now: Mutex<Duration>,
}

impl ManualContext {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Duration::ZERO),
        })
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl HostContext for ManualContext {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn spawn_blocking<F>(&self, _name: &str, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        work();
    }

    fn seed(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct BlockSnapshot {
    pub id: ConstructId,
    pub mass: u32,
    pub links: Vec<ConstructId>,
}

impl ConstructSnapshot for BlockSnapshot {
    fn construct_id(&self) -> ConstructId {
        self.id
    }
}

/// Minimal construct with observable call counters.
#[derive(Debug)]
pub(crate) struct Block {
    pub id: ConstructId,
    pub mass: u32,
    pub links: Vec<ConstructId>,
    pub suspended: bool,
    pub initialized: bool,
    pub valid: bool,
    pub closed: bool,
    pub disposed: bool,
    pub fail_update: bool,
    pub panic_update: bool,
    pub wants_close: bool,
    pub updates: u32,
    pub main_updates: u32,
    pub persisted: u32,
    pub refreshed: u32,
    pub reloads: u32,
    pub tag: &'static str,
    pub drops: Option<Arc<AtomicUsize>>,
}

impl Block {
    pub(crate) fn new(id: ConstructId) -> Self {
        Self {
            id,
            mass: 1,
            links: Vec::new(),
            suspended: false,
            initialized: true,
            valid: true,
            closed: false,
            disposed: false,
            fail_update: false,
            panic_update: false,
            wants_close: false,
            updates: 0,
            main_updates: 0,
            persisted: 0,
            refreshed: 0,
            reloads: 0,
            tag: "local",
            drops: None,
        }
    }

    pub(crate) fn counting_drops(mut self, drops: &Arc<AtomicUsize>) -> Self {
        self.drops = Some(Arc::clone(drops));
        self
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Construct for Block {
    type Snapshot = BlockSnapshot;

    fn id(&self) -> ConstructId {
        self.id
    }

    fn update(&mut self) -> Result<(), ConstructError> {
        if self.panic_update {
            panic!("block {} exploded", self.id);
        }
        if self.fail_update {
            return Err(ConstructError::new(self.id, "jammed"));
        }
        self.updates += 1;
        Ok(())
    }

    fn update_non_threadable(&mut self) -> Result<(), ConstructError> {
        if self.fail_update {
            return Err(ConstructError::new(self.id, "jammed"));
        }
        self.main_updates += 1;
        Ok(())
    }

    fn close(&mut self, _override_replica: bool) {
        self.closed = true;
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.closed = true;
    }

    fn to_snapshot(&self, _full: bool) -> BlockSnapshot {
        BlockSnapshot {
            id: self.id,
            mass: self.mass,
            links: self.links.clone(),
        }
    }

    fn from_snapshot(snapshot: &BlockSnapshot) -> Option<Self> {
        let mut block = Block::new(snapshot.id);
        block.mass = snapshot.mass;
        block.links = snapshot.links.clone();
        block.tag = "remote";
        Some(block)
    }

    fn apply_snapshot(&mut self, snapshot: &BlockSnapshot) -> bool {
        self.mass = snapshot.mass;
        self.links = snapshot.links.clone();
        self.refreshed += 1;
        true
    }

    fn persist(&mut self, snapshot: &BlockSnapshot) -> bool {
        self.mass = snapshot.mass;
        self.suspended = false;
        self.persisted += 1;
        true
    }

    fn is_valid(&self) -> bool {
        self.valid && !self.closed
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn fully_initialized(&self) -> bool {
        self.initialized
    }

    fn mark_closed(&self) -> bool {
        self.wants_close
    }

    fn closed(&self) -> bool {
        self.closed
    }

    fn linked(&self, _kind: LinkKind) -> Vec<ConstructId> {
        self.links.clone()
    }

    fn reload_config(&mut self, _config: &Configuration) {
        self.reloads += 1;
    }
}
