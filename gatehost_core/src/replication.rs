//! Replication conversations between the authority and its replicas.
//!
//! | Kind             | Replica → authority (phase 1) | Authority → replica            |
//! |------------------|-------------------------------|--------------------------------|
//! | `SyncConstructs` | empty request                 | `FullSync` reply or push       |
//! | `SyncConstruct`  | `ConstructRef`                | `ConstructSync`                |
//! | `CommLinked`     | `ConstructRef`                | `LinkResponse`                 |
//! | `BeaconLinked`   | `ConstructRef`                | `LinkResponse`                 |
//! | `FetchConfig`    | empty request                 | `Configuration`                |
//! | `UpdateConfig`   |                               | `Configuration` broadcast      |
//! | `CloseConstruct` |                               | `ConstructRef` broadcast       |
//!
//! Handlers hold a `Weak` reference to the session, so a dropped session
//! turns them into `HandlerError::SessionGone` instead of keeping it alive.
//! Registry removals requested by the protocol go through the deferred
//! close queue and are applied on the tick thread.

use gatehost_env::{HostContext, NetworkTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, Weak};
use tracing::{debug, error, info, warn};

use crate::callbacks::{handler, PacketHandler};
use crate::config::Configuration;
use crate::construct::{Construct, ConstructId, ConstructSnapshot, LinkKind};
use crate::error::{HandlerError, LifecycleError};
use crate::packet::{Packet, PacketKind};
use crate::queues::{CloseRequest, DeferredQueues};
use crate::registry::{Registry, UpsertOutcome};
use crate::session::Shared;

/// Snapshot set for a full sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSync<S> {
    pub snapshots: Vec<S>,
}

/// A construct id on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstructRef {
    pub id: ConstructId,
}

/// Partial sync answer. `None` means the authority no longer has `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructSync<S> {
    pub id: ConstructId,
    pub snapshot: Option<S>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResponse {
    pub id: ConstructId,
    pub linked: Vec<ConstructId>,
}

/// What a replica did with a full snapshot set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub persisted: usize,
    pub refreshed: usize,
    pub replaced: usize,
    pub rejected: usize,
    /// Local ids missing from the set, queued for close
    pub orphaned: usize,
}

/// Applies a full snapshot set to a replica registry.
///
/// Every snapshot is upserted. Local ids absent from the set are queued for
/// an overriding, non-propagated close that a later snapshot of the same id
/// cancels.
pub fn reconcile<C: Construct>(
    registry: &Registry<C>,
    queues: &DeferredQueues,
    snapshots: &[C::Snapshot],
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let mut seen = HashSet::with_capacity(snapshots.len());

    for snapshot in snapshots {
        seen.insert(snapshot.construct_id());
        match registry.upsert(snapshot) {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Persisted => report.persisted += 1,
            UpsertOutcome::Refreshed => report.refreshed += 1,
            UpsertOutcome::Replaced => report.replaced += 1,
            UpsertOutcome::Rejected => {
                warn!(construct = snapshot.construct_id(), "snapshot rejected");
                report.rejected += 1;
            }
        }
    }

    for entry in registry.entries() {
        if !seen.contains(&entry.id()) {
            queues.close_construct(
                CloseRequest::from_authority(entry.id()).unless_synced_since(entry.sync_stamp()),
            );
            report.orphaned += 1;
        }
    }
    report
}

/// Registers the handlers for the session's role.
pub(crate) fn install<C, Ctx, Net>(shared: &Arc<Shared<C, Ctx, Net>>)
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let weak = Arc::downgrade(shared);
    let transport = &shared.transport;

    if shared.role.is_server() {
        transport.on(PacketKind::SyncConstructs, bind(&weak, serve_full_sync));
        transport.on(PacketKind::SyncConstruct, bind(&weak, serve_construct));
        transport.on(
            PacketKind::CommLinked,
            bind(&weak, |s, p| serve_links(s, p, LinkKind::Comm)),
        );
        transport.on(
            PacketKind::BeaconLinked,
            bind(&weak, |s, p| serve_links(s, p, LinkKind::Beacon)),
        );
        transport.on(PacketKind::FetchConfig, bind(&weak, serve_config));
    } else {
        transport.on(PacketKind::SyncConstructs, bind(&weak, apply_full_sync));
        transport.on(PacketKind::SyncConstruct, bind(&weak, apply_construct));
        transport.on(PacketKind::CloseConstruct, bind(&weak, apply_close));
        transport.on(
            PacketKind::CommLinked,
            bind(&weak, |s, p| apply_links(s, p, LinkKind::Comm)),
        );
        transport.on(
            PacketKind::BeaconLinked,
            bind(&weak, |s, p| apply_links(s, p, LinkKind::Beacon)),
        );
        transport.on(PacketKind::FetchConfig, bind(&weak, apply_config));
        transport.on(PacketKind::UpdateConfig, bind(&weak, apply_config));
    }
}

fn bind<C, Ctx, Net, F>(weak: &Weak<Shared<C, Ctx, Net>>, f: F) -> PacketHandler
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
    F: Fn(&Shared<C, Ctx, Net>, &Packet) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    let weak = weak.clone();
    handler(move |packet| {
        let shared = weak.upgrade().ok_or(HandlerError::SessionGone)?;
        f(&shared, packet)
    })
}

fn serve_full_sync<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    if !packet.is_request() || packet.has_payload() {
        return Ok(());
    }
    let snapshots = shared.registry.replicable_snapshots(true);
    let count = snapshots.len();
    let mut reply = packet.reply(Some(&FullSync { snapshots }))?;
    shared.transport.send(&mut reply)?;
    debug!(to = %packet.sender(), constructs = count, "served full sync");
    Ok(())
}

fn apply_full_sync<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let Some(sync) = packet.payload::<FullSync<C::Snapshot>>()? else {
        return Ok(());
    };
    let report = reconcile(&shared.registry, &shared.queues, &sync.snapshots);
    debug!(
        inserted = report.inserted,
        persisted = report.persisted,
        refreshed = report.refreshed,
        replaced = report.replaced,
        rejected = report.rejected,
        orphaned = report.orphaned,
        "full sync applied"
    );
    Ok(())
}

fn serve_construct<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    if !packet.is_request() {
        return Ok(());
    }
    let ConstructRef { id } = packet
        .payload::<ConstructRef>()?
        .ok_or(HandlerError::MissingPayload("SyncConstruct"))?;
    let snapshot = shared.registry.get(id).and_then(|entry| {
        let construct = entry.lock();
        (!construct.closed()).then(|| construct.to_snapshot(true))
    });
    let mut reply = packet.reply(Some(&ConstructSync { id, snapshot }))?;
    shared.transport.send(&mut reply)?;
    Ok(())
}

fn apply_construct<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let sync = packet
        .payload::<ConstructSync<C::Snapshot>>()?
        .ok_or(HandlerError::MissingPayload("SyncConstruct"))?;

    match sync.snapshot {
        Some(snapshot) if snapshot.construct_id() != sync.id => Err(HandlerError::Other(format!(
            "snapshot for {} answered request for {}",
            snapshot.construct_id(),
            sync.id
        ))),
        Some(snapshot) => {
            let outcome = shared.registry.upsert(&snapshot);
            debug!(construct = sync.id, ?outcome, "partial sync applied");
            Ok(())
        }
        None => {
            if let Some(entry) = shared.registry.get(sync.id) {
                shared.queues.close_construct(
                    CloseRequest::from_authority(sync.id).unless_synced_since(entry.sync_stamp()),
                );
            }
            Ok(())
        }
    }
}

fn apply_close<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let ConstructRef { id } = packet
        .payload::<ConstructRef>()?
        .ok_or(HandlerError::MissingPayload("CloseConstruct"))?;
    shared.queues.close_construct(CloseRequest::from_authority(id));
    Ok(())
}

fn serve_links<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
    kind: LinkKind,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    if !packet.is_request() {
        return Ok(());
    }
    let ConstructRef { id } = packet
        .payload::<ConstructRef>()?
        .ok_or(HandlerError::MissingPayload("link query"))?;
    let mut linked = shared
        .registry
        .get(id)
        .map(|entry| entry.lock().linked(kind))
        .unwrap_or_default();
    linked.truncate(shared.config().max_link_depth);

    let mut reply = packet.reply(Some(&LinkResponse { id, linked }))?;
    shared.transport.send(&mut reply)?;
    Ok(())
}

fn apply_links<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
    kind: LinkKind,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let response = packet
        .payload::<LinkResponse>()?
        .ok_or(HandlerError::MissingPayload("link response"))?;
    shared
        .links
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert((kind, response.id), response.linked);
    Ok(())
}

fn serve_config<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    if !packet.is_request() || packet.has_payload() {
        return Ok(());
    }
    let config = shared.config();
    let mut reply = packet.reply(Some(config.as_ref()))?;
    shared.transport.send(&mut reply)?;
    Ok(())
}

fn apply_config<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    packet: &Packet,
) -> Result<(), HandlerError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let Some(config) = packet.payload::<Configuration>()? else {
        return Ok(());
    };
    config.validate()?;
    info!(from = %packet.sender(), "configuration received");
    shared.apply_config(config);
    Ok(())
}

/// Sends a phase-1 request to the authority.
pub(crate) fn request<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
    kind: PacketKind,
    subject: Option<ConstructId>,
) -> Result<usize, LifecycleError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let mut packet = Packet::new(kind);
    if let Some(id) = subject {
        if let Err(e) = packet.set_payload(Some(&ConstructRef { id })) {
            error!(kind = ?kind, construct = id, error = %e, "failed to encode request");
            return Ok(0);
        }
    }
    shared.transport.send(&mut packet)
}

/// Broadcasts `payload` to every replica.
pub(crate) fn broadcast<C, Ctx, Net, T>(
    shared: &Shared<C, Ctx, Net>,
    kind: PacketKind,
    payload: &T,
) -> Result<usize, LifecycleError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
    T: Serialize,
{
    let mut packet = match Packet::new(kind).broadcast().with_payload(payload) {
        Ok(packet) => packet,
        Err(e) => {
            error!(kind = ?kind, error = %e, "failed to encode broadcast");
            return Ok(0);
        }
    };
    shared.transport.send(&mut packet)
}

/// Pushes the full replicable snapshot set to every replica.
pub(crate) fn push_full_sync<C, Ctx, Net>(
    shared: &Shared<C, Ctx, Net>,
) -> Result<usize, LifecycleError>
where
    C: Construct,
    Ctx: HostContext,
    Net: NetworkTransport,
{
    let snapshots = shared.registry.replicable_snapshots(true);
    let count = snapshots.len();
    let queued = broadcast(shared, PacketKind::SyncConstructs, &FullSync { snapshots })?;
    debug!(constructs = count, replicas = queued, "pushed full sync");
    Ok(queued)
}
