//! Background registry sweeps.
//!
//! A sweep is one complete pass over the registry, run off the tick thread.
//! [`SweepGate`] bounds how many run at once. Constructs are taken with
//! `try_lock`, so when sweeps overlap each construct is updated by at most
//! one of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{debug, error, info};

use crate::construct::Construct;
use crate::fault::isolate;
use crate::queues::{CloseRequest, DeferredQueues};
use crate::registry::Registry;

/// Counting limiter for concurrent sweeps.
#[derive(Debug)]
pub struct SweepGate {
    active: AtomicUsize,
    limit: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl SweepGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        })
    }

    /// Claims a slot if fewer than `limit` sweeps are active.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SweepPermit> {
        let limit = self.limit.load(Ordering::Acquire);
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()
            .map(|_| SweepPermit {
                gate: Arc::clone(self),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Takes effect for the next acquire; running sweeps are not affected.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Blocks until no sweep holds a permit.
    pub fn wait_idle(&self) {
        let guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _guard = self
            .idle
            .wait_while(guard, |_| self.active() > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the lock orders this wake-up after a waiter's check
            let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.idle.notify_all();
        }
    }
}

/// A running sweep's slot. Released on drop, including while unwinding.
#[derive(Debug)]
pub struct SweepPermit {
    gate: Arc<SweepGate>,
}

impl Drop for SweepPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub updated: usize,
    /// Held by another sweep or by the tick thread
    pub busy: usize,
    /// Reported invalid and left alone
    pub invalid: usize,
    pub removed: usize,
    pub faults: usize,
    /// Constructs that asked to be closed and were queued for it
    pub close_requests: usize,
}

/// Runs one pass over `registry`.
///
/// Closed constructs are removed and disposed. Constructs flagging
/// `mark_closed` are queued for a propagated close on the tick thread.
/// Invalid constructs are skipped. Everything else gets its threadable
/// update; faults are logged per construct and do not stop the pass.
pub fn sweep<C: Construct>(registry: &Registry<C>, queues: &DeferredQueues) -> SweepReport {
    let mut report = SweepReport::default();

    for entry in registry.entries() {
        report.visited += 1;
        let Some(mut construct) = entry.try_lock() else {
            report.busy += 1;
            continue;
        };

        if construct.closed() {
            drop(construct);
            if registry.remove_entry(&entry) {
                entry.lock().dispose();
                info!(construct = entry.id(), "removed closed construct");
                report.removed += 1;
            }
            continue;
        }

        if !construct.is_valid() {
            report.invalid += 1;
            continue;
        }

        if construct.mark_closed() {
            queues.close_construct(CloseRequest::local(entry.id()));
            report.close_requests += 1;
            continue;
        }

        match isolate(|| construct.update()) {
            Ok(()) => {
                entry.record_update();
                report.updated += 1;
            }
            Err(fault) => {
                error!(construct = entry.id(), %fault, "construct update failed");
                report.faults += 1;
            }
        }
    }

    debug!(
        visited = report.visited,
        updated = report.updated,
        busy = report.busy,
        invalid = report.invalid,
        removed = report.removed,
        faults = report.faults,
        "sweep finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Block;
    use std::panic;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_gate_bounds_concurrency() {
        let gate = SweepGate::new(2);
        let first = gate.try_acquire().unwrap();
        let _second = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.active(), 2);

        drop(first);
        assert_eq!(gate.active(), 1);
        let _third = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
    }

    #[test]
    fn test_permit_released_on_panic() {
        let gate = SweepGate::new(1);
        let worker = Arc::clone(&gate);
        let result = panic::catch_unwind(move || {
            let _permit = worker.try_acquire().unwrap();
            panic!("sweep blew up");
        });
        assert!(result.is_err());
        assert_eq!(gate.active(), 0);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_set_limit() {
        let gate = SweepGate::new(0);
        assert!(gate.try_acquire().is_none());
        gate.set_limit(1);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_wait_idle_wakes_on_last_release() {
        let gate = SweepGate::new(2);
        gate.wait_idle();

        let permits = vec![gate.try_acquire().unwrap(), gate.try_acquire().unwrap()];
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(permits);
        });
        gate.wait_idle();
        assert_eq!(gate.active(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_sweep_skips_invalid_construct() {
        let registry = Registry::new();
        let queues = DeferredQueues::new();
        let entry = registry.insert(Block::new(6)).ok().unwrap();
        {
            let mut block = entry.lock();
            block.valid = false;
            block.wants_close = true;
        }

        let report = sweep(&registry, &queues);
        assert_eq!(report.invalid, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(entry.update_count(), 0);
        assert_eq!(queues.pending(), (0, 0));
        assert!(registry.contains(6));
    }

    #[test]
    fn test_sweep_updates_removes_and_isolates() {
        let registry = Registry::new();
        let queues = DeferredQueues::new();
        let drops = Arc::new(AtomicUsize::new(0));

        let healthy = registry.insert(Block::new(1)).ok().unwrap();
        let failing = registry.insert(Block::new(2)).ok().unwrap();
        failing.lock().fail_update = true;
        let panicking = registry.insert(Block::new(3)).ok().unwrap();
        panicking.lock().panic_update = true;
        let closed = registry.insert(Block::new(4).counting_drops(&drops)).ok().unwrap();
        closed.lock().closed = true;
        drop(closed);

        let report = sweep(&registry, &queues);
        assert_eq!(report.visited, 4);
        assert_eq!(report.updated, 1);
        assert_eq!(report.faults, 2);
        assert_eq!(report.removed, 1);

        assert_eq!(healthy.update_count(), 1);
        assert_eq!(failing.update_count(), 0);
        assert_eq!(registry.ids(), vec![1, 2, 3]);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_skips_held_construct() {
        let registry = Registry::new();
        let queues = DeferredQueues::new();
        let entry = registry.insert(Block::new(1)).ok().unwrap();

        let guard = entry.lock();
        let report = sweep(&registry, &queues);
        drop(guard);

        assert_eq!(report.busy, 1);
        assert_eq!(entry.update_count(), 0);
    }

    #[test]
    fn test_sweep_queues_marked_constructs() {
        let registry = Registry::new();
        let queues = DeferredQueues::new();
        let entry = registry.insert(Block::new(8)).ok().unwrap();
        entry.lock().wants_close = true;

        let report = sweep(&registry, &queues);
        assert_eq!(report.close_requests, 1);
        let requests = queues.drain_constructs();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, 8);
        assert!(requests[0].propagate);
    }
}
