//! Construct registry.
//!
//! Shared by the tick thread, sweep workers and network callbacks. The map
//! itself sits behind an `RwLock`; every construct sits behind its own
//! mutex inside a [`ConstructEntry`]. Lock order is always map first, entry
//! second. Nothing holds an entry lock while touching the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};

use crate::construct::{Construct, ConstructId, ConstructSnapshot};

/// One registered construct plus the bookkeeping the core owns.
pub struct ConstructEntry<C> {
    id: ConstructId,
    construct: Mutex<C>,
    updates: AtomicU64,
    synced: AtomicU64,
}

impl<C: Construct> ConstructEntry<C> {
    fn new(construct: C, stamp: u64) -> Self {
        Self {
            id: construct.id(),
            construct: Mutex::new(construct),
            updates: AtomicU64::new(0),
            synced: AtomicU64::new(stamp),
        }
    }

    pub fn id(&self) -> ConstructId {
        self.id
    }

    /// Exclusive access to the construct. A panic inside a previous holder
    /// was already isolated and logged, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, C> {
        self.construct.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Like [`lock`](Self::lock) but gives up if someone else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, C>> {
        match self.construct.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Number of completed background updates.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::AcqRel);
    }

    /// Registry-unique stamp of the last insert or snapshot applied here.
    pub fn sync_stamp(&self) -> u64 {
        self.synced.load(Ordering::Acquire)
    }
}

/// What [`Registry::upsert`] did with an incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No entry existed; a new replica was created.
    Inserted,
    /// A suspended entry was re-hydrated in place.
    Persisted,
    /// A live entry was refreshed in place and kept its identity.
    Refreshed,
    /// A closed entry was replaced by a new replica.
    Replaced,
    /// The snapshot could not be applied.
    Rejected,
}

pub struct Registry<C> {
    entries: RwLock<HashMap<ConstructId, Arc<ConstructEntry<C>>>>,
    stamps: AtomicU64,
}

impl<C: Construct> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Construct> Registry<C> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stamps: AtomicU64::new(0),
        }
    }

    fn next_stamp(&self) -> u64 {
        self.stamps.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn contains(&self, id: ConstructId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn get(&self, id: ConstructId) -> Option<Arc<ConstructEntry<C>>> {
        self.read().get(&id).cloned()
    }

    /// Sorted ids of every entry.
    pub fn ids(&self) -> Vec<ConstructId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Point-in-time copy of the entry list, ordered by id.
    pub fn entries(&self) -> Vec<Arc<ConstructEntry<C>>> {
        let mut entries: Vec<_> = self.read().values().cloned().collect();
        entries.sort_unstable_by_key(|e| e.id());
        entries
    }

    /// Registers a construct seen for the first time.
    ///
    /// An existing live entry under the same id always wins: the incoming
    /// construct is handed back untouched. A closed entry is replaced.
    pub fn insert(&self, construct: C) -> Result<Arc<ConstructEntry<C>>, C> {
        let id = construct.id();
        let mut map = self.write();
        if let Some(existing) = map.get(&id) {
            if !existing.lock().closed() {
                return Err(construct);
            }
        }
        let entry = Arc::new(ConstructEntry::new(construct, self.next_stamp()));
        map.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Applies a snapshot received from the authority.
    pub fn upsert(&self, snapshot: &C::Snapshot) -> UpsertOutcome {
        let id = snapshot.construct_id();
        let mut map = self.write();

        if let Some(existing) = map.get(&id) {
            let mut construct = existing.lock();
            let outcome = if construct.is_suspended() {
                Some(if construct.persist(snapshot) {
                    UpsertOutcome::Persisted
                } else {
                    UpsertOutcome::Rejected
                })
            } else if !construct.closed() {
                Some(if construct.apply_snapshot(snapshot) {
                    UpsertOutcome::Refreshed
                } else {
                    UpsertOutcome::Rejected
                })
            } else {
                None
            };
            if let Some(outcome) = outcome {
                if outcome != UpsertOutcome::Rejected {
                    existing.synced.store(self.next_stamp(), Ordering::Release);
                }
                return outcome;
            }
        }

        let replacing = map.contains_key(&id);
        match C::from_snapshot(snapshot) {
            Some(construct) => {
                map.insert(id, Arc::new(ConstructEntry::new(construct, self.next_stamp())));
                if replacing {
                    UpsertOutcome::Replaced
                } else {
                    UpsertOutcome::Inserted
                }
            }
            None => UpsertOutcome::Rejected,
        }
    }

    pub fn remove(&self, id: ConstructId) -> Option<Arc<ConstructEntry<C>>> {
        self.write().remove(&id)
    }

    /// Removes `entry` only if it is still the one registered under its id.
    pub fn remove_entry(&self, entry: &Arc<ConstructEntry<C>>) -> bool {
        let mut map = self.write();
        match map.get(&entry.id()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                map.remove(&entry.id());
                true
            }
            _ => false,
        }
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<Arc<ConstructEntry<C>>> {
        let mut entries: Vec<_> = self.write().drain().map(|(_, e)| e).collect();
        entries.sort_unstable_by_key(|e| e.id());
        entries
    }

    /// Snapshots of every construct that is open, valid and has been updated
    /// at least once, i.e. what the authority is willing to replicate.
    pub fn replicable_snapshots(&self, full: bool) -> Vec<C::Snapshot> {
        self.entries()
            .iter()
            .filter(|entry| entry.update_count() > 0)
            .filter_map(|entry| {
                let construct = entry.lock();
                (construct.is_valid() && !construct.closed()).then(|| construct.to_snapshot(full))
            })
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConstructId, Arc<ConstructEntry<C>>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConstructId, Arc<ConstructEntry<C>>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
