//! Kind → handler multimap used by the transport.
//!
//! One mutex guards structural changes. Dispatch clones the handler list for
//! a kind under that mutex and invokes the copy after releasing it, so a
//! handler may (un)register handlers, and registration never waits on a
//! running handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::HandlerError;
use crate::packet::{Packet, PacketKind};

/// A registered packet handler. Identity is the `Arc` allocation.
pub type PacketHandler = Arc<dyn Fn(&Packet) -> Result<(), HandlerError> + Send + Sync>;

/// Wraps a closure as a [`PacketHandler`].
pub fn handler<F>(f: F) -> PacketHandler
where
    F: Fn(&Packet) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
pub struct CallbackRegistry {
    handlers: Mutex<HashMap<PacketKind, Vec<PacketHandler>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for `kind`. Returns false if it was already present.
    pub fn add(&self, kind: PacketKind, handler: PacketHandler) -> bool {
        let mut map = self.lock();
        let list = map.entry(kind).or_default();
        if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        list.push(handler);
        true
    }

    /// Removes `handler` for `kind`. Returns false if it was not present.
    pub fn remove(&self, kind: PacketKind, handler: &PacketHandler) -> bool {
        let mut map = self.lock();
        let Some(list) = map.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&kind);
        }
        removed
    }

    /// Copy of the handler list for `kind`, in registration order.
    pub fn snapshot(&self, kind: PacketKind) -> Vec<PacketHandler> {
        self.lock().get(&kind).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count(&self, kind: PacketKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PacketKind, Vec<PacketHandler>>> {
        // Handlers never run under this lock, so a poisoned map is still consistent.
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
