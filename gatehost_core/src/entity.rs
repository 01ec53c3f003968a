//! Typed capability table for world entities.
//!
//! Entities are looked up by id and matched against a closed set of
//! component variants instead of being downcast at runtime.

use nalgebra::{Isometry3, Vector3};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::construct::ConstructId;

pub type EntityId = i64;

/// A physical body the warp timeline can move.
pub trait Body: Send + Sync {
    fn set_pose(&self, pose: Isometry3<f64>);
    fn set_linear_velocity(&self, velocity: Vector3<f64>);
}

#[derive(Clone)]
pub enum Component {
    Body(Arc<dyn Body>),
    /// The entity belongs to this construct.
    Construct(ConstructId),
}

#[derive(Default)]
pub struct EntityTable {
    components: RwLock<HashMap<EntityId, Vec<Component>>>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, entity: EntityId, component: Component) {
        let mut map = self.components.write().unwrap_or_else(PoisonError::into_inner);
        let list = map.entry(entity).or_default();
        // At most one component per variant.
        list.retain(|c| std::mem::discriminant(c) != std::mem::discriminant(&component));
        list.push(component);
    }

    pub fn detach(&self, entity: EntityId) -> bool {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity)
            .is_some()
    }

    pub fn body(&self, entity: EntityId) -> Option<Arc<dyn Body>> {
        self.find(entity, |c| match c {
            Component::Body(body) => Some(Arc::clone(body)),
            _ => None,
        })
    }

    pub fn construct_of(&self, entity: EntityId) -> Option<ConstructId> {
        self.find(entity, |c| match c {
            Component::Construct(id) => Some(*id),
            _ => None,
        })
    }

    fn find<T>(&self, entity: EntityId, pick: impl Fn(&Component) -> Option<T>) -> Option<T> {
        let map = self.components.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&entity)?.iter().find_map(pick)
    }
}
