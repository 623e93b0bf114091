//! Per-kind id registries.
//!
//! One map per entity kind and direction. The map lock is held only for the
//! single operation; entity locks are always taken after it is released.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entity::{
    InboundClient, InboundRequest, InboundStream, OutboundClient, OutboundRequest, OutboundStream,
};

pub struct Registry<E> {
    map: Mutex<HashMap<u32, Arc<E>>>,
}

impl<E> Registry<E> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Insert, replacing any previous entity under the id.
    pub fn insert(&self, id: u32, entity: Arc<E>) -> Option<Arc<E>> {
        self.map.lock().insert(id, entity)
    }

    /// Insert only if the id is vacant; hands the entity back otherwise.
    pub fn try_insert(&self, id: u32, entity: Arc<E>) -> Result<(), Arc<E>> {
        match self.map.lock().entry(id) {
            Entry::Occupied(_) => Err(entity),
            Entry::Vacant(slot) => {
                slot.insert(entity);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<E>> {
        self.map.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u32) -> Option<Arc<E>> {
        self.map.lock().remove(&id)
    }

    /// Empty the registry, returning every entity for teardown.
    pub fn drain(&self) -> Vec<(u32, Arc<E>)> {
        self.map.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Sorted snapshot of live ids, for diagnostics.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.map.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The six per-connection registries.
pub struct Registries {
    pub(crate) inbound_clients: Registry<InboundClient>,
    pub(crate) outbound_clients: Registry<OutboundClient>,
    pub(crate) inbound_requests: Registry<InboundRequest>,
    pub(crate) outbound_requests: Registry<OutboundRequest>,
    pub(crate) inbound_streams: Registry<InboundStream>,
    pub(crate) outbound_streams: Registry<OutboundStream>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            inbound_clients: Registry::new(),
            outbound_clients: Registry::new(),
            inbound_requests: Registry::new(),
            outbound_requests: Registry::new(),
            inbound_streams: Registry::new(),
            outbound_streams: Registry::new(),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
