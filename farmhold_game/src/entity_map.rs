// Bidirectional map between wire-level network ids and local entities.
//
// Kept consistent by two store listeners installed via `attach`; those
// listeners are the only call sites of the mutating methods, so the map
// can never drift from the network id components.

use std::collections::BTreeMap;

use farmhold_protocol::types::NetworkId;

use crate::store::{Entity, World};

#[derive(Default)]
pub struct NetworkEntityMap {
    by_id: BTreeMap<NetworkId, Entity>,
    by_entity: BTreeMap<Entity, NetworkId>,
}

impl NetworkEntityMap {
    pub fn entity_of(&self, id: NetworkId) -> Option<Entity> {
        self.by_id.get(&id).copied()
    }

    pub fn id_of(&self, entity: Entity) -> Option<NetworkId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub(crate) fn insert(&mut self, id: NetworkId, entity: Entity) {
        if let Some(previous) = self.by_id.insert(id, entity) {
            tracing::warn!(
                "network id {} rebound from {previous:?} to {entity:?}",
                id.0
            );
            self.by_entity.remove(&previous);
        }
        self.by_entity.insert(entity, id);
    }

    pub(crate) fn remove_entity(&mut self, entity: Entity) {
        if let Some(id) = self.by_entity.remove(&entity) {
            self.by_id.remove(&id);
        }
    }
}

/// Install the listeners that mirror network id components into the map.
/// Both server and client worlds call this once at construction.
pub fn attach(world: &mut World) {
    world.on_network_id_created(|view, entity| {
        if let Some(id) = view.components.network_ids.get(&entity).copied() {
            view.entity_map.insert(id, entity);
        }
    });
    world.on_network_id_destroyed(|view, entity| {
        view.entity_map.remove_entity(entity);
    });
}
