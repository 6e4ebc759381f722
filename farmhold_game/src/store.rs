// The component store: entities, component tables and change listeners.
//
// Every mutating operation that other parts of the game must observe
// (replication, the entity map, tile bookkeeping) fires its listener list
// synchronously, while the affected entity's components are still in
// place for destroy events. Listeners receive a WorldView: read access to
// all components plus mutable access to the side tables, but no way to
// re-enter the store itself, which keeps the firing order well-defined.
//
// Component tables are BTreeMaps so iteration order is deterministic,
// which in turn makes replication order deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use farmhold_protocol::components::{Farm, Position, Soldier, Structure};
use farmhold_protocol::types::NetworkId;

use crate::entity_map::NetworkEntityMap;
use crate::grid::TileGrid;

/// Local handle to one entity. Allocated from a counter that never reuses
/// values, so a stale handle can never alias a new entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(pub u32);

/// The component tables. Public fields: reads go straight to the maps,
/// writes go through [`World`] so listeners fire.
#[derive(Default)]
pub struct Components {
    pub network_ids: BTreeMap<Entity, NetworkId>,
    pub structures: BTreeMap<Entity, Structure>,
    pub farms: BTreeMap<Entity, Farm>,
    pub soldiers: BTreeMap<Entity, Soldier>,
    pub positions: BTreeMap<Entity, Position>,
}

/// What a listener sees while it runs: sibling components read-only, the
/// side tables mutable.
pub struct WorldView<'a> {
    pub components: &'a Components,
    pub entity_map: &'a mut NetworkEntityMap,
    pub grid: &'a mut TileGrid,
}

type Listener = Box<dyn FnMut(&mut WorldView<'_>, Entity)>;

#[derive(Default)]
struct Listeners {
    network_id_created: Vec<Listener>,
    network_id_destroyed: Vec<Listener>,
    structure_created: Vec<Listener>,
    structure_destroyed: Vec<Listener>,
    farm_changed: Vec<Listener>,
    soldier_created: Vec<Listener>,
    soldier_destroyed: Vec<Listener>,
}

#[derive(Default)]
pub struct World {
    next_entity: u32,
    components: Components,
    entity_map: NetworkEntityMap,
    grid: TileGrid,
    listeners: Listeners,
}

fn fire(
    listeners: &mut [Listener],
    components: &Components,
    entity_map: &mut NetworkEntityMap,
    grid: &mut TileGrid,
    entity: Entity,
) {
    let mut view = WorldView {
        components,
        entity_map,
        grid,
    };
    for listener in listeners.iter_mut() {
        listener(&mut view, entity);
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn entity_map(&self) -> &NetworkEntityMap {
        &self.entity_map
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn spawn(&mut self) -> Entity {
        let entity = Entity(self.next_entity);
        self.next_entity += 1;
        entity
    }

    pub fn insert_network_id(&mut self, entity: Entity, id: NetworkId) {
        self.components.network_ids.insert(entity, id);
        fire(
            &mut self.listeners.network_id_created,
            &self.components,
            &mut self.entity_map,
            &mut self.grid,
            entity,
        );
    }

    pub fn insert_structure(&mut self, entity: Entity, structure: Structure) {
        self.components.structures.insert(entity, structure);
        fire(
            &mut self.listeners.structure_created,
            &self.components,
            &mut self.entity_map,
            &mut self.grid,
            entity,
        );
    }

    /// Insert or replace a farm. Fires the farm-changed listeners either
    /// way, since a replacement is a state change too.
    pub fn insert_farm(&mut self, entity: Entity, farm: Farm) {
        self.components.farms.insert(entity, farm);
        fire(
            &mut self.listeners.farm_changed,
            &self.components,
            &mut self.entity_map,
            &mut self.grid,
            entity,
        );
    }

    pub fn insert_soldier(&mut self, entity: Entity, soldier: Soldier) {
        self.components.soldiers.insert(entity, soldier);
        fire(
            &mut self.listeners.soldier_created,
            &self.components,
            &mut self.entity_map,
            &mut self.grid,
            entity,
        );
    }

    /// Positions have no creation listeners; they matter only as part of a
    /// soldier, which is inserted after its position.
    pub fn insert_position(&mut self, entity: Entity, position: Position) {
        self.components.positions.insert(entity, position);
    }

    /// Mutate a farm in place and fire the farm-changed listeners.
    pub fn patch_farm(&mut self, entity: Entity, patch: impl FnOnce(&mut Farm)) {
        let Some(farm) = self.components.farms.get_mut(&entity) else {
            tracing::debug!("patch of a missing farm on {entity:?}; ignored");
            return;
        };
        patch(farm);
        fire(
            &mut self.listeners.farm_changed,
            &self.components,
            &mut self.entity_map,
            &mut self.grid,
            entity,
        );
    }

    /// Silent position update; position replication is batched elsewhere
    /// rather than event-driven.
    pub fn patch_position(&mut self, entity: Entity, patch: impl FnOnce(&mut Position)) {
        let Some(position) = self.components.positions.get_mut(&entity) else {
            tracing::debug!("patch of a missing position on {entity:?}; ignored");
            return;
        };
        patch(position);
    }

    /// Silent mutable sweep over every farm, for per-tick growth.
    pub fn farms_mut(&mut self) -> impl Iterator<Item = (Entity, &mut Farm)> {
        self.components.farms.iter_mut().map(|(e, farm)| (*e, farm))
    }

    /// Remove an entity and all its components. Destruction listeners fire
    /// before anything is removed, so they can still read the components.
    /// Order: structure, soldier, then network id last, so id-keyed
    /// cleanup happens after type-specific cleanup.
    pub fn destroy(&mut self, entity: Entity) {
        if self.components.structures.contains_key(&entity) {
            fire(
                &mut self.listeners.structure_destroyed,
                &self.components,
                &mut self.entity_map,
                &mut self.grid,
                entity,
            );
        }
        if self.components.soldiers.contains_key(&entity) {
            fire(
                &mut self.listeners.soldier_destroyed,
                &self.components,
                &mut self.entity_map,
                &mut self.grid,
                entity,
            );
        }
        if self.components.network_ids.contains_key(&entity) {
            fire(
                &mut self.listeners.network_id_destroyed,
                &self.components,
                &mut self.entity_map,
                &mut self.grid,
                entity,
            );
        }
        self.components.network_ids.remove(&entity);
        self.components.structures.remove(&entity);
        self.components.farms.remove(&entity);
        self.components.soldiers.remove(&entity);
        self.components.positions.remove(&entity);
    }

    pub fn on_network_id_created(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.network_id_created.push(Box::new(f));
    }

    pub fn on_network_id_destroyed(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.network_id_destroyed.push(Box::new(f));
    }

    pub fn on_structure_created(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.structure_created.push(Box::new(f));
    }

    pub fn on_structure_destroyed(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.structure_destroyed.push(Box::new(f));
    }

    pub fn on_farm_changed(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.farm_changed.push(Box::new(f));
    }

    pub fn on_soldier_created(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.soldier_created.push(Box::new(f));
    }

    pub fn on_soldier_destroyed(&mut self, f: impl FnMut(&mut WorldView<'_>, Entity) + 'static) {
        self.listeners.soldier_destroyed.push(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use farmhold_protocol::components::{FarmState, StructureKind};
    use farmhold_protocol::types::ClientId;

    fn castle(x: i32, y: i32) -> Structure {
        Structure {
            kind: StructureKind::Castle,
            x,
            y,
            size: 2,
            owner: ClientId(0),
        }
    }

    #[test]
    fn spawn_never_reuses_handles() {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        world.destroy(a);
        let c = world.spawn();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn insert_fires_listeners_in_registration_order() {
        let mut world = World::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&order);
        world.on_structure_created(move |_, e| first.borrow_mut().push(("first", e)));
        let second = Rc::clone(&order);
        world.on_structure_created(move |_, e| second.borrow_mut().push(("second", e)));

        let e = world.spawn();
        world.insert_structure(e, castle(1, 1));

        assert_eq!(*order.borrow(), vec![("first", e), ("second", e)]);
    }

    #[test]
    fn listeners_see_the_component_being_created() {
        let mut world = World::new();
        let seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        world.on_structure_created(move |view, e| {
            *sink.borrow_mut() = view.components.structures.get(&e).copied();
        });

        let e = world.spawn();
        world.insert_structure(e, castle(4, 5));
        assert_eq!(*seen.borrow(), Some(castle(4, 5)));
    }

    #[test]
    fn destroy_listeners_run_before_removal() {
        let mut world = World::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        world.on_structure_destroyed(move |view, e| {
            sink.borrow_mut()
                .push(view.components.structures.get(&e).copied());
        });

        let e = world.spawn();
        world.insert_structure(e, castle(2, 2));
        world.destroy(e);

        assert_eq!(*seen.borrow(), vec![Some(castle(2, 2))]);
        assert!(world.components().structures.is_empty());
    }

    #[test]
    fn destroy_fires_only_for_present_components() {
        let mut world = World::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&events);
        world.on_structure_destroyed(move |_, _| s.borrow_mut().push("structure"));
        let m = Rc::clone(&events);
        world.on_soldier_destroyed(move |_, _| m.borrow_mut().push("soldier"));
        let n = Rc::clone(&events);
        world.on_network_id_destroyed(move |_, _| n.borrow_mut().push("network id"));

        let e = world.spawn();
        world.insert_network_id(e, NetworkId(3));
        world.insert_structure(e, castle(0, 0));
        world.destroy(e);

        // No soldier on this entity, so no soldier event; network id last.
        assert_eq!(*events.borrow(), vec!["structure", "network id"]);
    }

    #[test]
    fn patch_farm_fires_change_listeners() {
        let mut world = World::new();
        let states = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&states);
        world.on_farm_changed(move |view, e| {
            if let Some(farm) = view.components.farms.get(&e) {
                sink.borrow_mut().push(farm.state);
            }
        });

        let e = world.spawn();
        world.insert_farm(e, Farm::growing(10));
        world.patch_farm(e, |farm| farm.state = FarmState::Harvest);

        assert_eq!(
            *states.borrow(),
            vec![FarmState::Growing, FarmState::Harvest]
        );
    }

    #[test]
    fn patch_of_a_missing_farm_is_ignored() {
        let mut world = World::new();
        let fired = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&fired);
        world.on_farm_changed(move |_, _| *sink.borrow_mut() += 1);

        world.patch_farm(Entity(99), |farm| farm.time = 5);
        assert_eq!(*fired.borrow(), 0);
    }

    #[test]
    fn farms_mut_is_silent() {
        let mut world = World::new();
        let fired = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&fired);
        world.on_farm_changed(move |_, _| *sink.borrow_mut() += 1);

        let e = world.spawn();
        world.insert_farm(e, Farm::growing(10));
        for (_, farm) in world.farms_mut() {
            farm.time += 1;
        }

        assert_eq!(*fired.borrow(), 1); // only the insert fired
        assert_eq!(world.components().farms[&e].time, 1);
    }

    #[test]
    fn listeners_can_mutate_the_grid() {
        let mut world = World::new();
        world.on_structure_created(move |view, e| {
            if let Some(structure) = view.components.structures.get(&e) {
                view.grid.occupy(e, structure);
            }
        });
        world.on_structure_destroyed(move |view, e| {
            if let Some(structure) = view.components.structures.get(&e) {
                view.grid.release(e, structure);
            }
        });

        let e = world.spawn();
        world.insert_structure(e, castle(1, 1));
        assert_eq!(world.grid().at(1, 1), Some(e));
        assert_eq!(world.grid().at(2, 2), Some(e));

        world.destroy(e);
        assert_eq!(world.grid().at(1, 1), None);
    }
}
