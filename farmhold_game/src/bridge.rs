// Replication listeners: the bridge from store mutations to the wire.
//
// Installed on the server's world only. Each listener composes the
// matching packet and broadcasts it immediately, so clients observe
// authoritative changes in the order they happened. Structure listeners
// also maintain the tile grid, keeping placement checks in sync with what
// has been replicated.

use std::sync::Arc;

use farmhold_net::server::ServerSender;
use farmhold_protocol::packets::GamePacket;
use farmhold_protocol::registry::PacketRegistry;

use crate::store::World;

pub fn install(world: &mut World, sender: ServerSender, registry: Arc<PacketRegistry>) {
    {
        let sender = sender.clone();
        let registry = Arc::clone(&registry);
        world.on_structure_created(move |view, entity| {
            let Some(&id) = view.components.network_ids.get(&entity) else {
                tracing::warn!("structure on {entity:?} has no network id; not replicated");
                return;
            };
            let Some(&structure) = view.components.structures.get(&entity) else {
                return;
            };
            view.grid.occupy(entity, &structure);
            if let Some(packet) =
                registry.compose(GamePacket::StructureCreated.id(), &(id, structure))
            {
                sender.send_all(&packet, None);
            }
        });
    }
    {
        let sender = sender.clone();
        let registry = Arc::clone(&registry);
        world.on_structure_destroyed(move |view, entity| {
            if let Some(&structure) = view.components.structures.get(&entity) {
                view.grid.release(entity, &structure);
            }
            let Some(&id) = view.components.network_ids.get(&entity) else {
                return;
            };
            if let Some(packet) = registry.compose(GamePacket::StructureDeleted.id(), &(id,)) {
                sender.send_all(&packet, None);
            }
        });
    }
    {
        let sender = sender.clone();
        let registry = Arc::clone(&registry);
        world.on_farm_changed(move |view, entity| {
            let Some(&id) = view.components.network_ids.get(&entity) else {
                tracing::warn!("farm on {entity:?} has no network id; not replicated");
                return;
            };
            let Some(&farm) = view.components.farms.get(&entity) else {
                return;
            };
            if let Some(packet) = registry.compose(GamePacket::FarmUpdate.id(), &(id, farm)) {
                sender.send_all(&packet, None);
            }
        });
    }
    {
        let sender = sender.clone();
        let registry = Arc::clone(&registry);
        world.on_soldier_created(move |view, entity| {
            let Some(&id) = view.components.network_ids.get(&entity) else {
                tracing::warn!("soldier on {entity:?} has no network id; not replicated");
                return;
            };
            let Some(&soldier) = view.components.soldiers.get(&entity) else {
                return;
            };
            let Some(&position) = view.components.positions.get(&entity) else {
                tracing::warn!("soldier on {entity:?} has no position; not replicated");
                return;
            };
            if let Some(packet) =
                registry.compose(GamePacket::SoldierCreated.id(), &(id, soldier, position))
            {
                sender.send_all(&packet, None);
            }
        });
    }
    {
        world.on_soldier_destroyed(move |view, entity| {
            let Some(&id) = view.components.network_ids.get(&entity) else {
                return;
            };
            if let Some(packet) = registry.compose(GamePacket::SoldierDeleted.id(), &(id,)) {
                sender.send_all(&packet, None);
            }
        });
    }
}
