// The replicated side of the game: lobby roster, own gold, and a world
// rebuilt from replication packets. Everything here runs on the thread
// that calls tick(); the transport only queues between ticks.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;

use farmhold_net::client::SocketClient;
use farmhold_protocol::components::{Farm, PlayerInfo, Position, Soldier, Structure};
use farmhold_protocol::packets::{GamePacket, register_game_packets};
use farmhold_protocol::registry::{PacketFields, PacketRegistry};
use farmhold_protocol::types::{ClientId, NetworkId, PacketId};

use crate::entity_map;
use crate::server::Stage;
use crate::store::World;

#[derive(Debug, Default)]
struct ClientState {
    my_id: Option<ClientId>,
    stage: Stage,
    players: BTreeMap<ClientId, PlayerInfo>,
    gold: i32,
    connection_lost: bool,
}

/// Replicated view of the game, keyed by wire-visible ids so two clients'
/// snapshots of the same game compare equal.
#[derive(Serialize)]
struct WorldSnapshot {
    stage: Stage,
    players: BTreeMap<ClientId, PlayerInfo>,
    structures: BTreeMap<NetworkId, Structure>,
    farms: BTreeMap<NetworkId, Farm>,
    soldiers: BTreeMap<NetworkId, Soldier>,
    positions: BTreeMap<NetworkId, Position>,
}

pub struct GameClient {
    net: SocketClient,
    registry: Arc<PacketRegistry>,
    state: Rc<RefCell<ClientState>>,
    world: Rc<RefCell<World>>,
    name: String,
}

impl GameClient {
    pub fn new(name: &str) -> Self {
        let mut registry = PacketRegistry::new();
        register_game_packets(&mut registry);
        let registry = Arc::new(registry);

        let net = SocketClient::new(Arc::clone(&registry));

        let mut world = World::new();
        entity_map::attach(&mut world);
        let world = Rc::new(RefCell::new(world));
        let state = Rc::new(RefCell::new(ClientState::default()));

        let mut client = Self {
            net,
            registry,
            state,
            world,
            name: name.to_string(),
        };
        client.wire_callbacks();
        client
    }

    /// Connect and announce our display name.
    pub fn start(&mut self, addr: impl ToSocketAddrs) -> io::Result<()> {
        self.net.start(addr)?;
        self.compose_and_send(GamePacket::NameAnnounce.id(), &(self.name.clone(),));
        Ok(())
    }

    pub fn stop(&mut self) {
        self.net.stop();
    }

    /// Drain queued packets into state, then pick up the handshake-assigned
    /// id once the transport has it.
    pub fn tick(&mut self) {
        self.net.handle_callbacks();
        self.state.borrow_mut().my_id = self.net.client_id();
    }

    pub fn is_connected(&self) -> bool {
        self.net.is_connected()
    }

    pub fn my_id(&self) -> Option<ClientId> {
        self.state.borrow().my_id
    }

    pub fn stage(&self) -> Stage {
        self.state.borrow().stage
    }

    pub fn gold(&self) -> i32 {
        self.state.borrow().gold
    }

    pub fn connection_lost(&self) -> bool {
        self.state.borrow().connection_lost
    }

    pub fn players(&self) -> BTreeMap<ClientId, PlayerInfo> {
        self.state.borrow().players.clone()
    }

    pub fn world(&self) -> Ref<'_, World> {
        self.world.borrow()
    }

    pub fn structures(&self) -> BTreeMap<NetworkId, Structure> {
        let world = self.world.borrow();
        world
            .components()
            .structures
            .iter()
            .filter_map(|(entity, s)| world.entity_map().id_of(*entity).map(|id| (id, *s)))
            .collect()
    }

    pub fn farms(&self) -> BTreeMap<NetworkId, Farm> {
        let world = self.world.borrow();
        world
            .components()
            .farms
            .iter()
            .filter_map(|(entity, f)| world.entity_map().id_of(*entity).map(|id| (id, *f)))
            .collect()
    }

    pub fn soldiers(&self) -> BTreeMap<NetworkId, Soldier> {
        let world = self.world.borrow();
        world
            .components()
            .soldiers
            .iter()
            .filter_map(|(entity, s)| world.entity_map().id_of(*entity).map(|id| (id, *s)))
            .collect()
    }

    pub fn soldier_positions(&self) -> BTreeMap<NetworkId, Position> {
        let world = self.world.borrow();
        world
            .components()
            .soldiers
            .keys()
            .filter_map(|entity| {
                let id = world.entity_map().id_of(*entity)?;
                let position = world.components().positions.get(entity)?;
                Some((id, *position))
            })
            .collect()
    }

    /// The replicated game state as JSON, for whole-state comparisons.
    /// Per-client fields (own id, own gold) are deliberately absent.
    pub fn world_json(&self) -> serde_json::Value {
        let snapshot = WorldSnapshot {
            stage: self.stage(),
            players: self.players(),
            structures: self.structures(),
            farms: self.farms(),
            soldiers: self.soldiers(),
            positions: self.soldier_positions(),
        };
        serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null)
    }

    pub fn send_ready(&self, ready: bool) {
        self.compose_and_send(GamePacket::ReadyToggle.id(), &(ready,));
    }

    pub fn request_harvest(&self, id: NetworkId) {
        self.compose_and_send(GamePacket::HarvestRequest.id(), &(id,));
    }

    pub fn request_place_wall(&self, x: i32, y: i32) {
        self.compose_and_send(GamePacket::PlaceWallRequest.id(), &(x, y));
    }

    pub fn request_plant_farm(&self, x: i32, y: i32) {
        self.compose_and_send(GamePacket::PlantFarmRequest.id(), &(x, y));
    }

    pub fn request_spawn_soldier(&self, x: f32, y: f32) {
        self.compose_and_send(GamePacket::SpawnSoldierRequest.id(), &(x, y));
    }

    fn compose_and_send<P: PacketFields>(&self, id: PacketId, fields: &P) {
        if let Some(packet) = self.registry.compose(id, fields) {
            self.net.send(&packet);
        }
    }

    fn wire_callbacks(&mut self) {
        {
            let state = Rc::clone(&self.state);
            self.net.on_packet::<(ClientId, PlayerInfo), _>(
                GamePacket::PlayerJoined.id(),
                move |(id, info)| {
                    tracing::info!("player {} is {:?}", id.0, info.name);
                    state.borrow_mut().players.insert(id, info);
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            self.net.on_packet::<(BTreeMap<ClientId, PlayerInfo>,), _>(
                GamePacket::LobbySnapshot.id(),
                move |(players,)| {
                    state.borrow_mut().players = players;
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            self.net
                .on_packet::<(ClientId,), _>(GamePacket::PlayerLeft.id(), move |(id,)| {
                    tracing::info!("player {} left", id.0);
                    state.borrow_mut().players.remove(&id);
                });
        }
        {
            let state = Rc::clone(&self.state);
            self.net.on_packet::<(ClientId, bool), _>(
                GamePacket::ReadyStatus.id(),
                move |(id, ready)| {
                    let mut state = state.borrow_mut();
                    match state.players.get_mut(&id) {
                        Some(info) => info.ready = ready,
                        None => tracing::warn!("ready status for unknown player {}", id.0),
                    }
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            self.net
                .on_packet::<(), _>(GamePacket::GameStart.id(), move |()| {
                    tracing::info!("game started");
                    state.borrow_mut().stage = Stage::Game;
                });
        }
        {
            let state = Rc::clone(&self.state);
            self.net
                .on_packet::<(i32,), _>(GamePacket::GoldUpdate.id(), move |(gold,)| {
                    state.borrow_mut().gold = gold;
                });
        }
        {
            let world = Rc::clone(&self.world);
            self.net.on_packet::<(NetworkId, Structure), _>(
                GamePacket::StructureCreated.id(),
                move |(id, structure)| {
                    let mut world = world.borrow_mut();
                    let entity = world.spawn();
                    world.insert_network_id(entity, id);
                    world.insert_structure(entity, structure);
                },
            );
        }
        {
            let world = Rc::clone(&self.world);
            self.net.on_packet::<(NetworkId,), _>(
                GamePacket::StructureDeleted.id(),
                move |(id,)| {
                    let mut world = world.borrow_mut();
                    match world.entity_map().entity_of(id) {
                        Some(entity) => world.destroy(entity),
                        None => tracing::debug!("delete for unknown structure {}", id.0),
                    }
                },
            );
        }
        {
            let world = Rc::clone(&self.world);
            self.net.on_packet::<(NetworkId, Farm), _>(
                GamePacket::FarmUpdate.id(),
                move |(id, farm)| {
                    let mut world = world.borrow_mut();
                    match world.entity_map().entity_of(id) {
                        Some(entity) => world.insert_farm(entity, farm),
                        None => tracing::warn!("farm update for unknown entity {}", id.0),
                    }
                },
            );
        }
        {
            let world = Rc::clone(&self.world);
            self.net.on_packet::<(NetworkId, Soldier, Position), _>(
                GamePacket::SoldierCreated.id(),
                move |(id, soldier, position)| {
                    let mut world = world.borrow_mut();
                    let entity = world.spawn();
                    world.insert_network_id(entity, id);
                    world.insert_position(entity, position);
                    world.insert_soldier(entity, soldier);
                },
            );
        }
        {
            let world = Rc::clone(&self.world);
            self.net
                .on_packet::<(NetworkId,), _>(GamePacket::SoldierDeleted.id(), move |(id,)| {
                    let mut world = world.borrow_mut();
                    match world.entity_map().entity_of(id) {
                        Some(entity) => world.destroy(entity),
                        None => tracing::debug!("delete for unknown soldier {}", id.0),
                    }
                });
        }
        {
            let world = Rc::clone(&self.world);
            self.net.on_packet::<(NetworkId, Position), _>(
                GamePacket::SoldierPosition.id(),
                move |(id, position)| {
                    let mut world = world.borrow_mut();
                    match world.entity_map().entity_of(id) {
                        Some(entity) => world.patch_position(entity, |p| *p = position),
                        None => tracing::debug!("position for unknown soldier {}", id.0),
                    }
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            self.net.on_disconnected(move || {
                tracing::warn!("connection to server lost");
                state.borrow_mut().connection_lost = true;
            });
        }
    }
}
