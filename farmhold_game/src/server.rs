// The authoritative game: lobby flow, request validation, economy, farm
// growth and soldier position broadcasts.
//
// All game state lives on the tick thread. Network callbacks installed on
// the transport capture Rc handles to the two state cells (player/lobby
// state and the world); the transport guarantees callbacks only run inside
// handle_callbacks, which tick() calls from this thread, so the RefCells
// are never contended.
//
// Replication is not done here: creating or changing components fires the
// bridge listeners installed on the world, which broadcast as a side
// effect. Handlers only validate, mutate state and answer with gold
// updates.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use farmhold_net::server::{ServerConfig, ServerSender, SocketServer};
use farmhold_protocol::components::{
    Farm, FarmState, PlayerInfo, Position, Soldier, SoldierKind, Structure, StructureKind,
};
use farmhold_protocol::packets::{GamePacket, register_game_packets};
use farmhold_protocol::registry::PacketRegistry;
use farmhold_protocol::types::{ClientId, NetworkId};

use crate::bridge;
use crate::entity_map;
use crate::grid::{MAP_TILES, TILE_PIXELS, TileGrid};
use crate::store::{Entity, World};

/// Fixed simulation rate: 20 ticks per second.
pub const TICK: Duration = Duration::from_millis(50);

/// Interval between soldier position broadcasts.
const POSITION_FLUSH: Duration = Duration::from_millis(100);

const WALL_COST: i32 = 10;
const FARM_COST: i32 = 100;
const SOLDIER_COST: i32 = 100;
const HARVEST_REWARD: i32 = 100;

/// Wall tile offsets of a starting base, relative to the player's corner.
const BASE_WALLS: [(i32, i32); 10] = [
    (2, 6),
    (3, 6),
    (2, 4),
    (3, 4),
    (4, 6),
    (4, 5),
    (4, 4),
    (1, 4),
    (1, 5),
    (1, 6),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Stage {
    #[default]
    Lobby,
    Game,
}

#[derive(Clone, Debug)]
pub struct GameConfig {
    pub port: u16,
    pub starting_gold: i32,
    /// Ticks a farm takes to ripen (200 ticks = 10 seconds).
    pub farm_grow_time: i32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            port: 7878,
            starting_gold: 100_000,
            farm_grow_time: 200,
        }
    }
}

struct PlayerRecord {
    info: PlayerInfo,
    gold: i32,
}

struct ServerState {
    stage: Stage,
    players: BTreeMap<ClientId, PlayerRecord>,
    next_network_id: u32,
    starting_gold: i32,
    farm_grow_time: i32,
}

impl ServerState {
    fn alloc_network_id(&mut self) -> NetworkId {
        let id = NetworkId(self.next_network_id);
        self.next_network_id += 1;
        id
    }
}

pub struct GameServer {
    net: SocketServer,
    registry: Arc<PacketRegistry>,
    state: Rc<RefCell<ServerState>>,
    world: Rc<RefCell<World>>,
    last_position_flush: Instant,
    /// Position each client last heard per soldier. Seeded on creation by
    /// a listener, since soldier-created already carries the position.
    last_sent_positions: Rc<RefCell<BTreeMap<NetworkId, Position>>>,
}

impl GameServer {
    pub fn new(config: GameConfig) -> Self {
        let mut registry = PacketRegistry::new();
        register_game_packets(&mut registry);
        let registry = Arc::new(registry);

        let net = SocketServer::new(ServerConfig { port: config.port }, Arc::clone(&registry));

        let mut world = World::new();
        entity_map::attach(&mut world);
        bridge::install(&mut world, net.sender(), Arc::clone(&registry));

        let last_sent_positions = Rc::new(RefCell::new(BTreeMap::new()));
        {
            let sent = Rc::clone(&last_sent_positions);
            world.on_soldier_created(move |view, entity| {
                let Some(id) = view.entity_map.id_of(entity) else {
                    return;
                };
                if let Some(&position) = view.components.positions.get(&entity) {
                    sent.borrow_mut().insert(id, position);
                }
            });
        }
        let world = Rc::new(RefCell::new(world));

        let state = Rc::new(RefCell::new(ServerState {
            stage: Stage::Lobby,
            players: BTreeMap::new(),
            next_network_id: 0,
            starting_gold: config.starting_gold,
            farm_grow_time: config.farm_grow_time,
        }));

        let mut server = Self {
            net,
            registry,
            state,
            world,
            last_position_flush: Instant::now(),
            last_sent_positions,
        };
        server.wire_callbacks();
        server
    }

    pub fn start(&mut self) -> io::Result<SocketAddr> {
        self.net.start()
    }

    pub fn stop(&mut self) {
        self.net.stop();
    }

    /// One simulation step: drain the network, grow farms, flush soldier
    /// positions if the broadcast interval has elapsed.
    pub fn tick(&mut self) {
        self.net.handle_callbacks();
        self.grow_farms();
        self.flush_soldier_positions();
    }

    /// Tick at the fixed rate until `keep_running` is cleared.
    pub fn run(&mut self, keep_running: &AtomicBool) {
        while keep_running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick();
            if let Some(rest) = TICK.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.borrow().stage
    }

    pub fn player_count(&self) -> usize {
        self.state.borrow().players.len()
    }

    pub fn player_gold(&self, id: ClientId) -> Option<i32> {
        self.state.borrow().players.get(&id).map(|record| record.gold)
    }

    pub fn players(&self) -> BTreeMap<ClientId, PlayerInfo> {
        self.state
            .borrow()
            .players
            .iter()
            .map(|(id, record)| (*id, record.info.clone()))
            .collect()
    }

    pub fn world(&self) -> Ref<'_, World> {
        self.world.borrow()
    }

    fn wire_callbacks(&mut self) {
        let sender = self.net.sender();

        {
            let state = Rc::clone(&self.state);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net.on_connected(move |id| {
                on_client_connected(&mut state.borrow_mut(), &sender, &registry, id);
            });
        }
        {
            let state = Rc::clone(&self.state);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net.on_disconnected(move |id| {
                on_client_disconnected(&mut state.borrow_mut(), &sender, &registry, id);
            });
        }
        {
            let state = Rc::clone(&self.state);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net
                .on_packet::<(String,), _>(GamePacket::NameAnnounce.id(), move |from, (name,)| {
                    on_name_announce(&mut state.borrow_mut(), &sender, &registry, from, name);
                });
        }
        {
            let state = Rc::clone(&self.state);
            let world = Rc::clone(&self.world);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net
                .on_packet::<(bool,), _>(GamePacket::ReadyToggle.id(), move |from, (ready,)| {
                    on_ready_toggle(
                        &mut state.borrow_mut(),
                        &mut world.borrow_mut(),
                        &sender,
                        &registry,
                        from,
                        ready,
                    );
                });
        }
        {
            let state = Rc::clone(&self.state);
            let world = Rc::clone(&self.world);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net.on_packet::<(NetworkId,), _>(
                GamePacket::HarvestRequest.id(),
                move |from, (id,)| {
                    on_harvest(
                        &mut state.borrow_mut(),
                        &mut world.borrow_mut(),
                        &sender,
                        &registry,
                        from,
                        id,
                    );
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            let world = Rc::clone(&self.world);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net.on_packet::<(i32, i32), _>(
                GamePacket::PlaceWallRequest.id(),
                move |from, (x, y)| {
                    on_place_wall(
                        &mut state.borrow_mut(),
                        &mut world.borrow_mut(),
                        &sender,
                        &registry,
                        from,
                        x,
                        y,
                    );
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            let world = Rc::clone(&self.world);
            let sender = sender.clone();
            let registry = Arc::clone(&self.registry);
            self.net.on_packet::<(i32, i32), _>(
                GamePacket::PlantFarmRequest.id(),
                move |from, (x, y)| {
                    on_plant_farm(
                        &mut state.borrow_mut(),
                        &mut world.borrow_mut(),
                        &sender,
                        &registry,
                        from,
                        x,
                        y,
                    );
                },
            );
        }
        {
            let state = Rc::clone(&self.state);
            let world = Rc::clone(&self.world);
            let registry = Arc::clone(&self.registry);
            self.net.on_packet::<(f32, f32), _>(
                GamePacket::SpawnSoldierRequest.id(),
                move |from, (x, y)| {
                    on_spawn_soldier(
                        &mut state.borrow_mut(),
                        &mut world.borrow_mut(),
                        &sender,
                        &registry,
                        from,
                        x,
                        y,
                    );
                },
            );
        }
    }

    /// Advance every growing farm's clock; ripen the ones whose time is up.
    /// A ripe farm's clock holds until it is harvested, so each ripening
    /// broadcasts exactly once.
    fn grow_farms(&mut self) {
        let mut world = self.world.borrow_mut();
        let due: Vec<Entity> = world
            .farms_mut()
            .filter_map(|(entity, farm)| {
                if farm.state == FarmState::Harvest {
                    return None;
                }
                farm.time += 1;
                (farm.time >= farm.grow_time).then_some(entity)
            })
            .collect();
        for entity in due {
            world.patch_farm(entity, |farm| {
                farm.state = FarmState::Harvest;
                farm.time = 0;
            });
        }
    }

    /// Broadcast the position of every soldier that moved since the last
    /// flush. Positions are polled on an interval instead of event-driven,
    /// so movement traffic stays bounded. Creation does not count as a
    /// move: the ledger is seeded when the soldier is replicated.
    fn flush_soldier_positions(&mut self) {
        if self.last_position_flush.elapsed() < POSITION_FLUSH {
            return;
        }
        self.last_position_flush = Instant::now();

        let world = self.world.borrow();
        let sender = self.net.sender();
        let mut last_sent = self.last_sent_positions.borrow_mut();
        for entity in world.components().soldiers.keys() {
            let Some(id) = world.entity_map().id_of(*entity) else {
                continue;
            };
            let Some(position) = world.components().positions.get(entity) else {
                continue;
            };
            if last_sent.get(&id) == Some(position) {
                continue;
            }
            last_sent.insert(id, *position);
            if let Some(packet) = self
                .registry
                .compose(GamePacket::SoldierPosition.id(), &(id, *position))
            {
                sender.send_all(&packet, None);
            }
        }
        last_sent.retain(|id, _| world.entity_map().entity_of(*id).is_some());
    }
}

fn send_gold(sender: &ServerSender, registry: &PacketRegistry, to: ClientId, gold: i32) {
    if let Some(packet) = registry.compose(GamePacket::GoldUpdate.id(), &(gold,)) {
        sender.send(to, &packet);
    }
}

fn on_client_connected(
    state: &mut ServerState,
    sender: &ServerSender,
    registry: &PacketRegistry,
    id: ClientId,
) {
    if state.stage != Stage::Lobby {
        tracing::info!("client {} connected mid-game; kicking", id.0);
        sender.kick(id);
        return;
    }
    tracing::info!("client {} joined the lobby", id.0);
    state.players.insert(
        id,
        PlayerRecord {
            info: PlayerInfo {
                name: String::new(),
                id,
                ready: false,
            },
            gold: 0,
        },
    );
    // Catch the newcomer up on everyone who has already announced a name.
    for (other, record) in &state.players {
        if *other == id || record.info.name.is_empty() {
            continue;
        }
        if let Some(packet) =
            registry.compose(GamePacket::PlayerJoined.id(), &(*other, record.info.clone()))
        {
            sender.send(id, &packet);
        }
    }
}

fn on_client_disconnected(
    state: &mut ServerState,
    sender: &ServerSender,
    registry: &PacketRegistry,
    id: ClientId,
) {
    tracing::info!("client {} left", id.0);
    // Only the lobby prunes the roster. A mid-game leaver keeps their
    // record: the running game still owns their structures and gold.
    if state.stage != Stage::Lobby {
        return;
    }
    if state.players.remove(&id).is_none() {
        return;
    }
    if let Some(packet) = registry.compose(GamePacket::PlayerLeft.id(), &(id,)) {
        sender.send_all(&packet, None);
    }
}

fn on_name_announce(
    state: &mut ServerState,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    name: String,
) {
    let Some(record) = state.players.get_mut(&from) else {
        tracing::warn!("name announce from unknown client {}", from.0);
        return;
    };
    if !record.info.name.is_empty() {
        tracing::warn!(
            "client {} is already named {:?}; announce ignored",
            from.0,
            record.info.name
        );
        return;
    }
    tracing::info!("client {} announced as {name:?}", from.0);
    record.info.name = name;
    // An empty announce leaves the record blank, and blank players are
    // never advertised.
    if record.info.name.is_empty() {
        return;
    }
    let info = record.info.clone();
    if let Some(packet) = registry.compose(GamePacket::PlayerJoined.id(), &(from, info)) {
        sender.send_all(&packet, None);
    }
}

fn on_ready_toggle(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    ready: bool,
) {
    if state.stage != Stage::Lobby {
        tracing::warn!("ready toggle from client {} outside the lobby; ignored", from.0);
        return;
    }
    {
        let Some(record) = state.players.get_mut(&from) else {
            tracing::warn!("ready toggle from unknown client {}", from.0);
            return;
        };
        if record.info.name.is_empty() {
            tracing::warn!("ready toggle from client {} before name announce; ignored", from.0);
            return;
        }
        record.info.ready = ready;
    }
    if let Some(packet) = registry.compose(GamePacket::ReadyStatus.id(), &(from, ready)) {
        sender.send_all(&packet, None);
    }
    try_start_game(state, world, sender, registry);
}

/// Start the game once at least one player has announced a name and every
/// announced player is ready. Clients that never announced are kicked;
/// their blank records stay in the map, but only announced players get a
/// base.
fn try_start_game(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
) {
    let mut announced = Vec::new();
    for (id, record) in &state.players {
        if record.info.name.is_empty() {
            continue;
        }
        if !record.info.ready {
            return;
        }
        announced.push(*id);
    }
    if announced.is_empty() {
        return;
    }

    for (id, record) in &state.players {
        if record.info.name.is_empty() {
            tracing::info!("kicking client {} (no name at game start)", id.0);
            sender.kick(*id);
        }
    }

    state.stage = Stage::Game;
    tracing::info!("all players ready; starting game with {} players", announced.len());
    if let Some(packet) = registry.compose(GamePacket::GameStart.id(), &()) {
        sender.send_all(&packet, None);
    }

    for (index, id) in announced.iter().enumerate() {
        setup_base(state, world, sender, registry, *id, index as i32);
    }
}

/// Lay out one player's starting base. Bases are stamped on a 10-tile
/// grid: players 0 and 1 side by side, 2 and 3 on the next row.
fn setup_base(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    owner: ClientId,
    index: i32,
) {
    let dx = (index % 2) * 10;
    let dy = (index / 2) * 10;

    let starting_gold = state.starting_gold;
    if let Some(record) = state.players.get_mut(&owner) {
        record.gold = starting_gold;
    }
    send_gold(sender, registry, owner, starting_gold);

    create_structure(state, world, StructureKind::Castle, 2 + dx, 2 + dy, 2, owner);
    create_farm(state, world, 2 + dx, 5 + dy, owner);
    create_farm(state, world, 3 + dx, 5 + dy, owner);
    for (wx, wy) in BASE_WALLS {
        create_structure(state, world, StructureKind::Wall, wx + dx, wy + dy, 1, owner);
    }

    let x = (TILE_PIXELS * (3 + dx)) as f32;
    let y = (TILE_PIXELS * (8 + dy)) as f32;
    create_soldier(state, world, x, y, owner);
}

fn create_structure(
    state: &mut ServerState,
    world: &mut World,
    kind: StructureKind,
    x: i32,
    y: i32,
    size: i32,
    owner: ClientId,
) -> Entity {
    let entity = world.spawn();
    world.insert_network_id(entity, state.alloc_network_id());
    world.insert_structure(
        entity,
        Structure {
            kind,
            x,
            y,
            size,
            owner,
        },
    );
    entity
}

fn create_farm(state: &mut ServerState, world: &mut World, x: i32, y: i32, owner: ClientId) -> Entity {
    let grow_time = state.farm_grow_time;
    let entity = create_structure(state, world, StructureKind::Farm, x, y, 1, owner);
    world.insert_farm(entity, Farm::growing(grow_time));
    entity
}

fn create_soldier(
    state: &mut ServerState,
    world: &mut World,
    x: f32,
    y: f32,
    owner: ClientId,
) -> Entity {
    let entity = world.spawn();
    world.insert_network_id(entity, state.alloc_network_id());
    // Position first: the soldier-created listener replicates both.
    world.insert_position(entity, Position { x, y });
    world.insert_soldier(
        entity,
        Soldier {
            owner,
            kind: SoldierKind::Basic,
        },
    );
    entity
}

fn on_harvest(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    id: NetworkId,
) {
    // Stale ids and unripe farms are normal client lag, not faults.
    let Some(entity) = world.entity_map().entity_of(id) else {
        return;
    };
    let Some(farm) = world.components().farms.get(&entity).copied() else {
        return;
    };
    if farm.state != FarmState::Harvest {
        return;
    }
    let Some(structure) = world.components().structures.get(&entity).copied() else {
        return;
    };
    if structure.owner != from {
        tracing::warn!(
            "client {} tried to harvest a farm owned by client {}",
            from.0,
            structure.owner.0
        );
        return;
    }

    world.patch_farm(entity, |farm| {
        farm.state = FarmState::Growing;
        farm.time = 0;
    });
    let Some(record) = state.players.get_mut(&from) else {
        return;
    };
    record.gold += HARVEST_REWARD;
    let gold = record.gold;
    send_gold(sender, registry, from, gold);
}

fn on_place_wall(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    x: i32,
    y: i32,
) {
    if state.stage != Stage::Game {
        tracing::warn!("place wall from client {} outside the game; ignored", from.0);
        return;
    }
    if !TileGrid::in_bounds(x, y) {
        tracing::warn!("place wall at ({x}, {y}) is out of bounds; ignored");
        return;
    }
    if world.grid().at(x, y).is_some() {
        tracing::warn!("place wall at ({x}, {y}) is occupied; ignored");
        return;
    }
    let Some(record) = state.players.get_mut(&from) else {
        return;
    };
    if record.gold < WALL_COST {
        return;
    }
    record.gold -= WALL_COST;
    let gold = record.gold;
    send_gold(sender, registry, from, gold);
    create_structure(state, world, StructureKind::Wall, x, y, 1, from);
}

fn on_plant_farm(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    x: i32,
    y: i32,
) {
    if state.stage != Stage::Game {
        tracing::warn!("plant farm from client {} outside the game; ignored", from.0);
        return;
    }
    if !TileGrid::in_bounds(x, y) {
        tracing::warn!("plant farm at ({x}, {y}) is out of bounds; ignored");
        return;
    }
    if world.grid().at(x, y).is_some() {
        tracing::warn!("plant farm at ({x}, {y}) is occupied; ignored");
        return;
    }
    let Some(record) = state.players.get_mut(&from) else {
        return;
    };
    if record.gold < FARM_COST {
        return;
    }
    record.gold -= FARM_COST;
    let gold = record.gold;
    send_gold(sender, registry, from, gold);
    create_farm(state, world, x, y, from);
}

fn on_spawn_soldier(
    state: &mut ServerState,
    world: &mut World,
    sender: &ServerSender,
    registry: &PacketRegistry,
    from: ClientId,
    x: f32,
    y: f32,
) {
    if state.stage != Stage::Game {
        tracing::warn!("spawn soldier from client {} outside the game; ignored", from.0);
        return;
    }
    let edge = (MAP_TILES * TILE_PIXELS) as f32;
    if !(0.0..edge).contains(&x) || !(0.0..edge).contains(&y) {
        tracing::warn!("spawn soldier at ({x}, {y}) is out of bounds; ignored");
        return;
    }
    let Some(record) = state.players.get_mut(&from) else {
        return;
    };
    if record.gold < SOLDIER_COST {
        return;
    }
    record.gold -= SOLDIER_COST;
    let gold = record.gold;
    send_gold(sender, registry, from, gold);
    create_soldier(state, world, x, y, from);
}

/// Owning handle to a server running on its own thread.
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the tick loop to stop and wait for it to finish. The loop
    /// stops the transport before exiting.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Start a server on a background thread and return once it is listening.
/// The game state is built on that thread, which is the only thread that
/// ever touches it.
pub fn start_server(config: GameConfig) -> io::Result<(ServerHandle, SocketAddr)> {
    let keep_running = Arc::new(AtomicBool::new(true));
    let thread_flag = Arc::clone(&keep_running);
    let (started_tx, started_rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let mut server = GameServer::new(config);
        let started = server.start();
        let ok = started.is_ok();
        let _ = started_tx.send(started);
        if !ok {
            return;
        }
        server.run(&thread_flag);
        server.stop();
    });

    match started_rx.recv() {
        Ok(Ok(addr)) => Ok((
            ServerHandle {
                keep_running,
                thread: Some(thread),
            },
            addr,
        )),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            let _ = thread.join();
            Err(io::Error::other("server thread exited before reporting"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (ServerState, World, ServerSender, Arc<PacketRegistry>) {
        let mut registry = PacketRegistry::new();
        register_game_packets(&mut registry);
        let registry = Arc::new(registry);
        // A transport that is never started: sends land in an empty client
        // table, which is exactly what handler unit tests want.
        let net = SocketServer::new(ServerConfig { port: 0 }, Arc::clone(&registry));
        let sender = net.sender();
        let mut world = World::new();
        entity_map::attach(&mut world);
        bridge::install(&mut world, sender.clone(), Arc::clone(&registry));
        let state = ServerState {
            stage: Stage::Lobby,
            players: BTreeMap::new(),
            next_network_id: 0,
            starting_gold: 100_000,
            farm_grow_time: 200,
        };
        (state, world, sender, registry)
    }

    fn join_named(
        state: &mut ServerState,
        sender: &ServerSender,
        registry: &PacketRegistry,
        id: ClientId,
        name: &str,
    ) {
        on_client_connected(state, sender, registry, id);
        on_name_announce(state, sender, registry, id, name.to_string());
    }

    fn start_two_player_game(
        state: &mut ServerState,
        world: &mut World,
        sender: &ServerSender,
        registry: &PacketRegistry,
    ) {
        join_named(state, sender, registry, ClientId(0), "Ada");
        join_named(state, sender, registry, ClientId(1), "Brick");
        on_ready_toggle(state, world, sender, registry, ClientId(0), true);
        assert_eq!(state.stage, Stage::Lobby);
        on_ready_toggle(state, world, sender, registry, ClientId(1), true);
        assert_eq!(state.stage, Stage::Game);
    }

    fn structures_of(world: &World, owner: ClientId, kind: StructureKind) -> Vec<Structure> {
        world
            .components()
            .structures
            .values()
            .filter(|s| s.owner == owner && s.kind == kind)
            .copied()
            .collect()
    }

    #[test]
    fn ready_before_name_is_ignored() {
        let (mut state, mut world, sender, registry) = rig();
        on_client_connected(&mut state, &sender, &registry, ClientId(0));
        on_ready_toggle(&mut state, &mut world, &sender, &registry, ClientId(0), true);

        assert_eq!(state.stage, Stage::Lobby);
        assert!(!state.players[&ClientId(0)].info.ready);
    }

    #[test]
    fn game_starts_when_every_named_player_is_ready() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        for id in [ClientId(0), ClientId(1)] {
            assert_eq!(state.players[&id].gold, 100_000);
            assert_eq!(structures_of(&world, id, StructureKind::Castle).len(), 1);
            assert_eq!(structures_of(&world, id, StructureKind::Farm).len(), 2);
            assert_eq!(structures_of(&world, id, StructureKind::Wall).len(), 10);
        }
        assert_eq!(world.components().structures.len(), 26);
        assert_eq!(world.components().farms.len(), 4);
        assert_eq!(world.components().soldiers.len(), 2);
        assert_eq!(world.components().network_ids.len(), world.entity_map().len());
    }

    #[test]
    fn bases_are_offset_per_player() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        let first_castle = structures_of(&world, ClientId(0), StructureKind::Castle)[0];
        assert_eq!((first_castle.x, first_castle.y, first_castle.size), (2, 2, 2));
        let second_castle = structures_of(&world, ClientId(1), StructureKind::Castle)[0];
        assert_eq!((second_castle.x, second_castle.y), (12, 2));

        // Soldier pixel positions: tile (3, 8) and (13, 8) scaled by 32.
        let mut positions: Vec<(f32, f32)> = world
            .components()
            .positions
            .values()
            .map(|p| (p.x, p.y))
            .collect();
        positions.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(positions, vec![(96.0, 256.0), (416.0, 256.0)]);
    }

    #[test]
    fn unnamed_players_do_not_block_the_start() {
        let (mut state, mut world, sender, registry) = rig();
        join_named(&mut state, &sender, &registry, ClientId(0), "Ada");
        on_client_connected(&mut state, &sender, &registry, ClientId(1)); // never names
        on_ready_toggle(&mut state, &mut world, &sender, &registry, ClientId(0), true);

        assert_eq!(state.stage, Stage::Game);
        // Only the named player got a base.
        assert_eq!(world.components().structures.len(), 13);
    }

    #[test]
    fn mid_game_join_is_refused() {
        let (mut state, mut world, sender, registry) = rig();
        join_named(&mut state, &sender, &registry, ClientId(0), "Ada");
        on_ready_toggle(&mut state, &mut world, &sender, &registry, ClientId(0), true);
        assert_eq!(state.stage, Stage::Game);

        on_client_connected(&mut state, &sender, &registry, ClientId(9));
        assert!(!state.players.contains_key(&ClientId(9)));
    }

    #[test]
    fn lobby_disconnect_removes_the_player() {
        let (mut state, _world, sender, registry) = rig();
        join_named(&mut state, &sender, &registry, ClientId(0), "Ada");
        join_named(&mut state, &sender, &registry, ClientId(1), "Brick");

        on_client_disconnected(&mut state, &sender, &registry, ClientId(1));
        assert_eq!(state.players.len(), 1);
        // Unknown disconnects are a no-op.
        on_client_disconnected(&mut state, &sender, &registry, ClientId(42));
        assert_eq!(state.players.len(), 1);
    }

    #[test]
    fn mid_game_disconnect_keeps_the_record() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_client_disconnected(&mut state, &sender, &registry, ClientId(1));
        assert_eq!(state.players.len(), 2);
        assert_eq!(state.players[&ClientId(1)].info.name, "Brick");
    }

    #[test]
    fn ready_toggle_mid_game_is_ignored() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_ready_toggle(&mut state, &mut world, &sender, &registry, ClientId(0), false);
        assert!(state.players[&ClientId(0)].info.ready);
    }

    #[test]
    fn second_name_announce_is_refused() {
        let (mut state, _world, sender, registry) = rig();
        join_named(&mut state, &sender, &registry, ClientId(0), "Ada");

        on_name_announce(&mut state, &sender, &registry, ClientId(0), "Eve".to_string());
        assert_eq!(state.players[&ClientId(0)].info.name, "Ada");
    }

    #[test]
    fn harvest_pays_and_resets_the_farm() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        let farm_entity = *world.components().farms.keys().next().unwrap();
        let farm_id = world.entity_map().id_of(farm_entity).unwrap();
        let owner = world.components().structures[&farm_entity].owner;
        world.patch_farm(farm_entity, |farm| farm.state = FarmState::Harvest);

        on_harvest(&mut state, &mut world, &sender, &registry, owner, farm_id);

        assert_eq!(state.players[&owner].gold, 100_100);
        let farm = world.components().farms[&farm_entity];
        assert_eq!(farm.state, FarmState::Growing);
        assert_eq!(farm.time, 0);
    }

    #[test]
    fn harvest_of_an_unripe_farm_is_ignored() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        let farm_entity = *world.components().farms.keys().next().unwrap();
        let farm_id = world.entity_map().id_of(farm_entity).unwrap();
        let owner = world.components().structures[&farm_entity].owner;

        on_harvest(&mut state, &mut world, &sender, &registry, owner, farm_id);
        assert_eq!(state.players[&owner].gold, 100_000);
        assert_eq!(
            world.components().farms[&farm_entity].state,
            FarmState::Growing
        );
    }

    #[test]
    fn harvest_of_someone_elses_farm_is_refused() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        let farm_entity = *world.components().farms.keys().next().unwrap();
        let farm_id = world.entity_map().id_of(farm_entity).unwrap();
        let owner = world.components().structures[&farm_entity].owner;
        let thief = if owner == ClientId(0) { ClientId(1) } else { ClientId(0) };
        world.patch_farm(farm_entity, |farm| farm.state = FarmState::Harvest);

        on_harvest(&mut state, &mut world, &sender, &registry, thief, farm_id);

        assert_eq!(state.players[&thief].gold, 100_000);
        assert_eq!(
            world.components().farms[&farm_entity].state,
            FarmState::Harvest
        );
    }

    #[test]
    fn harvest_of_a_stale_id_is_ignored() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_harvest(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            NetworkId(9999),
        );
        assert_eq!(state.players[&ClientId(0)].gold, 100_000);
    }

    #[test]
    fn place_wall_costs_gold_and_fills_the_tile() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_place_wall(&mut state, &mut world, &sender, &registry, ClientId(0), 20, 20);

        assert_eq!(state.players[&ClientId(0)].gold, 100_000 - WALL_COST);
        let wall = world.grid().at(20, 20).unwrap();
        assert_eq!(
            world.components().structures[&wall].kind,
            StructureKind::Wall
        );
        assert_eq!(world.components().structures[&wall].owner, ClientId(0));
    }

    #[test]
    fn place_wall_rejects_occupied_and_out_of_bounds_tiles() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);
        let baseline = world.components().structures.len();

        // The castle sits at (2, 2).
        on_place_wall(&mut state, &mut world, &sender, &registry, ClientId(0), 2, 2);
        on_place_wall(&mut state, &mut world, &sender, &registry, ClientId(0), -1, 5);
        on_place_wall(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            MAP_TILES,
            5,
        );

        assert_eq!(world.components().structures.len(), baseline);
        assert_eq!(state.players[&ClientId(0)].gold, 100_000);
    }

    #[test]
    fn place_wall_without_gold_is_silently_dropped() {
        let (mut state, mut world, sender, registry) = rig();
        state.starting_gold = 5;
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_place_wall(&mut state, &mut world, &sender, &registry, ClientId(0), 20, 20);

        assert_eq!(state.players[&ClientId(0)].gold, 5);
        assert!(world.grid().at(20, 20).is_none());
    }

    #[test]
    fn requests_before_the_game_are_refused() {
        let (mut state, mut world, sender, registry) = rig();
        join_named(&mut state, &sender, &registry, ClientId(0), "Ada");

        on_place_wall(&mut state, &mut world, &sender, &registry, ClientId(0), 5, 5);
        on_plant_farm(&mut state, &mut world, &sender, &registry, ClientId(0), 5, 5);
        on_spawn_soldier(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            100.0,
            100.0,
        );

        assert!(world.components().structures.is_empty());
        assert!(world.components().soldiers.is_empty());
    }

    #[test]
    fn plant_farm_creates_a_growing_farm() {
        let (mut state, mut world, sender, registry) = rig();
        state.farm_grow_time = 40;
        start_two_player_game(&mut state, &mut world, &sender, &registry);

        on_plant_farm(&mut state, &mut world, &sender, &registry, ClientId(1), 25, 25);

        assert_eq!(state.players[&ClientId(1)].gold, 100_000 - FARM_COST);
        let entity = world.grid().at(25, 25).unwrap();
        let farm = world.components().farms[&entity];
        assert_eq!(farm.state, FarmState::Growing);
        assert_eq!(farm.grow_time, 40);
    }

    #[test]
    fn spawn_soldier_validates_pixel_bounds() {
        let (mut state, mut world, sender, registry) = rig();
        start_two_player_game(&mut state, &mut world, &sender, &registry);
        let baseline = world.components().soldiers.len();

        on_spawn_soldier(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            -1.0,
            50.0,
        );
        on_spawn_soldier(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            50.0,
            1024.0,
        );
        assert_eq!(world.components().soldiers.len(), baseline);

        on_spawn_soldier(
            &mut state,
            &mut world,
            &sender,
            &registry,
            ClientId(0),
            500.0,
            500.0,
        );
        assert_eq!(world.components().soldiers.len(), baseline + 1);
        assert_eq!(
            state.players[&ClientId(0)].gold,
            100_000 - SOLDIER_COST
        );
    }

    #[test]
    fn farms_ripen_on_schedule() {
        let mut server = GameServer::new(GameConfig {
            port: 0,
            starting_gold: 1_000,
            farm_grow_time: 3,
        });

        {
            let mut state = server.state.borrow_mut();
            let mut world = server.world.borrow_mut();
            let sender = server.net.sender();
            join_named(&mut state, &sender, &server.registry, ClientId(0), "Ada");
            on_ready_toggle(
                &mut state,
                &mut world,
                &sender,
                &server.registry,
                ClientId(0),
                true,
            );
        }

        for _ in 0..2 {
            server.grow_farms();
        }
        {
            let world = server.world.borrow();
            assert!(
                world
                    .components()
                    .farms
                    .values()
                    .all(|farm| farm.state == FarmState::Growing)
            );
        }

        server.grow_farms();
        let world = server.world.borrow();
        assert!(
            world
                .components()
                .farms
                .values()
                .all(|farm| farm.state == FarmState::Harvest && farm.time == 0)
        );
    }

    #[test]
    fn ripe_farms_hold_until_harvested() {
        let mut server = GameServer::new(GameConfig {
            port: 0,
            starting_gold: 1_000,
            farm_grow_time: 3,
        });
        {
            let mut state = server.state.borrow_mut();
            let mut world = server.world.borrow_mut();
            let sender = server.net.sender();
            join_named(&mut state, &sender, &server.registry, ClientId(0), "Ada");
            on_ready_toggle(
                &mut state,
                &mut world,
                &sender,
                &server.registry,
                ClientId(0),
                true,
            );
        }
        let changes = Rc::new(RefCell::new(0u32));
        {
            let sink = Rc::clone(&changes);
            server
                .world
                .borrow_mut()
                .on_farm_changed(move |_, _| *sink.borrow_mut() += 1);
        }

        for _ in 0..3 {
            server.grow_farms();
        }
        assert_eq!(*changes.borrow(), 2); // one ripen broadcast per farm

        for _ in 0..6 {
            server.grow_farms();
        }
        // Held, not lapped: no repeat broadcasts, clocks stay at zero.
        assert_eq!(*changes.borrow(), 2);
        let world = server.world.borrow();
        assert!(
            world
                .components()
                .farms
                .values()
                .all(|farm| farm.state == FarmState::Harvest && farm.time == 0)
        );
    }

    #[test]
    fn soldier_positions_flush_only_on_movement() {
        let mut server = GameServer::new(GameConfig {
            port: 0,
            starting_gold: 1_000,
            farm_grow_time: 200,
        });
        {
            let mut state = server.state.borrow_mut();
            let mut world = server.world.borrow_mut();
            let sender = server.net.sender();
            join_named(&mut state, &sender, &server.registry, ClientId(0), "Ada");
            on_ready_toggle(
                &mut state,
                &mut world,
                &sender,
                &server.registry,
                ClientId(0),
                true,
            );
        }

        // Creation seeded the ledger with the spawn position.
        let soldier_id = {
            let world = server.world.borrow();
            let entity = *world.components().soldiers.keys().next().unwrap();
            world.entity_map().id_of(entity).unwrap()
        };
        assert_eq!(
            server.last_sent_positions.borrow().get(&soldier_id),
            Some(&Position { x: 96.0, y: 256.0 })
        );

        // Only an actual move updates the ledger on the next flush.
        {
            let mut world = server.world.borrow_mut();
            let entity = world.entity_map().entity_of(soldier_id).unwrap();
            world.patch_position(entity, |p| p.x = 128.0);
        }
        server.last_position_flush = Instant::now() - POSITION_FLUSH;
        server.flush_soldier_positions();
        assert_eq!(
            server.last_sent_positions.borrow().get(&soldier_id),
            Some(&Position { x: 128.0, y: 256.0 })
        );
    }
}
