// The game's packet catalog.
//
// One enum variant per packet type, with the wire id as the discriminant.
// `register_game_packets` installs the whole catalog into a registry; both
// server and client call it at startup so their signature tables agree.
//
// Field signatures (client -> server packets are marked "request"):
//   NameAnnounce        (String)                          request
//   LobbySnapshot       (BTreeMap<ClientId, PlayerInfo>)
//   PlayerJoined        (ClientId, PlayerInfo)
//   PlayerLeft          (ClientId)
//   ReadyToggle         (bool)                            request
//   ReadyStatus         (ClientId, bool)
//   GameStart           ()
//   GoldUpdate          (i32)
//   StructureCreated    (NetworkId, Structure)
//   StructureDeleted    (NetworkId)
//   FarmUpdate          (NetworkId, Farm)
//   HarvestRequest      (NetworkId)                       request
//   PlaceWallRequest    (i32, i32)                        request
//   PlantFarmRequest    (i32, i32)                        request
//   SoldierCreated      (NetworkId, Soldier, Position)
//   SoldierDeleted      (NetworkId)
//   SoldierPosition     (NetworkId, Position)
//   SpawnSoldierRequest (f32, f32)                        request

use std::collections::BTreeMap;

use crate::components::{Farm, PlayerInfo, Position, Soldier, Structure};
use crate::registry::PacketRegistry;
use crate::types::{ClientId, NetworkId, PacketId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GamePacket {
    NameAnnounce = 0,
    LobbySnapshot = 1,
    PlayerJoined = 2,
    PlayerLeft = 3,
    ReadyToggle = 4,
    ReadyStatus = 5,
    GameStart = 6,
    GoldUpdate = 7,
    StructureCreated = 8,
    StructureDeleted = 9,
    FarmUpdate = 10,
    HarvestRequest = 11,
    PlaceWallRequest = 12,
    PlantFarmRequest = 13,
    SoldierCreated = 14,
    SoldierDeleted = 15,
    SoldierPosition = 16,
    SpawnSoldierRequest = 17,
}

impl GamePacket {
    pub const fn id(self) -> PacketId {
        PacketId(self as u32)
    }

    pub const fn name(self) -> &'static str {
        match self {
            GamePacket::NameAnnounce => "name-announce",
            GamePacket::LobbySnapshot => "lobby-snapshot",
            GamePacket::PlayerJoined => "player-joined",
            GamePacket::PlayerLeft => "player-left",
            GamePacket::ReadyToggle => "ready-toggle",
            GamePacket::ReadyStatus => "ready-status",
            GamePacket::GameStart => "game-start",
            GamePacket::GoldUpdate => "gold-update",
            GamePacket::StructureCreated => "structure-created",
            GamePacket::StructureDeleted => "structure-deleted",
            GamePacket::FarmUpdate => "farm-state",
            GamePacket::HarvestRequest => "harvest-request",
            GamePacket::PlaceWallRequest => "place-wall-request",
            GamePacket::PlantFarmRequest => "plant-farm-request",
            GamePacket::SoldierCreated => "soldier-created",
            GamePacket::SoldierDeleted => "soldier-deleted",
            GamePacket::SoldierPosition => "soldier-position",
            GamePacket::SpawnSoldierRequest => "spawn-soldier-request",
        }
    }
}

/// Install every game packet into `registry`.
pub fn register_game_packets(registry: &mut PacketRegistry) {
    use GamePacket::*;

    registry.register::<(String,)>(NameAnnounce.id(), NameAnnounce.name());
    registry.register::<(BTreeMap<ClientId, PlayerInfo>,)>(
        LobbySnapshot.id(),
        LobbySnapshot.name(),
    );
    registry.register::<(ClientId, PlayerInfo)>(PlayerJoined.id(), PlayerJoined.name());
    registry.register::<(ClientId,)>(PlayerLeft.id(), PlayerLeft.name());
    registry.register::<(bool,)>(ReadyToggle.id(), ReadyToggle.name());
    registry.register::<(ClientId, bool)>(ReadyStatus.id(), ReadyStatus.name());
    registry.register::<()>(GameStart.id(), GameStart.name());
    registry.register::<(i32,)>(GoldUpdate.id(), GoldUpdate.name());
    registry.register::<(NetworkId, Structure)>(StructureCreated.id(), StructureCreated.name());
    registry.register::<(NetworkId,)>(StructureDeleted.id(), StructureDeleted.name());
    registry.register::<(NetworkId, Farm)>(FarmUpdate.id(), FarmUpdate.name());
    registry.register::<(NetworkId,)>(HarvestRequest.id(), HarvestRequest.name());
    registry.register::<(i32, i32)>(PlaceWallRequest.id(), PlaceWallRequest.name());
    registry.register::<(i32, i32)>(PlantFarmRequest.id(), PlantFarmRequest.name());
    registry.register::<(NetworkId, Soldier, Position)>(
        SoldierCreated.id(),
        SoldierCreated.name(),
    );
    registry.register::<(NetworkId,)>(SoldierDeleted.id(), SoldierDeleted.name());
    registry.register::<(NetworkId, Position)>(SoldierPosition.id(), SoldierPosition.name());
    registry.register::<(f32, f32)>(SpawnSoldierRequest.id(), SpawnSoldierRequest.name());
}
