// farmhold_game — the headless game built on the replication layer.
//
// This crate contains the authoritative server simulation and the
// replicated client: the entity store with its mutation observers, the
// network-id map, the bridge that turns store mutations into broadcasts,
// and the lobby/economy rules on top.
//
// Module overview:
// - `store.rs`:      Entity store — component tables plus creation/destruction observers.
// - `entity_map.rs`: NetworkId ↔ Entity bijection, maintained by store observers.
// - `grid.rs`:       Tile occupancy grid for structure placement.
// - `bridge.rs`:     Store observers that broadcast replication packets.
// - `server.rs`:     GameServer — lobby flow, request validation, economy, tick loop.
// - `client.rs`:     GameClient — replicated world and roster, request senders.
//
// **Critical constraint: single-threaded state.** All game state is
// confined to the thread that ticks it. The transport queues packets on
// background threads and hands them over only inside handle_callbacks,
// so neither the store nor the entity map ever needs a lock.

pub mod bridge;
pub mod client;
pub mod entity_map;
pub mod grid;
pub mod server;
pub mod store;
