// farmhold_protocol: the wire protocol shared by server and client.
//
// This crate has no networking of its own. It defines, in layers:
// - types: ClientId / NetworkId / PacketId newtypes
// - wire: the field codec (big-endian, length-prefixed containers)
// - framing: length-prefixed frames over any Read/Write stream
// - registry: packet signature table guarding compose and dispatch
// - components: replicated game data (players, structures, farms, soldiers)
// - packets: the concrete packet catalog and its registration
//
// Design decisions:
// - Field lists are validated against the registry at every seam instead of
//   being self-describing on the wire; payloads stay minimal.
// - Decoding is strict. A packet either decodes completely or is dropped
//   with a warning; there are no partial applies.
// - Packet ids are plain u32s assigned in the catalog, with u32::MAX
//   reserved for the transport handshake.

pub mod components;
pub mod framing;
pub mod packets;
pub mod registry;
pub mod types;
pub mod wire;

pub use registry::{Packet, PacketFields, PacketRegistry};
pub use types::{ClientId, NetworkId, PacketId};
