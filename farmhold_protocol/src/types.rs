// Identifier newtypes shared across the protocol.
//
// All three are compact u32 wrappers rather than bare integers so that a
// client id can never be passed where a network entity id is expected.

use serde::{Deserialize, Serialize};

use crate::wire::{DecodeError, Wire, WireReader, WireWriter};

/// Server-assigned connection ID. Allocated from a monotonic counter that is
/// never reset, so ids stay unique across reconnects for a server's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

/// Server-assigned ID naming a replicated entity on the wire. Local entity
/// handles differ between peers; this is the shared name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub u32);

/// Packet type ID carried in every frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketId(pub u32);

impl PacketId {
    /// Reserved id for the transport's own handshake frame. Never
    /// registrable and never dispatched to packet callbacks.
    pub const HANDSHAKE: PacketId = PacketId(u32::MAX);
}

impl Wire for ClientId {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_u32(self.0);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(ClientId(reader.take_u32()?))
    }
}

impl Wire for NetworkId {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_u32(self.0);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(NetworkId(reader.take_u32()?))
    }
}
