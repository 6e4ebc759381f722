// Packet signature registry.
//
// Both sides register every packet id together with its field-type list
// before any traffic flows. The registry then polices three seams:
// composing a packet, installing a receive callback, and dispatching an
// inbound frame. A mismatch at any seam is logged and the operation is
// refused, so a field-order bug shows up as a loud warning instead of a
// silently shifted decode.

use std::any::{TypeId, type_name};
use std::collections::HashMap;

use crate::types::PacketId;
use crate::wire::{DecodeError, Wire, WireReader, WireWriter};

/// The field tuple of a packet: an ordered list of wire-encodable values.
/// Implemented for tuples of up to three `Wire` fields, including the empty
/// tuple for payload-free packets.
pub trait PacketFields: Sized + 'static {
    fn type_ids() -> Vec<TypeId>;
    fn type_names() -> Vec<&'static str>;
    fn put(&self, writer: &mut WireWriter);
    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError>;
}

impl PacketFields for () {
    fn type_ids() -> Vec<TypeId> {
        Vec::new()
    }

    fn type_names() -> Vec<&'static str> {
        Vec::new()
    }

    fn put(&self, _writer: &mut WireWriter) {}

    fn take(_reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! impl_packet_fields {
    ($(($ty:ident, $field:ident)),+) => {
        impl<$($ty: Wire),+> PacketFields for ($($ty,)+) {
            fn type_ids() -> Vec<TypeId> {
                vec![$(TypeId::of::<$ty>()),+]
            }

            fn type_names() -> Vec<&'static str> {
                vec![$(type_name::<$ty>()),+]
            }

            fn put(&self, writer: &mut WireWriter) {
                let ($($field,)+) = self;
                $($field.put(writer);)+
            }

            fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
                Ok(($($ty::take(reader)?,)+))
            }
        }
    };
}

impl_packet_fields!((A, a));
impl_packet_fields!((A, a), (B, b));
impl_packet_fields!((A, a), (B, b), (C, c));

/// An encoded packet ready for framing: the 4-byte big-endian packet id
/// followed by the encoded fields.
#[derive(Clone, Debug)]
pub struct Packet {
    id: PacketId,
    bytes: Vec<u8>,
}

impl Packet {
    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

struct Registration {
    name: &'static str,
    field_types: Vec<TypeId>,
    field_names: Vec<&'static str>,
}

/// Table of known packet ids and their signatures.
#[derive(Default)]
pub struct PacketRegistry {
    packets: HashMap<PacketId, Registration>,
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` with the signature of `P`. Re-registering an id is
    /// almost certainly a catalog bug, so it is logged, but the newest
    /// signature wins.
    pub fn register<P: PacketFields>(&mut self, id: PacketId, name: &'static str) {
        if id == PacketId::HANDSHAKE {
            tracing::warn!("packet id {} is reserved for the handshake; '{name}' not registered", id.0);
            return;
        }
        let registration = Registration {
            name,
            field_types: P::type_ids(),
            field_names: P::type_names(),
        };
        if let Some(previous) = self.packets.insert(id, registration) {
            tracing::warn!(
                "packet id {} re-registered as '{name}' (was '{}'); previous signature replaced",
                id.0,
                previous.name
            );
        }
    }

    pub fn is_registered(&self, id: PacketId) -> bool {
        self.packets.contains_key(&id)
    }

    pub fn name_of(&self, id: PacketId) -> Option<&'static str> {
        self.packets.get(&id).map(|r| r.name)
    }

    /// Check that `P` matches the registered signature of `id`, logging the
    /// expected and offered field lists on mismatch.
    pub fn matches<P: PacketFields>(&self, id: PacketId) -> bool {
        let Some(registration) = self.packets.get(&id) else {
            tracing::warn!("packet id {} is not registered", id.0);
            return false;
        };
        if registration.field_types != P::type_ids() {
            tracing::warn!(
                "field types {:?} do not match '{}' which expects {:?}",
                P::type_names(),
                registration.name,
                registration.field_names
            );
            return false;
        }
        true
    }

    /// Encode `fields` into a packet for `id`, or refuse with a warning when
    /// the signature does not match the registration.
    pub fn compose<P: PacketFields>(&self, id: PacketId, fields: &P) -> Option<Packet> {
        if !self.matches::<P>(id) {
            return None;
        }
        let mut writer = WireWriter::new();
        writer.put_u32(id.0);
        fields.put(&mut writer);
        Some(Packet {
            id,
            bytes: writer.into_bytes(),
        })
    }
}
