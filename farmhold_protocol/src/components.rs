// Replicated game data carried inside packets.
//
// These are the value types both sides agree on: the server owns the
// authoritative copy, clients hold mirrored copies updated by packets.
// Each type has a Wire impl defining its field order on the wire; enums
// travel as validated i32 discriminants.

use serde::{Deserialize, Serialize};

use crate::types::ClientId;
use crate::wire::{DecodeError, Wire, WireReader, WireWriter};

/// One lobby participant as seen by every client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub name: String,
    pub id: ClientId,
    pub ready: bool,
}

impl Wire for PlayerInfo {
    fn put(&self, writer: &mut WireWriter) {
        self.name.put(writer);
        self.id.put(writer);
        self.ready.put(writer);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(PlayerInfo {
            name: String::take(reader)?,
            id: ClientId::take(reader)?,
            ready: bool::take(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureKind {
    Castle = 0,
    Farm = 1,
    Wall = 2,
}

impl Wire for StructureKind {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_i32(*self as i32);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        match reader.take_i32()? {
            0 => Ok(StructureKind::Castle),
            1 => Ok(StructureKind::Farm),
            2 => Ok(StructureKind::Wall),
            value => Err(DecodeError::UnknownDiscriminant {
                kind: "StructureKind",
                value,
            }),
        }
    }
}

/// A building occupying a square of `size` x `size` tiles with its top-left
/// corner at (x, y) in tile coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub kind: StructureKind,
    pub x: i32,
    pub y: i32,
    pub size: i32,
    pub owner: ClientId,
}

impl Wire for Structure {
    fn put(&self, writer: &mut WireWriter) {
        self.kind.put(writer);
        self.x.put(writer);
        self.y.put(writer);
        self.size.put(writer);
        self.owner.put(writer);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Structure {
            kind: StructureKind::take(reader)?,
            x: i32::take(reader)?,
            y: i32::take(reader)?,
            size: i32::take(reader)?,
            owner: ClientId::take(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FarmState {
    Growing = 0,
    Harvest = 1,
}

impl Wire for FarmState {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_i32(*self as i32);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        match reader.take_i32()? {
            0 => Ok(FarmState::Growing),
            1 => Ok(FarmState::Harvest),
            value => Err(DecodeError::UnknownDiscriminant {
                kind: "FarmState",
                value,
            }),
        }
    }
}

/// Crop growth attached to a farm structure. `time` counts ticks since the
/// last state change; at `grow_time` a growing farm becomes harvestable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Farm {
    pub state: FarmState,
    pub time: i32,
    pub grow_time: i32,
}

impl Farm {
    /// A freshly planted farm at the start of its growth cycle.
    pub fn growing(grow_time: i32) -> Self {
        Farm {
            state: FarmState::Growing,
            time: 0,
            grow_time,
        }
    }
}

impl Wire for Farm {
    fn put(&self, writer: &mut WireWriter) {
        self.state.put(writer);
        self.time.put(writer);
        self.grow_time.put(writer);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Farm {
            state: FarmState::take(reader)?,
            time: i32::take(reader)?,
            grow_time: i32::take(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoldierKind {
    Basic = 0,
}

impl Wire for SoldierKind {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_i32(*self as i32);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        match reader.take_i32()? {
            0 => Ok(SoldierKind::Basic),
            value => Err(DecodeError::UnknownDiscriminant {
                kind: "SoldierKind",
                value,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soldier {
    pub owner: ClientId,
    pub kind: SoldierKind,
}

impl Wire for Soldier {
    fn put(&self, writer: &mut WireWriter) {
        self.owner.put(writer);
        self.kind.put(writer);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Soldier {
            owner: ClientId::take(reader)?,
            kind: SoldierKind::take(reader)?,
        })
    }
}

/// World-space position in pixels, used by units that move off the tile
/// grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Wire for Position {
    fn put(&self, writer: &mut WireWriter) {
        self.x.put(writer);
        self.y.put(writer);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        Ok(Position {
            x: f32::take(reader)?,
            y: f32::take(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Wire + PartialEq + std::fmt::Debug>(value: &T) {
        let mut writer = WireWriter::new();
        value.put(&mut writer);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(&T::take(&mut reader).unwrap(), value);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn player_info_roundtrip() {
        roundtrip(&PlayerInfo {
            name: "Ada".to_string(),
            id: ClientId(3),
            ready: true,
        });
    }

    #[test]
    fn structure_roundtrip() {
        roundtrip(&Structure {
            kind: StructureKind::Castle,
            x: 2,
            y: 12,
            size: 2,
            owner: ClientId(0),
        });
    }

    #[test]
    fn farm_roundtrip() {
        roundtrip(&Farm {
            state: FarmState::Harvest,
            time: 17,
            grow_time: 200,
        });
    }

    #[test]
    fn soldier_and_position_roundtrip() {
        roundtrip(&Soldier {
            owner: ClientId(1),
            kind: SoldierKind::Basic,
        });
        roundtrip(&Position { x: 96.0, y: 256.5 });
    }

    #[test]
    fn unknown_structure_kind_is_rejected() {
        let mut writer = WireWriter::new();
        writer.put_i32(9);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        match StructureKind::take(&mut reader) {
            Err(DecodeError::UnknownDiscriminant { kind, value }) => {
                assert_eq!(kind, "StructureKind");
                assert_eq!(value, 9);
            }
            other => panic!("expected UnknownDiscriminant, got {other:?}"),
        }
    }

    #[test]
    fn enum_discriminants_are_stable() {
        let mut writer = WireWriter::new();
        StructureKind::Wall.put(&mut writer);
        FarmState::Harvest.put(&mut writer);
        SoldierKind::Basic.put(&mut writer);
        assert_eq!(writer.bytes(), &[0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0]);
    }
}
