// Tile occupancy for structure placement.

use farmhold_protocol::components::Structure;

use crate::store::Entity;

/// Map edge length in tiles. The world is a square.
pub const MAP_TILES: i32 = 32;

/// Edge length of one tile in world pixels.
pub const TILE_PIXELS: i32 = 32;

/// Which entity, if any, occupies each tile. A structure of size `s` fills
/// an `s` x `s` block of tiles.
pub struct TileGrid {
    tiles: Vec<Option<Entity>>,
}

impl TileGrid {
    pub fn new() -> Self {
        Self {
            tiles: vec![None; (MAP_TILES * MAP_TILES) as usize],
        }
    }

    pub fn in_bounds(x: i32, y: i32) -> bool {
        (0..MAP_TILES).contains(&x) && (0..MAP_TILES).contains(&y)
    }

    fn index(x: i32, y: i32) -> usize {
        (y * MAP_TILES + x) as usize
    }

    /// The occupant of (x, y). Out-of-bounds tiles read as empty.
    pub fn at(&self, x: i32, y: i32) -> Option<Entity> {
        if Self::in_bounds(x, y) {
            self.tiles[Self::index(x, y)]
        } else {
            None
        }
    }

    /// Mark every tile covered by `structure` as occupied by `entity`.
    /// Tiles outside the map are skipped.
    pub fn occupy(&mut self, entity: Entity, structure: &Structure) {
        for dy in 0..structure.size {
            for dx in 0..structure.size {
                let (x, y) = (structure.x + dx, structure.y + dy);
                if Self::in_bounds(x, y) {
                    self.tiles[Self::index(x, y)] = Some(entity);
                }
            }
        }
    }

    /// Clear the tiles covered by `structure`, but only where `entity` is
    /// still the occupant.
    pub fn release(&mut self, entity: Entity, structure: &Structure) {
        for dy in 0..structure.size {
            for dx in 0..structure.size {
                let (x, y) = (structure.x + dx, structure.y + dy);
                if Self::in_bounds(x, y) && self.tiles[Self::index(x, y)] == Some(entity) {
                    self.tiles[Self::index(x, y)] = None;
                }
            }
        }
    }

    pub fn occupied_tiles(&self) -> usize {
        self.tiles.iter().filter(|tile| tile.is_some()).count()
    }
}

impl Default for TileGrid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmhold_protocol::components::StructureKind;
    use farmhold_protocol::types::ClientId;

    fn structure(x: i32, y: i32, size: i32) -> Structure {
        Structure {
            kind: StructureKind::Castle,
            x,
            y,
            size,
            owner: ClientId(0),
        }
    }

    #[test]
    fn occupy_fills_the_covered_block() {
        let mut grid = TileGrid::new();
        grid.occupy(Entity(1), &structure(2, 3, 2));

        assert_eq!(grid.at(2, 3), Some(Entity(1)));
        assert_eq!(grid.at(3, 3), Some(Entity(1)));
        assert_eq!(grid.at(2, 4), Some(Entity(1)));
        assert_eq!(grid.at(3, 4), Some(Entity(1)));
        assert_eq!(grid.at(4, 3), None);
        assert_eq!(grid.occupied_tiles(), 4);
    }

    #[test]
    fn release_only_clears_own_tiles() {
        let mut grid = TileGrid::new();
        grid.occupy(Entity(1), &structure(0, 0, 1));
        grid.occupy(Entity(2), &structure(1, 0, 1));

        // A stale release overlapping a tile now owned by entity 2.
        grid.occupy(Entity(2), &structure(0, 0, 1));
        grid.release(Entity(1), &structure(0, 0, 2));

        assert_eq!(grid.at(0, 0), Some(Entity(2)));
        assert_eq!(grid.at(1, 0), Some(Entity(2)));
    }

    #[test]
    fn edges_clip_instead_of_panicking() {
        let mut grid = TileGrid::new();
        grid.occupy(Entity(5), &structure(MAP_TILES - 1, MAP_TILES - 1, 2));

        assert_eq!(grid.at(MAP_TILES - 1, MAP_TILES - 1), Some(Entity(5)));
        assert_eq!(grid.at(MAP_TILES, MAP_TILES), None);
        assert_eq!(grid.occupied_tiles(), 1);

        grid.release(Entity(5), &structure(MAP_TILES - 1, MAP_TILES - 1, 2));
        assert_eq!(grid.occupied_tiles(), 0);
    }

    #[test]
    fn out_of_bounds_reads_are_empty() {
        let grid = TileGrid::new();
        assert_eq!(grid.at(-1, 0), None);
        assert_eq!(grid.at(0, -1), None);
        assert_eq!(grid.at(MAP_TILES, 0), None);
    }
}
