use crate::core::coordinates::local_tile_index;
use crate::core::glam::IVec2;
use crate::core::{Bitset, ChunkCoord};
use crate::error::StoreError;
use crate::object::{RawObject, StoredChunk};
use crate::spatial::SpatialIndex;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;

pub const TILE_DEEP_WATER: u8 = 1;
pub const TILE_SHALLOW_WATER: u8 = 3;
pub const TILE_SWAMP: u8 = 50;
pub const TILE_SWAMP_GRASS: u8 = 53;
pub const TILE_SWAMP_MUD: u8 = 56;
pub const TILE_VOID: u8 = 255;
/// Tiles of a never-saved chunk.
pub const TILE_DEFAULT: u8 = 0;

pub fn is_passable_tile(tile: u8) -> bool {
    !matches!(
        tile,
        TILE_DEEP_WATER | TILE_SWAMP | TILE_SWAMP_GRASS | TILE_SWAMP_MUD | TILE_VOID
    )
}

pub fn is_swimmable_tile(tile: u8) -> bool {
    matches!(tile, TILE_DEEP_WATER | TILE_SHALLOW_WATER)
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChunkState {
    /// Known but holding no data.
    Unloaded,
    /// A load worker owns the chunk until the read completes.
    Loading,
    /// Data resident, objects still raw, at least one observer wants it nearby.
    Preloaded,
    /// Objects are live entities.
    Active,
    /// Data resident but nobody is interested; eligible for eviction.
    Inactive,
}

impl ChunkState {
    /// Whether tile and object data are resident.
    pub fn is_loaded(self) -> bool {
        matches!(self, Self::Preloaded | Self::Active | Self::Inactive)
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Preloaded => "preloaded",
            Self::Active => "active",
            Self::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// A square region of the world. The coordinates are fixed; everything else sits behind a lock that serializes state
/// transitions of this one chunk.
pub struct Chunk {
    coord: ChunkCoord,
    data: RwLock<ChunkData>,
}

impl Chunk {
    pub fn new(coord: ChunkCoord, chunk_size: i32, cell_size: i32) -> Self {
        Self {
            coord,
            data: RwLock::new(ChunkData::new(chunk_size, cell_size)),
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        self.coord
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ChunkData> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ChunkData> {
        self.data.write()
    }

    pub fn state(&self) -> ChunkState {
        self.data.read().state
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("state", &self.state())
            .finish()
    }
}

pub struct ChunkData {
    pub state: ChunkState,
    chunk_size: i32,
    tiles: Vec<u8>,
    passable: Bitset,
    swimmable: Bitset,
    /// Objects waiting to be materialized. Always empty while [`ChunkState::Active`].
    pub raw_objects: Vec<RawObject>,
    /// Live entities. Always empty unless [`ChunkState::Active`].
    pub spatial: SpatialIndex,
    version: u32,
    pub last_tick: u64,
    tiles_dirty: bool,
    raw_dirty: bool,
    generation: u64,
    /// Set while an eviction save is queued or running, so reconciliation doesn't cache the chunk again.
    pub(crate) evicting: bool,
    /// Set, under this lock, when the record leaves the resident map. A removed record is never touched again; a fresh
    /// one takes its place.
    pub(crate) removed: bool,
}

impl ChunkData {
    fn new(chunk_size: i32, cell_size: i32) -> Self {
        let num_tiles = (chunk_size * chunk_size) as usize;
        Self {
            state: ChunkState::Unloaded,
            chunk_size,
            tiles: Vec::new(),
            passable: Bitset::new(num_tiles),
            swimmable: Bitset::new(num_tiles),
            raw_objects: Vec::new(),
            spatial: SpatialIndex::new(cell_size),
            version: 0,
            last_tick: 0,
            tiles_dirty: false,
            raw_dirty: false,
            generation: 0,
            evicting: false,
            removed: false,
        }
    }

    /// Replaces all resident data with `stored`. A `None` record (never saved) becomes a chunk of default tiles.
    pub fn install(
        &mut self,
        coord: ChunkCoord,
        stored: Option<StoredChunk>,
    ) -> Result<(), StoreError> {
        let expected = (self.chunk_size * self.chunk_size) as usize;
        let stored = stored.unwrap_or_else(|| StoredChunk {
            tiles: vec![TILE_DEFAULT; expected],
            ..Default::default()
        });
        if stored.tiles.len() != expected {
            return Err(StoreError::InvalidTileData {
                coord,
                expected,
                actual: stored.tiles.len(),
            });
        }

        self.tiles = stored.tiles;
        self.rebuild_tile_flags();
        self.raw_objects = stored.objects;
        self.last_tick = stored.last_tick;
        self.spatial.clear();
        self.tiles_dirty = false;
        self.raw_dirty = false;
        Ok(())
    }

    fn rebuild_tile_flags(&mut self) {
        self.passable.clear();
        self.swimmable.clear();
        for (i, &tile) in self.tiles.iter().enumerate() {
            self.passable.assign(i, is_passable_tile(tile));
            self.swimmable.assign(i, is_swimmable_tile(tile));
        }
    }

    pub fn tiles(&self) -> &[u8] {
        &self.tiles
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Loaded, and still the resident record for its coordinate.
    pub fn has_tiles(&self) -> bool {
        self.state.is_loaded() && !self.removed
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn is_tile_passable(&self, local: IVec2) -> bool {
        self.local_index(local)
            .map_or(false, |i| self.passable.get(i))
    }

    pub fn is_tile_swimmable(&self, local: IVec2) -> bool {
        self.local_index(local)
            .map_or(false, |i| self.swimmable.get(i))
    }

    /// Returns the new version, or `None` if `local` is outside of the chunk or no tiles are resident.
    pub fn set_tile(&mut self, local: IVec2, tile: u8) -> Option<u32> {
        let i = self.local_index(local)?;
        self.tiles[i] = tile;
        self.passable.assign(i, is_passable_tile(tile));
        self.swimmable.assign(i, is_swimmable_tile(tile));
        self.version = self.version.wrapping_add(1);
        self.tiles_dirty = true;
        self.generation += 1;
        Some(self.version)
    }

    fn local_index(&self, local: IVec2) -> Option<usize> {
        let in_range = local.x >= 0
            && local.y >= 0
            && local.x < self.chunk_size
            && local.y < self.chunk_size;
        let i = local_tile_index(local, self.chunk_size);
        (in_range && i < self.tiles.len()).then(|| i)
    }

    /// Whether tiles or raw objects changed since the last successful save. Live entities are not considered.
    pub fn is_dirty(&self) -> bool {
        self.tiles_dirty || self.raw_dirty
    }

    pub fn is_raw_dirty(&self) -> bool {
        self.raw_dirty
    }

    pub fn mark_raw_dirty(&mut self) {
        self.raw_dirty = true;
        self.generation += 1;
    }

    /// Increases on every change that makes the chunk dirty.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Clears both dirty flags, unless something changed after the snapshot at `generation` was taken.
    pub fn mark_saved(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.tiles_dirty = false;
        self.raw_dirty = false;
        true
    }

    /// The persisted form of this chunk with `objects` standing in for its entities.
    pub fn snapshot_for_save(&self, objects: Vec<RawObject>) -> StoredChunk {
        StoredChunk {
            tiles: self.tiles.clone(),
            last_tick: self.last_tick,
            objects,
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
