use crate::units::{TileUnits, WorldUnits};

use glam::IVec2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The coordinates of a chunk, in units of chunks.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns the chunk containing the world-space point `p`.
    ///
    /// Uses floor division, so `(-1, -1)` in world space lands in chunk `(-1, -1)` rather than `(0, 0)`.
    pub fn from_world(p: WorldUnits<IVec2>, chunk_size: i32, coord_per_tile: i32) -> Self {
        Self::from_tile(world_to_tile(p, coord_per_tile), chunk_size)
    }

    /// Returns the chunk containing tile `p`.
    pub fn from_tile(p: TileUnits<IVec2>, chunk_size: i32) -> Self {
        Self::new(p.0.x.div_euclid(chunk_size), p.0.y.div_euclid(chunk_size))
    }

    pub fn as_ivec2(self) -> IVec2 {
        IVec2::new(self.x, self.y)
    }

    /// We implement this manually so the byte order sorts the same way as `(x, y)` when interpreted by [`sled`].
    ///
    /// The sign bit is flipped so negative coordinates sort before positive ones.
    pub fn into_sled_key(self) -> [u8; 8] {
        let mut bytes = [0; 8];
        bytes[..4].copy_from_slice(&flip_sign(self.x).to_be_bytes());
        bytes[4..].copy_from_slice(&flip_sign(self.y).to_be_bytes());
        bytes
    }

    pub fn from_sled_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 8 {
            return None;
        }
        let mut x = [0; 4];
        let mut y = [0; 4];
        x.copy_from_slice(&bytes[..4]);
        y.copy_from_slice(&bytes[4..]);
        Some(Self::new(
            unflip_sign(u32::from_be_bytes(x)),
            unflip_sign(u32::from_be_bytes(y)),
        ))
    }
}

impl From<IVec2> for ChunkCoord {
    fn from(v: IVec2) -> Self {
        Self::new(v.x, v.y)
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

pub fn world_to_tile(p: WorldUnits<IVec2>, coord_per_tile: i32) -> TileUnits<IVec2> {
    TileUnits(IVec2::new(
        p.0.x.div_euclid(coord_per_tile),
        p.0.y.div_euclid(coord_per_tile),
    ))
}

/// The position of tile `p` relative to the minimum corner of its chunk.
pub fn local_tile(p: TileUnits<IVec2>, chunk_size: i32) -> IVec2 {
    IVec2::new(p.0.x.rem_euclid(chunk_size), p.0.y.rem_euclid(chunk_size))
}

/// Row-major index of a chunk-local tile position.
pub fn local_tile_index(local: IVec2, chunk_size: i32) -> usize {
    (local.y * chunk_size + local.x) as usize
}

fn flip_sign(v: i32) -> u32 {
    (v as u32) ^ (1 << 31)
}

fn unflip_sign(v: u32) -> i32 {
    (v ^ (1 << 31)) as i32
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
