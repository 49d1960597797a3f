use crate::coordinates::ChunkCoord;

use serde::{Deserialize, Serialize};

/// The rectangle of chunk coordinates that exist in a world.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WorldBounds {
    pub min_x: i32,
    pub min_y: i32,
    /// Width in chunks.
    pub width: i32,
    /// Height in chunks.
    pub height: i32,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            width: 50,
            height: 50,
        }
    }
}

impl WorldBounds {
    pub const fn new(min_x: i32, min_y: i32, width: i32, height: i32) -> Self {
        Self {
            min_x,
            min_y,
            width,
            height,
        }
    }

    /// Exclusive.
    pub fn max_x(&self) -> i32 {
        self.min_x + self.width
    }

    /// Exclusive.
    pub fn max_y(&self) -> i32 {
        self.min_y + self.height
    }

    pub fn contains(&self, c: ChunkCoord) -> bool {
        c.x >= self.min_x && c.x < self.max_x() && c.y >= self.min_y && c.y < self.max_y()
    }

    pub fn chunk_count(&self) -> usize {
        self.width.max(0) as usize * self.height.max(0) as usize
    }

    /// Every in-bounds chunk within Chebyshev distance `radius` of `center`, row by row.
    pub fn square_around(&self, center: ChunkCoord, radius: i32) -> impl Iterator<Item = ChunkCoord> {
        let bounds = *self;
        let (min_x, max_x) = (
            (center.x - radius).max(bounds.min_x),
            (center.x + radius).min(bounds.max_x() - 1),
        );
        let (min_y, max_y) = (
            (center.y - radius).max(bounds.min_y),
            (center.y + radius).min(bounds.max_y() - 1),
        );
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| ChunkCoord::new(x, y)))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
