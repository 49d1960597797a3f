use crate::core::WorldBounds;
use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tiles are indexed with `i32` arithmetic, so a chunk's tile count must stay well inside that range.
pub const MAX_CHUNK_SIZE: i32 = 4096;

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Tiles along one edge of a chunk.
    pub chunk_size: i32,
    /// World units along one edge of a tile.
    pub coord_per_tile: i32,
    /// Chebyshev radius, in chunks, of the zone where chunks are kept active.
    pub active_radius: i32,
    /// Chebyshev radius, in chunks, of the zone where chunks are kept loaded. Never smaller than `active_radius`.
    pub preload_radius: i32,
    /// Edge length, in world units, of a spatial index bucket.
    pub spatial_cell_size: i32,
    pub world: WorldBounds,
    pub loader: LoaderConfig,
    pub saver: SaverConfig,
    pub cache: ChunkCacheConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            coord_per_tile: 12,
            active_radius: 1,
            preload_radius: 2,
            spatial_cell_size: 16,
            world: WorldBounds::default(),
            loader: LoaderConfig::default(),
            saver: SaverConfig::default(),
            cache: ChunkCacheConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("chunk_size", self.chunk_size as i64),
            ("coord_per_tile", self.coord_per_tile as i64),
            ("spatial_cell_size", self.spatial_cell_size as i64),
            ("world.width", self.world.width as i64),
            ("world.height", self.world.height as i64),
            ("loader.workers", self.loader.workers as i64),
            ("loader.queue_capacity", self.loader.queue_capacity as i64),
            ("saver.workers", self.saver.workers as i64),
            ("saver.queue_capacity", self.saver.queue_capacity as i64),
            ("cache.capacity", self.cache.capacity as i64),
            ("cache.sweep_interval_ms", self.cache.sweep_interval_ms as i64),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::TooLarge {
                field: "chunk_size",
                value: self.chunk_size as i64,
                max: MAX_CHUNK_SIZE as i64,
            });
        }
        if self.active_radius < 0 {
            return Err(ConfigError::NotPositive {
                field: "active_radius",
                value: self.active_radius as i64,
            });
        }
        if self.preload_radius < self.active_radius {
            return Err(ConfigError::PreloadSmallerThanActive {
                active: self.active_radius,
                preload: self.preload_radius,
            });
        }
        Ok(())
    }

    pub fn tiles_per_chunk(&self) -> usize {
        (self.chunk_size * self.chunk_size) as usize
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Threads pulling from the load queue.
    pub workers: usize,
    /// Load requests beyond this many pending are dropped.
    pub queue_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 512,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SaverConfig {
    /// Threads pulling from the save queue. Also the size of the pool used to flush chunks on shutdown.
    pub workers: usize,
    /// When full, evictions save on the evicting thread instead.
    pub queue_capacity: usize,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 512,
        }
    }
}

/// Controls how long chunks nobody is interested in stay resident.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkCacheConfig {
    /// Maximum number of inactive chunks kept in memory.
    pub capacity: usize,
    /// Inactive chunks untouched for this long are evicted.
    pub ttl_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 60,
            sweep_interval_ms: 1000,
        }
    }
}

impl ChunkCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
