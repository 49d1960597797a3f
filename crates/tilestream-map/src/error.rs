use crate::core::{ChunkCoord, EntityHandle, ObserverId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: i64 },
    #[error("{field} must be at most {max}, got {value}")]
    TooLarge {
        field: &'static str,
        value: i64,
        max: i64,
    },
    #[error("preload radius {preload} is smaller than active radius {active}")]
    PreloadSmallerThanActive { active: i32, preload: i32 },
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk {0} is not loaded")]
    NotLoaded(ChunkCoord),
    #[error("chunk {0} is not active")]
    NotActive(ChunkCoord),
    #[error("chunk {0} is outside of the world bounds")]
    OutOfBounds(ChunkCoord),
    #[error("timed out waiting for chunk {0} to load")]
    Timeout(ChunkCoord),
    #[error("chunk manager is shutting down")]
    ShuttingDown,
    #[error("{0} is not registered")]
    UnknownObserver(ObserverId),
    #[error("entity {handle} is not indexed in chunk {coord}")]
    EntityNotFound {
        handle: EntityHandle,
        coord: ChunkCoord,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("failed to encode objects of chunk {coord}: {reason}")]
    Encode { coord: ChunkCoord, reason: String },
    #[error("corrupt record for chunk {coord}: {reason}")]
    Corrupt { coord: ChunkCoord, reason: String },
    #[error("chunk {coord} has {actual} tiles, expected {expected}")]
    InvalidTileData {
        coord: ChunkCoord,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unknown object type {type_id} for object {object_id}")]
    UnknownType { object_id: u64, type_id: u32 },
    #[error("malformed object {object_id}: {reason}")]
    Malformed { object_id: u64, reason: String },
    #[error("no live entity for handle {0}")]
    UnknownHandle(EntityHandle),
}
