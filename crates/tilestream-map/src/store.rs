mod memory;
mod sled_store;

pub use memory::MemoryChunkStore;
pub use sled_store::SledChunkStore;

use crate::core::ChunkCoord;
use crate::error::StoreError;
use crate::object::StoredChunk;

/// Persistent storage for chunks. Called concurrently from I/O worker threads.
pub trait ChunkStore: Send + Sync {
    /// Returns `None` for a chunk that was never saved.
    fn load_chunk(&self, coord: ChunkCoord) -> Result<Option<StoredChunk>, StoreError>;

    fn save_chunk(&self, coord: ChunkCoord, chunk: &StoredChunk) -> Result<(), StoreError>;
}
