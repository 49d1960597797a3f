use super::ChunkStore;
use crate::core::{ChunkCoord, SmallKeyHashMap};
use crate::error::StoreError;
use crate::object::StoredChunk;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps chunks in a map. Counts reads and writes so callers can see how much I/O a workload caused.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<SmallKeyHashMap<ChunkCoord, StoredChunk>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a chunk without counting it as a save.
    pub fn insert(&self, coord: ChunkCoord, chunk: StoredChunk) {
        self.chunks.lock().insert(coord, chunk);
    }

    pub fn get(&self, coord: ChunkCoord) -> Option<StoredChunk> {
        self.chunks.lock().get(&coord).cloned()
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ChunkStore for MemoryChunkStore {
    fn load_chunk(&self, coord: ChunkCoord) -> Result<Option<StoredChunk>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.chunks.lock().get(&coord).cloned())
    }

    fn save_chunk(&self, coord: ChunkCoord, chunk: &StoredChunk) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.chunks.lock().insert(coord, chunk.clone());
        Ok(())
    }
}
