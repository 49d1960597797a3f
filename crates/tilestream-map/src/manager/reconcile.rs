use super::Shared;
use crate::chunk::{Chunk, ChunkData, ChunkState};
use crate::core::ChunkCoord;
use crate::interest::InterestLevel;
use crate::spatial::Partition;

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

pub(super) type Evicted = Vec<(ChunkCoord, Arc<Chunk>)>;

#[derive(Debug, Eq, PartialEq)]
pub(super) enum Followup {
    None,
    Load,
    /// An unloaded record nobody wants; can be dropped from the resident map.
    Forget,
}

impl Shared {
    /// Visits every chunk that is either wanted or resident.
    pub(super) fn reconcile(&self) {
        self.loads_completed.store(false, Ordering::SeqCst);

        let snapshot = self.interest.snapshot();
        let mut coords: Vec<ChunkCoord> = snapshot.keys().copied().collect();
        coords.extend(
            self.chunks
                .read()
                .keys()
                .filter(|c| !snapshot.contains_key(c))
                .copied(),
        );

        let mut evicted = Evicted::new();
        let mut to_load = Vec::new();
        let mut to_forget = Vec::new();
        for coord in coords {
            match self.reconcile_chunk(coord, &mut evicted) {
                Followup::None => (),
                Followup::Load => to_load.push(coord),
                Followup::Forget => to_forget.push(coord),
            }
        }

        // Requesting a load takes the resident map lock, so it waits until no chunk lock is held.
        for coord in to_load {
            self.request_load(coord);
        }
        for coord in to_forget {
            self.forget_unloaded(coord);
        }
        self.handle_evictions(evicted);
    }

    fn reconcile_chunk(&self, coord: ChunkCoord, evicted: &mut Evicted) -> Followup {
        match self.get_chunk_fast(coord) {
            Some(chunk) => self.reconcile_record(coord, &chunk, evicted),
            None => self.followup_for_absent(coord),
        }
    }

    fn followup_for_absent(&self, coord: ChunkCoord) -> Followup {
        if self.interest.is_interested(coord) {
            Followup::Load
        } else {
            Followup::None
        }
    }

    /// `chunk` may have been evicted since it was looked up, in which case it is treated as absent.
    pub(super) fn reconcile_record(
        &self,
        coord: ChunkCoord,
        chunk: &Arc<Chunk>,
        evicted: &mut Evicted,
    ) -> Followup {
        let mut data = chunk.write();
        if data.removed {
            return self.followup_for_absent(coord);
        }
        // The snapshot may be stale by now; only the interest seen under the chunk lock counts.
        let level = self.interest.level(coord);
        match (level, data.state) {
            (_, ChunkState::Loading) => (),
            (InterestLevel::None, ChunkState::Unloaded) => return Followup::Forget,
            (_, ChunkState::Unloaded) => return Followup::Load,

            (InterestLevel::Active, ChunkState::Preloaded | ChunkState::Inactive) => {
                self.activate(chunk, &mut data);
            }
            (InterestLevel::Active, ChunkState::Active) => {
                self.active.write().insert(coord);
            }

            (InterestLevel::Preload, ChunkState::Active) => {
                self.deactivate(coord, &mut data, ChunkState::Preloaded);
            }
            (InterestLevel::Preload, ChunkState::Inactive) => {
                data.state = ChunkState::Preloaded;
                self.cache.lock().remove(&coord);
            }
            (InterestLevel::Preload, ChunkState::Preloaded) => (),

            (InterestLevel::None, ChunkState::Active) => {
                self.deactivate(coord, &mut data, ChunkState::Inactive);
                evicted.extend(self.cache.lock().insert(coord, chunk.clone(), Instant::now()));
            }
            (InterestLevel::None, ChunkState::Preloaded) => {
                data.state = ChunkState::Inactive;
                evicted.extend(self.cache.lock().insert(coord, chunk.clone(), Instant::now()));
            }
            (InterestLevel::None, ChunkState::Inactive) if data.evicting => (),
            (InterestLevel::None, ChunkState::Inactive) => {
                // Covers chunks whose eviction was skipped or whose save failed.
                evicted.extend(
                    self.cache
                        .lock()
                        .insert_if_absent(coord, chunk.clone(), Instant::now()),
                );
            }
        }
        Followup::None
    }

    /// Materializes every raw object as a live entity. Objects that fail to build are logged and dropped.
    pub(super) fn activate(&self, chunk: &Chunk, data: &mut ChunkData) {
        let coord = chunk.coord();
        let raw_objects = mem::take(&mut data.raw_objects);
        let mut failed = 0;
        for raw in &raw_objects {
            match self.engine.build_entity(coord, raw) {
                Ok(handle) => {
                    let partition = if raw.is_static {
                        Partition::Static
                    } else {
                        Partition::Dynamic
                    };
                    data.spatial.add(partition, handle, raw.position());
                }
                Err(e) => {
                    failed += 1;
                    log::warn!("skipping object {} in chunk {}: {}", raw.id, coord, e);
                }
            }
        }
        data.state = ChunkState::Active;
        self.cache.lock().remove(&coord);
        self.active.write().insert(coord);
        log::debug!(
            "activated chunk {} with {} entities ({} failed)",
            coord,
            data.spatial.len(),
            failed
        );
    }

    /// Serializes and despawns every live entity, leaving the chunk in `target`.
    pub(super) fn deactivate(&self, coord: ChunkCoord, data: &mut ChunkData, target: ChunkState) {
        let handles = data.spatial.handles();
        let any_entity_dirty = handles.iter().any(|h| self.engine.is_entity_dirty(*h));

        let mut raw_objects = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.engine.serialize_entity(handle) {
                Ok(raw) => raw_objects.push(raw),
                Err(e) => log::error!("dropping entity {} of chunk {}: {}", handle, coord, e),
            }
            self.engine.despawn_entity(handle);
        }

        data.raw_objects = raw_objects;
        data.spatial.clear();
        if any_entity_dirty {
            data.mark_raw_dirty();
        }
        data.state = target;
        self.active.write().remove(&coord);
        log::debug!("deactivated chunk {} to {}", coord, target);
    }

    fn forget_unloaded(&self, coord: ChunkCoord) {
        let mut chunks = self.chunks.write();
        let chunk = match chunks.get(&coord) {
            Some(chunk) => chunk.clone(),
            None => return,
        };
        let mut data = chunk.write();
        let forgettable = data.state == ChunkState::Unloaded
            && !self.interest.is_interested(coord)
            && !self.futures.has_waiters(coord);
        if forgettable {
            data.removed = true;
            chunks.remove(&coord);
        }
    }
}
