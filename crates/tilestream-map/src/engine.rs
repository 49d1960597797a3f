use crate::core::glam::IVec2;
use crate::core::{ChunkCoord, EntityHandle, SmallKeyHashMap, SmallKeyHashSet};
use crate::error::BuildError;
use crate::object::RawObject;

use parking_lot::Mutex;

/// The live-entity side of the world. Chunks hand their raw objects to the engine on activation and take serialized
/// objects back on deactivation.
///
/// Only ever called from the reconciliation path (and shutdown), never from I/O workers.
pub trait EntityEngine: Send + Sync {
    fn build_entity(&self, chunk: ChunkCoord, raw: &RawObject) -> Result<EntityHandle, BuildError>;

    /// Captures the current state of a live entity, including its current position.
    fn serialize_entity(&self, handle: EntityHandle) -> Result<RawObject, BuildError>;

    fn despawn_entity(&self, handle: EntityHandle);

    /// Whether the entity changed since it was built.
    fn is_entity_dirty(&self, _handle: EntityHandle) -> bool {
        false
    }
}

/// A self-contained [`EntityEngine`] that keeps entities as raw objects in a map.
///
/// An object id always maps to the same handle, so an entity keeps its handle across deactivation and reactivation.
#[derive(Default)]
pub struct MemoryEntityEngine {
    state: Mutex<MemoryEngineState>,
}

#[derive(Default)]
struct MemoryEngineState {
    live: SmallKeyHashMap<EntityHandle, LiveEntity>,
    handles_by_object: SmallKeyHashMap<u64, EntityHandle>,
    next_handle: u64,
    /// When set, objects of any other type fail to build.
    known_types: Option<SmallKeyHashSet<u32>>,
}

struct LiveEntity {
    chunk: ChunkCoord,
    raw: RawObject,
    dirty: bool,
}

impl MemoryEntityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_types(types: impl IntoIterator<Item = u32>) -> Self {
        let engine = Self::default();
        engine.state.lock().known_types = Some(types.into_iter().collect());
        engine
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, handle: EntityHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    pub fn handle_of(&self, object_id: u64) -> Option<EntityHandle> {
        self.state.lock().handles_by_object.get(&object_id).copied()
    }

    pub fn position(&self, handle: EntityHandle) -> Option<IVec2> {
        self.state.lock().live.get(&handle).map(|e| e.raw.position())
    }

    pub fn chunk_of(&self, handle: EntityHandle) -> Option<ChunkCoord> {
        self.state.lock().live.get(&handle).map(|e| e.chunk)
    }

    /// Moves a live entity, marking it dirty. Returns the old position.
    pub fn move_entity(&self, handle: EntityHandle, to: IVec2) -> Option<IVec2> {
        let mut state = self.state.lock();
        let entity = state.live.get_mut(&handle)?;
        let from = entity.raw.position();
        entity.raw.set_position(to);
        entity.dirty = true;
        Some(from)
    }

    /// Spawns an entity that did not come from any chunk, such as a dropped item.
    pub fn spawn(&self, chunk: ChunkCoord, raw: RawObject) -> Result<EntityHandle, BuildError> {
        let handle = self.build_entity(chunk, &raw)?;
        if let Some(entity) = self.state.lock().live.get_mut(&handle) {
            entity.dirty = true;
        }
        Ok(handle)
    }
}

impl EntityEngine for MemoryEntityEngine {
    fn build_entity(&self, chunk: ChunkCoord, raw: &RawObject) -> Result<EntityHandle, BuildError> {
        let mut state = self.state.lock();
        if let Some(known) = &state.known_types {
            if !known.contains(&raw.type_id) {
                return Err(BuildError::UnknownType {
                    object_id: raw.id,
                    type_id: raw.type_id,
                });
            }
        }

        let handle = match state.handles_by_object.get(&raw.id) {
            Some(handle) => *handle,
            None => {
                state.next_handle += 1;
                let handle = EntityHandle::new(state.next_handle).ok_or_else(|| BuildError::Malformed {
                    object_id: raw.id,
                    reason: "handle space exhausted".into(),
                })?;
                state.handles_by_object.insert(raw.id, handle);
                handle
            }
        };
        state.live.insert(
            handle,
            LiveEntity {
                chunk,
                raw: raw.clone(),
                dirty: false,
            },
        );
        Ok(handle)
    }

    fn serialize_entity(&self, handle: EntityHandle) -> Result<RawObject, BuildError> {
        self.state
            .lock()
            .live
            .get(&handle)
            .map(|e| e.raw.clone())
            .ok_or(BuildError::UnknownHandle(handle))
    }

    fn despawn_entity(&self, handle: EntityHandle) {
        self.state.lock().live.remove(&handle);
    }

    fn is_entity_dirty(&self, handle: EntityHandle) -> bool {
        self.state.lock().live.get(&handle).map_or(false, |e| e.dirty)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
