//! # Chunk Manager
//!
//! Owns every resident [`Chunk`] and moves each one through its lifecycle as observers come and go:
//!
//! ```text
//! Unloaded -> Loading -> Preloaded <-> Active
//!                 |         ^  |        |
//!                 v         |  v        v
//!             Unloaded     Inactive <---+ -> evicted (saved if dirty)
//! ```
//!
//! Three kinds of threads touch chunks:
//!
//! - **Callers** register, move and unregister observers. Each interest change is followed by a reconciliation pass on
//!   the calling thread, which is the only place entities are built or despawned.
//! - **Load workers** read chunk data from the [`ChunkStore`] and never touch the [`EntityEngine`].
//! - **Save workers** write back chunks evicted from the inactive-chunk cache, then drop them if nobody became
//!   interested in the meantime.
//!
//! There is no global lock. Every transition of a chunk happens under that chunk's write lock, and every transition
//! decision re-reads the current interest while holding it. Cache eviction callbacks run only after all locks are
//! released.
//!
//! Lock order: resident map, then a chunk, then the interest indices. The cache, active set and load futures are
//! leaves.

mod io;
mod reconcile;

#[cfg(test)]
mod test;

use io::SaveRequest;

use crate::chunk::{Chunk, ChunkState};
use crate::config::StreamingConfig;
use crate::core::coordinates::local_tile;
use crate::core::glam::IVec2;
use crate::core::{
    ChunkCoord, EntityHandle, ObserverId, SmallKeyHashMap, SmallKeyHashSet, TileUnits, WorldUnits,
};
use crate::engine::EntityEngine;
use crate::error::ChunkError;
use crate::future::LoadFutures;
use crate::interest::{AoiDelta, InterestTracker};
use crate::lru::ExpiringLru;
use crate::notify::{ChunkEvent, Notifier, Priority};
use crate::spatial::Partition;
use crate::store::ChunkStore;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A point-in-time count of chunks by state, plus lifetime counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkStats {
    pub resident: usize,
    pub unloaded: usize,
    pub loading: usize,
    pub preloaded: usize,
    pub active: usize,
    pub inactive: usize,
    /// Inactive chunks waiting in the eviction cache.
    pub cached: usize,
    pub observers: usize,
    pub load_requests: u64,
    pub save_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Default)]
struct Counters {
    load_requests: AtomicU64,
    save_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// State shared between the manager handle and its worker threads.
struct Shared {
    config: StreamingConfig,
    store: Arc<dyn ChunkStore>,
    engine: Arc<dyn EntityEngine>,
    notifier: Arc<dyn Notifier>,

    chunks: RwLock<SmallKeyHashMap<ChunkCoord, Arc<Chunk>>>,
    /// Coordinates of chunks in [`ChunkState::Active`], for iterating without scanning every resident chunk.
    active: RwLock<SmallKeyHashSet<ChunkCoord>>,
    /// Inactive chunks, in eviction order.
    cache: Mutex<ExpiringLru<ChunkCoord, Arc<Chunk>>>,
    interest: InterestTracker,
    futures: LoadFutures,

    load_tx: Sender<ChunkCoord>,
    save_tx: Sender<SaveRequest>,
    /// Never sent on. Dropping the sender wakes every worker and waiter.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    stopped: AtomicBool,
    /// Set by load workers; the next [`ChunkManager::update`] reconciles the chunks they finished.
    loads_completed: AtomicBool,

    counters: Counters,
}

impl Shared {
    fn get_chunk_fast(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.chunks.read().get(&coord).cloned()
    }

    fn chunk_state(&self, coord: ChunkCoord) -> Option<ChunkState> {
        self.get_chunk_fast(coord).map(|c| c.state())
    }

    fn chunk_of(&self, p: WorldUnits<IVec2>) -> ChunkCoord {
        ChunkCoord::from_world(p, self.config.chunk_size, self.config.coord_per_tile)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn publish_observer_load(&self, observer: ObserverId, coord: ChunkCoord, epoch: u32) {
        let (tiles, version) = match self.get_chunk_fast(coord) {
            Some(chunk) => {
                let data = chunk.read();
                if data.has_tiles() {
                    (Arc::from(data.tiles()), data.version())
                } else {
                    (Arc::from(Vec::new()), 0)
                }
            }
            None => (Arc::from(Vec::new()), 0),
        };
        self.notifier.publish(
            ChunkEvent::ObserverChunkLoad {
                observer,
                coord,
                tiles,
                version,
                epoch,
            },
            Priority::High,
        );
    }

    /// Unloads go out before loads so a client never holds more chunks than its zone allows.
    fn publish_delta(&self, delta: &AoiDelta) {
        if !delta.send_chunk_events {
            return;
        }
        for &coord in &delta.to_deactivate {
            self.notifier.publish(
                ChunkEvent::ObserverChunkUnload {
                    observer: delta.observer,
                    coord,
                    epoch: delta.stream_epoch,
                },
                Priority::High,
            );
        }
        for &coord in &delta.to_activate {
            self.publish_observer_load(delta.observer, coord, delta.stream_epoch);
        }
    }
}

/// Streams chunks in and out of memory around registered observers. See the [module docs](self).
pub struct ChunkManager {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChunkManager {
    /// Validates `config` and starts the load workers, save workers and cache janitor.
    pub fn new(
        config: StreamingConfig,
        store: Arc<dyn ChunkStore>,
        engine: Arc<dyn EntityEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ChunkError> {
        config.validate()?;

        let (load_tx, load_rx) = channel::bounded(config.loader.queue_capacity);
        let (save_tx, save_rx) = channel::bounded(config.saver.queue_capacity);
        let (stop_tx, stop_rx) = channel::bounded(0);

        let shared = Arc::new(Shared {
            config,
            store,
            engine,
            notifier,
            chunks: Default::default(),
            active: Default::default(),
            cache: Mutex::new(ExpiringLru::new(
                config.cache.capacity,
                config.cache.ttl(),
            )),
            interest: InterestTracker::new(
                config.world,
                config.active_radius,
                config.preload_radius,
            ),
            futures: LoadFutures::default(),
            load_tx,
            save_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            stopped: AtomicBool::new(false),
            loads_completed: AtomicBool::new(false),
            counters: Counters::default(),
        });

        // If spawning fails part way, dropping `manager` stops the threads that did start.
        let manager = Self {
            shared,
            workers: Mutex::new(Vec::new()),
        };
        for i in 0..config.loader.workers {
            let rx = load_rx.clone();
            manager.spawn_worker(format!("chunk-load-{}", i), move |shared| {
                shared.run_load_worker(rx)
            })?;
        }
        for i in 0..config.saver.workers {
            let rx = save_rx.clone();
            manager.spawn_worker(format!("chunk-save-{}", i), move |shared| {
                shared.run_save_worker(rx)
            })?;
        }
        manager.spawn_worker("chunk-cache-janitor".into(), |shared| {
            shared.run_cache_janitor()
        })?;

        log::info!(
            "chunk manager started with {} load and {} save workers",
            config.loader.workers,
            config.saver.workers
        );
        Ok(manager)
    }

    fn spawn_worker(
        &self,
        name: String,
        work: impl FnOnce(&Shared) + Send + 'static,
    ) -> Result<(), ChunkError> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || work(&shared))?;
        self.workers.lock().push(handle);
        Ok(())
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.shared.config
    }

    pub fn chunk_of(&self, p: WorldUnits<IVec2>) -> ChunkCoord {
        self.shared.chunk_of(p)
    }

    // ---- Observers ----

    /// Starts tracking an observer at `position`. Does nothing if the observer is already registered.
    pub fn register_entity(
        &self,
        observer: ObserverId,
        position: WorldUnits<IVec2>,
        send_chunk_events: bool,
    ) {
        let center = self.shared.chunk_of(position);
        match self
            .shared
            .interest
            .register(observer, center, send_chunk_events)
        {
            Some(delta) => {
                log::debug!("registered {} at chunk {}", observer, center);
                self.shared.publish_delta(&delta);
                self.reconcile();
            }
            None => log::warn!("{} is already registered", observer),
        }
    }

    /// Recomputes the observer's zones around `position`. Repeating the same chunk is a no-op.
    pub fn update_entity_position(&self, observer: ObserverId, position: WorldUnits<IVec2>) {
        let center = self.shared.chunk_of(position);
        if let Some(delta) = self.shared.interest.update(observer, center) {
            log::debug!("{} moved to chunk {}", observer, center);
            self.shared.publish_delta(&delta);
            self.reconcile();
        }
    }

    /// Movement hook: only does work when the move crosses a chunk border.
    pub fn on_entity_moved(
        &self,
        observer: ObserverId,
        from: WorldUnits<IVec2>,
        to: WorldUnits<IVec2>,
    ) {
        if self.shared.chunk_of(from) != self.shared.chunk_of(to) {
            self.update_entity_position(observer, to);
        }
    }

    pub fn unregister_entity(&self, observer: ObserverId) {
        if self.shared.interest.unregister(observer).is_some() {
            log::debug!("unregistered {}", observer);
            self.reconcile();
        }
    }

    /// Unregisters a batch with a single reconciliation pass.
    pub fn unregister_entities(&self, observers: &[ObserverId]) {
        if self.shared.interest.unregister_many(observers) > 0 {
            self.reconcile();
        }
    }

    /// Turns on chunk events for `observer` under a new stream epoch, and sends a load event for every chunk in its
    /// active zone so the client can rebuild its view from scratch.
    pub fn enable_chunk_events(&self, observer: ObserverId) -> Result<u32, ChunkError> {
        let shared = &*self.shared;
        let epoch = shared
            .interest
            .enable_events(observer)
            .ok_or(ChunkError::UnknownObserver(observer))?;
        for coord in shared
            .interest
            .active_chunks(observer)
            .unwrap_or_default()
        {
            shared.publish_observer_load(observer, coord, epoch);
        }
        Ok(epoch)
    }

    pub fn entity_epoch(&self, observer: ObserverId) -> Option<u32> {
        self.shared.interest.stream_epoch(observer)
    }

    pub fn entity_active_chunks(&self, observer: ObserverId) -> Option<Vec<ChunkCoord>> {
        self.shared.interest.active_chunks(observer)
    }

    /// The chunk at the center of the observer's zones.
    pub fn entity_chunk(&self, observer: ObserverId) -> Option<ChunkCoord> {
        self.shared.interest.observer_chunk(observer)
    }

    // ---- Reconciliation ----

    /// Moves every chunk toward the state its current interest calls for.
    pub fn reconcile(&self) {
        self.shared.reconcile()
    }

    /// Call once per simulation tick. Activates chunks whose loads finished since the previous call.
    pub fn update(&self) {
        if self.shared.loads_completed.load(Ordering::SeqCst) {
            self.shared.reconcile();
        }
    }

    /// Evicts inactive chunks whose time-to-live has run out. The janitor thread also does this periodically.
    pub fn evict_expired(&self) {
        self.shared.evict_expired()
    }

    // ---- Chunk access ----

    /// Returns a loaded chunk, counting the lookup as a cache hit or miss.
    pub fn get_chunk(&self, coord: ChunkCoord) -> Result<Arc<Chunk>, ChunkError> {
        let shared = &*self.shared;
        if !shared.config.world.contains(coord) {
            return Err(ChunkError::OutOfBounds(coord));
        }
        match shared.get_chunk_fast(coord) {
            Some(chunk) if chunk.state().is_loaded() => {
                shared.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(chunk)
            }
            _ => {
                shared.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                Err(ChunkError::NotLoaded(coord))
            }
        }
    }

    /// Returns the resident record in any state, without bounds checks or statistics.
    pub fn get_chunk_fast(&self, coord: ChunkCoord) -> Option<Arc<Chunk>> {
        self.shared.get_chunk_fast(coord)
    }

    pub fn chunk_state(&self, coord: ChunkCoord) -> Option<ChunkState> {
        self.shared.chunk_state(coord)
    }

    pub fn is_resident(&self, coord: ChunkCoord) -> bool {
        self.shared.chunks.read().contains_key(&coord)
    }

    /// Requests loads for the whole preload zone around `position` without registering an observer.
    pub fn preload_chunks_around(&self, position: WorldUnits<IVec2>) {
        let shared = &*self.shared;
        let center = shared.chunk_of(position);
        for coord in shared
            .config
            .world
            .square_around(center, shared.config.preload_radius)
        {
            shared.request_load(coord);
        }
    }

    /// Blocks until the chunk at `coord` is loaded, `deadline` passes, or the manager stops.
    ///
    /// Concurrent waiters on the same chunk share a single load request.
    pub fn wait_preloaded(&self, coord: ChunkCoord, deadline: Instant) -> Result<(), ChunkError> {
        self.shared.wait_preloaded(coord, deadline)
    }

    pub fn wait_preloaded_timeout(
        &self,
        coord: ChunkCoord,
        timeout: Duration,
    ) -> Result<(), ChunkError> {
        self.wait_preloaded(coord, Instant::now() + timeout)
    }

    pub fn active_chunks(&self) -> Vec<Arc<Chunk>> {
        let coords = self.active_chunk_coords();
        let chunks = self.shared.chunks.read();
        coords
            .iter()
            .filter_map(|c| chunks.get(c).cloned())
            .collect()
    }

    pub fn active_chunk_coords(&self) -> Vec<ChunkCoord> {
        self.shared.active.read().iter().copied().sorted().collect()
    }

    pub fn is_chunk_active(&self, coord: ChunkCoord) -> bool {
        self.shared.active.read().contains(&coord)
    }

    // ---- Tiles ----

    /// `false` when the tile's chunk is not loaded.
    pub fn is_tile_passable(&self, tile: TileUnits<IVec2>) -> bool {
        self.with_loaded_tile(tile, |data, local| data.is_tile_passable(local))
            .unwrap_or(false)
    }

    /// `false` when the tile's chunk is not loaded.
    pub fn is_tile_swimmable(&self, tile: TileUnits<IVec2>) -> bool {
        self.with_loaded_tile(tile, |data, local| data.is_tile_swimmable(local))
            .unwrap_or(false)
    }

    fn with_loaded_tile<T>(
        &self,
        tile: TileUnits<IVec2>,
        f: impl FnOnce(&crate::chunk::ChunkData, IVec2) -> T,
    ) -> Option<T> {
        let chunk_size = self.shared.config.chunk_size;
        let chunk = self
            .shared
            .get_chunk_fast(ChunkCoord::from_tile(tile, chunk_size))?;
        let data = chunk.read();
        data.has_tiles()
            .then(|| f(&data, local_tile(tile, chunk_size)))
    }

    /// Changes one tile and returns the chunk's new version.
    pub fn set_tile(&self, tile: TileUnits<IVec2>, tile_id: u8) -> Result<u32, ChunkError> {
        let chunk_size = self.shared.config.chunk_size;
        let coord = ChunkCoord::from_tile(tile, chunk_size);
        let chunk = self
            .shared
            .get_chunk_fast(coord)
            .ok_or(ChunkError::NotLoaded(coord))?;
        let mut data = chunk.write();
        if !data.has_tiles() {
            return Err(ChunkError::NotLoaded(coord));
        }
        data.set_tile(local_tile(tile, chunk_size), tile_id)
            .ok_or(ChunkError::NotLoaded(coord))
    }

    /// A copy of the chunk's tiles and their version, for streaming to clients.
    pub fn chunk_tiles(&self, coord: ChunkCoord) -> Result<(Arc<[u8]>, u32), ChunkError> {
        let chunk = self
            .shared
            .get_chunk_fast(coord)
            .ok_or(ChunkError::NotLoaded(coord))?;
        let data = chunk.read();
        if !data.has_tiles() {
            return Err(ChunkError::NotLoaded(coord));
        }
        Ok((Arc::from(data.tiles()), data.version()))
    }

    // ---- Entities in active chunks ----

    fn resident_chunk_at(&self, p: WorldUnits<IVec2>) -> Result<(ChunkCoord, Arc<Chunk>), ChunkError> {
        let coord = self.shared.chunk_of(p);
        let chunk = self
            .shared
            .get_chunk_fast(coord)
            .ok_or(ChunkError::NotLoaded(coord))?;
        Ok((coord, chunk))
    }

    /// Indexes an entity spawned at runtime (such as a dropped item) in the active chunk containing `position`.
    pub fn add_static_to_chunk_spatial(
        &self,
        handle: EntityHandle,
        position: WorldUnits<IVec2>,
    ) -> Result<(), ChunkError> {
        let (coord, chunk) = self.resident_chunk_at(position)?;
        let mut data = chunk.write();
        if data.state != ChunkState::Active {
            return Err(ChunkError::NotActive(coord));
        }
        data.spatial.add_static(handle, position.into_inner());
        data.mark_raw_dirty();
        Ok(())
    }

    /// Returns `false` if the entity was not indexed there.
    pub fn remove_static_from_chunk_spatial(
        &self,
        handle: EntityHandle,
        position: WorldUnits<IVec2>,
    ) -> bool {
        let (_, chunk) = match self.resident_chunk_at(position) {
            Ok(found) => found,
            Err(_) => return false,
        };
        let mut data = chunk.write();
        let removed = data.spatial.remove_static(handle, position.into_inner());
        if removed {
            data.mark_raw_dirty();
        }
        removed
    }

    /// Moves an entity's index entry after it moved from `from` to `to`.
    ///
    /// Within one chunk this is a spatial update. Across a border into another active chunk the entry moves over; into a
    /// loaded but inactive chunk the entity is serialized into that chunk's raw objects and despawned.
    pub fn migrate_object(
        &self,
        handle: EntityHandle,
        from: WorldUnits<IVec2>,
        to: WorldUnits<IVec2>,
    ) -> Result<(), ChunkError> {
        let shared = &*self.shared;
        let (from_coord, source) = self.resident_chunk_at(from)?;
        let to_coord = shared.chunk_of(to);

        if from_coord == to_coord {
            let mut data = source.write();
            if data.state != ChunkState::Active {
                return Err(ChunkError::NotActive(from_coord));
            }
            if !data.spatial.update_dynamic(handle, from.0, to.0) {
                return Err(ChunkError::EntityNotFound {
                    handle,
                    coord: from_coord,
                });
            }
            return Ok(());
        }

        let target = shared
            .get_chunk_fast(to_coord)
            .ok_or(ChunkError::NotLoaded(to_coord))?;
        let (mut src, mut dst) = write_pair(&source, &target);
        if src.state != ChunkState::Active {
            return Err(ChunkError::NotActive(from_coord));
        }
        if !dst.has_tiles() {
            return Err(ChunkError::NotLoaded(to_coord));
        }
        let partition =
            src.spatial
                .remove(handle, from.0)
                .ok_or(ChunkError::EntityNotFound {
                    handle,
                    coord: from_coord,
                })?;

        if dst.state == ChunkState::Active {
            dst.spatial.add(partition, handle, to.0);
        } else {
            let mut raw = match shared.engine.serialize_entity(handle) {
                Ok(raw) => raw,
                Err(e) => {
                    src.spatial.add(partition, handle, from.0);
                    return Err(e.into());
                }
            };
            raw.set_position(to.0);
            raw.is_static = partition == Partition::Static;
            dst.raw_objects.push(raw);
            shared.engine.despawn_entity(handle);
        }
        src.mark_raw_dirty();
        dst.mark_raw_dirty();
        log::debug!(
            "migrated entity {} from chunk {} to {}",
            handle,
            from_coord,
            to_coord
        );
        Ok(())
    }

    // ---- Introspection ----

    pub fn stats(&self) -> ChunkStats {
        let shared = &*self.shared;
        let mut stats = ChunkStats::default();
        for chunk in shared.chunks.read().values() {
            stats.resident += 1;
            match chunk.state() {
                ChunkState::Unloaded => stats.unloaded += 1,
                ChunkState::Loading => stats.loading += 1,
                ChunkState::Preloaded => stats.preloaded += 1,
                ChunkState::Active => stats.active += 1,
                ChunkState::Inactive => stats.inactive += 1,
            }
        }
        stats.cached = shared.cache.lock().len();
        stats.observers = shared.interest.num_observers();
        let counters = &shared.counters;
        stats.load_requests = counters.load_requests.load(Ordering::Relaxed);
        stats.save_requests = counters.save_requests.load(Ordering::Relaxed);
        stats.cache_hits = counters.cache_hits.load(Ordering::Relaxed);
        stats.cache_misses = counters.cache_misses.load(Ordering::Relaxed);
        stats
    }

    // ---- Shutdown ----

    /// Stops all workers and writes every dirty chunk back to the store. Calling this more than once does nothing.
    ///
    /// Chunks still in the eviction cache are dropped from it without the eviction callback; they are saved below like
    /// every other resident chunk.
    pub fn stop(&self) {
        let shared = &*self.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("stopping chunk manager");

        drop(shared.stop_tx.lock().take());
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                log::error!("chunk worker thread panicked");
            }
        }
        drop(shared.cache.lock().purge());

        shared.save_all_dirty();
    }
}

impl Drop for ChunkManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Locks two different chunks in coordinate order, so opposite migrations can't deadlock.
fn write_pair<'a>(
    a: &'a Chunk,
    b: &'a Chunk,
) -> (
    RwLockWriteGuard<'a, crate::chunk::ChunkData>,
    RwLockWriteGuard<'a, crate::chunk::ChunkData>,
) {
    if a.coord() < b.coord() {
        let ga = a.write();
        let gb = b.write();
        (ga, gb)
    } else {
        let gb = b.write();
        let ga = a.write();
        (ga, gb)
    }
}

impl Shared {
    fn run_cache_janitor(&self) {
        let ticker = channel::tick(self.config.cache.sweep_interval());
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                recv(ticker) -> _ => self.evict_expired(),
            }
        }
    }
}
