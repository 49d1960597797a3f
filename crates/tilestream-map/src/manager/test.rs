// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

use super::reconcile::{Evicted, Followup};
use super::*;
use crate::chunk::{TILE_DEEP_WATER, TILE_VOID};
use crate::config::{ChunkCacheConfig, LoaderConfig, SaverConfig};
use crate::core::WorldBounds;
use crate::engine::MemoryEntityEngine;
use crate::error::StoreError;
use crate::interest::InterestLevel;
use crate::notify::{ChannelNotifier, NullNotifier};
use crate::object::{RawObject, StoredChunk};
use crate::store::MemoryChunkStore;

const A: ObserverId = ObserverId(1);
const B: ObserverId = ObserverId(2);
const CHUNK_SIZE: i32 = 8;

fn test_config() -> StreamingConfig {
    StreamingConfig {
        chunk_size: CHUNK_SIZE,
        coord_per_tile: 1,
        active_radius: 1,
        preload_radius: 2,
        spatial_cell_size: 4,
        world: WorldBounds::new(-5, -5, 11, 11),
        loader: LoaderConfig {
            workers: 2,
            queue_capacity: 512,
        },
        saver: SaverConfig {
            workers: 2,
            queue_capacity: 512,
        },
        cache: ChunkCacheConfig {
            capacity: 256,
            ttl_secs: 60,
            sweep_interval_ms: 60_000,
        },
    }
}

fn small_cache_config() -> StreamingConfig {
    let mut config = test_config();
    config.cache.capacity = 1;
    config
}

/// A world position inside chunk `c`.
fn world_pos(c: ChunkCoord) -> WorldUnits<IVec2> {
    WorldUnits(IVec2::new(c.x * CHUNK_SIZE + 1, c.y * CHUNK_SIZE + 1))
}

fn tile_in(c: ChunkCoord, local: IVec2) -> TileUnits<IVec2> {
    TileUnits(c.as_ivec2() * CHUNK_SIZE + local)
}

/// Ticks the manager until `cond` holds or a generous timeout passes.
fn wait_until(manager: &ChunkManager, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        manager.update();
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn object(id: u64, x: i32, y: i32, is_static: bool) -> RawObject {
    RawObject {
        id,
        type_id: 1,
        x,
        y,
        is_static,
        data: Vec::new(),
    }
}

fn seeded_chunk(objects: Vec<RawObject>) -> StoredChunk {
    StoredChunk {
        tiles: vec![0; (CHUNK_SIZE * CHUNK_SIZE) as usize],
        last_tick: 1,
        objects,
    }
}

struct Fixture {
    manager: ChunkManager,
    store: Arc<MemoryChunkStore>,
    engine: Arc<MemoryEntityEngine>,
}

fn fixture(config: StreamingConfig) -> Fixture {
    let store = Arc::new(MemoryChunkStore::new());
    let engine = Arc::new(MemoryEntityEngine::new());
    fixture_with(config, store, engine)
}

fn fixture_with(
    config: StreamingConfig,
    store: Arc<MemoryChunkStore>,
    engine: Arc<MemoryEntityEngine>,
) -> Fixture {
    let manager =
        ChunkManager::new(config, store.clone(), engine.clone(), Arc::new(NullNotifier)).unwrap();
    Fixture {
        manager,
        store,
        engine,
    }
}

/// Chunk (0, 0) holds two static objects and one dynamic one.
fn seeded_fixture() -> Fixture {
    let store = Arc::new(MemoryChunkStore::new());
    store.insert(
        ChunkCoord::new(0, 0),
        seeded_chunk(vec![
            object(1, 1, 1, true),
            object(2, 2, 2, true),
            object(3, 5, 5, false),
        ]),
    );
    fixture_with(test_config(), store, Arc::new(MemoryEntityEngine::new()))
}

/// Blocks a store call until the test releases it.
struct Gate {
    started_tx: Sender<()>,
    started_rx: Receiver<()>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl Gate {
    fn new() -> Self {
        let (started_tx, started_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        Self {
            started_tx,
            started_rx,
            release_tx,
            release_rx,
        }
    }

    fn pass(&self) {
        let _ = self.started_tx.send(());
        // Bounded so a failing test can't hang shutdown.
        let _ = self.release_rx.recv_timeout(Duration::from_secs(5));
    }

    fn wait_started(&self) -> bool {
        self.started_rx.recv_timeout(Duration::from_secs(5)).is_ok()
    }

    fn release(&self) {
        let _ = self.release_tx.send(());
    }
}

#[derive(Default)]
struct GatedStore {
    inner: MemoryChunkStore,
    load_gate: Option<Gate>,
    save_gate: Option<Gate>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl ChunkStore for GatedStore {
    fn load_chunk(&self, coord: ChunkCoord) -> Result<Option<StoredChunk>, StoreError> {
        if let Some(gate) = &self.load_gate {
            gate.pass();
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("injected load failure".into()));
        }
        self.inner.load_chunk(coord)
    }

    fn save_chunk(&self, coord: ChunkCoord, chunk: &StoredChunk) -> Result<(), StoreError> {
        if let Some(gate) = &self.save_gate {
            gate.pass();
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("injected save failure".into()));
        }
        self.inner.save_chunk(coord, chunk)
    }
}

fn gated_manager(config: StreamingConfig, store: Arc<GatedStore>) -> ChunkManager {
    ChunkManager::new(
        config,
        store,
        Arc::new(MemoryEntityEngine::new()),
        Arc::new(NullNotifier),
    )
    .unwrap()
}

// ---- Interest-driven lifecycle ----

#[test]
fn register_activates_interior_zone() {
    let f = fixture(test_config());
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(0, 0)), false);

    assert!(wait_until(&f.manager, || {
        let stats = f.manager.stats();
        stats.active == 9 && stats.preloaded == 16
    }));
    assert_eq!(f.manager.active_chunk_coords().len(), 9);
    assert!(f.manager.is_chunk_active(ChunkCoord::new(-1, 1)));
    assert!(!f.manager.is_chunk_active(ChunkCoord::new(2, 0)));
    assert_eq!(f.manager.stats().observers, 1);
    assert_eq!(f.manager.active_chunks().len(), 9);
}

#[test]
fn register_at_world_edge_is_clipped() {
    let f = fixture(test_config());
    f.manager
        .register_entity(B, world_pos(ChunkCoord::new(5, 0)), false);

    assert!(wait_until(&f.manager, || {
        let stats = f.manager.stats();
        stats.active == 6 && stats.preloaded == 9
    }));
    assert_eq!(f.manager.entity_active_chunks(B).unwrap().len(), 6);
    assert!(f.manager.get_chunk_fast(ChunkCoord::new(6, 0)).is_none());
}

#[test]
fn registering_twice_changes_nothing() {
    let f = fixture(test_config());
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(0, 0)), false);
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(4, 4)), false);
    assert_eq!(f.manager.entity_chunk(A), Some(ChunkCoord::new(0, 0)));
}

#[test]
fn unregister_demotes_everything_to_inactive() {
    let f = fixture(test_config());
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(0, 0)), false);
    assert!(wait_until(&f.manager, || f.manager.stats().active == 9
        && f.manager.stats().preloaded == 16));

    f.manager.unregister_entity(A);
    let stats = f.manager.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.preloaded, 0);
    assert_eq!(stats.inactive, 25);
    assert_eq!(stats.cached, 25);
    assert!(f.manager.active_chunk_coords().is_empty());
    assert_eq!(f.manager.entity_chunk(A), None);
}

#[test]
fn unregister_entities_reconciles_once_for_the_batch() {
    let f = fixture(test_config());
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(0, 0)), false);
    f.manager
        .register_entity(B, world_pos(ChunkCoord::new(1, 0)), false);
    assert!(wait_until(&f.manager, || f.manager.stats().active == 12));

    f.manager.unregister_entities(&[A, B, ObserverId(99)]);
    assert_eq!(f.manager.stats().observers, 0);
    assert_eq!(f.manager.stats().active, 0);
}

#[test]
fn moving_observer_promotes_and_demotes() {
    let f = fixture(test_config());
    f.manager
        .register_entity(A, world_pos(ChunkCoord::new(0, 0)), false);
    assert!(wait_until(&f.manager, || f.manager.stats().active == 9));

    f.manager
        .update_entity_position(A, world_pos(ChunkCoord::new(3, 0)));
    // Out of both zones.
    assert_eq!(
        f.manager.chunk_state(ChunkCoord::new(-1, 0)),
        Some(ChunkState::Inactive)
    );
    // Still within the preload zone.
    assert_eq!(
        f.manager.chunk_state(ChunkCoord::new(1, 0)),
        Some(ChunkState::Preloaded)
    );
    assert!(wait_until(&f.manager, || f
        .manager
        .is_chunk_active(ChunkCoord::new(4, 1))));
    assert_eq!(f.manager.entity_chunk(A), Some(ChunkCoord::new(3, 0)));
}

#[test]
fn movement_within_a_chunk_is_ignored() {
    let f = fixture(test_config());
    let start = world_pos(ChunkCoord::new(0, 0));
    f.manager.register_entity(A, start, false);
    let requests = f.manager.stats().load_requests;

    f.manager
        .on_entity_moved(A, start, WorldUnits(start.0 + IVec2::new(3, 3)));
    assert_eq!(f.manager.stats().load_requests, requests);

    f.manager
        .on_entity_moved(A, start, world_pos(ChunkCoord::new(1, 0)));
    assert_eq!(f.manager.entity_chunk(A), Some(ChunkCoord::new(1, 0)));
}

// ---- Activation and deactivation ----

#[test]
fn activation_round_trip_preserves_entities() {
    let f = seeded_fixture();
    let origin = ChunkCoord::new(0, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)));

    let chunk = f.manager.get_chunk(origin).unwrap();
    let handles: Vec<_> = (1..=3).map(|id| f.engine.handle_of(id).unwrap()).collect();
    {
        let data = chunk.read();
        assert!(data.raw_objects.is_empty());
        assert_eq!(data.spatial.static_len(), 2);
        assert_eq!(data.spatial.dynamic_len(), 1);
        assert_eq!(data.spatial.dynamic_handles(), vec![handles[2]]);
    }
    assert_eq!(f.engine.live_count(), 3);

    // Far enough that the origin leaves the preload zone.
    f.manager
        .update_entity_position(A, world_pos(ChunkCoord::new(4, 4)));
    {
        let data = chunk.read();
        assert_eq!(data.state, ChunkState::Inactive);
        assert_eq!(data.raw_objects.len(), 3);
        assert!(data.spatial.is_empty());
        assert!(!data.is_dirty());
    }
    assert_eq!(f.engine.live_count(), 0);

    f.manager.update_entity_position(A, world_pos(origin));
    assert!(f.manager.is_chunk_active(origin));
    let data = chunk.read();
    let mut static_handles = data.spatial.static_handles();
    static_handles.sort();
    assert_eq!(static_handles, vec![handles[0], handles[1]]);
    assert_eq!(data.spatial.dynamic_handles(), vec![handles[2]]);
}

#[test]
fn moved_entity_dirties_chunk_on_deactivation() {
    let f = seeded_fixture();
    let origin = ChunkCoord::new(0, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)));

    let mover = f.engine.handle_of(3).unwrap();
    f.engine.move_entity(mover, IVec2::new(6, 6));
    f.manager.unregister_entity(A);

    let chunk = f.manager.get_chunk_fast(origin).unwrap();
    let data = chunk.read();
    assert!(data.is_raw_dirty());
    let moved = data.raw_objects.iter().find(|o| o.id == 3).unwrap();
    assert_eq!(moved.position(), IVec2::new(6, 6));
}

#[test]
fn build_failure_skips_only_that_object() {
    let store = Arc::new(MemoryChunkStore::new());
    let origin = ChunkCoord::new(0, 0);
    let mut unknown = object(2, 3, 3, false);
    unknown.type_id = 42;
    store.insert(
        origin,
        seeded_chunk(vec![object(1, 1, 1, true), unknown]),
    );
    let engine = Arc::new(MemoryEntityEngine::with_known_types([1]));
    let f = fixture_with(test_config(), store, engine);

    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)));
    assert_eq!(f.engine.live_count(), 1);
    assert_eq!(f.manager.get_chunk(origin).unwrap().read().spatial.len(), 1);
}

// ---- Loading and waiting ----

#[test]
fn concurrent_waiters_share_one_load() {
    let store = Arc::new(GatedStore {
        load_gate: Some(Gate::new()),
        ..Default::default()
    });
    let manager = gated_manager(test_config(), store.clone());
    let coord = ChunkCoord::new(2, 2);

    crossbeam::scope(|s| {
        let first = s.spawn(|_| manager.wait_preloaded_timeout(coord, Duration::from_secs(5)));
        let gate = store.load_gate.as_ref().unwrap();
        assert!(gate.wait_started());
        let second = s.spawn(|_| manager.wait_preloaded_timeout(coord, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        gate.release();

        assert!(first.join().unwrap().is_ok());
        assert!(second.join().unwrap().is_ok());
    })
    .unwrap();

    assert_eq!(store.inner.load_count(), 1);
    assert_eq!(manager.stats().load_requests, 1);
    // Nobody is interested, so the chunk went straight to the cache.
    assert_eq!(manager.chunk_state(coord), Some(ChunkState::Inactive));
    assert_eq!(manager.stats().cached, 1);
}

#[test]
fn wait_times_out_while_load_is_stuck() {
    let store = Arc::new(GatedStore {
        load_gate: Some(Gate::new()),
        ..Default::default()
    });
    let manager = gated_manager(test_config(), store.clone());
    let coord = ChunkCoord::new(0, 0);

    let result = manager.wait_preloaded_timeout(coord, Duration::from_millis(30));
    assert!(matches!(result, Err(ChunkError::Timeout(c)) if c == coord));

    store.load_gate.as_ref().unwrap().release();
    assert!(manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .is_ok());
    assert_eq!(store.inner.load_count(), 1);
}

#[test]
fn wait_outside_world_fails_fast() {
    let f = fixture(test_config());
    assert!(matches!(
        f.manager
            .wait_preloaded_timeout(ChunkCoord::new(50, 0), Duration::from_secs(1)),
        Err(ChunkError::OutOfBounds(_))
    ));
}

#[test]
fn failed_load_reverts_to_unloaded_and_can_retry() {
    let store = Arc::new(GatedStore::default());
    store.fail_loads.store(true, Ordering::SeqCst);
    let manager = gated_manager(test_config(), store.clone());
    let coord = ChunkCoord::new(1, 1);

    let result = manager.wait_preloaded_timeout(coord, Duration::from_secs(5));
    assert!(matches!(result, Err(ChunkError::NotLoaded(_))));
    assert_eq!(manager.chunk_state(coord), Some(ChunkState::Unloaded));

    store.fail_loads.store(false, Ordering::SeqCst);
    assert!(manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .is_ok());
    assert_eq!(manager.stats().load_requests, 2);
}

#[test]
fn preload_around_loads_whole_preload_zone() {
    let f = fixture(test_config());
    f.manager
        .preload_chunks_around(world_pos(ChunkCoord::new(0, 0)));
    assert!(wait_until(&f.manager, || f.manager.stats().inactive == 25));
    assert_eq!(f.store.load_count(), 25);
}

#[test]
fn get_chunk_counts_hits_and_misses() {
    let f = fixture(test_config());
    let coord = ChunkCoord::new(0, 0);
    assert!(matches!(
        f.manager.get_chunk(ChunkCoord::new(-6, 0)),
        Err(ChunkError::OutOfBounds(_))
    ));
    assert!(matches!(
        f.manager.get_chunk(coord),
        Err(ChunkError::NotLoaded(_))
    ));
    f.manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .unwrap();
    assert_eq!(f.manager.get_chunk(coord).unwrap().coord(), coord);

    let stats = f.manager.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[test]
fn full_load_queue_drops_request_until_next_access() {
    let store = Arc::new(GatedStore {
        load_gate: Some(Gate::new()),
        ..Default::default()
    });
    let mut config = test_config();
    config.loader = LoaderConfig {
        workers: 1,
        queue_capacity: 1,
    };
    let manager = gated_manager(config, store.clone());
    let gate = store.load_gate.as_ref().unwrap();
    let (busy, queued, dropped) = (
        ChunkCoord::new(0, 0),
        ChunkCoord::new(1, 0),
        ChunkCoord::new(2, 0),
    );

    manager.shared.request_load(busy);
    assert!(gate.wait_started());
    // The only load worker is stuck on `busy`, so one more request fills the queue.
    manager.shared.request_load(queued);
    manager.shared.request_load(dropped);

    assert_eq!(manager.chunk_state(queued), Some(ChunkState::Loading));
    assert_eq!(manager.chunk_state(dropped), Some(ChunkState::Unloaded));
    assert_eq!(manager.stats().load_requests, 2);

    for _ in 0..3 {
        gate.release();
    }
    assert!(manager
        .wait_preloaded_timeout(dropped, Duration::from_secs(5))
        .is_ok());
    assert_eq!(manager.stats().load_requests, 3);
    assert_eq!(store.inner.load_count(), 3);
    assert!(manager
        .chunk_state(queued)
        .map_or(false, |state| state.is_loaded()));
}

// ---- Eviction ----

#[test]
fn clean_inactive_chunk_is_removed_without_write() {
    let f = fixture(small_cache_config());
    let first = ChunkCoord::new(0, 0);
    let second = ChunkCoord::new(1, 0);
    f.manager
        .wait_preloaded_timeout(first, Duration::from_secs(5))
        .unwrap();
    f.manager
        .wait_preloaded_timeout(second, Duration::from_secs(5))
        .unwrap();

    assert!(wait_until(&f.manager, || !f.manager.is_resident(first)));
    assert!(f.manager.is_resident(second));
    assert_eq!(f.store.save_count(), 0);
    assert_eq!(f.manager.stats().save_requests, 1);
}

#[test]
fn dirty_inactive_chunk_is_saved_before_removal() {
    let f = fixture(small_cache_config());
    let first = ChunkCoord::new(1, 1);
    let tile = tile_in(first, IVec2::new(1, 2));
    f.manager
        .wait_preloaded_timeout(first, Duration::from_secs(5))
        .unwrap();
    assert_eq!(f.manager.set_tile(tile, TILE_VOID).unwrap(), 1);

    f.manager
        .wait_preloaded_timeout(ChunkCoord::new(2, 2), Duration::from_secs(5))
        .unwrap();
    assert!(wait_until(&f.manager, || !f.manager.is_resident(first)));
    assert_eq!(f.store.save_count(), 1);
    let saved = f.store.get(first).unwrap();
    assert_eq!(saved.tiles[(2 * CHUNK_SIZE + 1) as usize], TILE_VOID);

    // Reloading picks up the saved edit.
    f.manager
        .wait_preloaded_timeout(first, Duration::from_secs(5))
        .unwrap();
    assert!(!f.manager.is_tile_passable(tile));
}

#[test]
fn interest_added_mid_save_prevents_removal() {
    let store = Arc::new(GatedStore {
        save_gate: Some(Gate::new()),
        ..Default::default()
    });
    let mut config = test_config();
    config.cache.ttl_secs = 0;
    let (notifier, events) = ChannelNotifier::bounded(1024);
    let manager = ChunkManager::new(
        config,
        store.clone(),
        Arc::new(MemoryEntityEngine::new()),
        Arc::new(notifier),
    )
    .unwrap();
    let coord = ChunkCoord::new(0, 0);

    manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .unwrap();
    manager
        .set_tile(tile_in(coord, IVec2::new(0, 0)), TILE_DEEP_WATER)
        .unwrap();
    manager.evict_expired();

    let gate = store.save_gate.as_ref().unwrap();
    assert!(gate.wait_started());
    // The save worker is now blocked inside the write.
    manager.register_entity(A, world_pos(coord), false);
    assert_eq!(manager.chunk_state(coord), Some(ChunkState::Active));
    gate.release();

    assert!(wait_until(&manager, || store.inner.save_count() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(manager.chunk_state(coord), Some(ChunkState::Active));
    assert!(!manager.get_chunk_fast(coord).unwrap().read().is_dirty());
    let unloaded = events
        .try_iter()
        .any(|(e, _)| e == ChunkEvent::ChunkUnloaded { coord });
    assert!(!unloaded);
}

#[test]
fn failed_save_keeps_chunk_resident_and_dirty() {
    let store = Arc::new(GatedStore::default());
    store.fail_saves.store(true, Ordering::SeqCst);
    let manager = gated_manager(small_cache_config(), store.clone());
    let first = ChunkCoord::new(0, 0);
    manager
        .wait_preloaded_timeout(first, Duration::from_secs(5))
        .unwrap();
    manager
        .set_tile(tile_in(first, IVec2::new(3, 3)), TILE_VOID)
        .unwrap();

    manager
        .wait_preloaded_timeout(ChunkCoord::new(1, 0), Duration::from_secs(5))
        .unwrap();
    assert!(wait_until(&manager, || manager.stats().save_requests >= 1));
    thread::sleep(Duration::from_millis(50));

    assert!(manager.is_resident(first));
    assert!(manager.get_chunk_fast(first).unwrap().read().is_dirty());
    assert_eq!(store.inner.save_count(), 0);
}

#[test]
fn evicted_record_is_never_activated() {
    let f = seeded_fixture();
    let origin = ChunkCoord::new(0, 0);
    f.manager
        .wait_preloaded_timeout(origin, Duration::from_secs(5))
        .unwrap();
    let shared = &*f.manager.shared;

    // A reconciliation pass looked the record up, then the eviction removed it.
    let stale = f.manager.get_chunk_fast(origin).unwrap();
    shared.save_and_remove(origin, &stale);
    assert!(!f.manager.is_resident(origin));
    assert!(stale.read().is_removed());

    // An observer shows up before the stale pass takes the chunk lock.
    assert!(shared.interest.register(A, origin, false).is_some());
    let mut evicted = Evicted::new();
    assert_eq!(
        shared.reconcile_record(origin, &stale, &mut evicted),
        Followup::Load
    );
    assert!(evicted.is_empty());
    assert_eq!(stale.state(), ChunkState::Inactive);
    assert_eq!(stale.read().raw_objects.len(), 3);
    assert!(!f.manager.is_chunk_active(origin));
    assert_eq!(f.engine.live_count(), 0);

    // The observer's own pass loads a fresh record and builds each object once.
    f.manager.reconcile();
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)));
    let resident = f.manager.get_chunk_fast(origin).unwrap();
    assert!(!Arc::ptr_eq(&resident, &stale));
    assert_eq!(resident.read().spatial.len(), 3);
    assert!(stale.read().spatial.is_empty());
    assert_eq!(f.engine.live_count(), 3);

    f.manager.unregister_entity(A);
    assert_eq!(f.engine.live_count(), 0);
    assert_eq!(stale.state(), ChunkState::Inactive);
}

#[test]
fn forgotten_record_is_flagged_removed() {
    let f = fixture(test_config());
    let coord = ChunkCoord::new(3, 3);
    let stale = Arc::new(Chunk::new(coord, CHUNK_SIZE, 4));
    f.manager.shared.chunks.write().insert(coord, stale.clone());

    // Unloaded, unwanted and unawaited.
    f.manager.reconcile();
    assert!(!f.manager.is_resident(coord));
    assert!(stale.read().is_removed());
    assert_eq!(stale.state(), ChunkState::Unloaded);

    // Asking for it again builds a fresh record.
    assert!(f
        .manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .is_ok());
    let resident = f.manager.get_chunk_fast(coord).unwrap();
    assert!(!Arc::ptr_eq(&resident, &stale));
    assert_eq!(stale.state(), ChunkState::Unloaded);
}

#[test]
fn full_save_queue_saves_on_the_evicting_thread() {
    let store = Arc::new(GatedStore {
        save_gate: Some(Gate::new()),
        ..Default::default()
    });
    let mut config = test_config();
    config.saver = SaverConfig {
        workers: 1,
        queue_capacity: 1,
    };
    config.cache.ttl_secs = 0;
    let manager = gated_manager(config, store.clone());
    let gate = store.save_gate.as_ref().unwrap();
    let coords = [
        ChunkCoord::new(0, 0),
        ChunkCoord::new(1, 0),
        ChunkCoord::new(2, 0),
    ];
    let load_and_edit = |coord: ChunkCoord| {
        manager
            .wait_preloaded_timeout(coord, Duration::from_secs(5))
            .unwrap();
        manager
            .set_tile(tile_in(coord, IVec2::new(1, 1)), TILE_VOID)
            .unwrap();
    };

    load_and_edit(coords[0]);
    manager.evict_expired();
    assert!(gate.wait_started());

    // The only save worker is stuck on the first chunk: the second fills the queue and the third overflows it.
    load_and_edit(coords[1]);
    load_and_edit(coords[2]);
    crossbeam::scope(|s| {
        let evictor = s.spawn(|_| manager.evict_expired());
        assert!(gate.wait_started());
        assert!(manager.is_resident(coords[2]));
        for _ in 0..3 {
            gate.release();
        }
        evictor.join().unwrap();
    })
    .unwrap();

    // Written and dropped before `evict_expired` returned.
    assert!(!manager.is_resident(coords[2]));
    let saved = store.inner.get(coords[2]).unwrap();
    assert_eq!(saved.tiles[(CHUNK_SIZE + 1) as usize], TILE_VOID);

    assert!(wait_until(&manager, || coords
        .iter()
        .all(|c| !manager.is_resident(*c))));
    assert_eq!(store.inner.save_count(), 3);
    assert_eq!(manager.stats().save_requests, 3);
}

// ---- Shutdown ----

#[test]
fn stop_saves_every_dirty_chunk() {
    let f = seeded_fixture();
    let origin = ChunkCoord::new(0, 0);
    let ring = ChunkCoord::new(2, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)
        && f.manager.chunk_state(ring) == Some(ChunkState::Preloaded)));

    let mover = f.engine.handle_of(3).unwrap();
    f.engine.move_entity(mover, IVec2::new(6, 6));
    f.manager
        .set_tile(tile_in(ring, IVec2::new(0, 0)), TILE_VOID)
        .unwrap();

    f.manager.stop();
    assert_eq!(f.store.save_count(), 2);
    let saved = f.store.get(origin).unwrap();
    assert_eq!(saved.objects.len(), 3);
    let moved = saved.objects.iter().find(|o| o.id == 3).unwrap();
    assert_eq!(moved.position(), IVec2::new(6, 6));
    assert_eq!(f.store.get(ring).unwrap().tiles[0], TILE_VOID);

    // Stopping again does nothing.
    f.manager.stop();
    assert_eq!(f.store.save_count(), 2);
    assert!(matches!(
        f.manager
            .wait_preloaded_timeout(origin, Duration::from_secs(1)),
        Err(ChunkError::ShuttingDown)
    ));
}

#[test]
fn stop_skips_chunks_already_saved_by_eviction() {
    let f = fixture(small_cache_config());
    let first = ChunkCoord::new(0, 0);
    f.manager
        .wait_preloaded_timeout(first, Duration::from_secs(5))
        .unwrap();
    f.manager
        .set_tile(tile_in(first, IVec2::new(0, 0)), TILE_VOID)
        .unwrap();
    f.manager
        .wait_preloaded_timeout(ChunkCoord::new(0, 1), Duration::from_secs(5))
        .unwrap();
    assert!(wait_until(&f.manager, || !f.manager.is_resident(first)));

    f.manager.stop();
    assert_eq!(f.store.save_count(), 1);
}

// ---- Tiles ----

#[test]
fn tile_queries_handle_negative_coordinates() {
    let f = fixture(test_config());
    let coord = ChunkCoord::new(-1, -1);
    f.manager
        .wait_preloaded_timeout(coord, Duration::from_secs(5))
        .unwrap();

    let tile = TileUnits(IVec2::new(-1, -1));
    assert_eq!(ChunkCoord::from_tile(tile, CHUNK_SIZE), coord);
    assert_eq!(f.manager.set_tile(tile, TILE_DEEP_WATER).unwrap(), 1);
    assert!(!f.manager.is_tile_passable(tile));
    assert!(f.manager.is_tile_swimmable(tile));
    assert!(f.manager.is_tile_passable(TileUnits(IVec2::new(-2, -1))));

    let (tiles, version) = f.manager.chunk_tiles(coord).unwrap();
    assert_eq!(version, 1);
    assert_eq!(tiles[(7 * CHUNK_SIZE + 7) as usize], TILE_DEEP_WATER);

    // Not loaded.
    let far = TileUnits(IVec2::new(30, 30));
    assert!(!f.manager.is_tile_passable(far));
    assert!(matches!(
        f.manager.set_tile(far, TILE_VOID),
        Err(ChunkError::NotLoaded(_))
    ));
}

// ---- Entities ----

#[test]
fn migrate_object_across_chunk_borders() {
    let f = seeded_fixture();
    let origin = ChunkCoord::new(0, 0);
    let east = ChunkCoord::new(1, 0);
    let far_east = ChunkCoord::new(2, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)
        && f.manager.is_chunk_active(east)
        && f.manager.chunk_state(far_east) == Some(ChunkState::Preloaded)));

    let mover = f.engine.handle_of(3).unwrap();
    let (start, middle, end) = (IVec2::new(5, 5), IVec2::new(9, 5), IVec2::new(17, 5));

    // Active to active.
    f.manager
        .migrate_object(mover, WorldUnits(start), WorldUnits(middle))
        .unwrap();
    assert!(f.manager.get_chunk_fast(origin).unwrap().read().spatial.dynamic_handles().is_empty());
    assert_eq!(
        f.manager.get_chunk_fast(east).unwrap().read().spatial.dynamic_handles(),
        vec![mover]
    );

    // Active to preloaded: the entity is stored raw.
    f.manager
        .migrate_object(mover, WorldUnits(middle), WorldUnits(end))
        .unwrap();
    assert!(!f.engine.is_live(mover));
    let target = f.manager.get_chunk_fast(far_east).unwrap();
    let data = target.read();
    assert!(data.is_raw_dirty());
    let raw = data.raw_objects.iter().find(|o| o.id == 3).unwrap();
    assert_eq!(raw.position(), end);
    assert!(!raw.is_static);
    drop(data);

    assert!(matches!(
        f.manager
            .migrate_object(mover, WorldUnits(middle), WorldUnits(start)),
        Err(ChunkError::EntityNotFound { .. })
    ));
}

#[test]
fn runtime_statics_need_an_active_chunk() {
    let f = fixture(test_config());
    let origin = ChunkCoord::new(0, 0);
    let ring = ChunkCoord::new(2, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)
        && f.manager.chunk_state(ring) == Some(ChunkState::Preloaded)));

    let drop_pos = WorldUnits(IVec2::new(2, 3));
    let item = f
        .engine
        .spawn(origin, object(50, drop_pos.0.x, drop_pos.0.y, true))
        .unwrap();
    f.manager
        .add_static_to_chunk_spatial(item, drop_pos)
        .unwrap();
    assert!(matches!(
        f.manager
            .add_static_to_chunk_spatial(item, world_pos(ring)),
        Err(ChunkError::NotActive(_))
    ));

    // Deactivation persists the dropped item with the chunk.
    f.manager.unregister_entity(A);
    let chunk = f.manager.get_chunk_fast(origin).unwrap();
    assert!(chunk.read().raw_objects.iter().any(|o| o.id == 50));

    assert!(!f.manager.remove_static_from_chunk_spatial(item, drop_pos));
}

#[test]
fn remove_runtime_static() {
    let f = fixture(test_config());
    let origin = ChunkCoord::new(0, 0);
    f.manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&f.manager, || f.manager.is_chunk_active(origin)));

    let pos = WorldUnits(IVec2::new(4, 4));
    let item = f.engine.spawn(origin, object(60, 4, 4, true)).unwrap();
    f.manager.add_static_to_chunk_spatial(item, pos).unwrap();
    assert!(f.manager.remove_static_from_chunk_spatial(item, pos));
    assert!(!f.manager.remove_static_from_chunk_spatial(item, pos));
}

// ---- Notifications ----

fn observer_events(events: &Receiver<(ChunkEvent, Priority)>) -> Vec<ChunkEvent> {
    events
        .try_iter()
        .map(|(e, _)| e)
        .filter(|e| {
            matches!(
                e,
                ChunkEvent::ObserverChunkLoad { .. } | ChunkEvent::ObserverChunkUnload { .. }
            )
        })
        .collect()
}

#[test]
fn observer_events_follow_active_zone() {
    let (notifier, events) = ChannelNotifier::bounded(1024);
    let manager = ChunkManager::new(
        test_config(),
        Arc::new(MemoryChunkStore::new()),
        Arc::new(MemoryEntityEngine::new()),
        Arc::new(notifier),
    )
    .unwrap();

    manager.register_entity(A, world_pos(ChunkCoord::new(0, 0)), true);
    let loads = observer_events(&events);
    assert_eq!(loads.len(), 9);
    assert!(loads
        .iter()
        .all(|e| matches!(e, ChunkEvent::ObserverChunkLoad { observer, epoch: 0, .. } if *observer == A)));

    manager.update_entity_position(A, world_pos(ChunkCoord::new(1, 0)));
    let moved = observer_events(&events);
    assert_eq!(moved.len(), 6);
    assert!(moved[..3]
        .iter()
        .all(|e| matches!(e, ChunkEvent::ObserverChunkUnload { coord, .. } if coord.x == -1)));
    assert!(moved[3..]
        .iter()
        .all(|e| matches!(e, ChunkEvent::ObserverChunkLoad { coord, .. } if coord.x == 2)));

    // Silent observers publish nothing.
    manager.register_entity(B, world_pos(ChunkCoord::new(-3, -3)), false);
    assert!(observer_events(&events).is_empty());
}

#[test]
fn enabling_events_bumps_epoch_and_resends_zone() {
    let (notifier, events) = ChannelNotifier::bounded(1024);
    let manager = ChunkManager::new(
        test_config(),
        Arc::new(MemoryChunkStore::new()),
        Arc::new(MemoryEntityEngine::new()),
        Arc::new(notifier),
    )
    .unwrap();
    let origin = ChunkCoord::new(0, 0);
    manager.register_entity(A, world_pos(origin), false);
    assert!(wait_until(&manager, || manager.is_chunk_active(origin)));
    assert_eq!(manager.entity_epoch(A), Some(0));

    assert_eq!(manager.enable_chunk_events(A).unwrap(), 1);
    assert_eq!(manager.entity_epoch(A), Some(1));
    let resent = observer_events(&events);
    assert_eq!(resent.len(), 9);
    let origin_load = resent
        .iter()
        .find(|e| e.coord() == origin)
        .unwrap();
    match origin_load {
        ChunkEvent::ObserverChunkLoad { tiles, epoch, .. } => {
            assert_eq!(*epoch, 1);
            assert_eq!(tiles.len(), (CHUNK_SIZE * CHUNK_SIZE) as usize);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert!(matches!(
        manager.enable_chunk_events(B),
        Err(ChunkError::UnknownObserver(_))
    ));
}

// ---- Concurrency ----

#[test]
fn concurrent_observers_leave_consistent_state() {
    let store = Arc::new(MemoryChunkStore::new());
    let mut next_id = 0;
    for y in -5..=5 {
        for x in -5..=5 {
            next_id += 1;
            store.insert(
                ChunkCoord::new(x, y),
                seeded_chunk(vec![object(
                    next_id,
                    x * CHUNK_SIZE + 2,
                    y * CHUNK_SIZE + 3,
                    next_id % 2 == 0,
                )]),
            );
        }
    }
    let mut config = test_config();
    config.cache.capacity = 4;
    config.cache.ttl_secs = 0;
    let f = fixture_with(config, store, Arc::new(MemoryEntityEngine::new()));
    let done = AtomicBool::new(false);

    crossbeam::scope(|s| {
        let evictor = s.spawn(|_| {
            while !done.load(Ordering::SeqCst) {
                f.manager.evict_expired();
                f.manager.update();
                thread::sleep(Duration::from_millis(1));
            }
        });

        let walkers: Vec<_> = (0..4)
            .map(|i: i32| {
                let manager = &f.manager;
                let observer = ObserverId(10 + i as u64);
                let direction = if i % 2 == 0 { 1 } else { -1 };
                s.spawn(move |_| {
                    for round in 0..15 {
                        let start = ChunkCoord::new((i + round) % 7 - 3, (2 * i + round) % 7 - 3);
                        manager.register_entity(observer, world_pos(start), false);
                        for step in 1..=4 {
                            let next = ChunkCoord::new(
                                (start.x + step * direction + 10) % 7 - 3,
                                (start.y + step + 10) % 7 - 3,
                            );
                            manager.update_entity_position(observer, world_pos(next));
                            manager.update();
                        }
                        // The last round stays registered.
                        if round < 14 {
                            manager.unregister_entity(observer);
                        }
                    }
                })
            })
            .collect();
        for walker in walkers {
            walker.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        evictor.join().unwrap();
    })
    .unwrap();

    let shared = &*f.manager.shared;
    f.manager.reconcile();
    assert!(wait_until(&f.manager, || {
        shared.interest.snapshot().into_iter().all(|(coord, level)| {
            let state = f.manager.chunk_state(coord);
            match level {
                InterestLevel::Active => state == Some(ChunkState::Active),
                _ => state == Some(ChunkState::Preloaded),
            }
        })
    }));
    assert_eq!(f.manager.stats().observers, 4);

    for coord in f.manager.active_chunk_coords() {
        assert_eq!(
            f.manager.chunk_state(coord),
            Some(ChunkState::Active),
            "chunk {} is in the active set",
            coord
        );
    }
    for coord in shared.interest.snapshot().keys() {
        assert!(f.manager.is_resident(*coord), "wanted chunk {} is gone", coord);
    }
    let mut indexed = 0;
    for chunk in shared.chunks.read().values() {
        let data = chunk.read();
        if data.state == ChunkState::Active {
            assert!(data.raw_objects.is_empty(), "active chunk {} has raw objects", chunk.coord());
            indexed += data.spatial.len();
        } else {
            assert!(data.spatial.is_empty(), "{} chunk {} has entities", data.state, chunk.coord());
        }
    }
    assert_eq!(f.engine.live_count(), indexed);
}
