//! Walks a handful of observers around a world for a while, editing tiles as they go, and logs what the chunk manager
//! does. Run with `RUST_LOG=info` (or `debug` for every transition).

use tilestream::map::core::coordinates::world_to_tile;
use tilestream::map::core::glam::IVec2;
use tilestream::map::core::{ObserverId, WorldBounds, WorldUnits};
use tilestream::map::{ChannelNotifier, ChunkEvent, MemoryEntityEngine, TILE_VOID};
use tilestream::{World, WorldError};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_CONFIG: &str = "config/soak.ron";
const NUM_OBSERVERS: u64 = 8;
const NUM_TICKS: u32 = 1000;
const TICK: Duration = Duration::from_millis(10);

fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.into());
    if let Err(e) = run(&path) {
        log::error!("soak failed: {}", e);
        std::process::exit(1);
    }
}

fn run(config_path: &str) -> Result<(), WorldError> {
    let (notifier, events) = ChannelNotifier::bounded(8192);
    let world = World::open_file(
        config_path,
        Arc::new(MemoryEntityEngine::new()),
        Arc::new(notifier),
    )?;
    let chunks = world.chunks();
    let config = *chunks.config();
    let arena = Arena::new(config.world, config.chunk_size * config.coord_per_tile);

    let mut walkers: Vec<Walker> = (0..NUM_OBSERVERS).map(|i| arena.spawn(i)).collect();
    for (i, walker) in walkers.iter().enumerate() {
        chunks.register_entity(walker.id, walker.position, i % 2 == 0);
    }

    let mut loads_seen = 0;
    let mut unloads_seen = 0;
    for tick in 0..NUM_TICKS {
        let started = Instant::now();

        for walker in &mut walkers {
            let from = walker.position;
            arena.step(walker);
            chunks.on_entity_moved(walker.id, from, walker.position);
        }
        chunks.update();

        // Dig under one walker now and then, so evictions have something to write.
        if tick % 10 == 0 {
            let walker = &walkers[(tick / 10) as usize % walkers.len()];
            let tile = world_to_tile(walker.position, config.coord_per_tile);
            if let Err(e) = chunks.set_tile(tile, TILE_VOID) {
                log::debug!("skipped edit at {:?}: {}", tile.0, e);
            }
        }

        for (event, _) in events.try_iter() {
            match event {
                ChunkEvent::ChunkLoaded { .. } => loads_seen += 1,
                ChunkEvent::ChunkUnloaded { .. } => unloads_seen += 1,
                _ => (),
            }
        }
        if tick % 100 == 0 {
            log::info!(
                "tick {}: {:?}, {} loads and {} unloads published",
                tick,
                chunks.stats(),
                loads_seen,
                unloads_seen
            );
        }

        if let Some(rest) = TICK.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    let ids: Vec<_> = walkers.iter().map(|w| w.id).collect();
    chunks.unregister_entities(&ids);
    log::info!("all observers gone: {:?}", chunks.stats());

    world.shutdown()
}

struct Walker {
    id: ObserverId,
    position: WorldUnits<IVec2>,
    velocity: IVec2,
}

/// The world, in world units.
struct Arena {
    min: IVec2,
    max: IVec2,
    chunk_extent: i32,
}

impl Arena {
    fn new(bounds: WorldBounds, chunk_extent: i32) -> Self {
        Self {
            min: IVec2::new(bounds.min_x, bounds.min_y) * chunk_extent,
            max: IVec2::new(bounds.max_x(), bounds.max_y()) * chunk_extent - IVec2::ONE,
            chunk_extent,
        }
    }

    /// Walkers start in a ring around the center, each with its own speed and heading.
    fn spawn(&self, i: u64) -> Walker {
        let n = i as i32;
        let center = (self.min + self.max) / 2;
        let offset = IVec2::new(n % 3 - 1, (n / 3) % 3 - 1) * self.chunk_extent * 3;
        let speed = self.chunk_extent / 16 + n;
        let velocity = match i % 4 {
            0 => IVec2::new(speed, 0),
            1 => IVec2::new(0, speed),
            2 => IVec2::new(-speed, speed / 2),
            _ => IVec2::new(speed / 2, -speed),
        };
        Walker {
            id: ObserverId(i + 1),
            position: WorldUnits((center + offset).clamp(self.min, self.max)),
            velocity,
        }
    }

    /// Bounces off the world edges.
    fn step(&self, walker: &mut Walker) {
        let mut p = walker.position.into_inner() + walker.velocity;
        for axis in 0..2 {
            if p[axis] < self.min[axis] || p[axis] > self.max[axis] {
                walker.velocity[axis] = -walker.velocity[axis];
                p[axis] = p[axis].clamp(self.min[axis], self.max[axis]);
            }
        }
        walker.position = WorldUnits(p);
    }
}
