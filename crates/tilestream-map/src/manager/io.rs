use super::reconcile::Evicted;
use super::Shared;
use crate::chunk::{Chunk, ChunkState};
use crate::core::ChunkCoord;
use crate::error::ChunkError;
use crate::notify::{ChunkEvent, Priority};
use crate::object::StoredChunk;

use crossbeam::channel::{self, Receiver, TrySendError};
use crossbeam::select;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub(super) struct SaveRequest {
    coord: ChunkCoord,
    chunk: Arc<Chunk>,
}

impl Shared {
    fn get_or_create_chunk(&self, coord: ChunkCoord) -> Arc<Chunk> {
        if let Some(chunk) = self.get_chunk_fast(coord) {
            return chunk;
        }
        let (chunk_size, cell_size) = (self.config.chunk_size, self.config.spatial_cell_size);
        self.chunks
            .write()
            .entry(coord)
            .or_insert_with(|| Arc::new(Chunk::new(coord, chunk_size, cell_size)))
            .clone()
    }

    /// Queues a load unless the chunk is already loading or loaded. A full queue drops the request; the next
    /// reconciliation pass or waiter asks again.
    pub(super) fn request_load(&self, coord: ChunkCoord) {
        if self.is_stopped() || !self.config.world.contains(coord) {
            return;
        }
        let chunk = self.get_or_create_chunk(coord);
        let mut data = chunk.write();
        if data.removed {
            // Evicted since the lookup; the resident map no longer has this record.
            drop(data);
            return self.request_load(coord);
        }
        if data.state != ChunkState::Unloaded {
            return;
        }
        match self.load_tx.try_send(coord) {
            Ok(()) => {
                // The worker can't observe the chunk until this lock is released.
                data.state = ChunkState::Loading;
                self.counters.load_requests.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("load queue full, dropping load request for chunk {}", coord)
            }
            Err(TrySendError::Disconnected(_)) => (),
        }
    }

    pub(super) fn run_load_worker(&self, requests: Receiver<ChunkCoord>) {
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                recv(requests) -> msg => match msg {
                    Ok(coord) => self.load_chunk(coord),
                    Err(_) => return,
                },
            }
        }
    }

    /// Reads one chunk from the store. Never touches the entity engine; activation is left to reconciliation.
    fn load_chunk(&self, coord: ChunkCoord) {
        let chunk = self.get_or_create_chunk(coord);
        if chunk.state() != ChunkState::Loading {
            self.futures.complete(coord);
            return;
        }

        let result = self.store.load_chunk(coord);

        let mut evicted = Evicted::new();
        let loaded = {
            let mut data = chunk.write();
            match result.and_then(|stored| data.install(coord, stored)) {
                Ok(()) => {
                    if self.interest.is_interested(coord) {
                        data.state = ChunkState::Preloaded;
                    } else {
                        // Loaded for a waiter only; eligible for eviction right away.
                        data.state = ChunkState::Inactive;
                        evicted = self.cache.lock().insert(coord, chunk.clone(), Instant::now());
                    }
                    true
                }
                Err(e) => {
                    log::error!("failed to load chunk {}: {}", coord, e);
                    data.state = ChunkState::Unloaded;
                    false
                }
            }
        };

        // Evictions are queued before waking waiters, so a waiter's next reconciliation sees them as evicting.
        self.handle_evictions(evicted);
        if loaded {
            self.loads_completed.store(true, Ordering::SeqCst);
        }
        self.futures.complete(coord);
        if loaded {
            log::debug!("loaded chunk {}", coord);
            self.notifier
                .publish(ChunkEvent::ChunkLoaded { coord }, Priority::Low);
        }
    }

    pub(super) fn wait_preloaded(&self, coord: ChunkCoord, deadline: Instant) -> Result<(), ChunkError> {
        if !self.config.world.contains(coord) {
            return Err(ChunkError::OutOfBounds(coord));
        }
        if self.is_stopped() {
            return Err(ChunkError::ShuttingDown);
        }
        let is_loaded = || self.chunk_state(coord).map_or(false, |s| s.is_loaded());
        if is_loaded() {
            return Ok(());
        }

        let waiter = self.futures.wait(coord);
        // The load may have finished between the check above and registering.
        if is_loaded() {
            self.futures.release(waiter, false);
            return Ok(());
        }
        if waiter.created {
            self.request_load(coord);
        }

        let result = select! {
            recv(waiter.done) -> _ => {
                if is_loaded() {
                    Ok(())
                } else if self.is_stopped() {
                    Err(ChunkError::ShuttingDown)
                } else {
                    Err(ChunkError::NotLoaded(coord))
                }
            },
            recv(self.stop_rx) -> _ => Err(ChunkError::ShuttingDown),
            recv(channel::at(deadline)) -> _ => Err(ChunkError::Timeout(coord)),
        };

        let load_in_flight = self.chunk_state(coord) == Some(ChunkState::Loading);
        self.futures.release(waiter, load_in_flight);
        result
    }

    pub(super) fn evict_expired(&self) {
        let evicted = self.cache.lock().expire(Instant::now());
        self.handle_evictions(evicted);
    }

    /// Runs eviction callbacks. Must be called without holding any chunk or map lock.
    pub(super) fn handle_evictions(&self, evicted: Evicted) {
        for (coord, chunk) in evicted {
            self.on_evict(coord, chunk);
        }
    }

    fn on_evict(&self, coord: ChunkCoord, chunk: Arc<Chunk>) {
        if self.is_stopped() {
            return;
        }
        if self.interest.is_interested(coord) {
            log::debug!("chunk {} was evicted but is wanted again; keeping it", coord);
            return;
        }
        self.counters.save_requests.fetch_add(1, Ordering::Relaxed);
        chunk.write().evicting = true;
        match self.save_tx.try_send(SaveRequest { coord, chunk }) {
            Ok(()) => (),
            Err(TrySendError::Full(request)) | Err(TrySendError::Disconnected(request)) => {
                log::warn!("save queue full, saving chunk {} on the evicting thread", coord);
                self.save_and_remove(request.coord, &request.chunk);
            }
        }
    }

    pub(super) fn run_save_worker(&self, requests: Receiver<SaveRequest>) {
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                recv(requests) -> msg => match msg {
                    Ok(request) => self.save_and_remove(request.coord, &request.chunk),
                    Err(_) => return,
                },
            }
        }
    }

    /// Writes an evicted chunk if it is dirty, then drops it from the resident map if it is still the same record, still
    /// inactive and clean, and still unwanted.
    ///
    /// The chunk is not locked during the write, so an observer may activate it meanwhile; the final checks catch that.
    /// A failed write leaves the chunk resident and dirty, and the next reconciliation pass puts it back in the cache.
    pub(super) fn save_and_remove(&self, coord: ChunkCoord, chunk: &Arc<Chunk>) {
        if !self.write_back_and_remove(coord, chunk) {
            chunk.write().evicting = false;
        }
    }

    /// Returns whether the chunk was dropped from the resident map.
    fn write_back_and_remove(&self, coord: ChunkCoord, chunk: &Arc<Chunk>) -> bool {
        if self.interest.is_interested(coord) {
            return false;
        }
        let snapshot = {
            let data = chunk.read();
            if data.state != ChunkState::Inactive {
                return false;
            }
            data.is_dirty()
                .then(|| (data.generation(), data.snapshot_for_save(data.raw_objects.clone())))
        };

        if let Some((generation, stored)) = snapshot {
            if let Err(e) = self.store.save_chunk(coord, &stored) {
                log::error!("failed to save chunk {}, keeping it resident: {}", coord, e);
                return false;
            }
            chunk.write().mark_saved(generation);
            log::debug!("saved chunk {}", coord);
        }

        let removed = {
            let mut chunks = self.chunks.write();
            let is_same_record = chunks
                .get(&coord)
                .map_or(false, |resident| Arc::ptr_eq(resident, chunk));
            if !is_same_record {
                return false;
            }
            // Held across the removal, so nothing can act on this record between the checks and the flag.
            let mut data = chunk.write();
            let removable = data.state == ChunkState::Inactive
                && !data.is_dirty()
                && !self.interest.is_interested(coord);
            if removable {
                data.removed = true;
                chunks.remove(&coord);
                self.cache
                    .lock()
                    .remove_if(&coord, |cached| Arc::ptr_eq(cached, chunk));
            }
            removable
        };

        if removed {
            log::debug!("unloaded chunk {}", coord);
            self.notifier
                .publish(ChunkEvent::ChunkUnloaded { coord }, Priority::Low);
        }
        removed
    }

    /// Captures every dirty resident chunk (serializing live entities of active ones on this thread) and writes them
    /// with a short-lived pool of save threads.
    pub(super) fn save_all_dirty(&self) {
        let resident: Vec<Arc<Chunk>> = self.chunks.read().values().cloned().collect();

        let mut pending = Vec::new();
        for chunk in resident {
            let coord = chunk.coord();
            let data = chunk.read();
            let objects = match data.state {
                ChunkState::Active => {
                    let handles = data.spatial.handles();
                    let dirty = data.is_dirty()
                        || handles.iter().any(|h| self.engine.is_entity_dirty(*h));
                    if !dirty {
                        continue;
                    }
                    handles
                        .into_iter()
                        .filter_map(|h| match self.engine.serialize_entity(h) {
                            Ok(raw) => Some(raw),
                            Err(e) => {
                                log::error!("not saving entity {} of chunk {}: {}", h, coord, e);
                                None
                            }
                        })
                        .collect()
                }
                ChunkState::Preloaded | ChunkState::Inactive if data.is_dirty() => {
                    data.raw_objects.clone()
                }
                _ => continue,
            };
            let stored = data.snapshot_for_save(objects);
            let generation = data.generation();
            drop(data);
            pending.push(PendingSave {
                coord,
                generation,
                stored,
                chunk,
            });
        }

        let total = pending.len();
        let saved = AtomicUsize::new(0);
        let (tx, rx) = channel::unbounded();
        for p in pending {
            let _ = tx.send(p);
        }
        drop(tx);

        let num_workers = self.config.saver.workers.min(total).max(1);
        let scope_result = crossbeam::scope(|s| {
            for _ in 0..num_workers {
                let rx = rx.clone();
                let saved = &saved;
                s.spawn(move |_| {
                    for p in rx.iter() {
                        match self.store.save_chunk(p.coord, &p.stored) {
                            Ok(()) => {
                                p.chunk.write().mark_saved(p.generation);
                                saved.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => log::error!("failed to save chunk {} on shutdown: {}", p.coord, e),
                        }
                    }
                });
            }
        });
        if scope_result.is_err() {
            log::error!("a shutdown save thread panicked");
        }

        let saved = saved.into_inner();
        log::info!(
            "chunk manager stopped: saved {} of {} dirty chunks",
            saved,
            total
        );
    }
}

struct PendingSave {
    coord: ChunkCoord,
    generation: u64,
    stored: StoredChunk,
    chunk: Arc<Chunk>,
}
