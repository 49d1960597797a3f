use crate::core::{ChunkCoord, SmallKeyHashMap};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

/// One registration as a waiter on a chunk load.
pub struct LoadWaiter {
    pub coord: ChunkCoord,
    /// Disconnects when the load completes.
    pub done: Receiver<()>,
    id: u64,
    /// Whether this waiter created the future, and so is responsible for requesting the load.
    pub created: bool,
}

struct LoadFuture {
    /// Dropping the only sender wakes every receiver.
    _done_tx: Sender<()>,
    done_rx: Receiver<()>,
    waiters: usize,
    id: u64,
}

/// Pending chunk loads that threads are blocked on, one per chunk.
#[derive(Default)]
pub struct LoadFutures {
    futures: Mutex<FutureMap>,
}

#[derive(Default)]
struct FutureMap {
    by_coord: SmallKeyHashMap<ChunkCoord, LoadFuture>,
    next_id: u64,
}

impl LoadFutures {
    /// Registers a waiter on the load of `coord`, creating the future if nobody else is waiting.
    pub fn wait(&self, coord: ChunkCoord) -> LoadWaiter {
        let mut map = self.futures.lock();
        let FutureMap { by_coord, next_id } = &mut *map;
        if let Some(future) = by_coord.get_mut(&coord) {
            future.waiters += 1;
            return LoadWaiter {
                coord,
                done: future.done_rx.clone(),
                id: future.id,
                created: false,
            };
        }

        *next_id += 1;
        let (done_tx, done_rx) = channel::bounded(0);
        by_coord.insert(
            coord,
            LoadFuture {
                _done_tx: done_tx,
                done_rx: done_rx.clone(),
                waiters: 1,
                id: *next_id,
            },
        );
        LoadWaiter {
            coord,
            done: done_rx,
            id: *next_id,
            created: true,
        }
    }

    /// Wakes all waiters on `coord`.
    pub fn complete(&self, coord: ChunkCoord) {
        // Dropped outside of the lock.
        let completed = self.futures.lock().by_coord.remove(&coord);
        drop(completed);
    }

    /// Deregisters `waiter`. When it was the last one and `load_in_flight` is false, nobody is left to complete the
    /// future, so it is dropped here.
    pub fn release(&self, waiter: LoadWaiter, load_in_flight: bool) {
        let mut map = self.futures.lock();
        let is_idle = match map.by_coord.get_mut(&waiter.coord) {
            // The future was completed or replaced; only the exact one we registered on is ours to release.
            Some(future) if future.id == waiter.id => {
                future.waiters = future.waiters.saturating_sub(1);
                future.waiters == 0
            }
            _ => false,
        };
        if is_idle && !load_in_flight {
            map.by_coord.remove(&waiter.coord);
        }
    }

    pub fn has_waiters(&self, coord: ChunkCoord) -> bool {
        self.futures
            .lock()
            .by_coord
            .get(&coord)
            .map_or(false, |f| f.waiters > 0)
    }

    pub fn len(&self) -> usize {
        self.futures.lock().by_coord.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
