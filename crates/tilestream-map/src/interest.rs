use crate::core::{ChunkCoord, ObserverId, SmallKeyHashMap, SmallKeyHashSet, WorldBounds};

use itertools::Itertools;
use parking_lot::{Mutex, RwLock};

/// One observer's area of interest.
#[derive(Clone, Debug)]
pub struct EntityAoi {
    pub center: ChunkCoord,
    /// Chunks this observer needs active.
    pub active: SmallKeyHashSet<ChunkCoord>,
    /// Chunks this observer needs resident. Always a superset of `active`.
    pub preload: SmallKeyHashSet<ChunkCoord>,
    /// Bumped each time the observer (re)enables chunk events, so clients can drop notifications from an older stream.
    pub stream_epoch: u32,
    pub send_chunk_events: bool,
}

/// Which observers care about one chunk. An observer is in at most one of the sets.
#[derive(Clone, Debug, Default)]
pub struct ChunkInterest {
    pub active: SmallKeyHashSet<ObserverId>,
    /// Observers that only need the chunk resident.
    pub preload: SmallKeyHashSet<ObserverId>,
}

impl ChunkInterest {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.preload.is_empty()
    }

    pub fn level(&self) -> InterestLevel {
        if !self.active.is_empty() {
            InterestLevel::Active
        } else if !self.preload.is_empty() {
            InterestLevel::Preload
        } else {
            InterestLevel::None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum InterestLevel {
    None,
    Preload,
    Active,
}

/// How an observer's active zone changed. Only used for notifications; reconciliation looks at the whole world.
#[derive(Clone, Debug, Default)]
pub struct AoiDelta {
    pub observer: ObserverId,
    pub to_activate: Vec<ChunkCoord>,
    pub to_deactivate: Vec<ChunkCoord>,
    pub send_chunk_events: bool,
    pub stream_epoch: u32,
}

/// Forward (observer to chunks) and reverse (chunk to observers) interest indices.
///
/// Mutations are serialized by `mutation`, so each one sees a consistent pair of indices. Readers only take the read
/// locks and may run concurrently with a mutation in progress.
pub struct InterestTracker {
    bounds: WorldBounds,
    active_radius: i32,
    preload_radius: i32,
    mutation: Mutex<()>,
    aois: RwLock<SmallKeyHashMap<ObserverId, EntityAoi>>,
    interests: RwLock<SmallKeyHashMap<ChunkCoord, ChunkInterest>>,
}

impl InterestTracker {
    pub fn new(bounds: WorldBounds, active_radius: i32, preload_radius: i32) -> Self {
        Self {
            bounds,
            active_radius,
            preload_radius: preload_radius.max(active_radius),
            mutation: Mutex::new(()),
            aois: Default::default(),
            interests: Default::default(),
        }
    }

    fn zones(&self, center: ChunkCoord) -> (SmallKeyHashSet<ChunkCoord>, SmallKeyHashSet<ChunkCoord>) {
        let active = self
            .bounds
            .square_around(center, self.active_radius)
            .collect();
        let preload = self
            .bounds
            .square_around(center, self.preload_radius)
            .collect();
        (active, preload)
    }

    /// Returns `None` if `observer` is already registered.
    pub fn register(
        &self,
        observer: ObserverId,
        center: ChunkCoord,
        send_chunk_events: bool,
    ) -> Option<AoiDelta> {
        let _guard = self.mutation.lock();

        if self.aois.read().contains_key(&observer) {
            return None;
        }

        let (active, preload) = self.zones(center);
        {
            let mut interests = self.interests.write();
            add_interest(&mut interests, observer, &active, &preload);
        }
        let mut to_activate: Vec<_> = active.iter().copied().collect();
        to_activate.sort();
        self.aois.write().insert(
            observer,
            EntityAoi {
                center,
                active,
                preload,
                stream_epoch: 0,
                send_chunk_events,
            },
        );

        Some(AoiDelta {
            observer,
            to_activate,
            to_deactivate: Vec::new(),
            send_chunk_events,
            stream_epoch: 0,
        })
    }

    /// Moves the observer's zones to `center`. Returns `None` when the observer is unknown or the center did not change.
    pub fn update(&self, observer: ObserverId, center: ChunkCoord) -> Option<AoiDelta> {
        let _guard = self.mutation.lock();

        let old = {
            let aois = self.aois.read();
            let aoi = aois.get(&observer)?;
            if aoi.center == center {
                return None;
            }
            aoi.clone()
        };

        let (active, preload) = self.zones(center);
        {
            let mut interests = self.interests.write();
            remove_interest(&mut interests, observer, &old.active, &old.preload);
            add_interest(&mut interests, observer, &active, &preload);
        }

        let mut to_activate: Vec<_> = active.difference(&old.active).copied().collect();
        let mut to_deactivate: Vec<_> = old.active.difference(&active).copied().collect();
        to_activate.sort();
        to_deactivate.sort();

        if let Some(aoi) = self.aois.write().get_mut(&observer) {
            aoi.center = center;
            aoi.active = active;
            aoi.preload = preload;
        }

        Some(AoiDelta {
            observer,
            to_activate,
            to_deactivate,
            send_chunk_events: old.send_chunk_events,
            stream_epoch: old.stream_epoch,
        })
    }

    pub fn unregister(&self, observer: ObserverId) -> Option<EntityAoi> {
        let _guard = self.mutation.lock();

        let aoi = self.aois.write().remove(&observer)?;
        remove_interest(
            &mut self.interests.write(),
            observer,
            &aoi.active,
            &aoi.preload,
        );
        Some(aoi)
    }

    /// Returns how many of `observers` were registered.
    pub fn unregister_many(&self, observers: &[ObserverId]) -> usize {
        let _guard = self.mutation.lock();

        let mut aois = self.aois.write();
        let mut interests = self.interests.write();
        let mut removed = 0;
        for observer in observers {
            if let Some(aoi) = aois.remove(observer) {
                remove_interest(&mut interests, *observer, &aoi.active, &aoi.preload);
                removed += 1;
            }
        }
        removed
    }

    /// Turns on chunk events for `observer` and returns its new stream epoch.
    pub fn enable_events(&self, observer: ObserverId) -> Option<u32> {
        let _guard = self.mutation.lock();

        let mut aois = self.aois.write();
        let aoi = aois.get_mut(&observer)?;
        aoi.stream_epoch = aoi.stream_epoch.wrapping_add(1);
        aoi.send_chunk_events = true;
        Some(aoi.stream_epoch)
    }

    pub fn level(&self, coord: ChunkCoord) -> InterestLevel {
        self.interests
            .read()
            .get(&coord)
            .map_or(InterestLevel::None, |i| i.level())
    }

    pub fn is_interested(&self, coord: ChunkCoord) -> bool {
        self.level(coord) != InterestLevel::None
    }

    pub fn interest(&self, coord: ChunkCoord) -> Option<ChunkInterest> {
        self.interests.read().get(&coord).cloned()
    }

    /// Every chunk somebody is interested in.
    pub fn snapshot(&self) -> SmallKeyHashMap<ChunkCoord, InterestLevel> {
        self.interests
            .read()
            .iter()
            .map(|(coord, interest)| (*coord, interest.level()))
            .collect()
    }

    pub fn num_interested_chunks(&self) -> usize {
        self.interests.read().len()
    }

    pub fn aoi(&self, observer: ObserverId) -> Option<EntityAoi> {
        self.aois.read().get(&observer).cloned()
    }

    pub fn num_observers(&self) -> usize {
        self.aois.read().len()
    }

    pub fn active_chunks(&self, observer: ObserverId) -> Option<Vec<ChunkCoord>> {
        self.aois
            .read()
            .get(&observer)
            .map(|aoi| aoi.active.iter().copied().sorted().collect())
    }

    pub fn observer_chunk(&self, observer: ObserverId) -> Option<ChunkCoord> {
        self.aois.read().get(&observer).map(|aoi| aoi.center)
    }

    pub fn stream_epoch(&self, observer: ObserverId) -> Option<u32> {
        self.aois.read().get(&observer).map(|aoi| aoi.stream_epoch)
    }
}

fn add_interest(
    interests: &mut SmallKeyHashMap<ChunkCoord, ChunkInterest>,
    observer: ObserverId,
    active: &SmallKeyHashSet<ChunkCoord>,
    preload: &SmallKeyHashSet<ChunkCoord>,
) {
    for coord in preload {
        let interest = interests.entry(*coord).or_default();
        if active.contains(coord) {
            interest.active.insert(observer);
        } else {
            interest.preload.insert(observer);
        }
    }
}

fn remove_interest(
    interests: &mut SmallKeyHashMap<ChunkCoord, ChunkInterest>,
    observer: ObserverId,
    active: &SmallKeyHashSet<ChunkCoord>,
    preload: &SmallKeyHashSet<ChunkCoord>,
) {
    for coord in preload.iter().chain(active.iter()) {
        let now_empty = match interests.get_mut(coord) {
            Some(interest) => {
                interest.active.remove(&observer);
                interest.preload.remove(&observer);
                interest.is_empty()
            }
            None => false,
        };
        if now_empty {
            interests.remove(coord);
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
