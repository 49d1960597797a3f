use crate::core::glam::IVec2;
use crate::core::morton::morton_encode_2d;
use crate::core::{Aabb2, Circle, EntityHandle, SmallKeyHashMap};

use smallvec::SmallVec;

type Bucket = SmallVec<[EntityHandle; 4]>;

/// Which half of a [`SpatialIndex`] an entity lives in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Partition {
    Static,
    Dynamic,
}

/// Buckets entity handles by grid cell, keeping immovable entities apart from moving ones so that the (much more frequent)
/// dynamic updates never touch static buckets.
///
/// Queries are cell-granular: they return every handle in every cell that overlaps the query region, so callers must
/// do their own exact distance checks.
#[derive(Clone, Debug)]
pub struct SpatialIndex {
    cell_size: i32,
    static_cells: SmallKeyHashMap<u64, Bucket>,
    dynamic_cells: SmallKeyHashMap<u64, Bucket>,
    num_static: usize,
    num_dynamic: usize,
}

impl SpatialIndex {
    pub fn new(cell_size: i32) -> Self {
        assert!(cell_size > 0);
        Self {
            cell_size,
            static_cells: Default::default(),
            dynamic_cells: Default::default(),
            num_static: 0,
            num_dynamic: 0,
        }
    }

    pub fn cell_size(&self) -> i32 {
        self.cell_size
    }

    fn cell_key(&self, p: IVec2) -> u64 {
        morton_encode_2d(self.cell_of(p))
    }

    fn cell_of(&self, p: IVec2) -> IVec2 {
        IVec2::new(p.x.div_euclid(self.cell_size), p.y.div_euclid(self.cell_size))
    }

    pub fn add_static(&mut self, handle: EntityHandle, p: IVec2) {
        let key = self.cell_key(p);
        self.static_cells.entry(key).or_default().push(handle);
        self.num_static += 1;
    }

    pub fn add_dynamic(&mut self, handle: EntityHandle, p: IVec2) {
        let key = self.cell_key(p);
        self.dynamic_cells.entry(key).or_default().push(handle);
        self.num_dynamic += 1;
    }

    pub fn add(&mut self, partition: Partition, handle: EntityHandle, p: IVec2) {
        match partition {
            Partition::Static => self.add_static(handle, p),
            Partition::Dynamic => self.add_dynamic(handle, p),
        }
    }

    pub fn remove_static(&mut self, handle: EntityHandle, p: IVec2) -> bool {
        let key = self.cell_key(p);
        let removed = remove_from_bucket(&mut self.static_cells, key, handle);
        if removed {
            self.num_static -= 1;
        }
        removed
    }

    pub fn remove_dynamic(&mut self, handle: EntityHandle, p: IVec2) -> bool {
        let key = self.cell_key(p);
        let removed = remove_from_bucket(&mut self.dynamic_cells, key, handle);
        if removed {
            self.num_dynamic -= 1;
        }
        removed
    }

    /// Removes `handle` from whichever partition has it in the cell of `p`.
    pub fn remove(&mut self, handle: EntityHandle, p: IVec2) -> Option<Partition> {
        if self.remove_dynamic(handle, p) {
            Some(Partition::Dynamic)
        } else if self.remove_static(handle, p) {
            Some(Partition::Static)
        } else {
            None
        }
    }

    /// Moves a dynamic entity. Returns `false` if the handle was not found in the cell of `old`, in which case nothing
    /// is inserted.
    pub fn update_dynamic(&mut self, handle: EntityHandle, old: IVec2, new: IVec2) -> bool {
        let old_key = self.cell_key(old);
        let new_key = self.cell_key(new);
        if old_key == new_key {
            return self
                .dynamic_cells
                .get(&old_key)
                .map_or(false, |b| b.contains(&handle));
        }
        if !remove_from_bucket(&mut self.dynamic_cells, old_key, handle) {
            return false;
        }
        self.dynamic_cells.entry(new_key).or_default().push(handle);
        true
    }

    /// Appends every handle in cells overlapping the bounding box of the circle of `radius` around `center`.
    pub fn query_radius(&self, center: IVec2, radius: i32, out: &mut Vec<EntityHandle>) {
        let circle = Circle::new(center.as_vec2(), radius as f32);
        self.query_aabb(circle.aabb(), out)
    }

    /// Appends every handle in cells overlapping `aabb`.
    pub fn query_aabb(&self, aabb: Aabb2, out: &mut Vec<EntityHandle>) {
        if aabb.is_empty() || self.is_empty() {
            return;
        }
        let cells = aabb.cells(self.cell_size);
        for y in cells.min.y..=cells.max.y {
            for x in cells.min.x..=cells.max.x {
                let key = morton_encode_2d(IVec2::new(x, y));
                for map in [&self.static_cells, &self.dynamic_cells] {
                    if let Some(bucket) = map.get(&key) {
                        out.extend_from_slice(bucket);
                    }
                }
            }
        }
    }

    pub fn static_len(&self) -> usize {
        self.num_static
    }

    pub fn dynamic_len(&self) -> usize {
        self.num_dynamic
    }

    pub fn len(&self) -> usize {
        self.num_static + self.num_dynamic
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn static_handles(&self) -> Vec<EntityHandle> {
        self.static_cells.values().flatten().copied().collect()
    }

    pub fn dynamic_handles(&self) -> Vec<EntityHandle> {
        self.dynamic_cells.values().flatten().copied().collect()
    }

    pub fn handles(&self) -> Vec<EntityHandle> {
        let mut handles = self.static_handles();
        handles.extend(self.dynamic_cells.values().flatten().copied());
        handles
    }

    pub fn clear(&mut self) {
        self.static_cells.clear();
        self.dynamic_cells.clear();
        self.num_static = 0;
        self.num_dynamic = 0;
    }
}

fn remove_from_bucket(
    cells: &mut SmallKeyHashMap<u64, Bucket>,
    key: u64,
    handle: EntityHandle,
) -> bool {
    let bucket = match cells.get_mut(&key) {
        Some(b) => b,
        None => return false,
    };
    let i = match bucket.iter().position(|h| *h == handle) {
        Some(i) => i,
        None => return false,
    };
    bucket.swap_remove(i);
    if bucket.is_empty() {
        cells.remove(&key);
    }
    true
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    fn h(raw: u64) -> EntityHandle {
        EntityHandle::new(raw).unwrap()
    }

    fn sorted(mut v: Vec<EntityHandle>) -> Vec<EntityHandle> {
        v.sort();
        v
    }

    #[test]
    fn partitions_are_counted_separately() {
        let mut index = SpatialIndex::new(16);
        index.add_static(h(1), IVec2::new(0, 0));
        index.add_dynamic(h(2), IVec2::new(3, 3));
        index.add_dynamic(h(3), IVec2::new(100, -100));

        assert_eq!(index.static_len(), 1);
        assert_eq!(index.dynamic_len(), 2);
        assert_eq!(sorted(index.handles()), vec![h(1), h(2), h(3)]);
        assert_eq!(index.dynamic_handles().len(), 2);

        assert_eq!(index.remove(h(1), IVec2::new(0, 0)), Some(Partition::Static));
        assert_eq!(index.remove(h(1), IVec2::new(0, 0)), None);
        assert_eq!(index.len(), 2);

        index.clear();
        assert!(index.is_empty());
        assert!(index.handles().is_empty());
    }

    #[test]
    fn query_appends_to_buffer() {
        let mut index = SpatialIndex::new(16);
        index.add_dynamic(h(1), IVec2::new(5, 5));
        index.add_static(h(2), IVec2::new(20, 5));
        index.add_dynamic(h(3), IVec2::new(500, 500));

        let mut out = vec![h(99)];
        index.query_radius(IVec2::new(8, 8), 4, &mut out);
        assert_eq!(out, vec![h(99), h(1)]);

        out.clear();
        index.query_aabb(
            Aabb2::from_min_and_max(IVec2::new(0, 0), IVec2::new(31, 31)),
            &mut out,
        );
        assert_eq!(sorted(out), vec![h(1), h(2)]);
    }

    #[test]
    fn negative_positions_bucket_below_zero() {
        let mut index = SpatialIndex::new(16);
        index.add_dynamic(h(1), IVec2::new(-1, -1));

        // Cell (0, 0) must not contain an entity at (-1, -1).
        let mut out = Vec::new();
        index.query_aabb(
            Aabb2::from_min_and_max(IVec2::new(0, 0), IVec2::new(15, 15)),
            &mut out,
        );
        assert!(out.is_empty());

        index.query_aabb(
            Aabb2::from_min_and_max(IVec2::new(-16, -16), IVec2::new(-1, -1)),
            &mut out,
        );
        assert_eq!(out, vec![h(1)]);
    }

    #[test]
    fn update_dynamic_moves_between_cells() {
        let mut index = SpatialIndex::new(16);
        index.add_dynamic(h(1), IVec2::new(1, 1));

        // Same cell is a no-op.
        assert!(index.update_dynamic(h(1), IVec2::new(1, 1), IVec2::new(2, 2)));

        assert!(index.update_dynamic(h(1), IVec2::new(2, 2), IVec2::new(40, 40)));
        let mut out = Vec::new();
        index.query_radius(IVec2::new(1, 1), 1, &mut out);
        assert!(out.is_empty());
        index.query_radius(IVec2::new(40, 40), 1, &mut out);
        assert_eq!(out, vec![h(1)]);
        assert_eq!(index.dynamic_len(), 1);
    }

    #[test]
    fn update_dynamic_of_unknown_handle_inserts_nothing() {
        let mut index = SpatialIndex::new(16);
        assert!(!index.update_dynamic(h(7), IVec2::new(0, 0), IVec2::new(100, 100)));
        assert!(index.is_empty());
        assert!(index.dynamic_handles().is_empty());
    }
}
