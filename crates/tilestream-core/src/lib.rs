//! Plain data types shared by the tilestream crates: coordinates, ids, bitsets, and small geometry.

pub mod bitset;
pub mod bounds;
pub mod coordinates;
pub mod geometry;
pub mod ids;
pub mod morton;
pub mod units;

use ahash::{AHashMap, AHashSet};
pub type SmallKeyHashMap<K, V> = AHashMap<K, V>;
pub type SmallKeyHashSet<K> = AHashSet<K>;

// Re-exports.
pub use glam;
pub use static_assertions;

pub use bitset::Bitset;
pub use bounds::WorldBounds;
pub use coordinates::ChunkCoord;
pub use geometry::{Aabb2, Circle};
pub use ids::{EntityHandle, ObserverId};
pub use units::{TileUnits, WorldUnits};
