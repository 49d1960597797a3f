//! The tilestream chunk lifecycle engine.
//!
//! # Chunks
//!
//! A 2D world is partitioned into square [`Chunk`](crate::Chunk)s of tiles. Only chunks near an observer are kept in
//! memory; the rest live in a [`ChunkStore`](crate::ChunkStore). Each resident chunk moves through the
//! [`ChunkState`](crate::ChunkState)s as observers approach and leave.
//!
//! ## Interest
//!
//! Every observer (usually a player) has two square zones of chunks around it: the active zone, where entities are live
//! and simulated, and a larger preload zone, where chunks are loaded ahead of time but their objects stay serialized. The
//! [`InterestTracker`](crate::InterestTracker) maintains the union of all zones.
//!
//! ## Entities
//!
//! Chunks store objects as [`RawObject`](crate::RawObject)s. When a chunk becomes active, an
//! [`EntityEngine`](crate::EntityEngine) turns them into live entities indexed by a per-chunk
//! [`SpatialIndex`](crate::SpatialIndex). Deactivation serializes them back.
//!
//! ## Eviction
//!
//! Chunks nobody is interested in wait in an [`ExpiringLru`](crate::ExpiringLru) cache. When they fall out of it they are
//! written back (if dirty) and dropped. See [`ChunkManager`](crate::ChunkManager) for the threading model.

pub use tilestream_core as core;

mod chunk;
mod config;
mod engine;
mod error;
mod future;
mod interest;
mod lru;
mod manager;
mod notify;
mod object;
mod spatial;
mod store;

pub use chunk::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use future::*;
pub use interest::*;
pub use lru::*;
pub use manager::*;
pub use notify::*;
pub use object::*;
pub use spatial::*;
pub use store::*;
