//! Tilestream: chunk streaming for tile-based 2D worlds, persisted with sled.
//!
//! See [`tilestream_map`] for the chunk lifecycle itself. This crate wires it to a [`Config`] file and a sled database.

mod config;
mod database;
mod world;

pub use config::{Config, DatabaseConfig};
pub use database::WorldDb;
pub use world::{World, WorldError};

pub use tilestream_map as map;
