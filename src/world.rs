use crate::{Config, WorldDb};

use std::sync::Arc;
use thiserror::Error;
use tilestream_map::{ChunkError, ChunkManager, EntityEngine, Notifier, StoreError};

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("failed to read config {path:?}: {source}")]
    Config {
        path: String,
        #[source]
        source: ron::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// A chunk manager streaming one map out of its sled database.
pub struct World {
    // Declared first so it stops, and saves, before the database closes.
    chunks: ChunkManager,
    db: WorldDb,
}

impl World {
    pub fn open(
        config: &Config,
        engine: Arc<dyn EntityEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, WorldError> {
        let db = WorldDb::open(&config.database)?;
        let chunks = ChunkManager::new(config.streaming, db.chunks().clone(), engine, notifier)?;
        Ok(Self { chunks, db })
    }

    pub fn open_file(
        path: &str,
        engine: Arc<dyn EntityEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, WorldError> {
        let config = Config::read_file(path).map_err(|source| WorldError::Config {
            path: path.into(),
            source,
        })?;
        Self::open(&config, engine, notifier)
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn db(&self) -> &WorldDb {
        &self.db
    }

    /// Saves every dirty chunk and flushes the database.
    pub fn shutdown(self) -> Result<(), WorldError> {
        self.chunks.stop();
        self.db.flush()?;
        Ok(())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
