use crate::config::DatabaseConfig;

use std::sync::Arc;
use tilestream_map::{SledChunkStore, StoreError};

/// The sled database backing one map.
pub struct WorldDb {
    db: sled::Db,
    chunks: Arc<SledChunkStore>,
}

impl WorldDb {
    pub fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut db_config = sled::Config::default().temporary(config.temporary);
        if !config.temporary {
            db_config = db_config.path(&config.path);
        }
        let db = db_config.open()?;
        let chunks = Arc::new(SledChunkStore::open(&db, &config.map_name)?);
        log::info!(
            "opened map {:?} at {:?} with {} saved chunks",
            config.map_name,
            config.path,
            chunks.num_chunks()
        );
        Ok(Self { db, chunks })
    }

    pub fn chunks(&self) -> &Arc<SledChunkStore> {
        &self.chunks
    }

    /// Blocks until every write so far is durable.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
