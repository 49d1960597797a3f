use super::ChunkStore;
use crate::core::ChunkCoord;
use crate::error::StoreError;
use crate::object::{decode_objects, encode_objects, StoredChunk};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{IVec, Transactional, Tree};
use std::io::{self, Read};

const TICK_HEADER_LEN: usize = 8;

/// # Sled Chunk Store
///
/// Chunks are split over two [`sled::Tree`]s that are always written together in one transaction, so a reader never
/// observes tiles from one save and objects from another.
///
/// ## Tiles Tree
///
/// `"{map}-tiles"` maps a [`ChunkCoord::into_sled_key`] to the chunk's last simulated tick (8 bytes, big-endian)
/// followed by an LZ4 frame of the row-major tile ids. Tile data is mostly runs of the same few ids, so it compresses
/// well.
///
/// ## Objects Tree
///
/// `"{map}-objects"` maps the same key to an `rkyv` archive of the chunk's raw objects. Archives are validated on
/// load since they come from disk.
pub struct SledChunkStore {
    tiles: Tree,
    objects: Tree,
}

impl SledChunkStore {
    pub fn open(db: &sled::Db, map_name: &str) -> Result<Self, StoreError> {
        Ok(Self {
            tiles: db.open_tree(format!("{}-tiles", map_name))?,
            objects: db.open_tree(format!("{}-objects", map_name))?,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.tiles.len()
    }

    pub fn contains(&self, coord: ChunkCoord) -> Result<bool, StoreError> {
        Ok(self.tiles.contains_key(coord.into_sled_key())?)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.tiles.flush()?;
        self.objects.flush()?;
        Ok(())
    }
}

impl ChunkStore for SledChunkStore {
    fn load_chunk(&self, coord: ChunkCoord) -> Result<Option<StoredChunk>, StoreError> {
        let key = coord.into_sled_key();
        let tile_bytes = match self.tiles.get(key)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (last_tick, tiles) = decode_tiles(coord, &tile_bytes)?;
        let objects = match self.objects.get(key)? {
            Some(bytes) => decode_objects(coord, &bytes)?,
            None => Vec::new(),
        };
        Ok(Some(StoredChunk {
            tiles,
            last_tick,
            objects,
        }))
    }

    fn save_chunk(&self, coord: ChunkCoord, chunk: &StoredChunk) -> Result<(), StoreError> {
        let key = IVec::from(&coord.into_sled_key()[..]);
        let tile_bytes = IVec::from(encode_tiles(chunk)?);
        let object_bytes = IVec::from(encode_objects(coord, &chunk.objects)?.as_slice());

        (&self.tiles, &self.objects)
            .transaction(
                |(tiles, objects)| -> ConflictableTransactionResult<(), ()> {
                    tiles.insert(key.clone(), tile_bytes.clone())?;
                    objects.insert(key.clone(), object_bytes.clone())?;
                    Ok(())
                },
            )
            .map_err(|e: TransactionError<()>| StoreError::Transaction(format!("{:?}", e)))
    }
}

fn encode_tiles(chunk: &StoredChunk) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::with_capacity(TICK_HEADER_LEN + chunk.tiles.len() / 4);
    bytes.extend_from_slice(&chunk.last_tick.to_be_bytes());
    let mut encoder = FrameEncoder::new(bytes);
    let mut reader = chunk.tiles.as_slice();
    io::copy(&mut reader, &mut encoder)?;
    encoder
        .finish()
        .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
}

fn decode_tiles(coord: ChunkCoord, bytes: &[u8]) -> Result<(u64, Vec<u8>), StoreError> {
    if bytes.len() < TICK_HEADER_LEN {
        return Err(StoreError::Corrupt {
            coord,
            reason: format!("tile record is only {} bytes", bytes.len()),
        });
    }
    let mut tick = [0; TICK_HEADER_LEN];
    tick.copy_from_slice(&bytes[..TICK_HEADER_LEN]);

    let mut tiles = Vec::new();
    FrameDecoder::new(&bytes[TICK_HEADER_LEN..])
        .read_to_end(&mut tiles)
        .map_err(|e| StoreError::Corrupt {
            coord,
            reason: e.to_string(),
        })?;
    Ok((u64::from_be_bytes(tick), tiles))
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
