use crate::core::glam::IVec2;
use crate::core::ChunkCoord;
use crate::error::StoreError;

use rkyv::{AlignedVec, Archive, Deserialize, Infallible, Serialize};

/// The persisted form of a world object while its chunk is not active.
///
/// `data` is opaque to the streaming engine; only the entity engine interprets it.
#[derive(Archive, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[archive(check_bytes)]
pub struct RawObject {
    pub id: u64,
    pub type_id: u32,
    /// World units.
    pub x: i32,
    /// World units.
    pub y: i32,
    /// Static objects never move, so they're indexed separately from dynamic ones.
    pub is_static: bool,
    pub data: Vec<u8>,
}

impl RawObject {
    pub fn position(&self) -> IVec2 {
        IVec2::new(self.x, self.y)
    }

    pub fn set_position(&mut self, p: IVec2) {
        self.x = p.x;
        self.y = p.y;
    }
}

/// Everything a [`ChunkStore`](crate::ChunkStore) persists for one chunk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredChunk {
    pub tiles: Vec<u8>,
    pub last_tick: u64,
    pub objects: Vec<RawObject>,
}

pub fn encode_objects(coord: ChunkCoord, objects: &Vec<RawObject>) -> Result<AlignedVec, StoreError> {
    rkyv::to_bytes::<_, 1024>(objects).map_err(|e| StoreError::Encode {
        coord,
        reason: format!("{:?}", e),
    })
}

/// Validates the archive before deserializing, since the bytes come from disk.
pub fn decode_objects(coord: ChunkCoord, bytes: &[u8]) -> Result<Vec<RawObject>, StoreError> {
    // Stored bytes carry no alignment guarantee.
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<Vec<RawObject>>(&aligned).map_err(|e| {
        StoreError::Corrupt {
            coord,
            reason: format!("{:?}", e),
        }
    })?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|e| StoreError::Corrupt {
            coord,
            reason: format!("{:?}", e),
        })
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
