use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;
use std::mem;
use std::num::NonZeroU64;

/// An opaque handle to a live entity, issued by an entity engine.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntityHandle(NonZeroU64);

// The niche keeps optional handles as small as a raw id.
const_assert_eq!(mem::size_of::<Option<EntityHandle>>(), 8);

impl EntityHandle {
    /// Returns `None` for the reserved value `0`.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies an entity that has registered an area of interest.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer {}", self.0)
    }
}
