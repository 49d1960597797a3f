use crate::core::{ChunkCoord, ObserverId};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChunkEvent {
    /// A chunk entered an observer's active zone.
    ObserverChunkLoad {
        observer: ObserverId,
        coord: ChunkCoord,
        /// Empty if the chunk was not resident yet; clients pick it up from a later `ChunkLoaded`.
        tiles: Arc<[u8]>,
        version: u32,
        epoch: u32,
    },
    /// A chunk left an observer's active zone.
    ObserverChunkUnload {
        observer: ObserverId,
        coord: ChunkCoord,
        epoch: u32,
    },
    ChunkLoaded {
        coord: ChunkCoord,
    },
    ChunkUnloaded {
        coord: ChunkCoord,
    },
}

impl ChunkEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ObserverChunkLoad { .. } => "chunk.observer.load",
            Self::ObserverChunkUnload { .. } => "chunk.observer.unload",
            Self::ChunkLoaded { .. } => "chunk.loaded",
            Self::ChunkUnloaded { .. } => "chunk.unloaded",
        }
    }

    pub fn coord(&self) -> ChunkCoord {
        match self {
            Self::ObserverChunkLoad { coord, .. }
            | Self::ObserverChunkUnload { coord, .. }
            | Self::ChunkLoaded { coord }
            | Self::ChunkUnloaded { coord } => *coord,
        }
    }
}

/// Fire-and-forget event sink. Implementations must not block the publisher.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: ChunkEvent, priority: Priority);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn publish(&self, _event: ChunkEvent, _priority: Priority) {}
}

/// Forwards events into a bounded channel, dropping them when the consumer falls behind.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: Sender<(ChunkEvent, Priority)>,
}

impl ChannelNotifier {
    pub fn bounded(capacity: usize) -> (Self, Receiver<(ChunkEvent, Priority)>) {
        let (tx, rx) = channel::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn publish(&self, event: ChunkEvent, priority: Priority) {
        match self.tx.try_send((event, priority)) {
            Ok(()) => (),
            Err(TrySendError::Full((event, _))) => {
                log::debug!("event channel full, dropping {} for {}", event.topic(), event.coord());
            }
            Err(TrySendError::Disconnected(_)) => (),
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
