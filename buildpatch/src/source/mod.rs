//! Chunk sources.
//!
//! A chunk source can hand out chunks it currently holds. Sources are
//! usually combined into a `ChainedChunkSource` in priority order:
//! chunk databases first, then local caches, then the cloud.

mod chained;
mod chunkdb;
mod cloud;
mod memory;


use std::collections::HashSet;
use std::sync::Arc;

use crate::chunk::{ChunkData, ChunkId};

pub use chained::ChainedChunkSource;
pub use chunkdb::ChunkDbChunkSource;
pub use cloud::{chunk_uri, CloudChunkSource, CLOUD_CHUNKS_DIR};
pub use memory::MemoryChunkSource;

/// Receives chunks that a source can no longer provide.
pub type UnavailableChunksCallback = Arc<dyn Fn(HashSet<ChunkId>) + Send + Sync>;

/// A provider of chunks.
pub trait ChunkSource: Send + Sync {
    /// Returns a chunk if this source can provide it right now.
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>>;

    /// Asks the source to take on more required chunks.
    ///
    /// Returns the subset this source will never be able to provide.
    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId>;

    /// Sets the function called when previously accepted chunks become
    /// unavailable.
    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback);
}
