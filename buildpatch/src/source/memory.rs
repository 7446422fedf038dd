//! In-memory chunk source.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{ChunkSource, UnavailableChunksCallback};
use crate::chunk::{ChunkData, ChunkId};

/// A chunk store held in memory.
#[derive(Default)]
pub struct MemoryChunkSource {
    chunks: RwLock<HashMap<ChunkId, Arc<ChunkData>>>,
    required: Mutex<HashSet<ChunkId>>,
    callback: Mutex<Option<UnavailableChunksCallback>>,
}

impl MemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks(chunks: impl IntoIterator<Item = ChunkData>) -> Self {
        let source = Self::new();
        for chunk in chunks {
            source.insert(chunk);
        }
        source
    }

    pub fn insert(&self, chunk: ChunkData) {
        self.chunks.write().insert(chunk.id(), Arc::new(chunk));
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.read().contains_key(id)
    }

    /// Removes chunks from the store.
    ///
    /// Removed chunks that were accepted as runtime requirements are
    /// reported as unavailable.
    pub fn remove(&self, ids: &[ChunkId]) {
        let mut unavailable = HashSet::new();
        {
            let mut chunks = self.chunks.write();
            let mut required = self.required.lock();
            for id in ids {
                if chunks.remove(id).is_some() && required.remove(id) {
                    unavailable.insert(*id);
                }
            }
        }

        if unavailable.is_empty() {
            return;
        }

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(unavailable);
        }
    }
}

impl ChunkSource for MemoryChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        self.chunks.read().get(id).cloned()
    }

    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let chunks = self.chunks.read();
        let mut required = self.required.lock();

        requirements
            .into_iter()
            .filter(|id| {
                if chunks.contains_key(id) {
                    required.insert(*id);
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        *self.callback.lock() = Some(callback);
    }
}
