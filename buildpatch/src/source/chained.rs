//! Chained chunk source.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use super::{ChunkSource, UnavailableChunksCallback};
use crate::chunk::{ChunkData, ChunkId};

type Sources = Arc<Vec<Arc<dyn ChunkSource>>>;

/// Presents several sources as one, queried in priority order.
///
/// There is no caching at this layer. Driven from a single thread;
/// each underlying source is responsible for its own synchronization.
pub struct ChainedChunkSource {
    sources: Sources,
}

impl ChainedChunkSource {
    /// Creates a chain.
    ///
    /// # Panics
    ///
    /// Panics if `sources` is empty.
    pub fn new(sources: Vec<Arc<dyn ChunkSource>>) -> Self {
        assert!(
            !sources.is_empty(),
            "A chained chunk source needs at least one source"
        );

        Self {
            sources: Arc::new(sources),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Offers `requirements` to `sources[start..]` in order, returning what
/// none of them accepted.
fn cascade_requirements(
    sources: &[Arc<dyn ChunkSource>],
    start: usize,
    mut requirements: HashSet<ChunkId>,
) -> HashSet<ChunkId> {
    for source in sources.iter().skip(start) {
        if requirements.is_empty() {
            break;
        }
        requirements = source.add_runtime_requirements(requirements);
    }

    requirements
}

impl ChunkSource for ChainedChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        self.sources.iter().find_map(|source| source.get(id))
    }

    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId> {
        cascade_requirements(&self.sources, 0, requirements)
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        let last = self.sources.len() - 1;

        for (idx, source) in self.sources.iter().enumerate() {
            if idx == last {
                source.set_unavailable_chunks_callback(callback.clone());
                continue;
            }

            // Weak, as the sources own their callbacks.
            let sources: Weak<Vec<Arc<dyn ChunkSource>>> = Arc::downgrade(&self.sources);
            let callback = callback.clone();

            source.set_unavailable_chunks_callback(Arc::new(move |unavailable| {
                let Some(sources) = sources.upgrade() else {
                    return;
                };

                let remaining = cascade_requirements(&sources, idx + 1, unavailable);
                if !remaining.is_empty() {
                    callback(remaining);
                }
            }));
        }
    }
}
