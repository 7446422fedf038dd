//! Chunk source reading from chunkdb files.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ChunkSource, UnavailableChunksCallback};
use crate::chunk::{ChunkData, ChunkDataSerialization, ChunkId};
use crate::chunkdb::{read_header, ChunkLocation};
use crate::config::ChunkDbSourceConfig;
use crate::error::{BuildPatchError, BuildPatchResult};
use crate::fs::FileSystem;
use crate::reference_tracker::ReferenceTracker;

/// A chunk source backed by one or more chunkdb files.
///
/// Chunks are loaded on demand and kept until the reference tracker
/// reports no remaining uses. Each load also prefetches upcoming chunks
/// held by the same databases.
pub struct ChunkDbChunkSource {
    config: ChunkDbSourceConfig,
    file_system: Arc<dyn FileSystem>,
    serializer: Arc<dyn ChunkDataSerialization>,
    reference_tracker: Arc<dyn ReferenceTracker>,

    databases: Vec<PathBuf>,
    state: Mutex<State>,
    callback: Mutex<Option<UnavailableChunksCallback>>,
}

#[derive(Default)]
struct State {
    /// Chunks we can still load, with their database index.
    available: HashMap<ChunkId, (usize, ChunkLocation)>,

    cache: HashMap<ChunkId, Arc<ChunkData>>,

    /// Chunks accepted as runtime requirements.
    required: HashSet<ChunkId>,
}

impl ChunkDbChunkSource {
    /// Opens a set of chunk databases.
    ///
    /// Files that are missing or have an invalid header are skipped with
    /// a warning. When several files hold the same chunk the first wins.
    pub fn open(
        config: ChunkDbSourceConfig,
        file_system: Arc<dyn FileSystem>,
        serializer: Arc<dyn ChunkDataSerialization>,
        reference_tracker: Arc<dyn ReferenceTracker>,
        paths: &[PathBuf],
    ) -> Self {
        let mut databases = Vec::new();
        let mut available = HashMap::new();

        for path in paths {
            let header = match read_header(&*file_system, path) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!("Skipping chunk database {:?}: {}", path, e);
                    continue;
                }
            };

            tracing::debug!(
                "Opened chunk database {:?} with {} chunks",
                path,
                header.contents.len()
            );

            let index = databases.len();
            databases.push(path.clone());
            for location in header.contents {
                available.entry(location.id).or_insert((index, location));
            }
        }

        Self {
            config,
            file_system,
            serializer,
            reference_tracker,
            databases,
            state: Mutex::new(State {
                available,
                ..State::default()
            }),
            callback: Mutex::new(None),
        }
    }

    /// Returns the chunks this source can currently provide.
    pub fn available_chunks(&self) -> HashSet<ChunkId> {
        let state = self.state.lock();
        state
            .available
            .keys()
            .chain(state.cache.keys())
            .copied()
            .collect()
    }

    /// Returns the stored size of a chunk, if this source holds it.
    pub fn chunk_size(&self, id: &ChunkId) -> Option<u64> {
        self.state
            .lock()
            .available
            .get(id)
            .map(|(_, location)| location.byte_size as u64)
    }

    /// Returns the number of opened database files.
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    /// Drops cached chunks with no remaining uses.
    fn evict(&self, state: &mut State, keep: &ChunkId) {
        let tracker = &self.reference_tracker;
        state
            .cache
            .retain(|id, _| id == keep || tracker.reference_count(id) > 0);
    }

    /// Loads a chunk into the cache.
    ///
    /// On failure the chunk is no longer available, and is returned in
    /// `lost` if it was a runtime requirement.
    fn load(&self, state: &mut State, id: &ChunkId, lost: &mut HashSet<ChunkId>) -> bool {
        let Some((index, location)) = state.available.get(id).cloned() else {
            return false;
        };

        match self.read_chunk(&self.databases[index], &location) {
            Ok(chunk) => {
                state.cache.insert(*id, Arc::new(chunk));
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load chunk {} from {:?}: {}",
                    id,
                    self.databases[index],
                    e
                );
                state.available.remove(id);
                if state.required.remove(id) {
                    lost.insert(*id);
                }
                false
            }
        }
    }

    fn read_chunk(&self, path: &Path, location: &ChunkLocation) -> BuildPatchResult<ChunkData> {
        let mut reader = self.file_system.create_file_reader(path)?;
        reader.seek(SeekFrom::Start(location.byte_start))?;

        let mut bytes = vec![0u8; location.byte_size as usize];
        reader.read_exact(&mut bytes)?;

        let chunk = self.serializer.load_from_bytes(&bytes)?;
        if chunk.id() != location.id {
            return Err(BuildPatchError::UnexpectedChunk {
                expected: location.id,
                found: chunk.id(),
            });
        }

        Ok(chunk)
    }

    fn prefetch(&self, state: &mut State, lost: &mut HashSet<ChunkId>) {
        let upcoming = self
            .reference_tracker
            .next_references(self.config.prefetch_maximum);

        let mut loaded = 0;
        for id in upcoming {
            if loaded >= self.config.prefetch_minimum
                || state.cache.len() >= self.config.prefetch_maximum
            {
                break;
            }

            if state.cache.contains_key(&id) || !state.available.contains_key(&id) {
                continue;
            }

            if self.load(state, &id, lost) {
                loaded += 1;
            }
        }
    }

    fn report_unavailable(&self, lost: HashSet<ChunkId>) {
        if lost.is_empty() {
            return;
        }

        tracing::info!("{} chunks are no longer available from chunk databases", lost.len());

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(lost);
        }
    }
}

impl ChunkSource for ChunkDbChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        let mut lost = HashSet::new();

        let chunk = {
            let mut state = self.state.lock();
            self.evict(&mut state, id);

            if !state.cache.contains_key(id) && self.load(&mut state, id, &mut lost) {
                self.prefetch(&mut state, &mut lost);
            }

            state.cache.get(id).cloned()
        };

        // Called without holding our lock, as it may come back into the chain
        self.report_unavailable(lost);

        chunk
    }

    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let mut state = self.state.lock();
        let State {
            available,
            cache,
            required,
        } = &mut *state;

        requirements
            .into_iter()
            .filter(|id| {
                if available.contains_key(id) || cache.contains_key(id) {
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
