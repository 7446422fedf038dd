//! Chunk source downloading from cloud directories.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChunkSource, UnavailableChunksCallback};
use crate::chunk::{ChunkData, ChunkDataSerialization, ChunkId};
use crate::config::CloudSourceConfig;
use crate::download::{DownloadResult, DownloadService, RequestId};
use crate::installer_error::InstallerError;
use crate::reference_tracker::ReferenceTracker;

/// The directory holding chunks under each cloud root.
pub const CLOUD_CHUNKS_DIR: &str = "Chunks";

/// How often a blocked `get` checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A chunk source that downloads chunks through the download service.
///
/// `get` blocks until the chunk arrives, so the download service must be
/// ticked by another thread. Failed downloads are retried with the
/// configured delays, moving to the next cloud directory on each retry.
/// This source accepts every runtime requirement.
pub struct CloudChunkSource {
    config: CloudSourceConfig,
    cloud_dirs: Vec<String>,
    download_service: Arc<DownloadService>,
    serializer: Arc<dyn ChunkDataSerialization>,
    reference_tracker: Arc<dyn ReferenceTracker>,
    cancel: CancellationToken,

    state: Mutex<State>,
    callback: Mutex<Option<UnavailableChunksCallback>>,
}

#[derive(Default)]
struct State {
    cache: HashMap<ChunkId, Arc<ChunkData>>,
    in_flight: HashMap<ChunkId, Download>,

    /// Chunks that failed every attempt.
    failed: HashSet<ChunkId>,

    required: HashSet<ChunkId>,
}

struct Download {
    request: RequestId,
    uri: String,
    receiver: Receiver<DownloadResult>,
}

/// Returns the URI of a chunk under a cloud directory.
pub fn chunk_uri(cloud_dir: &str, id: &ChunkId) -> String {
    format!(
        "{}/{}/{}.chunk",
        cloud_dir.trim_end_matches('/'),
        CLOUD_CHUNKS_DIR,
        id
    )
}

impl CloudChunkSource {
    /// Creates a cloud source.
    ///
    /// Downloads stop once `installer_error` records an error.
    ///
    /// # Panics
    ///
    /// Panics if `cloud_dirs` is empty.
    pub fn new(
        config: CloudSourceConfig,
        cloud_dirs: Vec<String>,
        download_service: Arc<DownloadService>,
        serializer: Arc<dyn ChunkDataSerialization>,
        reference_tracker: Arc<dyn ReferenceTracker>,
        installer_error: &InstallerError,
    ) -> Self {
        assert!(!cloud_dirs.is_empty(), "At least one cloud directory is required");

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            installer_error.register_for_errors(move || cancel.cancel());
        }

        Self {
            config,
            cloud_dirs,
            download_service,
            serializer,
            reference_tracker,
            cancel,
            state: Mutex::new(State::default()),
            callback: Mutex::new(None),
        }
    }

    /// Aborts blocked and future downloads.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn request(&self, id: &ChunkId, attempt: u32) -> Download {
        let cloud_dir = &self.cloud_dirs[attempt as usize % self.cloud_dirs.len()];
        let uri = chunk_uri(cloud_dir, id);

        let (sender, receiver) = channel::bounded(1);
        let request = self.download_service.request_file(
            uri.clone(),
            Box::new(move |_, result| {
                let _ = sender.send(result);
            }),
            Box::new(|_, _| {}),
        );

        Download {
            request,
            uri,
            receiver,
        }
    }

    /// Starts downloads for upcoming chunks, up to the configured limit.
    fn prefetch(&self, state: &mut State, current: &ChunkId) {
        let limit = self.config.num_simultaneous_downloads;
        if state.in_flight.len() >= limit {
            return;
        }

        for id in self.reference_tracker.next_references(limit) {
            if state.in_flight.len() >= limit {
                break;
            }

            if id == *current
                || state.cache.contains_key(&id)
                || state.in_flight.contains_key(&id)
                || state.failed.contains(&id)
            {
                continue;
            }

            let download = self.request(&id, 0);
            state.in_flight.insert(id, download);
        }
    }

    /// Waits for a download. Returns None if cancelled.
    fn wait(&self, download: &Download) -> Option<DownloadResult> {
        loop {
            if self.cancel.is_cancelled() {
                self.download_service.request_cancel(download.request);
                return None;
            }

            match download.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(result) => return Some(result),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Sleeps unless cancelled first. Returns false if cancelled.
    fn delay(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    fn decode(&self, id: &ChunkId, download: &Download, result: DownloadResult) -> Option<ChunkData> {
        if !result.success {
            tracing::warn!(
                "Failed to download {}: {}",
                download.uri,
                result.reason.as_deref().unwrap_or("unknown error")
            );
            return None;
        }

        match self.serializer.load_from_bytes(&result.data) {
            Ok(chunk) if chunk.id() == *id => Some(chunk),
            Ok(chunk) => {
                tracing::warn!("Downloaded {} but got chunk {}", download.uri, chunk.id());
                None
            }
            Err(e) => {
                tracing::warn!("Downloaded {} but it is invalid: {}", download.uri, e);
                None
            }
        }
    }

    fn give_up(&self, id: &ChunkId) {
        tracing::error!("Giving up on chunk {}", id);

        let was_required = {
            let mut state = self.state.lock();
            state.failed.insert(*id);
            state.required.remove(id)
        };

        if was_required {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(HashSet::from([*id]));
            }
        }
    }
}

impl ChunkSource for CloudChunkSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        let mut download = {
            let mut state = self.state.lock();

            let tracker = &self.reference_tracker;
            state
                .cache
                .retain(|cached, _| cached == id || tracker.reference_count(cached) > 0);

            if let Some(chunk) = state.cache.get(id) {
                return Some(chunk.clone());
            }

            if state.failed.contains(id) || self.cancel.is_cancelled() {
                return None;
            }

            let download = match state.in_flight.remove(id) {
                Some(download) => download,
                None => self.request(id, 0),
            };

            self.prefetch(&mut state, id);

            download
        };

        let mut retries = 0u32;
        loop {
            let result = self.wait(&download)?;

            if let Some(chunk) = self.decode(id, &download, result) {
                let chunk = Arc::new(chunk);
                self.state.lock().cache.insert(*id, chunk.clone());
                return Some(chunk);
            }

            if !self.config.can_retry(retries) {
                self.give_up(id);
                return None;
            }

            retries += 1;
            if !self.delay(self.config.retry_delay(retries)) {
                return None;
            }

            tracing::debug!("Retrying chunk {} (attempt {})", id, retries + 1);
            download = self.request(id, retries);
        }
    }

    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let mut state = self.state.lock();
        for id in requirements {
            state.failed.remove(&id);
            state.required.insert(id);
        }

        HashSet::new()
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        *self.callback.lock() = Some(callback);
    }
}
