//! Download service.
//!
//! Fetches whole files by URI, from HTTP(S) or from the local file
//! system, and reports progress and completion through per-request
//! callbacks.
//!
//! The service is pumped by calling `tick` from the thread that owns
//! it. All callbacks fire on that thread, during `tick` (or during drop).
//! Background work runs on a Tokio runtime: HTTP requests as async
//! tasks, file reads as blocking tasks. Background tasks only exchange
//! plain data with the owner through the shared progress and completion
//! maps; they never touch callbacks.
//!
//! A request moves `New -> Active -> Completed | Cancelled`. A request
//! cancelled before its first tick goes straight from `New` to
//! `Cancelled` without doing any I/O.

#[cfg(feature = "http")]
mod http;


use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::DownloadConfig;
use crate::error::BuildPatchResult;
use crate::fs::FileSystem;

#[cfg(feature = "http")]
pub use self::http::ReqwestHttpClient;

/// Identifies a request. Never reused within the process.
pub type RequestId = u64;

/// Called once when a request finishes, fails or is cancelled.
pub type DownloadCompleteCallback = Box<dyn FnOnce(RequestId, DownloadResult) + Send>;

/// Called with the number of bytes received so far.
pub type DownloadProgressCallback = Box<dyn FnMut(RequestId, u64) + Send>;

/// Progress sink handed to HTTP clients.
pub type HttpProgress<'a> = &'a (dyn Fn(u64) + Send + Sync);

pub type HttpResult = Result<HttpResponse, Box<dyn StdError + Send + Sync>>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// The outcome of a request.
#[derive(Clone, Debug)]
pub struct DownloadResult {
    pub success: bool,

    /// The HTTP status, if an HTTP response was received.
    pub response_code: Option<u16>,

    pub data: Bytes,

    /// Why the request failed.
    pub reason: Option<String>,
}

/// A complete HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Performs HTTP GET requests for the download service.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetches a URL, reporting the body bytes received so far.
    async fn get(&self, url: &str, progress: HttpProgress<'_>) -> HttpResult;
}

/// The download service.
pub struct DownloadService {
    config: DownloadConfig,
    runtime: Handle,
    http: Arc<dyn HttpClient>,
    file_system: Arc<dyn FileSystem>,

    new_requests: Mutex<VecDeque<(RequestId, String)>>,
    cancels: Mutex<HashSet<RequestId>>,
    active: Mutex<HashMap<RequestId, ActiveRequest>>,
    callbacks: Mutex<HashMap<RequestId, Callbacks>>,

    /// Cancelled tasks that may still be running.
    draining: Mutex<Vec<JoinHandle<()>>>,

    shared: Arc<Shared>,
}

/// State written by background tasks.
#[derive(Default)]
struct Shared {
    progress: Mutex<HashMap<RequestId, u64>>,
    completed: Mutex<BTreeMap<RequestId, DownloadResult>>,
}

struct Callbacks {
    on_complete: DownloadCompleteCallback,
    on_progress: DownloadProgressCallback,
}

struct ActiveRequest {
    uri: String,
    started: Instant,
    task: ActiveTask,
}

enum ActiveTask {
    Http(JoinHandle<()>),
    File {
        cancel: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    },
}

impl DownloadResult {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            response_code: None,
            data: Bytes::new(),
            reason: Some(reason.into()),
        }
    }

    fn cancelled() -> Self {
        Self::failed("Request cancelled")
    }
}

impl DownloadService {
    /// Creates a service.
    ///
    /// `runtime` runs the background work.
    pub fn new(
        config: DownloadConfig,
        runtime: Handle,
        http: Arc<dyn HttpClient>,
        file_system: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            config,
            runtime,
            http,
            file_system,
            new_requests: Mutex::new(VecDeque::new()),
            cancels: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Queues a file to be fetched on the next tick.
    ///
    /// URIs starting with `http` are fetched over HTTP; anything else is
    /// a local path.
    pub fn request_file(
        &self,
        uri: impl Into<String>,
        on_complete: DownloadCompleteCallback,
        on_progress: DownloadProgressCallback,
    ) -> RequestId {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);

        self.callbacks.lock().insert(
            id,
            Callbacks {
                on_complete,
                on_progress,
            },
        );
        self.new_requests.lock().push_back((id, uri.into()));

        id
    }

    /// Cancels a request. Does nothing if it already completed.
    pub fn request_cancel(&self, id: RequestId) {
        self.cancels.lock().insert(id);
    }

    /// Returns the number of requests whose completion has not fired yet.
    pub fn pending_requests(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Pumps the service. Must be called from the owning thread.
    pub fn tick(&self) {
        self.process_cancellations();
        self.dispatch_new_requests();
        self.process_timeouts();
        self.fire_progress();
        self.fire_completions();
    }

    fn process_cancellations(&self) {
        let cancels: Vec<RequestId> = self.cancels.lock().drain().collect();
        if cancels.is_empty() {
            return;
        }

        for id in cancels {
            let was_new = {
                let mut new_requests = self.new_requests.lock();
                let before = new_requests.len();
                new_requests.retain(|(request_id, _)| *request_id != id);
                new_requests.len() != before
            };

            if was_new {
                tracing::debug!("Cancelled request {} before it started", id);
                self.complete(id, DownloadResult::cancelled());
                continue;
            }

            let active = self.active.lock().remove(&id);
            if let Some(active) = active {
                tracing::debug!("Cancelling request {} ({})", id, active.uri);
                self.stop(active.task);
                self.complete(id, DownloadResult::cancelled());
            }
        }

        self.draining.lock().retain(|handle| !handle.is_finished());
    }

    fn dispatch_new_requests(&self) {
        let new_requests: Vec<(RequestId, String)> = self.new_requests.lock().drain(..).collect();

        for (id, uri) in new_requests {
            let task = if uri.starts_with("http") {
                tracing::debug!("Requesting {} over HTTP (request {})", uri, id);
                ActiveTask::Http(self.spawn_http(id, uri.clone()))
            } else {
                tracing::debug!("Reading {} from disk (request {})", uri, id);
                let cancel = Arc::new(AtomicBool::new(false));
                let handle = self.spawn_file_read(id, PathBuf::from(&uri), cancel.clone());
                ActiveTask::File { cancel, handle }
            };

            self.active.lock().insert(
                id,
                ActiveRequest {
                    uri,
                    started: Instant::now(),
                    task,
                },
            );
        }
    }

    fn process_timeouts(&self) {
        let timeout = self.config.request_timeout;

        let timed_out: Vec<(RequestId, ActiveRequest)> = {
            let completed = self.shared.completed.lock();
            let mut active = self.active.lock();

            let ids: Vec<RequestId> = active
                .iter()
                .filter(|(id, request)| {
                    request.started.elapsed() > timeout && !completed.contains_key(id)
                })
                .map(|(id, _)| *id)
                .collect();

            ids.into_iter()
                .filter_map(|id| active.remove(&id).map(|request| (id, request)))
                .collect()
        };

        for (id, request) in timed_out {
            tracing::warn!(
                "Request {} ({}) timed out after {:?}",
                id,
                request.uri,
                timeout
            );
            self.stop(request.task);
            self.complete(
                id,
                DownloadResult::failed(format!("Request timed out after {:?}", timeout)),
            );
        }
    }

    fn fire_progress(&self) {
        let progress: Vec<(RequestId, u64)> = self.shared.progress.lock().drain().collect();

        for (id, bytes) in progress {
            // Taken out so callbacks may call back into the service.
            let callbacks = self.callbacks.lock().remove(&id);
            if let Some(mut callbacks) = callbacks {
                (callbacks.on_progress)(id, bytes);
                self.callbacks.lock().insert(id, callbacks);
            }
        }
    }

    fn fire_completions(&self) {
        let completed = std::mem::take(&mut *self.shared.completed.lock());

        for (id, result) in completed {
            self.active.lock().remove(&id);

            let callbacks = self.callbacks.lock().remove(&id);
            if let Some(mut callbacks) = callbacks {
                // Progress that raced with completion is delivered first
                let progress = self.shared.progress.lock().remove(&id);
                if let Some(bytes) = progress {
                    (callbacks.on_progress)(id, bytes);
                }

                if !result.success {
                    tracing::debug!("Request {} failed: {:?}", id, result.reason);
                }
                (callbacks.on_complete)(id, result);
            }
        }
    }

    /// Records a result unless the request already has one.
    fn complete(&self, id: RequestId, result: DownloadResult) {
        self.shared.completed.lock().entry(id).or_insert(result);
    }

    fn stop(&self, task: ActiveTask) {
        let handle = match task {
            ActiveTask::Http(handle) => {
                handle.abort();
                handle
            }
            ActiveTask::File { cancel, handle } => {
                cancel.store(true, Ordering::Relaxed);
                handle
            }
        };

        self.draining.lock().push(handle);
    }

    fn spawn_http(&self, id: RequestId, uri: String) -> JoinHandle<()> {
        let http = self.http.clone();
        let shared = self.shared.clone();

        self.runtime.spawn(async move {
            let progress_shared = shared.clone();
            let progress = move |bytes: u64| {
                progress_shared.progress.lock().insert(id, bytes);
            };

            let result = match http.get(&uri, &progress).await {
                Ok(response) => {
                    let success = (200..300).contains(&response.status);
                    DownloadResult {
                        success,
                        response_code: Some(response.status),
                        reason: (!success).then(|| format!("HTTP {}", response.status)),
                        data: response.body,
                    }
                }
                Err(e) => DownloadResult::failed(e.to_string()),
            };

            shared.completed.lock().entry(id).or_insert(result);
        })
    }

    fn spawn_file_read(
        &self,
        id: RequestId,
        path: PathBuf,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let file_system = self.file_system.clone();
        let shared = self.shared.clone();
        let read_size = self.config.file_read_size.max(1);

        self.runtime.spawn_blocking(move || {
            let result = read_file(&*file_system, &path, read_size, &cancel, |bytes| {
                shared.progress.lock().insert(id, bytes);
            });

            shared.completed.lock().entry(id).or_insert(result);
        })
    }
}

/// Reads a whole file in `read_size` steps, checking for cancellation
/// between steps.
fn read_file(
    file_system: &dyn FileSystem,
    path: &std::path::Path,
    read_size: usize,
    cancel: &AtomicBool,
    progress: impl Fn(u64),
) -> DownloadResult {
    let size = match file_system.file_size(path) {
        Ok(size) => size as usize,
        Err(e) => return DownloadResult::failed(format!("Could not open {:?}: {}", path, e)),
    };

    let mut reader = match file_system.create_file_reader(path) {
        Ok(reader) => reader,
        Err(e) => return DownloadResult::failed(format!("Could not open {:?}: {}", path, e)),
    };

    let mut data = Vec::with_capacity(size);
    while data.len() < size {
        if cancel.load(Ordering::Relaxed) {
            return DownloadResult::cancelled();
        }

        let start = data.len();
        let step = read_size.min(size - start);
        data.resize(start + step, 0);

        let read = match reader.read(&mut data[start..]) {
            Ok(read) => read,
            Err(e) => return DownloadResult::failed(format!("Could not read {:?}: {}", path, e)),
        };
        data.truncate(start + read);

        if read == 0 {
            break;
        }

        progress(data.len() as u64);
    }

    if data.len() != size {
        return DownloadResult::failed(format!(
            "Short read on {:?}: expected {} bytes, got {}",
            path,
            size,
            data.len()
        ));
    }

    progress(data.len() as u64);

    DownloadResult {
        success: true,
        response_code: None,
        data: Bytes::from(data),
        reason: None,
    }
}

/// Ticks a download service on a dedicated thread until dropped.
pub struct DownloadTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DownloadTicker {
    pub fn spawn(service: Arc<DownloadService>, interval: Duration) -> BuildPatchResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("download-ticker".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        service.tick();
                        std::thread::sleep(interval);
                    }
                })?
        };

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for DownloadTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Download ticker panicked");
            }
        }
    }
}

impl Drop for DownloadService {
    /// Stops all work and fails every request that has not completed.
    ///
    /// Blocks until background tasks have finished, so this must not be
    /// dropped from within an async context.
    fn drop(&mut self) {
        let active: Vec<ActiveRequest> = self.active.lock().drain().map(|(_, r)| r).collect();
        for request in active {
            self.stop(request.task);
        }

        let handles: Vec<JoinHandle<()>> = self.draining.lock().drain(..).collect();
        if !handles.is_empty() {
            tracing::debug!("Waiting for {} download tasks to stop", handles.len());
            futures::executor::block_on(join_all(handles));
        }

        let callbacks: Vec<(RequestId, Callbacks)> = self.callbacks.lock().drain().collect();
        for (id, callbacks) in callbacks {
            (callbacks.on_complete)(id, DownloadResult::cancelled());
        }
    }
}

impl fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadService")
            .field("config", &self.config)
            .field("active", &self.active.lock().len())
            .field("pending", &self.callbacks.lock().len())
            .finish()
    }
}
