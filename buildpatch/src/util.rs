//! Misc utilities.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{self as channel, Sender};
use parking_lot::Mutex;

use crate::error::{BuildPatchError, BuildPatchResult};

type Task = Box<dyn FnOnce() + Send>;

/// A dedicated thread that owns some state.
///
/// Work touching that state is posted here and runs in FIFO order.
/// Any thread may marshal a call onto it with `run_blocking`.
/// The thread exits once the last handle is dropped.
#[derive(Clone)]
pub struct OwnerThread {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    thread_id: ThreadId,
    sender: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OwnerThread {
    /// Spawns a new owner thread.
    pub fn spawn(name: &str) -> BuildPatchResult<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                thread_id: handle.thread().id(),
                sender: Mutex::new(Some(sender)),
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns whether the caller is running on this thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Queues a function to run on the thread.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> BuildPatchResult<()> {
        let sender = self.inner.sender.lock();
        sender
            .as_ref()
            .and_then(|sender| sender.send(Box::new(f)).ok())
            .ok_or_else(|| self.gone())
    }

    /// Runs a function on the thread and waits for its result.
    ///
    /// When called from the thread itself, the function runs inline.
    pub fn run_blocking<R, F>(&self, f: F) -> BuildPatchResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }

        let (sender, receiver) = channel::bounded(1);
        self.post(move || {
            let _ = sender.send(f());
        })?;

        receiver.recv().map_err(|_| self.gone())
    }

    fn gone(&self) -> BuildPatchError {
        BuildPatchError::OwnerThreadGone {
            name: self.inner.name.clone(),
        }
    }
}

impl fmt::Debug for OwnerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerThread")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Closing the channel ends the task loop.
        self.sender.lock().take();

        if let Some(handle) = self.handle.lock().take() {
            if thread::current().id() != self.thread_id && handle.join().is_err() {
                tracing::error!("Thread \"{}\" panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_blocking_runs_on_owner() {
        let owner = OwnerThread::spawn("test-owner").unwrap();
        assert!(!owner.is_current());

        let name = owner
            .run_blocking(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(Some("test-owner".to_string()), name);

        // Nested calls run inline instead of deadlocking
        let inner_owner = owner.clone();
        let nested = owner
            .run_blocking(move || inner_owner.run_blocking(|| 42).unwrap())
            .unwrap();
        assert_eq!(42, nested);
    }

    #[test]
    fn test_post_preserves_order() {
        let owner = OwnerThread::spawn("test-order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..100 {
            let log = log.clone();
            let counter = counter.clone();
            owner
                .post(move || {
                    log.lock().push(i);
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        owner.run_blocking(|| ()).unwrap();
        assert_eq!(100, counter.load(Ordering::SeqCst));
        assert_eq!((0..100).collect::<Vec<_>>(), *log.lock());
    }
}
