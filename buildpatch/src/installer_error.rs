//! Installer-wide error state.
//!
//! Any component may report a fatal error; the first one reported is
//! kept and every other component observes it before continuing.
//! Cancellation is not an error and is signalled separately.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// The class of a reported error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required chunk could not be obtained from any source.
    MissingChunk,

    /// Chunk bookkeeping disagreed with the planned work.
    ReferenceTracking,

    /// Writing output to disk failed.
    FileWrite,
}

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Shared error sink.
#[derive(Default)]
pub struct InstallerError {
    state: Mutex<ErrorState>,
}

#[derive(Default)]
struct ErrorState {
    error: Option<(ErrorKind, String)>,
    listeners: Vec<Listener>,
}

impl InstallerError {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reports an error. Only the first report is recorded.
    pub fn set_error(&self, kind: ErrorKind, code: impl Into<String>) {
        let listeners = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                return;
            }

            let code = code.into();
            tracing::error!("Installer error {:?}: {}", kind, code);
            state.error = Some((kind, code));
            state.listeners.clone()
        };

        for listener in listeners {
            listener();
        }
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.state.lock().error.as_ref().map(|(kind, _)| *kind)
    }

    pub fn error_code(&self) -> Option<String> {
        self.state.lock().error.as_ref().map(|(_, code)| code.clone())
    }

    /// Registers a function to call when the first error is reported.
    pub fn register_for_errors(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.state.lock().listeners.push(Arc::new(listener));
    }
}

impl fmt::Debug for InstallerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerError")
            .field("error", &self.state.lock().error)
            .finish()
    }
}
