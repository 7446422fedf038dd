//! Error handling.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use displaydoc::Display;

pub type BuildPatchResult<T> = Result<T, BuildPatchError>;

/// An error.
#[derive(Debug, Display)]
pub enum BuildPatchError {
    /// Invalid chunk id "{id}"
    InvalidChunkId { id: String },

    /// Expected chunk {expected}, found {found}
    UnexpectedChunk {
        expected: super::chunk::ChunkId,
        found: super::chunk::ChunkId,
    },

    /// Invalid configuration in {path:?}: {reason}
    InvalidConfig { path: PathBuf, reason: String },

    /// Thread "{name}" is no longer running.
    OwnerThreadGone { name: String },

    /// Chunk error: {0}
    ChunkError(super::chunk::Error),

    /// Chunk database error: {0}
    ChunkDbError(super::chunkdb::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl BuildPatchError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidChunkId { .. } => "InvalidChunkId",
            Self::UnexpectedChunk { .. } => "UnexpectedChunk",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::OwnerThreadGone { .. } => "OwnerThreadGone",
            Self::ChunkError(_) => "ChunkError",
            Self::ChunkDbError(_) => "ChunkDbError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for BuildPatchError {}

impl From<io::Error> for BuildPatchError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::chunk::Error> for BuildPatchError {
    fn from(error: super::chunk::Error) -> Self {
        Self::ChunkError(error)
    }
}

impl From<super::chunkdb::Error> for BuildPatchError {
    fn from(error: super::chunkdb::Error) -> Self {
        Self::ChunkDbError(error)
    }
}
