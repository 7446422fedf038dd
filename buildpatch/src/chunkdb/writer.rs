//! Chunk database writer.
//!
//! Two threads cooperate to produce chunkdb files:
//!
//! - The processing thread pulls each planned chunk from a source,
//!   serializes it and queues positional writes.
//! - The output thread performs the file I/O in queue order.
//!
//! Each file starts with a placeholder header. Once all of its chunks
//! are queued, the completed header is queued again at position 0,
//! strictly after the chunk writes.
//!
//! Output is all or nothing: on failure or cancellation every file
//! created by the run is deleted.

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChunkDatabaseFile, ChunkDatabaseHeader};
use crate::chunk::ChunkDataSerialization;
use crate::config::WriterConfig;
use crate::error::BuildPatchResult;
use crate::fs::{FileSystem, FileWriter};
use crate::installer_error::{ErrorKind, InstallerError};
use crate::reference_tracker::ReferenceTracker;
use crate::source::ChunkSource;
use crate::util::OwnerThread;

/// Called once with the overall success of the run.
pub type WriterCompleteCallback = Box<dyn FnOnce(bool) + Send>;

/// A message from the processing thread to the output thread.
#[derive(Debug)]
enum OutputMessage {
    /// Close the current file and start a new one.
    CreateFile(PathBuf),

    /// Write bytes into the current file.
    WriteAt { position: u64, data: Vec<u8> },

    /// No further messages.
    Done,
}

/// Handle to a running chunk database writer.
///
/// Dropping the handle cancels the run and waits for both threads.
pub struct ChunkDatabaseWriter {
    cancel: CancellationToken,
    processing: Option<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
}

struct Processing {
    source: Arc<dyn ChunkSource>,
    serializer: Arc<dyn ChunkDataSerialization>,
    reference_tracker: Arc<dyn ReferenceTracker>,
    installer_error: Arc<InstallerError>,
    cancel: CancellationToken,
    sender: Sender<OutputMessage>,
    files: Vec<ChunkDatabaseFile>,
}

struct Output {
    config: WriterConfig,
    file_system: Arc<dyn FileSystem>,
    installer_error: Arc<InstallerError>,
    cancel: CancellationToken,
    receiver: Receiver<OutputMessage>,
    owner: OwnerThread,
    on_complete: WriterCompleteCallback,
}

/// The file currently being written.
struct OpenFile {
    path: PathBuf,
    writer: Box<dyn FileWriter>,
    position: u64,
}

impl ChunkDatabaseWriter {
    /// Starts writing the planned files.
    ///
    /// `on_complete` is posted to `owner` once both the chunk data and
    /// the cleanup are finished.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: WriterConfig,
        source: Arc<dyn ChunkSource>,
        file_system: Arc<dyn FileSystem>,
        installer_error: Arc<InstallerError>,
        reference_tracker: Arc<dyn ReferenceTracker>,
        serializer: Arc<dyn ChunkDataSerialization>,
        files: Vec<ChunkDatabaseFile>,
        owner: OwnerThread,
        on_complete: WriterCompleteCallback,
    ) -> BuildPatchResult<Self> {
        let cancel = CancellationToken::new();
        let (sender, receiver) = channel::unbounded();

        let processing = Processing {
            source,
            serializer,
            reference_tracker,
            installer_error: installer_error.clone(),
            cancel: cancel.clone(),
            sender,
            files,
        };

        let output = Output {
            config,
            file_system,
            installer_error,
            cancel: cancel.clone(),
            receiver,
            owner,
            on_complete,
        };

        let output = thread::Builder::new()
            .name("chunkdb-output".to_string())
            .spawn(move || output.run())?;

        let processing = thread::Builder::new()
            .name("chunkdb-processing".to_string())
            .spawn(move || processing.run())?;

        Ok(Self {
            cancel,
            processing: Some(processing),
            output: Some(output),
        })
    }

    /// Requests cancellation. The run completes unsuccessfully.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for both threads to finish.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        for handle in [self.processing.take(), self.output.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::error!("Chunk database writer thread panicked");
            }
        }
    }
}

impl Drop for ChunkDatabaseWriter {
    fn drop(&mut self) {
        if self.processing.is_some() || self.output.is_some() {
            self.cancel.cancel();
            self.join();
        }
    }
}

impl Processing {
    fn run(mut self) {
        let files = std::mem::take(&mut self.files);
        self.process(files);
        let _ = self.sender.send(OutputMessage::Done);
    }

    fn should_abort(&self) -> bool {
        self.cancel.is_cancelled() || self.installer_error.has_error()
    }

    fn send(&self, message: OutputMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    fn process(&self, files: Vec<ChunkDatabaseFile>) {
        for file in files {
            if self.should_abort() {
                return;
            }

            if !self.send(OutputMessage::CreateFile(file.database_filename.clone())) {
                return;
            }

            let mut header = ChunkDatabaseHeader::placeholder(&file.data_list);
            if !self.send(OutputMessage::WriteAt {
                position: 0,
                data: header.to_bytes(),
            }) {
                return;
            }

            let mut position = header.header_size as u64;
            for (idx, id) in file.data_list.iter().enumerate() {
                if self.should_abort() {
                    return;
                }

                let chunk = match self.source.get(id) {
                    Some(chunk) => chunk,
                    None => {
                        self.installer_error.set_error(
                            ErrorKind::MissingChunk,
                            format!("Chunk {} is unavailable for {:?}", id, file.database_filename),
                        );
                        return;
                    }
                };

                let data = match self.serializer.save_to_bytes(&chunk) {
                    Ok(data) => data,
                    Err(e) => {
                        self.installer_error.set_error(
                            ErrorKind::MissingChunk,
                            format!("Failed to serialize chunk {}: {}", id, e),
                        );
                        return;
                    }
                };

                let Some(byte_size) = entry_size(data.len()) else {
                    self.installer_error.set_error(
                        ErrorKind::FileWrite,
                        format!("Chunk {} is too large for a chunkdb entry: {} bytes", id, data.len()),
                    );
                    return;
                };

                let location = &mut header.contents[idx];
                location.byte_start = position;
                location.byte_size = byte_size;
                position += data.len() as u64;

                if !self.send(OutputMessage::WriteAt {
                    position: location.byte_start,
                    data,
                }) {
                    return;
                }

                if !self.reference_tracker.pop_reference(id) {
                    self.installer_error.set_error(
                        ErrorKind::ReferenceTracking,
                        format!("Chunk reference tracking failure on {}", id),
                    );
                    return;
                }
            }

            header.data_size = position - header.header_size as u64;
            tracing::debug!(
                "Queued {} chunks ({} bytes) for {:?}",
                header.contents.len(),
                header.data_size,
                file.database_filename
            );

            if !self.send(OutputMessage::WriteAt {
                position: 0,
                data: header.to_bytes(),
            }) {
                return;
            }
        }
    }
}

/// Returns the size of a serialized chunk as stored in the location table.
pub(super) fn entry_size(len: usize) -> Option<u32> {
    u32::try_from(len).ok()
}

impl Output {
    fn run(self) {
        let mut created = Vec::new();
        let mut current: Option<OpenFile> = None;

        loop {
            if self.cancel.is_cancelled() || self.installer_error.has_error() {
                break;
            }

            let message = match self.receiver.recv_timeout(self.config.queue_timeout) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match message {
                OutputMessage::CreateFile(path) => {
                    if let Some(file) = current.take() {
                        self.close(file);
                    }

                    tracing::info!("Creating chunk database {:?}", path);
                    match self.file_system.create_file_writer(&path) {
                        Ok(writer) => {
                            created.push(path.clone());
                            current = Some(OpenFile {
                                path,
                                writer,
                                position: 0,
                            });
                        }
                        Err(e) => {
                            self.installer_error.set_error(
                                ErrorKind::FileWrite,
                                format!("Failed to create {:?}: {}", path, e),
                            );
                            break;
                        }
                    }
                }
                OutputMessage::WriteAt { position, data } => {
                    let file = match current.as_mut() {
                        Some(file) => file,
                        None => {
                            self.installer_error.set_error(
                                ErrorKind::FileWrite,
                                "Received chunk data with no open chunk database",
                            );
                            break;
                        }
                    };

                    if let Err(e) = file.write_at(position, &data) {
                        self.installer_error.set_error(
                            ErrorKind::FileWrite,
                            format!("Failed to write {:?}: {}", file.path, e),
                        );
                        break;
                    }
                }
                OutputMessage::Done => break,
            }
        }

        if let Some(file) = current.take() {
            self.close(file);
        }

        let success = !self.cancel.is_cancelled() && !self.installer_error.has_error();
        if !success {
            for path in &created {
                tracing::info!("Deleting incomplete chunk database {:?}", path);
                if let Err(e) = self.file_system.delete_file(path) {
                    tracing::warn!("Failed to delete {:?}: {}", path, e);
                }
            }
        }

        let on_complete = Arc::new(Mutex::new(Some(self.on_complete)));
        let posted = {
            let on_complete = on_complete.clone();
            self.owner.post(move || {
                if let Some(on_complete) = on_complete.lock().take() {
                    on_complete(success);
                }
            })
        };

        if let Err(e) = posted {
            tracing::warn!("{}; completing on the output thread", e);
            if let Some(on_complete) = on_complete.lock().take() {
                on_complete(success);
            }
        }
    }

    fn close(&self, mut file: OpenFile) {
        if let Err(e) = file.writer.flush() {
            self.installer_error.set_error(
                ErrorKind::FileWrite,
                format!("Failed to flush {:?}: {}", file.path, e),
            );
        }
    }
}

impl OpenFile {
    fn write_at(&mut self, position: u64, data: &[u8]) -> std::io::Result<()> {
        if self.position != position {
            self.writer.seek(SeekFrom::Start(position))?;
        }

        self.writer.write_all(data)?;
        self.position = position + data.len() as u64;

        Ok(())
    }
}
