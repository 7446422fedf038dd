use super::*;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver};
use tempfile::TempDir;

use crate::chunk::{ChunkData, ChunkDataSerialization, ChunkSerializer};
use crate::config::WriterConfig;
use crate::error::BuildPatchError;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::installer_error::{ErrorKind, InstallerError};
use crate::reference_tracker::{OrderedReferenceTracker, ReferenceTracker};
use crate::source::{ChunkSource, MemoryChunkSource, UnavailableChunksCallback};
use crate::testing::{make_chunk, write_chunk_database};
use crate::util::OwnerThread;

fn ids(chunks: &[ChunkData]) -> Vec<ChunkId> {
    chunks.iter().map(ChunkData::id).collect()
}

#[test]
fn test_header_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.chunkdb");
    let chunks = vec![make_chunk(100), make_chunk(200), make_chunk(300)];
    let header = write_chunk_database(&path, &chunks);

    let read = read_header(&LocalFileSystem, &path).unwrap();
    assert_eq!(header, read);
    assert_eq!(ChunkDatabaseHeader::serialized_size(3), read.header_size);
    assert_eq!(ids(&chunks), read.contents.iter().map(|l| l.id).collect::<Vec<_>>());

    let parsed = ChunkDatabaseHeader::from_bytes(&header.to_bytes()).unwrap();
    assert_eq!(header, parsed);

    let second = read.find(&chunks[1].id()).unwrap();
    assert_eq!(read.contents[0].byte_start + read.contents[0].byte_size as u64, second.byte_start);
    assert!(read.find(&ChunkId::new_random()).is_none());
}

#[test]
fn test_placeholder_has_final_size() {
    let chunk_ids = vec![ChunkId::new_random(), ChunkId::new_random()];
    let placeholder = ChunkDatabaseHeader::placeholder(&chunk_ids);

    assert_eq!(placeholder.header_size as usize, placeholder.to_bytes().len());
    assert_eq!(FIXED_HEADER_SIZE + 2 * LOCATION_SIZE, placeholder.header_size);
}

#[test]
fn test_header_errors() {
    let header = ChunkDatabaseHeader::placeholder(&[ChunkId::new_random()]);
    let bytes = header.to_bytes();

    let mut bad_magic = bytes.clone();
    bad_magic[0] ^= 0xff;
    assert!(matches!(
        ChunkDatabaseHeader::from_bytes(&bad_magic),
        Err(BuildPatchError::ChunkDbError(Error::BadMagic(_)))
    ));

    assert!(matches!(
        ChunkDatabaseHeader::from_bytes(&bytes[..bytes.len() - 1]),
        Err(BuildPatchError::ChunkDbError(Error::Truncated { .. }))
    ));

    let mut bad_version = bytes;
    bad_version[4] = 99;
    assert!(matches!(
        ChunkDatabaseHeader::from_bytes(&bad_version),
        Err(BuildPatchError::ChunkDbError(Error::UnsupportedVersion(99)))
    ));
}

#[test]
fn test_header_table_larger_than_file() {
    let count: u32 = 100_000_000;
    let mut bytes = ChunkDatabaseHeader::placeholder(&[]).to_bytes();
    bytes[8..12].copy_from_slice(&ChunkDatabaseHeader::serialized_size(count as usize).to_le_bytes());
    bytes[20..24].copy_from_slice(&count.to_le_bytes());

    assert!(matches!(
        ChunkDatabaseHeader::from_bytes(&bytes),
        Err(BuildPatchError::ChunkDbError(Error::Truncated { actual, .. })) if actual == bytes.len()
    ));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("forged.chunkdb");
    std::fs::write(&path, &bytes).unwrap();
    assert!(matches!(
        read_header(&LocalFileSystem, &path),
        Err(BuildPatchError::ChunkDbError(Error::Truncated { .. }))
    ));
}

#[test]
fn test_validate() {
    let mut header = ChunkDatabaseHeader::placeholder(&[ChunkId::new_random(), ChunkId::new_random()]);
    let start = header.header_size as u64;
    header.contents[0].byte_start = start;
    header.contents[0].byte_size = 10;
    header.contents[1].byte_start = start + 10;
    header.contents[1].byte_size = 20;
    header.data_size = 30;

    header.validate(start + 30).unwrap();

    assert!(matches!(
        header.validate(start + 31),
        Err(BuildPatchError::ChunkDbError(Error::SizeMismatch { .. }))
    ));

    header.contents[1].byte_start += 1;
    assert!(matches!(
        header.validate(start + 30),
        Err(BuildPatchError::ChunkDbError(Error::BadLocation { .. }))
    ));
}

#[test]
fn test_plan_without_limit() {
    let chunks: Vec<(ChunkId, u64)> = (0..5).map(|_| (ChunkId::new_random(), 1000)).collect();
    let output = Path::new("/out/build.chunkdb");

    let plan = plan_chunk_databases(&chunks, output, None);
    assert_eq!(1, plan.len());
    assert_eq!(output, plan[0].database_filename);
    assert_eq!(
        chunks.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        plan[0].data_list
    );

    let empty = plan_chunk_databases(&[], output, Some(10));
    assert_eq!(1, empty.len());
    assert!(empty[0].data_list.is_empty());
}

#[test]
fn test_plan_with_limit() {
    let small = |size| (ChunkId::new_random(), size);
    let chunks = vec![small(400), small(400), small(400), small(5000), small(100)];
    let output = Path::new("/out/build.chunkdb");

    // Room for two 400-byte chunks per file
    let limit = ChunkDatabaseHeader::serialized_size(2) as u64 + 800;
    let plan = plan_chunk_databases(&chunks, output, Some(limit));

    let lists: Vec<Vec<ChunkId>> = plan.iter().map(|f| f.data_list.clone()).collect();
    assert_eq!(
        vec![
            vec![chunks[0].0, chunks[1].0],
            vec![chunks[2].0],
            vec![chunks[3].0],
            vec![chunks[4].0],
        ],
        lists
    );

    let names: Vec<PathBuf> = plan.iter().map(|f| f.database_filename.clone()).collect();
    assert_eq!(
        vec![
            PathBuf::from("/out/build.part01.chunkdb"),
            PathBuf::from("/out/build.part02.chunkdb"),
            PathBuf::from("/out/build.part03.chunkdb"),
            PathBuf::from("/out/build.part04.chunkdb"),
        ],
        names
    );
}

/// Counts pops on an inner tracker.
struct CountingTracker {
    inner: OrderedReferenceTracker,
    pops: parking_lot::Mutex<Vec<ChunkId>>,
}

impl ReferenceTracker for CountingTracker {
    fn referenced_chunks(&self) -> HashSet<ChunkId> {
        self.inner.referenced_chunks()
    }

    fn reference_count(&self, id: &ChunkId) -> u32 {
        self.inner.reference_count(id)
    }

    fn next_references(&self, count: usize) -> Vec<ChunkId> {
        self.inner.next_references(count)
    }

    fn pop_reference(&self, id: &ChunkId) -> bool {
        self.pops.lock().push(*id);
        self.inner.pop_reference(id)
    }
}

/// A source whose `get` waits until the gate is dropped.
struct GatedSource {
    inner: MemoryChunkSource,
    gate: Receiver<()>,
    waiting: AtomicUsize,
}

impl ChunkSource for GatedSource {
    fn get(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _ = self.gate.recv();
        self.inner.get(id)
    }

    fn add_runtime_requirements(&self, requirements: HashSet<ChunkId>) -> HashSet<ChunkId> {
        self.inner.add_runtime_requirements(requirements)
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        self.inner.set_unavailable_chunks_callback(callback)
    }
}

struct Run {
    writer: ChunkDatabaseWriter,
    installer_error: Arc<InstallerError>,
    completion: Receiver<(bool, Option<String>)>,
}

impl Run {
    fn start(
        source: Arc<dyn ChunkSource>,
        tracker: Arc<dyn ReferenceTracker>,
        files: Vec<ChunkDatabaseFile>,
    ) -> Self {
        let owner = OwnerThread::spawn("writer-owner").unwrap();
        let installer_error = InstallerError::new();
        let (sender, completion) = channel::bounded(1);

        let writer = ChunkDatabaseWriter::start(
            WriterConfig {
                queue_timeout: Duration::from_millis(20),
            },
            source,
            Arc::new(LocalFileSystem),
            installer_error.clone(),
            tracker,
            Arc::new(ChunkSerializer),
            files,
            owner,
            Box::new(move |success| {
                let thread = thread::current().name().map(str::to_owned);
                sender.send((success, thread)).unwrap();
            }),
        )
        .unwrap();

        Self {
            writer,
            installer_error,
            completion,
        }
    }

    fn finish(self) -> (bool, Option<String>, Arc<InstallerError>) {
        self.writer.wait();
        let (success, thread) = self
            .completion
            .recv_timeout(Duration::from_secs(10))
            .unwrap();
        (success, thread, self.installer_error)
    }
}

fn single_file(dir: &TempDir, chunks: &[ChunkData]) -> Vec<ChunkDatabaseFile> {
    vec![ChunkDatabaseFile {
        database_filename: dir.path().join("out.chunkdb"),
        data_list: ids(chunks),
    }]
}

#[test]
fn test_writer_end_to_end() {
    let dir = TempDir::new().unwrap();
    let chunks = vec![make_chunk(1000), make_chunk(2500), make_chunk(700)];
    let source = Arc::new(MemoryChunkSource::with_chunks(chunks.clone()));
    let tracker = Arc::new(CountingTracker {
        inner: OrderedReferenceTracker::new(ids(&chunks)),
        pops: Default::default(),
    });
    let files = single_file(&dir, &chunks);

    let (success, thread, installer_error) =
        Run::start(source, tracker.clone(), files.clone()).finish();

    assert!(success);
    assert!(!installer_error.has_error());
    assert_eq!(Some("writer-owner"), thread.as_deref());

    // Every written chunk is popped exactly once, in order
    assert_eq!(ids(&chunks), *tracker.pops.lock());
    assert_eq!(0, tracker.inner.remaining());

    let path = &files[0].database_filename;
    let header = read_header(&LocalFileSystem, path).unwrap();
    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes.len() as u64, header.header_size as u64 + header.data_size);

    for (chunk, location) in chunks.iter().zip(&header.contents) {
        assert_eq!(chunk.id(), location.id);

        let start = location.byte_start as usize;
        let end = start + location.byte_size as usize;
        let loaded = ChunkSerializer.load_from_bytes(&bytes[start..end]).unwrap();
        assert_eq!(chunk.data(), loaded.data());
    }
}

#[test]
fn test_writer_multiple_files() {
    let dir = TempDir::new().unwrap();
    let chunks: Vec<ChunkData> = (0..6).map(|_| make_chunk(1000)).collect();
    let source = Arc::new(MemoryChunkSource::with_chunks(chunks.clone()));
    let tracker = Arc::new(OrderedReferenceTracker::new(ids(&chunks)));

    let sizes: Vec<(ChunkId, u64)> = chunks
        .iter()
        .map(|chunk| (chunk.id(), ChunkSerializer.save_to_bytes(chunk).unwrap().len() as u64))
        .collect();
    let limit = ChunkDatabaseHeader::serialized_size(2) as u64 + sizes[0].1 * 2;
    let files = plan_chunk_databases(&sizes, &dir.path().join("out.chunkdb"), Some(limit));
    assert_eq!(3, files.len());

    let (success, _, _) = Run::start(source, tracker, files.clone()).finish();
    assert!(success);

    let mut written = Vec::new();
    for file in &files {
        let header = read_header(&LocalFileSystem, &file.database_filename).unwrap();
        assert!(std::fs::metadata(&file.database_filename).unwrap().len() <= limit);
        written.extend(header.contents.iter().map(|l| l.id));
    }
    assert_eq!(ids(&chunks), written);
}

#[test]
fn test_writer_missing_chunk() {
    let dir = TempDir::new().unwrap();
    let chunks = vec![make_chunk(100), make_chunk(100), make_chunk(100)];

    // The middle chunk is nowhere to be found
    let source = Arc::new(MemoryChunkSource::with_chunks([chunks[0].clone(), chunks[2].clone()]));
    let tracker = Arc::new(OrderedReferenceTracker::new(ids(&chunks)));
    let files = single_file(&dir, &chunks);

    let (success, _, installer_error) = Run::start(source, tracker, files.clone()).finish();

    assert!(!success);
    assert_eq!(Some(ErrorKind::MissingChunk), installer_error.error_kind());
    assert!(!files[0].database_filename.exists());
}

#[test]
fn test_writer_missing_chunk_removes_every_file() {
    let dir = TempDir::new().unwrap();
    let chunks: Vec<ChunkData> = (0..4).map(|_| make_chunk(100)).collect();

    // The first file completes before the second one runs dry
    let source = Arc::new(MemoryChunkSource::with_chunks(chunks[..3].to_vec()));
    let tracker = Arc::new(OrderedReferenceTracker::new(ids(&chunks)));
    let files = vec![
        ChunkDatabaseFile {
            database_filename: dir.path().join("out.part01.chunkdb"),
            data_list: ids(&chunks[..2]),
        },
        ChunkDatabaseFile {
            database_filename: dir.path().join("out.part02.chunkdb"),
            data_list: ids(&chunks[2..]),
        },
    ];

    let (success, _, installer_error) = Run::start(source, tracker, files.clone()).finish();

    assert!(!success);
    assert_eq!(Some(ErrorKind::MissingChunk), installer_error.error_kind());
    for file in &files {
        assert!(
            !LocalFileSystem.file_exists(&file.database_filename),
            "{:?} was left behind",
            file.database_filename
        );
    }
}

#[test]
#[cfg(target_pointer_width = "64")]
fn test_entry_size_limit() {
    assert_eq!(Some(1000), writer::entry_size(1000));
    assert_eq!(Some(u32::MAX), writer::entry_size(u32::MAX as usize));
    assert_eq!(None, writer::entry_size(u32::MAX as usize + 1));
}

#[test]
fn test_writer_tracking_failure() {
    let dir = TempDir::new().unwrap();
    let chunks = vec![make_chunk(100), make_chunk(100)];
    let source = Arc::new(MemoryChunkSource::with_chunks(chunks.clone()));

    // The tracker expects the chunks in the opposite order
    let mut reversed = ids(&chunks);
    reversed.reverse();
    let tracker = Arc::new(OrderedReferenceTracker::new(reversed));
    let files = single_file(&dir, &chunks);

    let (success, _, installer_error) = Run::start(source, tracker, files.clone()).finish();

    assert!(!success);
    assert_eq!(Some(ErrorKind::ReferenceTracking), installer_error.error_kind());
    assert!(!files[0].database_filename.exists());
}

#[test]
fn test_writer_cancel() {
    let dir = TempDir::new().unwrap();
    let chunks = vec![make_chunk(100), make_chunk(100), make_chunk(100)];
    let (gate_sender, gate) = channel::bounded::<()>(0);
    let source = Arc::new(GatedSource {
        inner: MemoryChunkSource::with_chunks(chunks.clone()),
        gate,
        waiting: AtomicUsize::new(0),
    });
    let tracker = Arc::new(OrderedReferenceTracker::new(ids(&chunks)));
    let files = single_file(&dir, &chunks);

    let run = Run::start(source.clone(), tracker, files.clone());

    // Wait until the first chunk is being fetched
    while source.waiting.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    run.writer.cancel();
    run.writer.cancel();
    drop(gate_sender);

    let (success, _, installer_error) = run.finish();

    assert!(!success);
    assert!(!installer_error.has_error());
    assert!(!files[0].database_filename.exists());
}

#[test]
fn test_writer_no_files() {
    let source = Arc::new(MemoryChunkSource::new());
    let tracker = Arc::new(OrderedReferenceTracker::new([]));

    let (success, _, _) = Run::start(source, tracker, Vec::new()).finish();
    assert!(success);
}
