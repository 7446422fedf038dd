//! Sources feeding the chunk database writer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as channel;
use tempfile::TempDir;

use buildpatch::chunk::{ChunkData, ChunkId, ChunkSerializer};
use buildpatch::chunkdb::{read_header, ChunkDatabaseFile, ChunkDatabaseWriter};
use buildpatch::config::{ChunkDbSourceConfig, WriterConfig};
use buildpatch::fs::LocalFileSystem;
use buildpatch::installer_error::InstallerError;
use buildpatch::reference_tracker::OrderedReferenceTracker;
use buildpatch::source::{
    ChainedChunkSource, ChunkDbChunkSource, ChunkSource, MemoryChunkSource,
};
use buildpatch::testing::{make_chunk, write_chunk_database};
use buildpatch::util::OwnerThread;

fn run_writer(
    source: Arc<dyn ChunkSource>,
    tracker: Arc<OrderedReferenceTracker>,
    files: Vec<ChunkDatabaseFile>,
) -> bool {
    let (sender, receiver) = channel::bounded(1);

    let writer = ChunkDatabaseWriter::start(
        WriterConfig::default(),
        source,
        Arc::new(LocalFileSystem),
        InstallerError::new(),
        tracker,
        Arc::new(ChunkSerializer),
        files,
        OwnerThread::spawn("pipeline").unwrap(),
        Box::new(move |success| sender.send(success).unwrap()),
    )
    .unwrap();
    writer.wait();

    receiver.recv_timeout(Duration::from_secs(10)).unwrap()
}

#[test]
fn test_repackage_from_chunkdb_and_memory() {
    let dir = TempDir::new().unwrap();
    let chunks: Vec<ChunkData> = (1..=5).map(|i| make_chunk(i * 777)).collect();
    let ids: Vec<ChunkId> = chunks.iter().map(ChunkData::id).collect();

    let existing = dir.path().join("existing.chunkdb");
    write_chunk_database(&existing, &chunks[..3]);

    // Interleave the two sources in the output order
    let order = vec![ids[3], ids[0], ids[4], ids[1], ids[2]];
    let tracker = Arc::new(OrderedReferenceTracker::new(order.clone()));

    let chunkdb = Arc::new(ChunkDbChunkSource::open(
        ChunkDbSourceConfig::default(),
        Arc::new(LocalFileSystem),
        Arc::new(ChunkSerializer),
        tracker.clone(),
        &[existing],
    ));
    let memory = Arc::new(MemoryChunkSource::with_chunks(chunks[3..].iter().cloned()));
    let chain = Arc::new(ChainedChunkSource::new(vec![chunkdb as Arc<dyn ChunkSource>, memory]));

    let required: HashSet<ChunkId> = ids.iter().copied().collect();
    assert!(chain.add_runtime_requirements(required).is_empty());

    let output = dir.path().join("repackaged.chunkdb");
    let files = vec![ChunkDatabaseFile {
        database_filename: output.clone(),
        data_list: order.clone(),
    }];

    assert!(run_writer(chain, tracker.clone(), files));
    assert_eq!(0, tracker.remaining());

    let header = read_header(&LocalFileSystem, &output).unwrap();
    assert_eq!(order, header.contents.iter().map(|l| l.id).collect::<Vec<_>>());

    // The output can itself serve as a source
    let reread = ChunkDbChunkSource::open(
        ChunkDbSourceConfig::default(),
        Arc::new(LocalFileSystem),
        Arc::new(ChunkSerializer),
        Arc::new(OrderedReferenceTracker::new(order.clone())),
        &[output],
    );
    for chunk in &chunks {
        let loaded = reread.get(&chunk.id()).unwrap();
        assert_eq!(chunk.data(), loaded.data());
    }
}
