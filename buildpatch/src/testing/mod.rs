//! Utilities for testing.

use bytes::Bytes;
use tokio::runtime::Runtime;

use crate::chunk::{ChunkData, ChunkDataSerialization, ChunkId, ChunkSerializer};
use crate::chunkdb::ChunkDatabaseHeader;

/// Returns a new multi-threaded Tokio runtime for background work.
pub fn get_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

/// Returns some fake data.
pub fn get_fake_data(len: usize) -> Vec<u8> {
    let mut state = 42u32;
    let mut data = vec![0u8; len];

    for (i, byte) in data.iter_mut().enumerate() {
        (state, _) = state.overflowing_mul(1664525u32);
        (state, _) = state.overflowing_add(1013904223u32);
        *byte = ((state >> (i % 24)) & 0xff) as u8;
    }

    data
}

/// Returns a chunk with a fresh id and `len` bytes of fake data.
pub fn make_chunk(len: usize) -> ChunkData {
    ChunkData::new(ChunkId::new_random(), Bytes::from(get_fake_data(len)))
}

/// Writes chunks into a chunkdb file, returning its header.
pub fn write_chunk_database(path: &std::path::Path, chunks: &[ChunkData]) -> ChunkDatabaseHeader {
    let serializer = ChunkSerializer;
    let ids: Vec<ChunkId> = chunks.iter().map(ChunkData::id).collect();
    let mut header = ChunkDatabaseHeader::placeholder(&ids);

    let mut body = Vec::new();
    for (chunk, location) in chunks.iter().zip(header.contents.iter_mut()) {
        let bytes = serializer.save_to_bytes(chunk).unwrap();
        location.byte_start = header.header_size as u64 + body.len() as u64;
        location.byte_size = bytes.len() as u32;
        body.extend_from_slice(&bytes);
    }
    header.data_size = body.len() as u64;

    let mut file = header.to_bytes();
    file.extend_from_slice(&body);
    std::fs::write(path, file).unwrap();

    header
}
