//! Chunk databases.
//!
//! A chunkdb packages serialized chunks behind a header that locates
//! each of them within the file.
//!
//! ## Layout
//!
//! ```text
//! | magic u32 | version u32 | header size u32 | data size u64 | count u32 |
//! | guid [16] | byte start u64 | byte size u32 |  (x count)
//! | chunk 0 | chunk 1 | ...
//! ```
//!
//! All integers are little endian. `header size` covers everything up to
//! the first chunk and depends only on the number of entries, so a
//! placeholder header can be written first and overwritten in place once
//! the offsets are known.

mod writer;

#[cfg(test)]
mod tests;

use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use displaydoc::Display;

use crate::chunk::ChunkId;
use crate::error::BuildPatchResult;
use crate::fs::FileSystem;

pub use writer::{ChunkDatabaseWriter, WriterCompleteCallback};

/// Magic number at the start of every chunkdb file.
pub const CHUNKDB_MAGIC: u32 = 0xB1FE_3AA3;

/// Current chunkdb version.
pub const CHUNKDB_VERSION: u32 = 1;

/// Size of the fixed part of the header.
pub const FIXED_HEADER_SIZE: u32 = 4 + 4 + 4 + 8 + 4;

/// Size of one location table entry.
pub const LOCATION_SIZE: u32 = 16 + 8 + 4;

/// File extension of chunk databases.
pub const CHUNKDB_EXTENSION: &str = "chunkdb";

/// A chunk database format error.
#[derive(Debug, Display)]
pub enum Error {
    /// Bad chunkdb magic {0:#010x}.
    BadMagic(u32),

    /// Unsupported chunkdb version {0}.
    UnsupportedVersion(u32),

    /// Truncated chunkdb header: expected {expected} bytes, got {actual}.
    Truncated { expected: usize, actual: usize },

    /// Header size {header_size} does not match {count} entries.
    BadHeaderSize { header_size: u32, count: u32 },

    /// Header size {header_size} plus data size {data_size} does not match the file size {file_size}.
    SizeMismatch {
        header_size: u32,
        data_size: u64,
        file_size: u64,
    },

    /// Chunk {id} is not where expected: starts at {byte_start}, expected {expected}.
    BadLocation {
        id: ChunkId,
        byte_start: u64,
        expected: u64,
    },
}

/// Where a chunk lives within a chunkdb file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLocation {
    pub id: ChunkId,
    pub byte_start: u64,
    pub byte_size: u32,
}

/// The header of a chunkdb file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDatabaseHeader {
    pub header_size: u32,
    pub data_size: u64,
    pub contents: Vec<ChunkLocation>,
}

/// A planned chunkdb file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDatabaseFile {
    pub database_filename: PathBuf,
    pub data_list: Vec<ChunkId>,
}

impl ChunkDatabaseHeader {
    /// Creates a header with placeholder locations for the given chunks.
    pub fn placeholder(ids: &[ChunkId]) -> Self {
        Self {
            header_size: Self::serialized_size(ids.len()),
            data_size: 0,
            contents: ids
                .iter()
                .map(|id| ChunkLocation {
                    id: *id,
                    byte_start: 0,
                    byte_size: 0,
                })
                .collect(),
        }
    }

    /// Returns the serialized size of a header with `count` entries.
    pub fn serialized_size(count: usize) -> u32 {
        FIXED_HEADER_SIZE + LOCATION_SIZE * count as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.header_size as usize);
        buf.put_u32_le(CHUNKDB_MAGIC);
        buf.put_u32_le(CHUNKDB_VERSION);
        buf.put_u32_le(self.header_size);
        buf.put_u64_le(self.data_size);
        buf.put_u32_le(self.contents.len() as u32);

        for location in &self.contents {
            buf.put_slice(location.id.as_bytes());
            buf.put_u64_le(location.byte_start);
            buf.put_u32_le(location.byte_size);
        }

        buf.to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> BuildPatchResult<Self> {
        let mut reader = bytes;
        Self::read_from(&mut reader, bytes.len() as u64)
    }

    /// Reads a header from the start of a file of `file_size` bytes.
    ///
    /// A location table that cannot fit in the file is rejected before
    /// it is allocated.
    pub fn read_from(reader: &mut dyn Read, file_size: u64) -> BuildPatchResult<Self> {
        let mut fixed = [0u8; FIXED_HEADER_SIZE as usize];
        read_exact_or_truncated(reader, &mut fixed, 0)?;

        let mut buf = &fixed[..];
        let magic = buf.get_u32_le();
        if magic != CHUNKDB_MAGIC {
            return Err(Error::BadMagic(magic).into());
        }

        let version = buf.get_u32_le();
        if version == 0 || version > CHUNKDB_VERSION {
            return Err(Error::UnsupportedVersion(version).into());
        }

        let header_size = buf.get_u32_le();
        let data_size = buf.get_u64_le();
        let count = buf.get_u32_le();

        if (header_size as u64)
            != FIXED_HEADER_SIZE as u64 + LOCATION_SIZE as u64 * count as u64
        {
            return Err(Error::BadHeaderSize { header_size, count }.into());
        }

        if header_size as u64 > file_size {
            return Err(Error::Truncated {
                expected: header_size as usize,
                actual: file_size as usize,
            }
            .into());
        }

        let mut table = vec![0u8; (LOCATION_SIZE * count) as usize];
        read_exact_or_truncated(reader, &mut table, FIXED_HEADER_SIZE as usize)?;

        let mut buf = &table[..];
        let mut contents = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut id = [0u8; 16];
            buf.copy_to_slice(&mut id);
            contents.push(ChunkLocation {
                id: ChunkId::from_bytes(id),
                byte_start: buf.get_u64_le(),
                byte_size: buf.get_u32_le(),
            });
        }

        Ok(Self {
            header_size,
            data_size,
            contents,
        })
    }

    /// Checks that the header exactly describes a file of `file_size` bytes.
    ///
    /// Chunks must be stored back to back, in table order, directly
    /// after the header.
    pub fn validate(&self, file_size: u64) -> BuildPatchResult<()> {
        if self.header_size as u64 + self.data_size != file_size {
            return Err(Error::SizeMismatch {
                header_size: self.header_size,
                data_size: self.data_size,
                file_size,
            }
            .into());
        }

        let mut expected = self.header_size as u64;
        for location in &self.contents {
            if location.byte_start != expected {
                return Err(Error::BadLocation {
                    id: location.id,
                    byte_start: location.byte_start,
                    expected,
                }
                .into());
            }
            expected += location.byte_size as u64;
        }

        if expected != file_size {
            return Err(Error::SizeMismatch {
                header_size: self.header_size,
                data_size: expected - self.header_size as u64,
                file_size,
            }
            .into());
        }

        Ok(())
    }

    /// Returns the location of a chunk, if present.
    pub fn find(&self, id: &ChunkId) -> Option<&ChunkLocation> {
        self.contents.iter().find(|location| location.id == *id)
    }
}

/// Reads and validates the header of a chunkdb file.
pub fn read_header(file_system: &dyn FileSystem, path: &Path) -> BuildPatchResult<ChunkDatabaseHeader> {
    let file_size = file_system.file_size(path)?;
    let mut reader = file_system.create_file_reader(path)?;

    let header = ChunkDatabaseHeader::read_from(&mut reader, file_size)?;
    header.validate(file_size)?;

    Ok(header)
}

/// Splits an ordered chunk list into chunkdb files.
///
/// `chunks` pairs each chunk with its serialized size. Without a size
/// limit everything goes into `output_file`. With a limit, files are
/// filled in order until the next chunk would exceed it; a chunk larger
/// than the limit gets a file of its own. Multiple files are named
/// `<stem>.partNN.chunkdb` next to `output_file`.
pub fn plan_chunk_databases(
    chunks: &[(ChunkId, u64)],
    output_file: &Path,
    max_output_file_size: Option<u64>,
) -> Vec<ChunkDatabaseFile> {
    let mut groups: Vec<Vec<ChunkId>> = Vec::new();
    let mut current: Vec<ChunkId> = Vec::new();
    let mut current_size = ChunkDatabaseHeader::serialized_size(0) as u64;

    for (id, size) in chunks {
        let grown = current_size + LOCATION_SIZE as u64 + size;

        if let Some(max) = max_output_file_size {
            if !current.is_empty() && grown > max {
                groups.push(std::mem::take(&mut current));
                current_size = ChunkDatabaseHeader::serialized_size(0) as u64;
            }
        }

        current_size += LOCATION_SIZE as u64 + size;
        current.push(*id);
    }

    if groups.is_empty() {
        return vec![ChunkDatabaseFile {
            database_filename: output_file.to_owned(),
            data_list: current,
        }];
    }
    groups.push(current);

    let stem = output_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    groups
        .into_iter()
        .enumerate()
        .map(|(i, data_list)| ChunkDatabaseFile {
            database_filename: output_file.with_file_name(format!(
                "{}.part{:02}.{}",
                stem,
                i + 1,
                CHUNKDB_EXTENSION
            )),
            data_list,
        })
        .collect()
}

fn read_exact_or_truncated(
    reader: &mut dyn Read,
    buf: &mut [u8],
    offset: usize,
) -> BuildPatchResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..])?;
        if read == 0 {
            return Err(Error::Truncated {
                expected: offset + buf.len(),
                actual: offset + filled,
            }
            .into());
        }
        filled += read;
    }

    Ok(())
}
