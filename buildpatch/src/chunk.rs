//! Chunks.
//!
//! A chunk is the unit of transfer and storage, identified by a
//! 128-bit GUID assigned when the build is generated.
//!
//! ## Serialized Form
//!
//! ```text
//! | magic u32 | version u32 | header size u32 | stored size u32 | guid [16] |
//! | rolling hash u64 | stored as u8 | sha1 [20] | hash type u8 | data size u32 |
//! | payload (possibly zlib-compressed) ...
//! ```
//!
//! All integers are little endian.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use displaydoc::Display;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{de, ser, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BuildPatchError, BuildPatchResult};
use crate::hash::{rolling_hash, ChunkHash};

/// Magic number at the start of every serialized chunk.
pub const CHUNK_MAGIC: u32 = 0xB1FE_3AA2;

/// Current serialized chunk version.
pub const CHUNK_VERSION: u32 = 3;

/// Size of the serialized chunk header.
pub const CHUNK_HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 16 + 8 + 1 + 20 + 1 + 4;

/// Flag in `stored_as` marking a compressed payload.
const STORED_COMPRESSED: u8 = 0x01;

/// Upper bound on buffer space reserved from a header before decoding.
const MAX_PREALLOCATION: usize = 1024 * 1024;

/// Flags in `hash_type`.
const HASH_ROLLING: u8 = 0x01;
const HASH_SHA1: u8 = 0x02;

/// The identifier of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(Uuid);

/// How a chunk payload is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
}

/// A chunk format error.
#[derive(Debug, Display)]
pub enum Error {
    /// Bad chunk magic {0:#010x}.
    BadMagic(u32),

    /// Unsupported chunk version {0}.
    UnsupportedVersion(u32),

    /// Truncated chunk: expected {expected} bytes, got {actual}.
    Truncated { expected: usize, actual: usize },

    /// Payload of chunk {id} does not match its size: expected {expected} bytes, got {actual}.
    SizeMismatch {
        id: ChunkId,
        expected: usize,
        actual: usize,
    },

    /// Payload of chunk {id} does not match its hash: expected {expected}, got {actual}.
    HashMismatch {
        id: ChunkId,
        expected: String,
        actual: String,
    },

    /// Chunk {id} is too large to serialize: {size} bytes.
    TooLarge { id: ChunkId, size: usize },

    /// Failed to decompress chunk {id}: {error}
    Decompression { id: ChunkId, error: io::Error },
}

/// Metadata stored in front of each chunk payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: ChunkId,
    pub rolling_hash: u64,
    pub sha1: ChunkHash,
    pub stored_as: Compression,
    pub data_size_compressed: u32,
    pub data_size_uncompressed: u32,
}

/// An in-memory chunk.
///
/// Owned by the source that produced it; consumers hold it through
/// an `Arc` for as long as they read from it.
#[derive(Clone, Debug)]
pub struct ChunkData {
    header: ChunkHeader,
    data: Bytes,
}

/// Converts chunks to and from their serialized form.
pub trait ChunkDataSerialization: Send + Sync {
    /// Serializes a chunk, compressing it if its header asks for it.
    fn save_to_bytes(&self, chunk: &ChunkData) -> BuildPatchResult<Vec<u8>>;

    /// Deserializes and verifies a chunk.
    fn load_from_bytes(&self, bytes: &[u8]) -> BuildPatchResult<ChunkData>;
}

/// The default chunk serializer.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkSerializer;

impl ChunkId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.as_bytes()))
    }
}

impl FromStr for ChunkId {
    type Err = BuildPatchError;

    /// Parses either 32 hexadecimal digits or a hyphenated GUID.
    fn from_str(s: &str) -> BuildPatchResult<Self> {
        let s = s.trim();
        let invalid = || BuildPatchError::InvalidChunkId { id: s.to_owned() };

        if s.len() == 32 {
            let bytes = hex::decode(s).map_err(|_| invalid())?;
            let uuid = Uuid::from_slice(&bytes).map_err(|_| invalid())?;
            Ok(Self(uuid))
        } else {
            Uuid::parse_str(s).map(Self).map_err(|_| invalid())
        }
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        String::deserialize(deserializer)
            .and_then(|s| s.parse().map_err(|e: BuildPatchError| Error::custom(e.to_string())))
    }
}

impl Serialize for ChunkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ChunkData {
    /// Creates an uncompressed chunk, computing its hashes.
    pub fn new(id: ChunkId, data: Bytes) -> Self {
        let header = ChunkHeader {
            id,
            rolling_hash: rolling_hash(&data),
            sha1: ChunkHash::sha1_from_bytes(&data),
            stored_as: Compression::None,
            data_size_compressed: data.len() as u32,
            data_size_uncompressed: data.len() as u32,
        };

        Self { header, data }
    }

    /// Sets how the payload should be stored when serialized.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.header.stored_as = compression;
        self
    }

    pub fn id(&self) -> ChunkId {
        self.header.id
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    /// Returns the uncompressed payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Checks the payload against the SHA1 hash in the header.
    pub fn verify(&self) -> Result<(), Error> {
        let actual = ChunkHash::sha1_from_bytes(&self.data);
        if actual == self.header.sha1 {
            return Ok(());
        }

        Err(Error::HashMismatch {
            id: self.header.id,
            expected: self.header.sha1.to_typed_base16(),
            actual: actual.to_typed_base16(),
        })
    }
}

impl ChunkDataSerialization for ChunkSerializer {
    fn save_to_bytes(&self, chunk: &ChunkData) -> BuildPatchResult<Vec<u8>> {
        let header = &chunk.header;

        let payload = match header.stored_as {
            Compression::None => chunk.data.to_vec(),
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&chunk.data)?;
                encoder.finish()?
            }
        };

        let too_large = |size| Error::TooLarge {
            id: header.id,
            size,
        };
        let stored_size = u32::try_from(payload.len()).map_err(|_| too_large(payload.len()))?;
        let data_size = u32::try_from(chunk.data.len()).map_err(|_| too_large(chunk.data.len()))?;

        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
        buf.put_u32_le(CHUNK_MAGIC);
        buf.put_u32_le(CHUNK_VERSION);
        buf.put_u32_le(CHUNK_HEADER_SIZE as u32);
        buf.put_u32_le(stored_size);
        buf.put_slice(header.id.as_bytes());
        buf.put_u64_le(header.rolling_hash);
        buf.put_u8(match header.stored_as {
            Compression::None => 0,
            Compression::Zlib => STORED_COMPRESSED,
        });
        buf.put_slice(header.sha1.data());
        buf.put_u8(HASH_ROLLING | HASH_SHA1);
        buf.put_u32_le(data_size);
        buf.put_slice(&payload);

        Ok(buf.to_vec())
    }

    fn load_from_bytes(&self, bytes: &[u8]) -> BuildPatchResult<ChunkData> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(Error::Truncated {
                expected: CHUNK_HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let mut buf = bytes;
        let magic = buf.get_u32_le();
        if magic != CHUNK_MAGIC {
            return Err(Error::BadMagic(magic).into());
        }

        let version = buf.get_u32_le();
        if version == 0 || version > CHUNK_VERSION {
            return Err(Error::UnsupportedVersion(version).into());
        }

        let header_size = buf.get_u32_le() as usize;
        let stored_size = buf.get_u32_le() as usize;

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let id = ChunkId::from_bytes(id);

        let rolling_hash = buf.get_u64_le();
        let stored_as = if buf.get_u8() & STORED_COMPRESSED != 0 {
            Compression::Zlib
        } else {
            Compression::None
        };

        let mut sha1 = [0u8; 20];
        buf.copy_to_slice(&mut sha1);
        let _hash_type = buf.get_u8();
        let uncompressed_size = buf.get_u32_le() as usize;

        let expected = header_size.max(CHUNK_HEADER_SIZE) + stored_size;
        if bytes.len() < expected {
            return Err(Error::Truncated {
                expected,
                actual: bytes.len(),
            }
            .into());
        }

        let payload = &bytes[header_size.max(CHUNK_HEADER_SIZE)..expected];
        let data = match stored_as {
            Compression::None => payload.to_vec(),
            Compression::Zlib => {
                // The header size is untrusted until the payload decodes to it
                let mut data = Vec::with_capacity(uncompressed_size.min(MAX_PREALLOCATION));
                ZlibDecoder::new(payload)
                    .take(uncompressed_size as u64 + 1)
                    .read_to_end(&mut data)
                    .map_err(|error| Error::Decompression { id, error })?;
                data
            }
        };

        if data.len() != uncompressed_size {
            return Err(Error::SizeMismatch {
                id,
                expected: uncompressed_size,
                actual: data.len(),
            }
            .into());
        }

        let chunk = ChunkData {
            header: ChunkHeader {
                id,
                rolling_hash,
                sha1: ChunkHash::Sha1(sha1),
                stored_as,
                data_size_compressed: stored_size as u32,
                data_size_uncompressed: uncompressed_size as u32,
            },
            data: Bytes::from(data),
        };

        chunk.verify()?;

        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{get_fake_data, make_chunk};

    #[test]
    fn test_chunk_id_parse() {
        let id = ChunkId::new_random();
        let hex = id.to_string();

        assert_eq!(32, hex.len());
        assert_eq!(hex.to_uppercase(), hex);
        assert_eq!(id, hex.parse().unwrap());
        assert_eq!(id, hex.to_lowercase().parse().unwrap());
        assert_eq!(id, id.0.hyphenated().to_string().parse().unwrap());

        assert!(matches!(
            "not-a-guid".parse::<ChunkId>(),
            Err(BuildPatchError::InvalidChunkId { .. })
        ));
    }

    #[test]
    fn test_compressed_chunk() {
        // Highly compressible
        let data = Bytes::from(vec![7u8; 64 * 1024]);
        let chunk = ChunkData::new(ChunkId::new_random(), data).with_compression(Compression::Zlib);

        let serialized = ChunkSerializer.save_to_bytes(&chunk).unwrap();
        assert!(serialized.len() < CHUNK_HEADER_SIZE + 64 * 1024);

        let loaded = ChunkSerializer.load_from_bytes(&serialized).unwrap();
        let (expected, actual) = (chunk.header(), loaded.header());
        assert_eq!(expected.id, actual.id);
        assert_eq!(expected.sha1, actual.sha1);
        assert_eq!(expected.rolling_hash, actual.rolling_hash);
        assert_eq!(Compression::Zlib, actual.stored_as);
        assert_eq!(64 * 1024, actual.data_size_uncompressed);
        assert_eq!(
            serialized.len() - CHUNK_HEADER_SIZE,
            actual.data_size_compressed as usize
        );
        assert_eq!(chunk.data(), loaded.data());
    }

    #[test]
    fn test_forged_uncompressed_size() {
        let data = Bytes::from(vec![3u8; 4096]);
        let chunk = ChunkData::new(ChunkId::new_random(), data).with_compression(Compression::Zlib);
        let mut serialized = ChunkSerializer.save_to_bytes(&chunk).unwrap();

        // The data size field closes the header
        serialized[CHUNK_HEADER_SIZE - 4..CHUNK_HEADER_SIZE].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            ChunkSerializer.load_from_bytes(&serialized),
            Err(BuildPatchError::ChunkError(Error::SizeMismatch { expected, actual: 4096, .. }))
                if expected == u32::MAX as usize
        ));

        serialized[CHUNK_HEADER_SIZE - 4..CHUNK_HEADER_SIZE].copy_from_slice(&16u32.to_le_bytes());
        assert!(matches!(
            ChunkSerializer.load_from_bytes(&serialized),
            Err(BuildPatchError::ChunkError(Error::SizeMismatch { expected: 16, actual: 17, .. }))
        ));
    }

    #[test]
    fn test_uncompressed_chunk_layout() {
        let chunk = make_chunk(1000);
        let serialized = ChunkSerializer.save_to_bytes(&chunk).unwrap();

        assert_eq!(CHUNK_HEADER_SIZE + 1000, serialized.len());
        assert_eq!(&CHUNK_MAGIC.to_le_bytes(), &serialized[..4]);
        assert_eq!(chunk.id().as_bytes(), &serialized[16..32]);
        assert_eq!(chunk.data().as_ref(), &serialized[CHUNK_HEADER_SIZE..]);
    }

    #[test]
    fn test_corrupt_chunk() {
        let chunk = ChunkData::new(ChunkId::new_random(), Bytes::from(get_fake_data(512)));
        let mut serialized = ChunkSerializer.save_to_bytes(&chunk).unwrap();

        let last = serialized.len() - 1;
        serialized[last] ^= 0xff;
        assert!(matches!(
            ChunkSerializer.load_from_bytes(&serialized),
            Err(BuildPatchError::ChunkError(Error::HashMismatch { id, expected, actual }))
                if id == chunk.id()
                    && expected == chunk.header().sha1.to_typed_base16()
                    && actual.starts_with("sha1:")
                    && actual != expected
        ));

        assert!(matches!(
            ChunkSerializer.load_from_bytes(&serialized[..10]),
            Err(BuildPatchError::ChunkError(Error::Truncated { .. }))
        ));

        serialized[0] = 0;
        assert!(matches!(
            ChunkSerializer.load_from_bytes(&serialized),
            Err(BuildPatchError::ChunkError(Error::BadMagic(_)))
        ));
    }
}
