use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::cli::{require, Opts};
use crate::error::ToolError;
use buildpatch::chunk::{ChunkDataSerialization, ChunkSerializer};
use buildpatch::chunkdb::{read_header, ChunkLocation};
use buildpatch::fs::{FileReader, FileSystem, LocalFileSystem};

/// Verify the contents of a chunk database.
#[derive(Debug, Default, Args)]
pub struct VerifyChunks {
    /// The chunk database to verify.
    #[clap(long = "inputfile")]
    pub input_file: Option<PathBuf>,
}

pub fn run(opts: &Opts) -> Result<()> {
    let input_file = require(&opts.verify_chunks.input_file, "InputFile")?;

    let file_system = LocalFileSystem;
    if !file_system.file_exists(input_file) {
        return Err(ToolError::FileNotFound(input_file.to_owned()).into());
    }

    let header = read_header(&file_system, input_file).map_err(|e| {
        ToolError::Failure(format!("Invalid chunk database {:?}: {}", input_file, e))
    })?;

    let mut reader = file_system.create_file_reader(input_file)?;
    let mut failures = 0;
    for location in &header.contents {
        if let Err(reason) = verify_chunk(&mut reader, location) {
            tracing::error!("Chunk {} is bad: {}", location.id, reason);
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(ToolError::Failure(format!(
            "{} of {} chunks in {:?} failed verification",
            failures,
            header.contents.len(),
            input_file
        ))
        .into());
    }

    eprintln!(
        "Verified {} chunks in {:?}",
        header.contents.len(),
        input_file
    );

    Ok(())
}

fn verify_chunk(reader: &mut Box<dyn FileReader>, location: &ChunkLocation) -> Result<()> {
    reader.seek(SeekFrom::Start(location.byte_start))?;

    let mut bytes = vec![0u8; location.byte_size as usize];
    reader.read_exact(&mut bytes)?;

    let chunk = ChunkSerializer.load_from_bytes(&bytes)?;
    if chunk.id() != location.id {
        anyhow::bail!("Found chunk {} in its place", chunk.id());
    }

    Ok(())
}
