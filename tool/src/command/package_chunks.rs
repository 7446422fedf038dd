use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;

use crate::cli::{require, Opts};
use crate::error::ToolError;
use buildpatch::chunk::{ChunkId, ChunkSerializer};
use buildpatch::chunkdb::{plan_chunk_databases, ChunkDatabaseWriter};
use buildpatch::config::load_config;
use buildpatch::download::{DownloadService, DownloadTicker, HttpClient, ReqwestHttpClient};
use buildpatch::fs::{FileSystem, LocalFileSystem};
use buildpatch::installer_error::{ErrorKind, InstallerError};
use buildpatch::reference_tracker::OrderedReferenceTracker;
use buildpatch::source::{
    chunk_uri, ChainedChunkSource, ChunkDbChunkSource, ChunkSource, CloudChunkSource,
};
use buildpatch::util::OwnerThread;

const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Package chunks into chunk databases.
#[derive(Debug, Default, Args)]
pub struct PackageChunks {
    /// File listing the chunks to package, one id per line.
    ///
    /// A line may carry the chunk's stored size after the id.
    #[clap(long = "chunklist")]
    pub chunk_list: Option<PathBuf>,

    /// Cloud directories to fetch chunks from, comma-separated.
    #[clap(long = "clouddir")]
    pub cloud_dir: Option<String>,

    /// The chunk database to write.
    #[clap(long = "outputfile")]
    pub output_file: Option<PathBuf>,

    /// Split the output into files no larger than this many bytes.
    #[clap(long = "maxoutputfilesize")]
    pub max_output_file_size: Option<u64>,

    /// Existing chunk databases to take chunks from first.
    #[clap(long = "chunkdbs", value_delimiter = ',')]
    pub chunk_dbs: Vec<PathBuf>,
}

pub fn run(opts: &Opts) -> Result<()> {
    let sub = &opts.package_chunks;
    let chunk_list = require(&sub.chunk_list, "ChunkList")?;
    let cloud_dir = require(&sub.cloud_dir, "CloudDir")?;
    let output_file = require(&sub.output_file, "OutputFile")?;
    let max_output_file_size = sub.max_output_file_size.filter(|size| *size > 0);

    let cloud_dirs: Vec<String> = cloud_dir
        .split(',')
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(str::to_owned)
        .collect();
    if cloud_dirs.is_empty() {
        return Err(ToolError::Arguments("-CloudDir= is empty".to_string()).into());
    }

    let config = load_config(opts.config.as_deref())?;
    let entries = read_chunk_list(chunk_list)?;
    let ids: Vec<ChunkId> = entries.iter().map(|(id, _)| *id).collect();
    tracing::info!("Packaging {} chunks into {:?}", ids.len(), output_file);

    let file_system: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
    let serializer = Arc::new(ChunkSerializer);
    let tracker = Arc::new(OrderedReferenceTracker::new(ids.iter().copied()));
    let installer_error = InstallerError::new();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new()?);
    let download_service = Arc::new(DownloadService::new(
        config.download.clone(),
        runtime.handle().clone(),
        http,
        file_system.clone(),
    ));

    let mut sources: Vec<Arc<dyn ChunkSource>> = Vec::new();

    let chunkdb_source = if sub.chunk_dbs.is_empty() {
        None
    } else {
        let source = Arc::new(ChunkDbChunkSource::open(
            config.chunkdb_source.clone(),
            file_system.clone(),
            serializer.clone(),
            tracker.clone(),
            &sub.chunk_dbs,
        ));
        sources.push(source.clone());
        Some(source)
    };

    sources.push(Arc::new(CloudChunkSource::new(
        config.cloud_source.clone(),
        cloud_dirs.clone(),
        download_service.clone(),
        serializer.clone(),
        tracker.clone(),
        &installer_error,
    )));

    let chain = Arc::new(ChainedChunkSource::new(sources));
    {
        let installer_error = installer_error.clone();
        chain.set_unavailable_chunks_callback(Arc::new(move |lost: HashSet<ChunkId>| {
            for id in &lost {
                tracing::error!("Chunk {} cannot be sourced", id);
            }
            installer_error.set_error(
                ErrorKind::MissingChunk,
                format!("{} chunks cannot be sourced", lost.len()),
            );
        }));
    }

    let rejected = chain.add_runtime_requirements(ids.iter().copied().collect());
    if !rejected.is_empty() {
        tracing::warn!("{} chunks were not accepted by any source", rejected.len());
    }

    let sizes = resolve_sizes(
        &entries,
        chunkdb_source.as_deref(),
        &cloud_dirs,
        &*file_system,
        max_output_file_size.is_some(),
    )?;
    let files = plan_chunk_databases(&sizes, output_file, max_output_file_size);

    let _ticker = DownloadTicker::spawn(download_service, TICK_INTERVAL)?;
    let owner = OwnerThread::spawn("bptool-main")?;
    let (sender, receiver) = crossbeam_channel::bounded(1);

    let writer = ChunkDatabaseWriter::start(
        config.writer.clone(),
        chain,
        file_system,
        installer_error.clone(),
        tracker,
        serializer,
        files.clone(),
        owner,
        Box::new(move |success| {
            let _ = sender.send(success);
        }),
    )?;
    writer.wait();

    let success = receiver.recv().unwrap_or(false);
    if !success {
        let reason = installer_error
            .error_code()
            .unwrap_or_else(|| "cancelled".to_string());
        return Err(ToolError::Failure(format!("Failed to package chunks: {}", reason)).into());
    }

    for file in &files {
        eprintln!(
            "Wrote {:?} ({} chunks)",
            file.database_filename,
            file.data_list.len()
        );
    }

    Ok(())
}

/// Reads the chunk list.
///
/// Blank lines and lines starting with `#` are ignored. Repeated chunks
/// are packaged once.
fn read_chunk_list(path: &Path) -> Result<Vec<(ChunkId, Option<u64>)>> {
    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ToolError::FileNotFound(path.to_owned()).into(),
        _ => anyhow::Error::from(e),
    })?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let invalid = || {
            ToolError::Arguments(format!("Invalid chunk list entry on line {}: {}", lineno + 1, line))
        };

        let mut fields = line.split_whitespace();
        let id: ChunkId = fields
            .next()
            .and_then(|id| id.parse().ok())
            .ok_or_else(invalid)?;
        let size = match fields.next() {
            Some(size) => Some(size.parse::<u64>().map_err(|_| invalid())?),
            None => None,
        };

        if !seen.insert(id) {
            tracing::warn!("Chunk {} is listed more than once", id);
            continue;
        }

        entries.push((id, size));
    }

    Ok(entries)
}

/// Finds the stored size of each chunk.
///
/// Sizes come from the chunk list, then the chunk databases, then local
/// cloud directories. They are only needed when splitting the output.
fn resolve_sizes(
    entries: &[(ChunkId, Option<u64>)],
    chunkdb_source: Option<&ChunkDbChunkSource>,
    cloud_dirs: &[String],
    file_system: &dyn FileSystem,
    required: bool,
) -> Result<Vec<(ChunkId, u64)>> {
    entries
        .iter()
        .map(|(id, size)| {
            let size = size
                .or_else(|| chunkdb_source.and_then(|source| source.chunk_size(id)))
                .or_else(|| {
                    cloud_dirs
                        .iter()
                        .filter(|dir| !dir.starts_with("http"))
                        .find_map(|dir| file_system.file_size(Path::new(&chunk_uri(dir, id))).ok())
                });

            match size {
                Some(size) => Ok((*id, size)),
                None if !required => Ok((*id, 0)),
                None => Err(ToolError::Failure(format!(
                    "Size of chunk {} is unknown; list it in the chunk list to use -MaxOutputFileSize",
                    id
                ))
                .into()),
            }
        })
        .collect()
}
