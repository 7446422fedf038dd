//! Global CLI Setup.
//!
//! Switches use the `-Name=value` form, for example:
//!
//! ```text
//! bptool -mode=packagechunks -ChunkList=chunks.txt -CloudDir=/builds/1.2 -OutputFile=out.chunkdb
//! ```
//!
//! Switch names are case-insensitive. They are rewritten into regular
//! long options before parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;

use crate::command::package_chunks::{self, PackageChunks};
use crate::command::verify_chunks::{self, VerifyChunks};
use crate::error::ToolError;

/// BuildPatch tool.
#[derive(Debug, Parser)]
#[clap(name = "bptool", version)]
pub struct Opts {
    /// The tool mode to run.
    #[clap(long)]
    pub mode: Option<String>,

    /// Path to the configuration file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    #[clap(flatten)]
    pub package_chunks: PackageChunks,

    #[clap(flatten)]
    pub verify_chunks: VerifyChunks,
}

/// Tool modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolMode {
    PackageChunks,
    VerifyChunks,
    Compactify,
    Enumeration,
    MergeManifests,
    DiffManifests,
}

impl ToolMode {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "packagechunks" => Some(Self::PackageChunks),
            "verifychunks" => Some(Self::VerifyChunks),
            "compactify" => Some(Self::Compactify),
            "enumeration" => Some(Self::Enumeration),
            "mergemanifests" => Some(Self::MergeManifests),
            "diffmanifests" => Some(Self::DiffManifests),
            _ => None,
        }
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let opts = match Opts::try_parse_from(normalize_args(args)) {
        Ok(opts) => opts,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.print()?;
            return Ok(());
        }
        Err(e) => return Err(ToolError::Arguments(e.to_string()).into()),
    };

    let name = opts
        .mode
        .clone()
        .ok_or_else(|| ToolError::Arguments("No tool mode given; pass -mode=<name>".to_string()))?;
    let mode = ToolMode::from_name(&name).ok_or(ToolError::UnknownMode(name))?;

    tracing::debug!("Running tool mode {:?}", mode);

    match mode {
        ToolMode::PackageChunks => package_chunks::run(&opts),
        ToolMode::VerifyChunks => verify_chunks::run(&opts),
        ToolMode::Compactify
        | ToolMode::Enumeration
        | ToolMode::MergeManifests
        | ToolMode::DiffManifests => {
            Err(ToolError::UnsupportedMode(format!("{:?}", mode).to_lowercase()).into())
        }
    }
}

/// Rewrites `-Name=value` switches into `--name=value`.
///
/// The first argument is the program name and is kept as is.
fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let arg: OsString = arg.into();
            if i == 0 {
                return arg;
            }

            let Some(s) = arg.to_str() else {
                return arg;
            };

            match s.strip_prefix('-') {
                Some(rest) if !rest.starts_with('-') && rest.len() > 1 => {
                    let (name, value) = match rest.split_once('=') {
                        Some((name, value)) => (name, Some(value)),
                        None => (rest, None),
                    };

                    let mut normalized = format!("--{}", name.to_ascii_lowercase());
                    if let Some(value) = value {
                        normalized.push('=');
                        normalized.push_str(value);
                    }
                    normalized.into()
                }
                _ => arg,
            }
        })
        .collect()
}

/// Returns a required switch or an argument error.
pub fn require<'a, T>(value: &'a Option<T>, switch: &str) -> Result<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| ToolError::Arguments(format!("Missing required switch -{}=", switch)).into())
}
