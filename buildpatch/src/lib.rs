//! The BuildPatch Library.
//!
//! Chunk-oriented build distribution: chunk sources, download
//! service, chunk database packaging and per-machine state.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

pub mod chunk;
pub mod chunkdb;
pub mod config;
pub mod download;
pub mod error;
pub mod fs;
pub mod hash;
pub mod installer_error;
pub mod machine_config;
pub mod reference_tracker;
pub mod source;
pub mod testing;
pub mod util;

pub use error::{BuildPatchError, BuildPatchResult};
