//! Create and apply binary patches between two versions of a directory tree.
//!
//! A patch is a single versioned archive: a fixed header, a dialect-specific
//! preamble, an item table with one entry per changed path, and a region of
//! independently compressed payloads. Applying one never touches the
//! destination until the whole result has been built and verified.

pub mod apply;
pub mod batch;
pub mod binary_diff;
pub mod binary_patch;
pub mod codec;
pub mod create;
pub mod diff;
pub mod error;
pub mod finishing;
pub mod patch_format;
pub mod policy;
pub mod reader;
mod rolling_hash;
pub mod tree;
mod util;
mod wire;
pub mod writer;

use std::path::Path;

pub use apply::{apply_operations, apply_patch, ApplyOptions, ProgressEvent};
pub use batch::{create_patches, CreateJob, MAX_CONCURRENT_CREATES};
pub use codec::{Compression, CompressionSpec};
pub use create::{create_patch, CreateOptions};
pub use error::{Error, Result};
pub use patch_format::{MajorVersion, Operation, PatchHeader, PatchSummary};
pub use tree::TreeSnapshot;

/// The header of `patch`, or the newest format this crate writes when no
/// file is given. Only the first 12 bytes of the file are read.
pub fn version_info(patch: Option<&Path>) -> Result<PatchHeader> {
    match patch {
        Some(path) => reader::read_header(path),
        None => Ok(PatchHeader::latest()),
    }
}
