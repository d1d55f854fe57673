use std::path::{Path, PathBuf};

use crate::codec::Compression;

/// Every failure the create/apply engine can report.
///
/// Format, version and path-safety errors are raised before any filesystem
/// mutation. Apply errors abort the whole transaction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported patch major version {0}")]
    UnsupportedVersion(u16),

    #[error("compression {mode} at level {level} is not supported by major version {major}")]
    IncompatibleCompression {
        major: u16,
        mode: Compression,
        level: u8,
    },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("path escapes tree root: {0:?}")]
    PathEscape(String),

    #[error("failed to read tree at {}: {reason}", path.display())]
    TreeRead { path: PathBuf, reason: String },

    #[error("before-tree does not match the patch (expected tree hash {expected}, found {actual})")]
    VersionMismatch { expected: String, actual: String },

    #[error("failed to apply {op} at {path:?}: {cause}")]
    OperationApply {
        path: String,
        op: &'static str,
        cause: String,
    },

    #[error("patched tree does not match the patch (expected tree hash {expected}, found {actual})")]
    ResultMismatch { expected: String, actual: String },

    #[error("apply cancelled after {completed} of {total} operations")]
    Cancelled { completed: usize, total: usize },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptArchive(msg.into())
    }

    pub(crate) fn tree_read(path: &Path, reason: impl ToString) -> Self {
        Error::TreeRead {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Attach the offending path to a raw I/O error.
pub trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
