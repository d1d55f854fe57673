//! Create orchestration: snapshot both trees, diff them, write the archive.

use std::path::Path;

use tracing::{debug, info};

use crate::codec::CompressionSpec;
use crate::diff;
use crate::error::Result;
use crate::patch_format::{MajorVersion, PatchSummary, TreeHashes};
use crate::tree::{display_hash, TreeSnapshot};
use crate::writer::ArchiveWriter;

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub major_version: MajorVersion,
    pub compression: CompressionSpec,
    /// Log one line per archived operation at info level
    pub verbose: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            major_version: MajorVersion::LATEST,
            compression: CompressionSpec::default(),
            verbose: false,
        }
    }
}

/// Create a patch at `output` that turns `before` into `after`.
///
/// Both trees are walked concurrently on blocking threads; hashing, diffing
/// and compression fan out over Rayon inside them.
pub async fn create_patch(
    before: &Path,
    after: &Path,
    output: &Path,
    options: &CreateOptions,
) -> Result<PatchSummary> {
    // An impossible dialect/codec pair is refused before either tree is read.
    let writer =
        ArchiveWriter::new(options.major_version, options.compression)?.verbose(options.verbose);

    let before_root = before.to_path_buf();
    let after_root = after.to_path_buf();
    let (old, new) = tokio::try_join!(
        tokio::task::spawn_blocking(move || TreeSnapshot::capture(&before_root)),
        tokio::task::spawn_blocking(move || TreeSnapshot::capture(&after_root)),
    )?;
    let old = old?;
    let new = new?;
    debug!(before = old.len(), after = new.len(), "trees captured");

    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PatchSummary> {
        let operations = diff::diff_trees(&old, &new)?;
        let trees = TreeHashes {
            before: old.tree_hash(),
            after: new.tree_hash(),
        };
        let size = writer.write(&operations, trees, &output)?;

        let summary = PatchSummary::from_operations(&operations);
        info!(
            path = %output.display(),
            version = %writer.major(),
            compression = %writer.compression(),
            bytes = size,
            operations = summary.total(),
            before = %display_hash(&trees.before),
            after = %display_hash(&trees.after),
            "patch created"
        );
        Ok(summary)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use crate::error::Error;
    use crate::reader;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_records_both_tree_hashes() {
        let temp = TempDir::new().unwrap();
        let (old, new) = (temp.path().join("old"), temp.path().join("new"));
        fs::create_dir_all(old.join("lib")).unwrap();
        fs::create_dir_all(new.join("lib")).unwrap();
        fs::write(old.join("lib/a.txt"), b"first").unwrap();
        fs::write(new.join("lib/a.txt"), b"second").unwrap();
        fs::write(new.join("b.txt"), b"added").unwrap();

        let patch = temp.path().join("out.delta");
        let summary = create_patch(&old, &new, &patch, &CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.added, 1);
        assert_eq!(summary.content_modified, 1);

        let info = reader::read_info(&patch).unwrap();
        assert_eq!(info.header.major, 3);
        assert_eq!(info.compression, CompressionSpec::default());
        assert_eq!(info.trees.before, TreeSnapshot::capture(&old).unwrap().tree_hash());
        assert_eq!(info.trees.after, TreeSnapshot::capture(&new).unwrap().tree_hash());
    }

    #[tokio::test]
    async fn test_incompatible_options_fail_before_walking() {
        let temp = TempDir::new().unwrap();
        let patch = temp.path().join("out.delta");
        let options = CreateOptions {
            major_version: MajorVersion::V1,
            compression: CompressionSpec::new(Compression::Gzip, 0),
            verbose: false,
        };
        // Neither tree exists; the codec check must win.
        let err = create_patch(
            &temp.path().join("missing-a"),
            &temp.path().join("missing-b"),
            &patch,
            &options,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::IncompatibleCompression { major: 1, .. }));
        assert!(!patch.exists());
    }

    #[tokio::test]
    async fn test_unreadable_tree_is_reported() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("old")).unwrap();
        let err = create_patch(
            &temp.path().join("old"),
            &temp.path().join("nope"),
            &temp.path().join("out.delta"),
            &CreateOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TreeRead { .. }));
    }
}
