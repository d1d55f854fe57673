//! Serialize an operation list into a versioned patch archive.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::codec::CompressionSpec;
use crate::error::{Error, IoContext, Result};
use crate::patch_format::{
    Dialect, Digest, FileNode, MajorVersion, NodeKind, Operation, PatchHeader, Payload,
    TreeHashes,
};
use crate::tree::validate_relative_path;
use crate::wire::ByteWriter;

pub(crate) const OP_ADD: u8 = 0;
pub(crate) const OP_REMOVE: u8 = 1;
pub(crate) const OP_MODIFY_CONTENT: u8 = 2;
pub(crate) const OP_MODIFY_PERMISSIONS: u8 = 3;
pub(crate) const OP_MODIFY_SYMLINK_TARGET: u8 = 4;
pub(crate) const OP_CODE_MASK: u8 = 0x0F;
/// On an Add: remove whatever currently sits at the path first.
pub(crate) const FLAG_REPLACE: u8 = 0x80;

pub(crate) const ENCODING_FULL: u8 = 0;
pub(crate) const ENCODING_DIFF: u8 = 1;

/// One table row: the operation plus the raw bytes it needs in the payload region.
struct Entry<'a> {
    op: &'a Operation,
    replace: bool,
    raw_payload: Option<Vec<u8>>,
}

/// Writes archives of one fixed dialect and codec.
#[derive(Debug, Clone)]
pub struct ArchiveWriter {
    major: MajorVersion,
    compression: CompressionSpec,
    verbose: bool,
}

impl ArchiveWriter {
    /// Fails up front if the dialect cannot carry the requested codec.
    pub fn new(major: MajorVersion, compression: CompressionSpec) -> Result<Self> {
        major.check_compression(compression)?;
        Ok(Self {
            major,
            compression,
            verbose: false,
        })
    }

    /// Log one line per operation at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn major(&self) -> MajorVersion {
        self.major
    }

    pub fn compression(&self) -> CompressionSpec {
        self.compression
    }

    /// Write `operations` to `destination`, returning the archive size in bytes.
    ///
    /// The archive is assembled in a temporary file beside `destination` and
    /// renamed into place, so a failure never leaves a partial archive behind.
    pub fn write(
        &self,
        operations: &[Operation],
        trees: TreeHashes,
        destination: &Path,
    ) -> Result<u64> {
        let entries = self.plan_entries(operations)?;

        for entry in &entries {
            if self.verbose {
                info!("{:>8} {}", entry.op.verbose_label(), entry.op.path());
            } else {
                debug!(op = entry.op.kind_name(), path = entry.op.path(), "archiving");
            }
        }

        let compression = self.compression;
        let stored: Vec<Option<Vec<u8>>> = entries
            .par_iter()
            .map(|entry| {
                entry
                    .raw_payload
                    .as_deref()
                    .map(|raw| compression.compress(raw))
                    .transpose()
            })
            .collect::<std::io::Result<_>>()
            .at(destination)?;

        let dialect = self.major.dialect();
        let mut table = ByteWriter::new();
        let mut payload_offset: u64 = 0;
        for (entry, stored) in entries.iter().zip(&stored) {
            let payload_ref = match (stored, &entry.raw_payload) {
                (Some(stored), Some(raw)) => {
                    let r = PayloadRef {
                        offset: payload_offset,
                        stored_len: stored.len() as u64,
                        raw_len: raw.len() as u64,
                    };
                    payload_offset += r.stored_len;
                    Some(r)
                }
                _ => None,
            };
            encode_entry(&mut table, dialect, entry, payload_ref)?;
        }

        let mut head = ByteWriter::new();
        head.put_bytes(&PatchHeader::for_version(self.major).to_bytes());
        encode_preamble(&mut head, dialect, self.compression, trees);
        head.put_u32(entries.len() as u32);
        head.put_u64(table.len() as u64);

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(parent).at(parent)?;
        {
            let mut out = std::io::BufWriter::new(file.as_file_mut());
            out.write_all(&head.into_inner()).at(destination)?;
            out.write_all(&table.into_inner()).at(destination)?;
            for payload in stored.iter().flatten() {
                out.write_all(payload).at(destination)?;
            }
            out.flush().at(destination)?;
        }
        file.as_file().sync_all().at(destination)?;
        let size = file.as_file().metadata().at(destination)?.len();
        file.persist(destination)
            .map_err(|e| e.error)
            .at(destination)?;

        debug!(
            path = %destination.display(),
            bytes = size,
            entries = entries.len(),
            "patch archive written"
        );
        Ok(size)
    }

    /// Validate paths, fold Remove+Add pairs into replace entries and
    /// serialize each payload's raw bytes.
    fn plan_entries<'a>(&self, operations: &'a [Operation]) -> Result<Vec<Entry<'a>>> {
        let mut entries: Vec<Entry<'a>> = Vec::with_capacity(operations.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(operations.len());

        let mut i = 0;
        while i < operations.len() {
            let op = &operations[i];
            validate_relative_path(op.path())?;

            let folds_into_next = matches!(op, Operation::Remove { .. })
                && operations.get(i + 1).is_some_and(|next| {
                    matches!(next, Operation::Add { .. }) && next.path() == op.path()
                });
            let (op, replace) = if folds_into_next {
                i += 1;
                (&operations[i], true)
            } else {
                (op, false)
            };
            i += 1;

            if !seen.insert(op.path()) {
                return Err(Error::corrupt(format!(
                    "more than one operation for path {:?}",
                    op.path()
                )));
            }
            entries.push(Entry {
                op,
                replace,
                raw_payload: raw_payload(op)?,
            });
        }
        Ok(entries)
    }
}

/// Convenience wrapper: validate, then write.
pub fn write_archive(
    operations: &[Operation],
    major: MajorVersion,
    compression: CompressionSpec,
    trees: TreeHashes,
    verbose: bool,
    destination: &Path,
) -> Result<u64> {
    ArchiveWriter::new(major, compression)?
        .verbose(verbose)
        .write(operations, trees, destination)
}

#[derive(Debug, Clone, Copy)]
struct PayloadRef {
    offset: u64,
    stored_len: u64,
    raw_len: u64,
}

fn raw_payload(op: &Operation) -> Result<Option<Vec<u8>>> {
    Ok(match op {
        Operation::Add {
            node,
            content: Some(content),
        } if node.kind == NodeKind::Regular => Some(content.clone()),
        Operation::Add { node, .. } if node.kind == NodeKind::Regular => {
            return Err(Error::corrupt(format!(
                "add of regular file {:?} carries no content",
                node.path
            )))
        }
        Operation::ModifyContent {
            payload: Payload::Full(data),
            ..
        } => Some(data.clone()),
        Operation::ModifyContent {
            payload: Payload::Diff(chunks),
            ..
        } => Some(bincode::serialize(chunks).map_err(|e| Error::corrupt(e.to_string()))?),
        _ => None,
    })
}

fn encode_preamble(
    w: &mut ByteWriter,
    dialect: &Dialect,
    compression: CompressionSpec,
    trees: TreeHashes,
) {
    if dialect.compression_in_preamble {
        w.put_u8(compression.mode as u8);
        w.put_u8(compression.level);
    }
    w.put_bytes(&trees.before);
    w.put_bytes(&trees.after);
    if dialect.extension_block {
        // No extensions defined at the latest minor.
        w.put_u16(0);
    }
}

fn node_digest(node: &FileNode) -> Result<Digest> {
    node.digest
        .ok_or_else(|| Error::corrupt(format!("regular file {:?} has no digest", node.path)))
}

fn encode_entry(
    w: &mut ByteWriter,
    dialect: &Dialect,
    entry: &Entry<'_>,
    payload: Option<PayloadRef>,
) -> Result<()> {
    let op = entry.op;
    w.put_str16(op.path())?;
    match op {
        Operation::Add { node, .. } => {
            let flags = if entry.replace { FLAG_REPLACE } else { 0 };
            w.put_u8(OP_ADD | flags);
            w.put_u8(node.kind as u8);
            w.put_u16(node.mode as u16);
            match node.kind {
                NodeKind::Regular => {
                    w.put_bytes(&node_digest(node)?);
                    encode_payload_ref(w, dialect, payload)?;
                }
                NodeKind::Symlink => {
                    w.put_str16(node.link_target.as_deref().unwrap_or_default())?;
                }
                NodeKind::Directory => {}
            }
        }
        Operation::Remove { .. } => w.put_u8(OP_REMOVE),
        Operation::ModifyContent { node, payload: p } => {
            w.put_u8(OP_MODIFY_CONTENT);
            w.put_u16(node.mode as u16);
            w.put_u8(match p {
                Payload::Full(_) => ENCODING_FULL,
                Payload::Diff(_) => ENCODING_DIFF,
            });
            w.put_bytes(&node_digest(node)?);
            encode_payload_ref(w, dialect, payload)?;
        }
        Operation::ModifyPermissions { mode, .. } => {
            w.put_u8(OP_MODIFY_PERMISSIONS);
            w.put_u16(*mode as u16);
        }
        Operation::ModifySymlinkTarget { target, .. } => {
            w.put_u8(OP_MODIFY_SYMLINK_TARGET);
            w.put_str16(target)?;
        }
    }
    Ok(())
}

fn encode_payload_ref(
    w: &mut ByteWriter,
    dialect: &Dialect,
    payload: Option<PayloadRef>,
) -> Result<()> {
    let payload = payload.ok_or_else(|| Error::corrupt("content entry without a payload"))?;
    w.put_u64(payload.offset);
    w.put_u64(payload.stored_len);
    if dialect.raw_lengths {
        w.put_u64(payload.raw_len);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Compression;
    use tempfile::TempDir;

    fn hashes() -> TreeHashes {
        TreeHashes {
            before: [1; 32],
            after: [2; 32],
        }
    }

    fn sample_ops() -> Vec<Operation> {
        vec![
            Operation::Add {
                node: FileNode::directory("docs", 0o755),
                content: None,
            },
            Operation::Add {
                node: FileNode::regular("docs/readme.txt", 0o644, 5, crate::util::hash_bytes(b"hello")),
                content: Some(b"hello".to_vec()),
            },
        ]
    }

    #[test]
    fn test_modern_codec_refused_for_early_version_before_writing() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.delta");
        for (major, spec) in [
            (MajorVersion::V1, CompressionSpec::new(Compression::Gzip, 0)),
            (MajorVersion::V2, CompressionSpec::new(Compression::Zstd, 0)),
            (MajorVersion::V3, CompressionSpec::new(Compression::Lz4, 1)),
        ] {
            let err = write_archive(&sample_ops(), major, spec, hashes(), false, &dest).unwrap_err();
            assert!(matches!(err, Error::IncompatibleCompression { .. }), "{err}");
        }
        assert!(!dest.exists());
    }

    #[test]
    fn test_escaping_path_leaves_no_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.delta");
        let ops = vec![Operation::Remove {
            path: "../outside".into(),
        }];
        let err = write_archive(
            &ops,
            MajorVersion::V3,
            CompressionSpec::default(),
            hashes(),
            false,
            &dest,
        )
        .unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicate_paths_are_refused() {
        let temp = TempDir::new().unwrap();
        let ops = vec![
            Operation::Remove { path: "a".into() },
            Operation::Remove { path: "a".into() },
        ];
        let err = write_archive(
            &ops,
            MajorVersion::V2,
            CompressionSpec::new(Compression::None, 0),
            hashes(),
            false,
            &temp.path().join("out.delta"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CorruptArchive(_)));
    }

    #[test]
    fn test_header_leads_the_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.delta");
        let size = write_archive(
            &sample_ops(),
            MajorVersion::V2,
            CompressionSpec::new(Compression::Gzip, 9),
            hashes(),
            true,
            &dest,
        )
        .unwrap();
        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(bytes.len() as u64, size);
        let header = PatchHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, PatchHeader::for_version(MajorVersion::V2));
    }

    #[test]
    fn test_verbose_flag_does_not_change_bytes() {
        let temp = TempDir::new().unwrap();
        let quiet = temp.path().join("quiet.delta");
        let loud = temp.path().join("loud.delta");
        let spec = CompressionSpec::new(Compression::Zlib, 0);
        write_archive(&sample_ops(), MajorVersion::V3, spec, hashes(), false, &quiet).unwrap();
        write_archive(&sample_ops(), MajorVersion::V3, spec, hashes(), true, &loud).unwrap();
        assert_eq!(std::fs::read(quiet).unwrap(), std::fs::read(loud).unwrap());
    }
}
