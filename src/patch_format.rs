use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Compression, CompressionSpec};
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 8] = b"TRDELTA\0";

/// Magic plus major and minor version.
pub const HEADER_LEN: usize = MAGIC.len() + 4;

/// Permission bits tracked per node (rwx for all classes plus setuid/setgid/sticky).
pub const PERMISSION_MASK: u32 = 0o7777;

pub type Digest = [u8; 32];

/// Archive dialect. The major version fixes the table layout and the legal codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MajorVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

/// What a major version can express, held as data rather than behavior.
#[derive(Debug)]
pub struct Dialect {
    pub major: MajorVersion,
    pub latest_minor: u16,
    pub codecs: &'static [Compression],
    /// Preamble records compression mode and level.
    pub compression_in_preamble: bool,
    /// Payload references carry the uncompressed length.
    pub raw_lengths: bool,
    /// Preamble ends with a length-prefixed block that older minors skip.
    pub extension_block: bool,
}

static V1_DIALECT: Dialect = Dialect {
    major: MajorVersion::V1,
    latest_minor: 0,
    codecs: &[Compression::None],
    compression_in_preamble: false,
    raw_lengths: false,
    extension_block: false,
};

static V2_DIALECT: Dialect = Dialect {
    major: MajorVersion::V2,
    latest_minor: 1,
    codecs: &[Compression::None, Compression::Gzip],
    compression_in_preamble: true,
    raw_lengths: true,
    extension_block: false,
};

static V3_DIALECT: Dialect = Dialect {
    major: MajorVersion::V3,
    latest_minor: 0,
    codecs: &Compression::ALL,
    compression_in_preamble: true,
    raw_lengths: true,
    extension_block: true,
};

impl MajorVersion {
    pub const EARLIEST: MajorVersion = MajorVersion::V1;
    pub const LATEST: MajorVersion = MajorVersion::V3;

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MajorVersion::V1),
            2 => Ok(MajorVersion::V2),
            3 => Ok(MajorVersion::V3),
            other => Err(Error::UnsupportedVersion(other)),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn dialect(self) -> &'static Dialect {
        match self {
            MajorVersion::V1 => &V1_DIALECT,
            MajorVersion::V2 => &V2_DIALECT,
            MajorVersion::V3 => &V3_DIALECT,
        }
    }

    /// Codec used when the caller does not name one.
    pub fn default_compression(self) -> CompressionSpec {
        match self {
            MajorVersion::V1 => CompressionSpec::new(Compression::None, 0),
            MajorVersion::V2 => CompressionSpec::new(Compression::Gzip, 0),
            MajorVersion::V3 => CompressionSpec::default(),
        }
    }

    /// Reject a codec/level pair this dialect cannot carry.
    pub fn check_compression(self, spec: CompressionSpec) -> Result<()> {
        if self.dialect().codecs.contains(&spec.mode) && spec.level_is_valid() {
            Ok(())
        } else {
            Err(Error::IncompatibleCompression {
                major: self.as_u16(),
                mode: spec.mode,
                level: spec.level,
            })
        }
    }
}

impl fmt::Display for MajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// The only part of a patch readable without knowing its dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub major: u16,
    pub minor: u16,
}

impl PatchHeader {
    pub fn latest() -> Self {
        let major = MajorVersion::LATEST;
        Self {
            major: major.as_u16(),
            minor: major.dialect().latest_minor,
        }
    }

    pub fn for_version(major: MajorVersion) -> Self {
        Self {
            major: major.as_u16(),
            minor: major.dialect().latest_minor,
        }
    }

    pub fn major_version(&self) -> Result<MajorVersion> {
        MajorVersion::from_u16(self.major)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.major.to_le_bytes());
        buf[10..12].copy_from_slice(&self.minor.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::corrupt(format!(
                "file is {} bytes, shorter than the {HEADER_LEN}-byte header",
                buf.len()
            )));
        }
        if &buf[..8] != MAGIC {
            return Err(Error::corrupt("missing magic header"));
        }
        Ok(Self {
            major: u16::from_le_bytes([buf[8], buf[9]]),
            minor: u16::from_le_bytes([buf[10], buf[11]]),
        })
    }
}

impl fmt::Display for PatchHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Tree hashes recorded when the patch was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHashes {
    pub before: Digest,
    pub after: Digest,
}

/// Header plus the dialect-specific preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub header: PatchHeader,
    pub compression: CompressionSpec,
    pub trees: TreeHashes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
}

impl NodeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(NodeKind::Regular),
            1 => Some(NodeKind::Directory),
            2 => Some(NodeKind::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    /// Relative to the tree root, `/`-separated
    pub path: String,
    pub kind: NodeKind,
    /// Permission bits; always 0 for symlinks
    pub mode: u32,
    /// Byte length, regular files only
    pub size: u64,
    pub link_target: Option<String>,
    /// BLAKE3 of the content, regular files only
    pub digest: Option<Digest>,
}

impl FileNode {
    pub fn regular(path: impl Into<String>, mode: u32, size: u64, digest: Digest) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Regular,
            mode,
            size,
            link_target: None,
            digest: Some(digest),
        }
    }

    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Directory,
            mode,
            size: 0,
            link_target: None,
            digest: None,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Symlink,
            mode: 0,
            size: 0,
            link_target: Some(target.into()),
            digest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChunk {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// New content for a modified regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Full(Vec<u8>),
    Diff(Vec<DiffChunk>),
}

/// One described change at one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Add {
        node: FileNode,
        /// Present for regular files only
        content: Option<Vec<u8>>,
    },
    Remove {
        path: String,
    },
    ModifyContent {
        node: FileNode,
        payload: Payload,
    },
    ModifyPermissions {
        path: String,
        mode: u32,
    },
    ModifySymlinkTarget {
        path: String,
        target: String,
    },
}

impl Operation {
    pub fn path(&self) -> &str {
        match self {
            Operation::Add { node, .. } | Operation::ModifyContent { node, .. } => &node.path,
            Operation::Remove { path }
            | Operation::ModifyPermissions { path, .. }
            | Operation::ModifySymlinkTarget { path, .. } => path,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "add",
            Operation::Remove { .. } => "remove",
            Operation::ModifyContent { .. } => "modify-content",
            Operation::ModifyPermissions { .. } => "modify-permissions",
            Operation::ModifySymlinkTarget { .. } => "modify-symlink-target",
        }
    }

    /// Operator-facing verb used in verbose logs.
    pub fn verbose_label(&self) -> &'static str {
        match self {
            Operation::Add { .. } => "Added",
            Operation::Remove { .. } => "Removed",
            Operation::ModifyContent {
                payload: Payload::Diff(_),
                ..
            } => "Diffed",
            Operation::ModifyContent { .. } | Operation::ModifySymlinkTarget { .. } => "Updated",
            Operation::ModifyPermissions { .. } => "Modified",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub added: usize,
    pub removed: usize,
    pub content_modified: usize,
    pub permissions_modified: usize,
    pub symlinks_retargeted: usize,
}

impl PatchSummary {
    pub fn from_operations(operations: &[Operation]) -> Self {
        let mut summary = Self::default();
        for op in operations {
            match op {
                Operation::Add { .. } => summary.added += 1,
                Operation::Remove { .. } => summary.removed += 1,
                Operation::ModifyContent { .. } => summary.content_modified += 1,
                Operation::ModifyPermissions { .. } => summary.permissions_modified += 1,
                Operation::ModifySymlinkTarget { .. } => summary.symlinks_retargeted += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.added
            + self.removed
            + self.content_modified
            + self.permissions_modified
            + self.symlinks_retargeted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes_round_trip() {
        let header = PatchHeader { major: 3, minor: 7 };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..8], MAGIC);
        assert_eq!(PatchHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_short_and_foreign_input() {
        assert!(matches!(
            PatchHeader::from_bytes(b"TRDELTA"),
            Err(Error::CorruptArchive(_))
        ));
        assert!(matches!(
            PatchHeader::from_bytes(b"BSDIFF40\x03\x00\x00\x00"),
            Err(Error::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_unknown_major_is_unsupported() {
        assert!(matches!(
            MajorVersion::from_u16(0),
            Err(Error::UnsupportedVersion(0))
        ));
        assert!(matches!(
            MajorVersion::from_u16(4),
            Err(Error::UnsupportedVersion(4))
        ));
        assert_eq!(MajorVersion::from_u16(2).unwrap(), MajorVersion::V2);
    }

    #[test]
    fn test_codec_sets_grow_with_major_version() {
        let none = CompressionSpec::new(Compression::None, 0);
        let gzip = CompressionSpec::new(Compression::Gzip, 9);
        let zstd = CompressionSpec::new(Compression::Zstd, 0);

        assert!(MajorVersion::V1.check_compression(none).is_ok());
        assert!(MajorVersion::V1.check_compression(gzip).is_err());
        assert!(MajorVersion::V2.check_compression(gzip).is_ok());
        assert!(MajorVersion::V2.check_compression(zstd).is_err());
        assert!(MajorVersion::V3.check_compression(zstd).is_ok());
        assert!(MajorVersion::V3.check_compression(gzip).is_ok());

        for major in [MajorVersion::V1, MajorVersion::V2, MajorVersion::V3] {
            assert!(major.check_compression(major.default_compression()).is_ok());
        }
    }

    #[test]
    fn test_fixed_level_codec_rejects_nonzero_level() {
        let err = MajorVersion::V3
            .check_compression(CompressionSpec::new(Compression::Lz4, 2))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompatibleCompression {
                major: 3,
                mode: Compression::Lz4,
                level: 2
            }
        ));
    }

    #[test]
    fn test_summary_counts_each_kind() {
        let ops = vec![
            Operation::Add {
                node: FileNode::directory("a", 0o755),
                content: None,
            },
            Operation::Remove { path: "b".into() },
            Operation::ModifyPermissions {
                path: "c".into(),
                mode: 0o600,
            },
        ];
        let summary = PatchSummary::from_operations(&ops);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.permissions_modified, 1);
        assert_eq!(summary.total(), 3);
    }
}
