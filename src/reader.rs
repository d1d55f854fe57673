//! Parse and validate patch archives without touching any tree.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use bincode::Options;
use rayon::prelude::*;

use crate::codec::{Compression, CompressionSpec};
use crate::error::{Error, IoContext, Result};
use crate::patch_format::{
    ArchiveInfo, DiffChunk, Digest, FileNode, MajorVersion, NodeKind, Operation, PatchHeader,
    Payload, TreeHashes, HEADER_LEN, PERMISSION_MASK,
};
use crate::tree::validate_relative_path;
use crate::util;
use crate::wire::ByteReader;
use crate::writer::{
    ENCODING_DIFF, ENCODING_FULL, FLAG_REPLACE, OP_ADD, OP_CODE_MASK, OP_MODIFY_CONTENT,
    OP_MODIFY_PERMISSIONS, OP_MODIFY_SYMLINK_TARGET, OP_REMOVE,
};

/// Smallest possible table entry: empty-length prefix, one path byte, tag.
const MIN_ENTRY_LEN: usize = 4;

/// A fully parsed archive.
#[derive(Debug, Clone)]
pub struct PatchArchive {
    pub info: ArchiveInfo,
    pub operations: Vec<Operation>,
}

/// Read only the fixed header. Does not look at the rest of the file.
pub fn read_header(path: &Path) -> Result<PatchHeader> {
    let file = std::fs::File::open(path).at(path)?;
    let mut buf = Vec::with_capacity(HEADER_LEN);
    file.take(HEADER_LEN as u64)
        .read_to_end(&mut buf)
        .at(path)?;
    PatchHeader::from_bytes(&buf)
}

/// Header plus preamble: codec and tree hashes.
pub fn read_info(path: &Path) -> Result<ArchiveInfo> {
    let data = load(path)?;
    let mut r = ByteReader::new(&data);
    Ok(parse_prefix(&mut r)?.0)
}

pub fn read_archive(path: &Path) -> Result<PatchArchive> {
    let data = load(path)?;
    parse_archive(&data)
}

pub fn read_operations(path: &Path) -> Result<Vec<Operation>> {
    Ok(read_archive(path)?.operations)
}

fn load(path: &Path) -> Result<memmap2::Mmap> {
    let len = std::fs::metadata(path).at(path)?.len();
    if len < HEADER_LEN as u64 {
        return Err(Error::corrupt(format!(
            "file is {len} bytes, shorter than the {HEADER_LEN}-byte header"
        )));
    }
    util::mmap_file(path).at(path)
}

/// Validate everything structural first; decompress only once the whole
/// table is known to be sound.
pub fn parse_archive(bytes: &[u8]) -> Result<PatchArchive> {
    let mut r = ByteReader::new(bytes);
    let (info, major) = parse_prefix(&mut r)?;

    let entry_count = r.u32()? as usize;
    let table_len = r.u64()?;
    if table_len > r.remaining() as u64 {
        return Err(Error::corrupt(format!(
            "item table of {table_len} bytes runs past the end of the file"
        )));
    }
    let table = r.bytes(table_len as usize)?;
    let region = &bytes[r.position()..];

    let entries = parse_table(table, entry_count, major, region.len() as u64)?;

    for entry in &entries {
        validate_relative_path(entry.path)?;
    }
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in &entries {
        if !seen.insert(entry.path) {
            return Err(Error::corrupt(format!(
                "path {:?} appears in more than one entry",
                entry.path
            )));
        }
    }

    let operations = entries
        .into_par_iter()
        .map(|entry| entry.into_operations(region, info.compression))
        .collect::<Result<Vec<Vec<Operation>>>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(PatchArchive { info, operations })
}

fn parse_prefix(r: &mut ByteReader<'_>) -> Result<(ArchiveInfo, MajorVersion)> {
    let header = PatchHeader::from_bytes(r.bytes(HEADER_LEN)?)?;
    let major = header.major_version()?;
    let dialect = major.dialect();

    let compression = if dialect.compression_in_preamble {
        let code = r.u8()?;
        let level = r.u8()?;
        let mode = Compression::from_u8(code)
            .ok_or_else(|| Error::corrupt(format!("unknown compression id {code}")))?;
        let spec = CompressionSpec::new(mode, level);
        major.check_compression(spec)?;
        spec
    } else {
        CompressionSpec::new(Compression::None, 0)
    };

    let trees = TreeHashes {
        before: r.digest()?,
        after: r.digest()?,
    };
    if dialect.extension_block {
        let len = r.u16()? as usize;
        r.bytes(len)?;
    }

    Ok((
        ArchiveInfo {
            header,
            compression,
            trees,
        },
        major,
    ))
}

#[derive(Debug, Clone, Copy)]
struct PayloadRef {
    offset: u64,
    stored_len: u64,
    raw_len: u64,
}

enum Body<'a> {
    AddDirectory { mode: u32 },
    AddSymlink { target: &'a str },
    AddRegular { mode: u32, digest: Digest, payload: PayloadRef },
    Remove,
    ModifyContent { mode: u32, diff: bool, digest: Digest, payload: PayloadRef },
    ModifyPermissions { mode: u32 },
    ModifySymlinkTarget { target: &'a str },
}

struct RawEntry<'a> {
    path: &'a str,
    replace: bool,
    body: Body<'a>,
}

fn parse_table<'a>(
    table: &'a [u8],
    entry_count: usize,
    major: MajorVersion,
    region_len: u64,
) -> Result<Vec<RawEntry<'a>>> {
    if entry_count > table.len() / MIN_ENTRY_LEN {
        return Err(Error::corrupt(format!(
            "{entry_count} entries cannot fit in a {}-byte table",
            table.len()
        )));
    }
    let dialect = major.dialect();
    let mut r = ByteReader::new(table);
    let mut entries = Vec::with_capacity(entry_count);

    let payload_ref = |r: &mut ByteReader<'a>| -> Result<PayloadRef> {
        let offset = r.u64()?;
        let stored_len = r.u64()?;
        let raw_len = if dialect.raw_lengths { r.u64()? } else { stored_len };
        let in_bounds = offset
            .checked_add(stored_len)
            .is_some_and(|end| end <= region_len);
        if !in_bounds {
            return Err(Error::corrupt(format!(
                "payload at offset {offset} (+{stored_len}) lies outside the {region_len}-byte payload region"
            )));
        }
        Ok(PayloadRef {
            offset,
            stored_len,
            raw_len,
        })
    };
    let read_mode = |r: &mut ByteReader<'a>| -> Result<u32> {
        let mode = u32::from(r.u16()?);
        if mode & !PERMISSION_MASK != 0 {
            return Err(Error::corrupt(format!("invalid permission bits {mode:o}")));
        }
        Ok(mode)
    };

    for _ in 0..entry_count {
        let path = r.str16()?;
        let tag = r.u8()?;
        let code = tag & OP_CODE_MASK;
        let flags = tag & !OP_CODE_MASK;
        if flags & !FLAG_REPLACE != 0 || (flags != 0 && code != OP_ADD) {
            return Err(Error::corrupt(format!("invalid flags {flags:#x} on {path:?}")));
        }

        let body = match code {
            OP_ADD => {
                let kind = r.u8()?;
                let kind = NodeKind::from_u8(kind)
                    .ok_or_else(|| Error::corrupt(format!("unknown node kind {kind}")))?;
                let mode = read_mode(&mut r)?;
                match kind {
                    NodeKind::Directory => Body::AddDirectory { mode },
                    NodeKind::Symlink => Body::AddSymlink { target: r.str16()? },
                    NodeKind::Regular => Body::AddRegular {
                        mode,
                        digest: r.digest()?,
                        payload: payload_ref(&mut r)?,
                    },
                }
            }
            OP_REMOVE => Body::Remove,
            OP_MODIFY_CONTENT => {
                let mode = read_mode(&mut r)?;
                let diff = match r.u8()? {
                    ENCODING_FULL => false,
                    ENCODING_DIFF => true,
                    other => {
                        return Err(Error::corrupt(format!("unknown payload encoding {other}")))
                    }
                };
                Body::ModifyContent {
                    mode,
                    diff,
                    digest: r.digest()?,
                    payload: payload_ref(&mut r)?,
                }
            }
            OP_MODIFY_PERMISSIONS => Body::ModifyPermissions {
                mode: read_mode(&mut r)?,
            },
            OP_MODIFY_SYMLINK_TARGET => Body::ModifySymlinkTarget {
                target: r.str16()?,
            },
            other => return Err(Error::corrupt(format!("unknown operation code {other}"))),
        };
        entries.push(RawEntry {
            path,
            replace: flags & FLAG_REPLACE != 0,
            body,
        });
    }

    if r.remaining() != 0 {
        return Err(Error::corrupt(format!(
            "{} unexplained bytes after the last table entry",
            r.remaining()
        )));
    }
    Ok(entries)
}

impl RawEntry<'_> {
    fn load(&self, region: &[u8], compression: CompressionSpec, p: PayloadRef) -> Result<Vec<u8>> {
        let start = p.offset as usize;
        let stored = &region[start..start + p.stored_len as usize];
        compression
            .decompress(stored, p.raw_len)
            .map_err(|e| Error::corrupt(format!("payload for {:?}: {e}", self.path)))
    }

    fn verified(&self, content: &[u8], digest: &Digest) -> Result<()> {
        if util::hash_bytes(content) != *digest {
            return Err(Error::corrupt(format!(
                "content digest mismatch for {:?}",
                self.path
            )));
        }
        Ok(())
    }

    fn into_operations(self, region: &[u8], compression: CompressionSpec) -> Result<Vec<Operation>> {
        let path = self.path.to_string();
        let op = match &self.body {
            Body::AddDirectory { mode } => Operation::Add {
                node: FileNode::directory(path.clone(), *mode),
                content: None,
            },
            Body::AddSymlink { target } => Operation::Add {
                node: FileNode::symlink(path.clone(), *target),
                content: None,
            },
            Body::AddRegular {
                mode,
                digest,
                payload,
            } => {
                let content = self.load(region, compression, *payload)?;
                self.verified(&content, digest)?;
                Operation::Add {
                    node: FileNode::regular(path.clone(), *mode, content.len() as u64, *digest),
                    content: Some(content),
                }
            }
            Body::Remove => Operation::Remove { path: path.clone() },
            Body::ModifyContent {
                mode,
                diff,
                digest,
                payload,
            } => {
                let raw = self.load(region, compression, *payload)?;
                let (size, payload) = if *diff {
                    let chunks: Vec<DiffChunk> = bincode::DefaultOptions::new()
                        .with_fixint_encoding()
                        .with_limit(raw.len() as u64)
                        .deserialize(&raw)
                        .map_err(|e| {
                            Error::corrupt(format!("diff payload for {:?}: {e}", self.path))
                        })?;
                    let size = chunks
                        .iter()
                        .map(|c| match c {
                            DiffChunk::Copy { length, .. } => *length,
                            DiffChunk::Insert { data } => data.len() as u64,
                        })
                        .fold(0u64, u64::saturating_add);
                    (size, Payload::Diff(chunks))
                } else {
                    self.verified(&raw, digest)?;
                    (raw.len() as u64, Payload::Full(raw))
                };
                Operation::ModifyContent {
                    node: FileNode::regular(path.clone(), *mode, size, *digest),
                    payload,
                }
            }
            Body::ModifyPermissions { mode } => Operation::ModifyPermissions {
                path: path.clone(),
                mode: *mode,
            },
            Body::ModifySymlinkTarget { target } => Operation::ModifySymlinkTarget {
                path: path.clone(),
                target: target.to_string(),
            },
        };

        if self.replace {
            Ok(vec![Operation::Remove { path }, op])
        } else {
            Ok(vec![op])
        }
    }
}
