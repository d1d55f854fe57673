//! Merge-walk two snapshots into an ordered operation list.

use std::cmp::Ordering;
use std::path::Path;

use rayon::prelude::*;

use crate::binary_diff;
use crate::error::{Error, Result};
use crate::patch_format::{FileNode, NodeKind, Operation, Payload};
use crate::tree::{compare_paths, TreeSnapshot};
use crate::util;

/// Returns true for file types that are already compressed or otherwise incompressible,
/// where computing a binary diff would yield no meaningful savings.
fn is_incompressible(path: &str) -> bool {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "ico" | "icns" | "tiff" | "tif" | "avif"
            // Audio / video
            | "mp4" | "mkv" | "mov" | "webm" | "m4v" | "mp3" | "aac" | "ogg" | "flac" | "m4a"
            // Archives
            | "zip" | "gz" | "bz2" | "xz" | "zst" | "7z" | "dmg" | "car"
            // Fonts
            | "woff" | "woff2"
            // Other
            | "pdf"
        )
    )
}

/// One step of the merge walk, before any file content is read.
enum Change<'a> {
    Added(&'a FileNode),
    Removed(&'a FileNode),
    Replaced(&'a FileNode, &'a FileNode),
    Content(&'a FileNode, &'a FileNode),
    Permissions(&'a FileNode),
    Target(&'a FileNode),
}

/// Describe how to turn `before` into `after`.
///
/// Operations come out in canonical path order, so a parent directory is
/// always created before anything addressing a child. A kind change at one
/// path becomes `Remove` immediately followed by `Add`.
pub fn diff_trees(before: &TreeSnapshot, after: &TreeSnapshot) -> Result<Vec<Operation>> {
    let changes = merge_walk(before.nodes(), after.nodes());

    let mut operations: Vec<Operation> = changes
        .par_iter()
        .map(|change| expand(change, before, after))
        .collect::<Result<Vec<Vec<Operation>>>>()?
        .into_iter()
        .flatten()
        .collect();

    // Stable: keeps Remove ahead of Add on a replaced path.
    operations.sort_by(|a, b| compare_paths(a.path(), b.path()));
    Ok(operations)
}

fn merge_walk<'a>(before: &'a [FileNode], after: &'a [FileNode]) -> Vec<Change<'a>> {
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < before.len() || j < after.len() {
        let order = match (before.get(i), after.get(j)) {
            (Some(old), Some(new)) => compare_paths(&old.path, &new.path),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Less => {
                changes.push(Change::Removed(&before[i]));
                i += 1;
            }
            Ordering::Greater => {
                changes.push(Change::Added(&after[j]));
                j += 1;
            }
            Ordering::Equal => {
                if let Some(change) = classify(&before[i], &after[j]) {
                    changes.push(change);
                }
                i += 1;
                j += 1;
            }
        }
    }
    changes
}

fn classify<'a>(old: &'a FileNode, new: &'a FileNode) -> Option<Change<'a>> {
    if old.kind != new.kind {
        return Some(Change::Replaced(old, new));
    }
    match new.kind {
        NodeKind::Regular if old.digest != new.digest => Some(Change::Content(old, new)),
        NodeKind::Symlink if old.link_target != new.link_target => Some(Change::Target(new)),
        _ if old.mode != new.mode => Some(Change::Permissions(new)),
        _ => None,
    }
}

fn expand(change: &Change<'_>, before: &TreeSnapshot, after: &TreeSnapshot) -> Result<Vec<Operation>> {
    Ok(match change {
        Change::Added(node) => vec![add_operation(node, after)?],
        Change::Removed(node) => vec![Operation::Remove {
            path: node.path.clone(),
        }],
        Change::Replaced(old, new) => vec![
            Operation::Remove {
                path: old.path.clone(),
            },
            add_operation(new, after)?,
        ],
        Change::Content(_, new) => vec![Operation::ModifyContent {
            node: (*new).clone(),
            payload: content_payload(&new.path, before, after)?,
        }],
        Change::Permissions(node) => vec![Operation::ModifyPermissions {
            path: node.path.clone(),
            mode: node.mode,
        }],
        Change::Target(node) => vec![Operation::ModifySymlinkTarget {
            path: node.path.clone(),
            target: node.link_target.clone().unwrap_or_default(),
        }],
    })
}

fn add_operation(node: &FileNode, after: &TreeSnapshot) -> Result<Operation> {
    let content = match node.kind {
        NodeKind::Regular => {
            let full = after.full_path(&node.path);
            Some(std::fs::read(&full).map_err(|e| Error::tree_read(&full, e))?)
        }
        NodeKind::Directory | NodeKind::Symlink => None,
    };
    Ok(Operation::Add {
        node: node.clone(),
        content,
    })
}

/// A block diff when it encodes smaller than the new content, else the full content.
fn content_payload(path: &str, before: &TreeSnapshot, after: &TreeSnapshot) -> Result<Payload> {
    let old_path = before.full_path(path);
    let new_path = after.full_path(path);

    let new_data = std::fs::read(&new_path).map_err(|e| Error::tree_read(&new_path, e))?;
    if is_incompressible(path) {
        return Ok(Payload::Full(new_data));
    }

    let chunks = util::with_file_bytes(&old_path, |old| {
        binary_diff::compute_diff(old, &new_data)
    })
    .map_err(|e| Error::tree_read(&old_path, e))?;

    if binary_diff::encoded_len(&chunks) < new_data.len() as u64 {
        Ok(Payload::Diff(chunks))
    } else {
        Ok(Payload::Full(new_data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::set_mode;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn snapshot(dir: &Path) -> TreeSnapshot {
        TreeSnapshot::capture(dir).unwrap()
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let full = root.join(rel);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, data).unwrap();
        set_mode(&full, 0o644).unwrap();
    }

    fn labels(ops: &[Operation]) -> Vec<(String, &'static str)> {
        ops.iter()
            .map(|op| (op.path().to_string(), op.kind_name()))
            .collect()
    }

    #[test]
    fn test_identical_trees_produce_nothing() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a/b.txt", b"same");
        symlink("a/b.txt", temp.path().join("link")).unwrap();
        let snap = snapshot(temp.path());
        assert!(diff_trees(&snap, &snap).unwrap().is_empty());
    }

    #[test]
    fn test_each_change_kind() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();

        write(old.path(), "keep.txt", b"unchanged");
        write(new.path(), "keep.txt", b"unchanged");
        write(old.path(), "edit.txt", b"version one");
        write(new.path(), "edit.txt", b"version two");
        write(old.path(), "gone/old.txt", b"bye");
        write(new.path(), "fresh/new.txt", b"hi");
        write(old.path(), "script.sh", b"echo");
        write(new.path(), "script.sh", b"echo");
        set_mode(&new.path().join("script.sh"), 0o755).unwrap();
        symlink("keep.txt", old.path().join("link")).unwrap();
        symlink("edit.txt", new.path().join("link")).unwrap();

        let ops = diff_trees(&snapshot(old.path()), &snapshot(new.path())).unwrap();
        assert_eq!(
            labels(&ops),
            vec![
                ("edit.txt".to_string(), "modify-content"),
                ("fresh".to_string(), "add"),
                ("fresh/new.txt".to_string(), "add"),
                ("gone".to_string(), "remove"),
                ("gone/old.txt".to_string(), "remove"),
                ("link".to_string(), "modify-symlink-target"),
                ("script.sh".to_string(), "modify-permissions"),
            ]
        );

        match &ops[0] {
            Operation::ModifyContent { node, payload } => {
                assert_eq!(node.digest, Some(util::hash_bytes(b"version two")));
                // Tiny files never beat their own size as a diff.
                assert_eq!(payload, &Payload::Full(b"version two".to_vec()));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &ops[2] {
            Operation::Add { content, .. } => assert_eq!(content.as_deref(), Some(&b"hi"[..])),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_kind_change_is_remove_then_add() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        write(old.path(), "thing", b"file first");
        write(new.path(), "thing/inside.txt", b"now a directory");

        let ops = diff_trees(&snapshot(old.path()), &snapshot(new.path())).unwrap();
        assert_eq!(
            labels(&ops),
            vec![
                ("thing".to_string(), "remove"),
                ("thing".to_string(), "add"),
                ("thing/inside.txt".to_string(), "add"),
            ]
        );
    }

    #[test]
    fn test_large_edit_uses_block_diff() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        let base: Vec<u8> = (0..64 * 1024).map(|i| (i * 7 % 253) as u8).collect();
        let mut edited = base.clone();
        edited[100..110].copy_from_slice(b"0123456789");
        write(old.path(), "lib/core.bin", &base);
        write(new.path(), "lib/core.bin", &edited);

        let ops = diff_trees(&snapshot(old.path()), &snapshot(new.path())).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0],
            Operation::ModifyContent {
                payload: Payload::Diff(_),
                ..
            }
        ));
    }

    #[test]
    fn test_incompressible_extension_skips_diff() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        let base = vec![5u8; 32 * 1024];
        let mut edited = base.clone();
        edited[0] = 6;
        write(old.path(), "art.png", &base);
        write(new.path(), "art.png", &edited);

        let ops = diff_trees(&snapshot(old.path()), &snapshot(new.path())).unwrap();
        assert!(matches!(
            &ops[0],
            Operation::ModifyContent {
                payload: Payload::Full(_),
                ..
            }
        ));
    }
}
