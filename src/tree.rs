//! Snapshots of a live directory tree: walk, digest, canonical order.

use std::cmp::Ordering;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::patch_format::{Digest, FileNode, NodeKind, PERMISSION_MASK};
use crate::util;

/// Canonical path order: component-wise, so a directory precedes everything
/// beneath it and siblings sort bytewise.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

/// Reject any table path that does not stay strictly inside the tree root.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let escape = || Error::PathEscape(path.to_string());
    if path.is_empty() || path.contains('\0') || path.contains('\\') {
        return Err(escape());
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(escape());
    }
    if !Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(escape());
    }
    Ok(())
}

/// Every ancestor of `path`, nearest to the root first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// The state of a tree at one instant, one node per path, in canonical order.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    root: PathBuf,
    nodes: Vec<FileNode>,
}

impl TreeSnapshot {
    /// Walk `root` without following links and digest every regular file.
    pub fn capture(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::tree_read(root, format!("cannot resolve root: {e}")))?;
        if !root.is_dir() {
            return Err(Error::tree_read(&root, "root is not a directory"));
        }

        let mut nodes = Vec::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let at = e.path().unwrap_or(&root).to_path_buf();
                Error::tree_read(&at, e)
            })?;
            let full_path = entry.path();
            let relative = full_path
                .strip_prefix(&root)
                .map_err(|e| Error::tree_read(full_path, e))?;
            let relative = relative
                .to_str()
                .ok_or_else(|| Error::tree_read(full_path, "path is not valid UTF-8"))?
                .to_string();

            let meta = entry
                .metadata()
                .map_err(|e| Error::tree_read(full_path, e))?;
            let file_type = entry.file_type();
            let mode = meta.permissions().mode() & PERMISSION_MASK;

            let node = if file_type.is_dir() {
                FileNode::directory(relative, mode)
            } else if file_type.is_file() {
                // Digest is filled in by the parallel pass below.
                FileNode::regular(relative, mode, meta.len(), [0u8; 32])
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(full_path)
                    .map_err(|e| Error::tree_read(full_path, e))?;
                let target = target
                    .to_str()
                    .ok_or_else(|| Error::tree_read(full_path, "link target is not valid UTF-8"))?
                    .to_string();
                FileNode::symlink(relative, target)
            } else {
                return Err(Error::tree_read(
                    full_path,
                    "unsupported node kind (only regular files, directories and symlinks)",
                ));
            };
            nodes.push(node);
        }

        nodes
            .par_iter_mut()
            .filter(|n| n.kind == NodeKind::Regular)
            .try_for_each(|node| -> Result<()> {
                let full = root.join(&node.path);
                let hash = util::hash_file_streaming(&full)
                    .map_err(|e| Error::tree_read(&full, e))?;
                node.digest = Some(*hash.as_bytes());
                Ok(())
            })?;

        nodes.sort_by(|a, b| compare_paths(&a.path, &b.path));
        Ok(Self { root, nodes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes(&self) -> &[FileNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileNode> {
        self.nodes
            .binary_search_by(|n| compare_paths(&n.path, path))
            .ok()
            .map(|i| &self.nodes[i])
    }

    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Identity of the whole tree. Timestamps are volatile and not included.
    pub fn tree_hash(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        for node in &self.nodes {
            hasher.update(node.path.as_bytes());
            hasher.update(&[0, node.kind as u8]);
            hasher.update(&node.mode.to_le_bytes());
            if let Some(digest) = &node.digest {
                hasher.update(digest);
            }
            if let Some(target) = &node.link_target {
                hasher.update(target.as_bytes());
            }
            hasher.update(&[0]);
        }
        *hasher.finalize().as_bytes()
    }
}

pub fn display_hash(digest: &Digest) -> String {
    blake3::Hash::from(*digest).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_parent_sorts_before_children_and_siblings() {
        let mut paths = vec!["a/b", "a-c", "a", "b", "a/b/c", "a.txt"];
        paths.sort_by(|a, b| compare_paths(a, b));
        assert_eq!(paths, vec!["a", "a/b", "a/b/c", "a-c", "a.txt", "b"]);
    }

    #[test]
    fn test_escaping_paths_are_rejected() {
        for bad in [
            "../outside",
            "a/../../b",
            "/etc/passwd",
            "",
            "a//b",
            "./a",
            "a/",
            "a\\..\\b",
        ] {
            assert!(
                matches!(validate_relative_path(bad), Err(Error::PathEscape(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_relative_path("Contents/MacOS/app").is_ok());
        assert!(validate_relative_path("..hidden").is_ok());
    }

    #[test]
    fn test_ancestors_nearest_root_first() {
        let all: Vec<_> = ancestors("a/b/c").collect();
        assert_eq!(all, vec!["a", "a/b"]);
        assert_eq!(ancestors("top").count(), 0);
    }

    #[test]
    fn test_capture_records_kinds_modes_and_targets() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/tool"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("bin/tool", root.join("current")).unwrap();

        let snap = TreeSnapshot::capture(root).unwrap();
        let paths: Vec<_> = snap.nodes().iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["bin", "bin/tool", "current"]);

        let tool = snap.get("bin/tool").unwrap();
        assert_eq!(tool.kind, NodeKind::Regular);
        assert_eq!(tool.mode, 0o755);
        assert_eq!(tool.size, 10);
        assert_eq!(tool.digest, Some(*blake3::hash(b"#!/bin/sh\n").as_bytes()));

        let link = snap.get("current").unwrap();
        assert_eq!(link.kind, NodeKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("bin/tool"));
        assert_eq!(link.mode, 0);
    }

    #[test]
    fn test_tree_hash_tracks_content_and_mode() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(root.join("f"), b"one").unwrap();
        fs::set_permissions(root.join("f"), fs::Permissions::from_mode(0o644)).unwrap();
        let first = TreeSnapshot::capture(root).unwrap().tree_hash();
        assert_eq!(first, TreeSnapshot::capture(root).unwrap().tree_hash());

        fs::set_permissions(root.join("f"), fs::Permissions::from_mode(0o600)).unwrap();
        let second = TreeSnapshot::capture(root).unwrap().tree_hash();
        assert_ne!(first, second);

        fs::write(root.join("f"), b"two").unwrap();
        assert_ne!(second, TreeSnapshot::capture(root).unwrap().tree_hash());
    }

    #[test]
    fn test_socket_is_rejected() {
        let temp = TempDir::new().unwrap();
        let _listener =
            std::os::unix::net::UnixListener::bind(temp.path().join("control.sock")).unwrap();
        let err = TreeSnapshot::capture(temp.path()).unwrap_err();
        assert!(matches!(err, Error::TreeRead { .. }), "{err}");
    }

    #[test]
    fn test_missing_root_is_tree_read_error() {
        let temp = TempDir::new().unwrap();
        let err = TreeSnapshot::capture(&temp.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::TreeRead { .. }));
    }
}
