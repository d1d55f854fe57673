//! Transactional apply: stage a copy, replay, verify, promote.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::binary_patch;
use crate::error::{Error, IoContext, Result};
use crate::finishing;
use crate::patch_format::{
    Digest, FileNode, NodeKind, Operation, PatchSummary, Payload, PERMISSION_MASK,
};
use crate::reader;
use crate::tree::{ancestors, compare_paths, display_hash, TreeSnapshot};
use crate::util;

/// Owner bits kept on every staged directory until the final mode pass.
const STAGING_DIR_BITS: u32 = 0o700;
/// Mode for parents an operation needs but the tree does not have.
const IMPLIED_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Log one line per operation at info level
    pub verbose: bool,
    /// Refresh the root mtime and clear quarantine markers after promotion
    pub finishing_touches: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            finishing_touches: true,
        }
    }
}

/// Reported after each operation has been applied to the staging tree.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent<'a> {
    /// Zero-based position of the operation just applied
    pub index: usize,
    pub total: usize,
    pub operation: &'a Operation,
}

impl ProgressEvent<'_> {
    pub fn fraction(&self) -> f64 {
        (self.index + 1) as f64 / self.total as f64
    }
}

/// Turn the tree at `before` into the patch's after-tree at `destination`.
///
/// `before` and `destination` may be the same directory. Nothing at
/// `destination` changes unless every operation succeeds and the result
/// matches the after-tree hash recorded in the patch.
pub fn apply_patch<F>(
    before: &Path,
    destination: &Path,
    patch: &Path,
    options: &ApplyOptions,
    progress: F,
) -> Result<PatchSummary>
where
    F: FnMut(&ProgressEvent<'_>) -> ControlFlow<()>,
{
    let archive = reader::read_archive(patch)?;
    debug!(
        patch = %patch.display(),
        version = %archive.info.header,
        compression = %archive.info.compression,
        operations = archive.operations.len(),
        "patch validated"
    );

    let snapshot = TreeSnapshot::capture(before)?;
    let actual = snapshot.tree_hash();
    if actual != archive.info.trees.before {
        return Err(Error::VersionMismatch {
            expected: display_hash(&archive.info.trees.before),
            actual: display_hash(&actual),
        });
    }

    apply_operations(
        &snapshot,
        &archive.operations,
        destination,
        Some(archive.info.trees.after),
        options,
        progress,
    )
}

/// Replay `operations` over a staged copy of `before` and promote the result
/// to `destination`.
pub fn apply_operations<F>(
    before: &TreeSnapshot,
    operations: &[Operation],
    destination: &Path,
    expected_after: Option<Digest>,
    options: &ApplyOptions,
    mut progress: F,
) -> Result<PatchSummary>
where
    F: FnMut(&ProgressEvent<'_>) -> ControlFlow<()>,
{
    let mut staging = Staging::create(destination, before)?;

    let total = operations.len();
    for (index, op) in operations.iter().enumerate() {
        if options.verbose {
            info!("{:>8} {}", op.verbose_label(), op.path());
        } else {
            debug!(op = op.kind_name(), path = op.path(), "applying");
        }
        staging.apply(op)?;

        let event = ProgressEvent {
            index,
            total,
            operation: op,
        };
        if progress(&event).is_break() {
            return Err(Error::Cancelled {
                completed: index + 1,
                total,
            });
        }
    }

    staging.finalize_modes()?;

    if let Some(expected) = expected_after {
        let actual = TreeSnapshot::capture(&staging.tree)?.tree_hash();
        if actual != expected {
            return Err(Error::ResultMismatch {
                expected: display_hash(&expected),
                actual: display_hash(&actual),
            });
        }
    }

    staging.promote(destination)?;
    if options.finishing_touches {
        finishing::apply_finishing_touches(destination);
    }

    let summary = PatchSummary::from_operations(operations);
    info!(
        path = %destination.display(),
        operations = summary.total(),
        "patch applied"
    );
    Ok(summary)
}

fn rejected(op: &Operation, cause: impl ToString) -> Error {
    Error::OperationApply {
        path: op.path().to_string(),
        op: op.kind_name(),
        cause: cause.to_string(),
    }
}

fn verify_digest(op: &Operation, node: &FileNode, content: &[u8]) -> Result<()> {
    if node.digest != Some(util::hash_bytes(content)) {
        return Err(rejected(op, "content digest mismatch"));
    }
    Ok(())
}

fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    fs::write(path, content).at(path)?;
    util::set_mode(path, mode).at(path)
}

fn metadata_if_present(path: &Path) -> Result<Option<fs::Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).at(path),
    }
}

/// A working copy of the tree inside a temporary directory next to the
/// destination. Dropping it discards everything not yet promoted.
struct Staging {
    container: Option<TempDir>,
    tree: PathBuf,
    root_mode: u32,
    /// Final modes for directories, applied once all operations are done.
    dir_modes: HashMap<String, u32>,
    /// Paths removed so far; removals beneath them are already satisfied.
    removed: HashSet<String>,
    /// Set when the previous tree could not be put back and sits inside the container.
    preserve: bool,
}

impl Staging {
    fn create(destination: &Path, before: &TreeSnapshot) -> Result<Self> {
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).at(parent)?;
        let container = tempfile::Builder::new()
            .prefix(".treedelta-")
            .tempdir_in(parent)
            .at(parent)?;

        let tree = container.path().join("tree");
        fs::create_dir(&tree).at(&tree)?;
        let root_mode = fs::metadata(before.root())
            .at(before.root())?
            .permissions()
            .mode()
            & PERMISSION_MASK;

        let mut staging = Self {
            container: Some(container),
            tree,
            root_mode,
            dir_modes: HashMap::new(),
            removed: HashSet::new(),
            preserve: false,
        };
        staging.copy_from(before)?;
        debug!(
            staging = %staging.tree.display(),
            nodes = before.len(),
            "before-tree staged"
        );
        Ok(staging)
    }

    fn copy_from(&mut self, before: &TreeSnapshot) -> Result<()> {
        // Canonical order creates every directory before its contents.
        for node in before.nodes() {
            let dst = self.tree.join(&node.path);
            match node.kind {
                NodeKind::Directory => {
                    fs::create_dir(&dst).at(&dst)?;
                    util::set_mode(&dst, node.mode | STAGING_DIR_BITS).at(&dst)?;
                    self.dir_modes.insert(node.path.clone(), node.mode);
                }
                NodeKind::Symlink => {
                    symlink(node.link_target.as_deref().unwrap_or_default(), &dst).at(&dst)?;
                }
                NodeKind::Regular => {}
            }
        }

        let tree = &self.tree;
        before
            .nodes()
            .par_iter()
            .filter(|n| n.kind == NodeKind::Regular)
            .try_for_each(|node| -> Result<()> {
                let src = before.full_path(&node.path);
                let dst = tree.join(&node.path);
                fs::copy(&src, &dst).at(&src)?;
                util::set_mode(&dst, node.mode).at(&dst)
            })
    }

    fn apply(&mut self, op: &Operation) -> Result<()> {
        let path = op.path();
        if matches!(op, Operation::Remove { .. })
            && ancestors(path).any(|a| self.removed.contains(a))
        {
            return Ok(());
        }
        self.prepare_ancestors(op)?;

        let full = self.tree.join(path);
        let existing = metadata_if_present(&full)?;

        match op {
            Operation::Add { node, content } => {
                if existing.is_some() {
                    return Err(rejected(op, "path already exists"));
                }
                match node.kind {
                    NodeKind::Directory => {
                        fs::create_dir(&full).at(&full)?;
                        util::set_mode(&full, node.mode | STAGING_DIR_BITS).at(&full)?;
                        self.dir_modes.insert(path.to_string(), node.mode);
                    }
                    NodeKind::Regular => {
                        let content = content
                            .as_deref()
                            .ok_or_else(|| rejected(op, "regular file without content"))?;
                        verify_digest(op, node, content)?;
                        write_file(&full, content, node.mode)?;
                    }
                    NodeKind::Symlink => {
                        let target = node.link_target.as_deref().unwrap_or_default();
                        symlink(target, &full).at(&full)?;
                    }
                }
            }
            Operation::Remove { .. } => {
                let meta = existing.ok_or_else(|| rejected(op, "path does not exist"))?;
                if meta.is_dir() {
                    util::remove_tree(&full).at(&full)?;
                    let prefix = format!("{path}/");
                    self.dir_modes
                        .retain(|p, _| p != path && !p.starts_with(&prefix));
                } else {
                    fs::remove_file(&full).at(&full)?;
                }
                self.removed.insert(path.to_string());
            }
            Operation::ModifyContent { node, payload } => {
                match existing {
                    Some(meta) if meta.file_type().is_file() => {}
                    Some(_) => return Err(rejected(op, "not a regular file")),
                    None => return Err(rejected(op, "path does not exist")),
                }
                let content: Cow<'_, [u8]> = match payload {
                    Payload::Full(data) => Cow::Borrowed(data),
                    Payload::Diff(chunks) => Cow::Owned(
                        util::with_file_bytes(&full, |old| binary_patch::apply_diff(old, chunks))
                            .at(&full)?
                            .map_err(|e| rejected(op, e))?,
                    ),
                };
                verify_digest(op, node, &content)?;
                fs::remove_file(&full).at(&full)?;
                write_file(&full, &content, node.mode)?;
            }
            Operation::ModifyPermissions { mode, .. } => {
                let meta = existing.ok_or_else(|| rejected(op, "path does not exist"))?;
                if meta.file_type().is_symlink() {
                    return Err(rejected(op, "symlinks carry no permissions"));
                }
                if meta.is_dir() {
                    self.dir_modes.insert(path.to_string(), *mode);
                    util::set_mode(&full, *mode | STAGING_DIR_BITS).at(&full)?;
                } else {
                    util::set_mode(&full, *mode).at(&full)?;
                }
            }
            Operation::ModifySymlinkTarget { target, .. } => {
                match existing {
                    Some(meta) if meta.file_type().is_symlink() => {}
                    Some(_) => return Err(rejected(op, "not a symlink")),
                    None => return Err(rejected(op, "path does not exist")),
                }
                fs::remove_file(&full).at(&full)?;
                symlink(target, &full).at(&full)?;
            }
        }
        Ok(())
    }

    /// Refuse to reach through a symlink; create missing parents for adds.
    fn prepare_ancestors(&mut self, op: &Operation) -> Result<()> {
        let create = matches!(op, Operation::Add { .. });
        for ancestor in ancestors(op.path()) {
            let full = self.tree.join(ancestor);
            match metadata_if_present(&full)? {
                Some(meta) if meta.file_type().is_symlink() => {
                    return Err(Error::PathEscape(op.path().to_string()));
                }
                Some(meta) if meta.is_dir() => {}
                Some(_) => {
                    return Err(rejected(op, format!("{ancestor:?} is not a directory")));
                }
                None if create => {
                    fs::create_dir(&full).at(&full)?;
                    util::set_mode(&full, IMPLIED_DIR_MODE).at(&full)?;
                }
                None => return Err(rejected(op, format!("{ancestor:?} does not exist"))),
            }
        }
        Ok(())
    }

    /// Deepest first, so a read-only parent never blocks its children.
    fn finalize_modes(&self) -> Result<()> {
        let mut dirs: Vec<(&String, &u32)> = self.dir_modes.iter().collect();
        dirs.sort_by(|a, b| compare_paths(b.0, a.0));
        for (path, mode) in dirs {
            let full = self.tree.join(path);
            util::set_mode(&full, *mode).at(&full)?;
        }
        Ok(())
    }

    fn promote(&mut self, destination: &Path) -> Result<()> {
        let Some(container) = self.container.as_ref() else {
            return Err(Error::Io {
                path: self.tree.clone(),
                source: io::Error::other("staging directory already released"),
            });
        };
        let backup = container.path().join("previous");

        let had_previous = match metadata_if_present(destination)? {
            Some(_) => {
                fs::rename(destination, &backup).at(destination)?;
                true
            }
            None => false,
        };

        if let Err(e) = fs::rename(&self.tree, destination) {
            if had_previous {
                if let Err(restore) = fs::rename(&backup, destination) {
                    self.preserve = true;
                    warn!(
                        previous = %backup.display(),
                        error = %restore,
                        "could not restore the previous tree; it has been kept"
                    );
                }
            }
            return Err(e).at(destination);
        }

        if let Err(e) = util::set_mode(destination, self.root_mode) {
            warn!(path = %destination.display(), error = %e, "could not restore root permissions");
        }
        if had_previous {
            if let Err(e) = util::remove_tree(&backup) {
                warn!(path = %backup.display(), error = %e, "could not remove the previous tree");
            }
        }
        debug!(path = %destination.display(), "staged tree promoted");
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.preserve {
            if let Some(container) = self.container.take() {
                let _ = container.into_path();
            }
            return;
        }
        if self.tree.symlink_metadata().is_ok() {
            if let Err(e) = util::remove_tree(&self.tree) {
                warn!(path = %self.tree.display(), error = %e, "could not discard staging tree");
            }
        }
    }
}
