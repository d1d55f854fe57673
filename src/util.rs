use memmap2::Mmap;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = fs::File::open(path)?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe { Mmap::map(&file) }
}

/// Run `f` over the bytes of a file, mapping it when non-empty.
/// Zero-length files cannot be mapped on every platform.
pub fn with_file_bytes<T>(path: &Path, f: impl FnOnce(&[u8]) -> T) -> io::Result<T> {
    if fs::symlink_metadata(path)?.len() == 0 {
        return Ok(f(&[]));
    }
    let map = mmap_file(path)?;
    Ok(f(&map))
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> io::Result<blake3::Hash> {
    let file = fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Remove a file, symlink or whole directory tree.
///
/// Read-only directories are made owner-writable first; `remove_dir_all`
/// alone cannot empty them.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return fs::remove_file(path);
    }
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let mode = entry.metadata().map_err(io::Error::other)?.permissions().mode();
            if mode & 0o700 != 0o700 {
                set_mode(entry.path(), mode | 0o700)?;
            }
        }
    }
    fs::remove_dir_all(path)
}
