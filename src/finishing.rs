//! Best-effort touches on a freshly promoted tree. Failures here are logged,
//! never returned to the caller of an apply.

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Provenance marker set by browsers and download tools on macOS.
pub const QUARANTINE_ATTRIBUTE: &str = "com.apple.quarantine";

/// Bump the modification time of `root` so file browsers and launch
/// services notice the update.
pub fn refresh_directory_time(root: &Path) -> io::Result<()> {
    let dir = fs::File::open(root)?;
    dir.set_modified(SystemTime::now())
}

/// Strip the quarantine attribute from every node under `root`, links included.
/// Returns how many nodes carried it.
pub fn clear_quarantine(root: &Path) -> io::Result<usize> {
    if !xattr::SUPPORTED_PLATFORM {
        return Ok(0);
    }
    let mut cleared = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        match xattr::get(entry.path(), QUARANTINE_ATTRIBUTE) {
            Ok(Some(_)) => {
                xattr::remove(entry.path(), QUARANTINE_ATTRIBUTE)?;
                cleared += 1;
            }
            Ok(None) => {}
            // Filesystems without extended attributes, or a namespace the
            // platform does not know, simply have nothing to clear.
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "extended attributes unreadable");
            }
        }
    }
    Ok(cleared)
}

pub fn apply_finishing_touches(root: &Path) {
    if let Err(e) = refresh_directory_time(root) {
        warn!(path = %root.display(), error = %e, "could not refresh modification time");
    }
    match clear_quarantine(root) {
        Ok(0) => {}
        Ok(n) => debug!(path = %root.display(), nodes = n, "cleared quarantine attribute"),
        Err(e) => warn!(path = %root.display(), error = %e, "could not clear quarantine attribute"),
    }
}
