//! Atomic install protocol
//!
//! Both storage tiers persist by writing a complete temp file and then
//! swapping it into place through [`install`]. The destination is always
//! either the complete old file or the complete new file, never a partial
//! one. This defends against a process crash mid-write only; two writers
//! racing for the same destination are out of scope and no locking is
//! used.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Extension of installed store files
pub const EXTENSION: &str = ".psdata";

/// Extension of the rotating backup kept beside each installed file
pub const BACKUP_EXTENSION: &str = "._psbak";

/// Derive the rotating backup path for a destination
///
/// `cache.psdata` maps to `cache._psbak`; a destination without the store
/// extension simply gains the backup extension.
pub fn backup_path(dst: &Path) -> std::path::PathBuf {
    let name = dst.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = name.strip_suffix(EXTENSION).unwrap_or(name);
    dst.with_file_name(format!("{stem}{BACKUP_EXTENSION}"))
}

/// Remove a file, treating "not found" as success
///
/// Returns false only for real failures (permissions, disk trouble).
pub fn remove_quiet(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            trace!("Removed file: {}", path.display());
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Could not remove file: {}", path.display());
            debug!("Persistent storage exception: {e}");
            false
        }
    }
}

/// Swap a freshly written temp file into place
///
/// Sequence: drop any stale backup, rotate the current destination to the
/// backup name as a rollback point, then rename the temp file onto the
/// destination. A failed final rename restores the backup best-effort
/// before reporting failure.
pub fn install(src: &Path, dst: &Path) -> bool {
    let dst_backup = backup_path(dst);

    if !remove_quiet(&dst_backup) {
        return false;
    }

    match fs::rename(dst, &dst_backup) {
        Ok(()) => trace!("Backup file created: {}", dst_backup.display()),
        // First-ever install has nothing to back up
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(
                "Could not rotate {} -> {}",
                dst.display(),
                dst_backup.display()
            );
            debug!("Persistent storage exception: {e}");
            return false;
        }
    }

    match fs::rename(src, dst) {
        Ok(()) => {
            trace!("File installed: {}", dst.display());
            true
        }
        Err(e) => {
            warn!("Could not install {} -> {}", src.display(), dst.display());
            debug!("Persistent storage exception: {e}");

            // Roll the backup forward again so the old content survives
            match fs::rename(&dst_backup, dst) {
                Ok(()) => trace!("Restored original content: {}", dst.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to restore original file: {}", dst.display());
                    debug!("Persistent storage exception: {e}");
                }
            }
            false
        }
    }
}
