//! Fleet-level maintenance across namespaces
//!
//! A store instance only ever touches its own namespace. These functions
//! operate on a whole root directory instead, so a scheduled job can
//! discover every namespace ever written and reclaim disk from the ones
//! nobody has touched in a while. Liveness is judged purely by file
//! mtime, which is why the in-process read paths renew timestamps on
//! access.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info};

use crate::install::{BACKUP_EXTENSION, EXTENSION};
use crate::store::{CACHE_KEY, DATA_DIR, DEFAULT_FILE_EXPIRY, TEMP_DIR};
use crate::validation::is_identifier;

/// One file visited by [`disk_prune`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRecord {
    pub path: PathBuf,
    /// False in dry-run mode or when removal failed
    pub removed: bool,
}

/// Discover namespace directories under a root path
///
/// Only directories whose names satisfy the identifier grammar qualify.
/// With filters, `closest` treats each filter as a prefix; otherwise the
/// match must be exact.
pub fn disk_scan(path: &Path, namespaces: Option<&[&str]>, closest: bool) -> Vec<String> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Storage path not found: {}", path.display());
            return Vec::new();
        }
        Err(e) => {
            error!("Could not scan storage path: {}", path.display());
            debug!("Persistent storage exception: {e}");
            return Vec::new();
        }
    };

    let mut found: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_identifier(name))
        .filter(|name| match namespaces {
            None => true,
            Some(filters) if closest => filters.iter().any(|prefix| name.starts_with(prefix)),
            Some(filters) => filters.iter().any(|exact| name == exact),
        })
        .collect();

    found.sort();
    found
}

/// Reclaim disk from stale namespaces
///
/// Every store-managed file older than `expiry_sec` seconds (default 30
/// days; negative values fall back to the default) is removed, then any
/// namespace directory left empty is taken down too. With `action` off
/// this is a dry run: the returned report is identical but nothing is
/// touched. Results map namespace to the files visited.
pub fn disk_prune(
    path: &Path,
    namespaces: Option<&[&str]>,
    expiry_sec: Option<f64>,
    action: bool,
) -> BTreeMap<String, Vec<PruneRecord>> {
    let seconds = expiry_sec
        .filter(|sec| sec.is_finite() && *sec >= 0.0)
        .unwrap_or(DEFAULT_FILE_EXPIRY);
    let threshold = SystemTime::now() - Duration::from_secs_f64(seconds);

    let mut report = BTreeMap::new();

    for namespace in disk_scan(path, namespaces, true) {
        let base = path.join(&namespace);
        let data = base.join(DATA_DIR);
        let temp = base.join(TEMP_DIR);

        let mut candidates = vec![
            base.join(format!("{CACHE_KEY}{EXTENSION}")),
            base.join(format!("{CACHE_KEY}{BACKUP_EXTENSION}")),
        ];
        candidates.extend(managed_files(&data));
        candidates.extend(scratch_files(&temp));

        let mut records = Vec::new();
        // Stays true only while every visited file went away cleanly
        let mut dir_sweep = true;

        for file in candidates {
            let mtime = match fs::metadata(&file).and_then(|meta| meta.modified()) {
                Ok(mtime) => mtime,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    error!("Could not stat file: {}", file.display());
                    debug!("Persistent storage exception: {e}");
                    dir_sweep = false;
                    continue;
                }
            };

            if mtime > threshold {
                // Still being used
                continue;
            }

            let mut removed = false;
            if action {
                match fs::remove_file(&file) {
                    Ok(()) => {
                        removed = true;
                        info!("Removed stale file: {}", file.display());
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        dir_sweep = false;
                    }
                    Err(e) => {
                        error!("Could not remove stale file: {}", file.display());
                        debug!("Persistent storage exception: {e}");
                        dir_sweep = false;
                    }
                }
            }

            records.push(PruneRecord {
                path: file,
                removed,
            });
        }

        if dir_sweep && action {
            // Leaf directories first; rmdir refuses non-empty ones
            for dir in [&temp, &data, &base] {
                if fs::remove_dir(dir).is_ok() {
                    info!("Removed persistent directory: {}", dir.display());
                }
            }
        }

        report.insert(namespace, records);
    }

    report
}

/// Store-managed files inside a namespace's data directory
fn managed_files(data: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(data) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(EXTENSION) || name.ends_with(BACKUP_EXTENSION))
        })
        .collect();
    files.sort();
    files
}

/// Everything in a namespace's scratch directory is fair game
fn scratch_files(temp: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(temp) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PersistMode, PersistentStore};
    use tempfile::TempDir;

    fn age_tree(root: &Path, seconds: u64) {
        let stamp = SystemTime::now() - Duration::from_secs(seconds);
        let times = fs::FileTimes::new().set_accessed(stamp).set_modified(stamp);
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    fs::File::options()
                        .append(true)
                        .open(&path)
                        .unwrap()
                        .set_times(times)
                        .unwrap();
                }
            }
        }
    }

    fn seed_namespace(root: &Path, namespace: &str) {
        let mut store =
            PersistentStore::new(Some(root), namespace, Some(PersistMode::Flush)).unwrap();
        store.set("k", "v").unwrap();
        store.write("blob", b"payload".as_slice()).unwrap();
    }

    #[test]
    fn test_disk_scan_filters() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "alpha");
        seed_namespace(dir.path(), "alpha2");
        seed_namespace(dir.path(), "beta");
        // Invalid directory names never count as namespaces
        fs::create_dir(dir.path().join("not a namespace")).unwrap();
        // Nor do stray files
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        assert_eq!(
            disk_scan(dir.path(), None, true),
            vec!["alpha", "alpha2", "beta"]
        );
        assert_eq!(
            disk_scan(dir.path(), Some(&["alpha"]), true),
            vec!["alpha", "alpha2"]
        );
        assert_eq!(disk_scan(dir.path(), Some(&["alpha"]), false), vec!["alpha"]);
        assert!(disk_scan(dir.path(), Some(&["gamma"]), true).is_empty());
    }

    #[test]
    fn test_disk_scan_missing_root() {
        let dir = TempDir::new().unwrap();
        assert!(disk_scan(&dir.path().join("nope"), None, true).is_empty());
    }

    #[test]
    fn test_disk_prune_removes_stale_namespace() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "stale");
        age_tree(&dir.path().join("stale"), 3_000_000);

        let report = disk_prune(dir.path(), None, None, true);
        let records = &report["stale"];
        assert!(!records.is_empty());
        assert!(records.iter().all(|record| record.removed));

        // Emptied directories come down with the files
        assert!(!dir.path().join("stale").exists());
    }

    #[test]
    fn test_disk_prune_spares_fresh_files() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "fresh");

        let report = disk_prune(dir.path(), None, None, true);
        assert!(report["fresh"].is_empty());
        assert!(dir.path().join("fresh").join("cache.psdata").is_file());
    }

    #[test]
    fn test_disk_prune_dry_run_parity() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "stale");
        age_tree(&dir.path().join("stale"), 3_000_000);

        let dry = disk_prune(dir.path(), None, None, false);
        assert!(!dry["stale"].is_empty());
        assert!(dry["stale"].iter().all(|record| !record.removed));
        // Dry run touched nothing
        assert!(dir.path().join("stale").join("cache.psdata").is_file());

        let wet = disk_prune(dir.path(), None, None, true);
        let dry_paths: Vec<_> = dry["stale"].iter().map(|r| &r.path).collect();
        let wet_paths: Vec<_> = wet["stale"].iter().map(|r| &r.path).collect();
        assert_eq!(dry_paths, wet_paths);
        assert!(!dir.path().join("stale").exists());
    }

    #[test]
    fn test_disk_prune_zero_expiry_takes_everything() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "ns");

        let report = disk_prune(dir.path(), None, Some(0.0), true);
        assert!(report["ns"].iter().all(|record| record.removed));
        assert!(!dir.path().join("ns").exists());
    }

    #[test]
    fn test_disk_prune_negative_expiry_uses_default() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "ns");

        // Default threshold is 30 days, so fresh files survive
        let report = disk_prune(dir.path(), None, Some(-5.0), true);
        assert!(report["ns"].is_empty());
        assert!(dir.path().join("ns").exists());
    }

    #[test]
    fn test_disk_prune_namespace_filter() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "keepme");
        seed_namespace(dir.path(), "dropme");
        age_tree(dir.path(), 3_000_000);

        let report = disk_prune(dir.path(), Some(&["dropme"]), None, true);
        assert!(report.contains_key("dropme"));
        assert!(!report.contains_key("keepme"));
        assert!(!dir.path().join("dropme").exists());
        assert!(dir.path().join("keepme").join("cache.psdata").is_file());
    }

    #[test]
    fn test_disk_prune_ignores_foreign_files() {
        let dir = TempDir::new().unwrap();
        seed_namespace(dir.path(), "ns");
        let foreign = dir.path().join("ns").join(DATA_DIR).join("notes.txt");
        fs::write(&foreign, b"user data").unwrap();
        age_tree(&dir.path().join("ns"), 3_000_000);

        let report = disk_prune(dir.path(), None, None, true);
        assert!(report["ns"]
            .iter()
            .all(|record| record.path != foreign));
        // Namespace directory survives because var/ is not empty
        assert!(foreign.is_file());
        assert!(dir.path().join("ns").exists());
    }
}
