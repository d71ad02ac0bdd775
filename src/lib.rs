//! # psdata - Embedded File-Backed Key/Value Cache and Blob Store
//!
//! `psdata` gives an application durable, self-healing local state with no
//! server and no database. Each store owns one *namespace* directory under
//! a root path and exposes two tiers:
//!
//! - **Cache tier**: typed key/value entries with optional TTLs, held in
//!   memory and snapshotted to one gzip+JSON file
//! - **Blob tier**: one file per key for arbitrary byte payloads
//!
//! Every durable write goes through an atomic temp-file install with a
//! rotating backup, so a crash mid-write never leaves a partial file.
//! Corrupted state is detected by checksum and discarded rather than
//! surfaced, and a namespace that cannot reach its disk degrades to a
//! memory-only store instead of failing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use psdata::{Expiry, PersistentStore, PersistMode, Result};
//! use std::path::Path;
//!
//! # fn main() -> Result<()> {
//! let mut store = PersistentStore::new(
//!     Some(Path::new("/var/lib/myapp")),
//!     "session",
//!     Some(PersistMode::Flush),
//! )?;
//!
//! // Cache tier: typed values, optional TTL
//! store.set("token", "abc123")?;
//! store.set_with("nonce", 42i64, Expiry::In(300.0), true, true)?;
//! let token = store.get("token");
//!
//! // Blob tier: arbitrary bytes under their own key
//! store.write("avatar", b"\x89PNG...".as_slice())?;
//! let avatar = store.read("avatar")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Maintenance
//!
//! A scheduled job can reclaim disk across every namespace a root path
//! holds, without constructing any store:
//!
//! ```rust,no_run
//! use psdata::disk_prune;
//! use std::path::Path;
//!
//! // Dry run first, then do it for real
//! let report = disk_prune(Path::new("/var/lib/myapp"), None, None, false);
//! for (namespace, records) in &report {
//!     println!("{namespace}: {} stale files", records.len());
//! }
//! disk_prune(Path::new("/var/lib/myapp"), None, None, true);
//! ```

pub mod error;
pub mod install;
pub mod maintenance;
pub mod object;
pub mod store;
pub mod validation;

pub use error::{Result, StoreError};
pub use maintenance::{disk_prune, disk_scan, PruneRecord};
pub use object::{CacheObject, CacheRecord, CacheValue, Expiry};
pub use store::{
    BlobReader, BlobSource, DeleteOptions, PersistMode, PersistentStore, BASE_KEY,
    DEFAULT_FILE_EXPIRY, DEFAULT_MAX_FILE_SIZE,
};
