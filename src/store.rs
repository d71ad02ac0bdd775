//! Persistent store: cache tier, blob tier, and housekeeping
//!
//! A [`PersistentStore`] owns one namespace under a root path:
//!
//! ```text
//! <root>/<namespace>/cache.psdata    gzip+JSON snapshot of the cache tier
//! <root>/<namespace>/cache._psbak    rotating backup
//! <root>/<namespace>/var/<key>.psdata   one blob file per key
//! <root>/<namespace>/var/<key>._psbak   rotating backup per blob
//! <root>/<namespace>/tmp/            scratch area, swept aggressively
//! ```
//!
//! The cache tier (`get`/`set`/`clear`/`prune`) is an in-memory map loaded
//! lazily from the snapshot file; the blob tier (`read`/`write`/`open`)
//! goes straight to per-key files. Both tiers persist through the atomic
//! install protocol in [`crate::install`].
//!
//! Strictly single-threaded and synchronous. Disk unavailability at
//! construction demotes the store to `Memory` mode instead of failing -
//! a caller that cannot persist state must still be able to run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, StoreError};
use crate::install::{backup_path, install, remove_quiet, BACKUP_EXTENSION, EXTENSION};
use crate::object::{CacheObject, CacheRecord, CacheValue, Expiry};
use crate::validation::{is_identifier, validate_key, validate_namespace};

/// Maximum bytes a namespace may occupy on disk (1 MiB); 0 disables the quota
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1_048_576;

/// Age in seconds after which an untouched file is prunable (30 days)
pub const DEFAULT_FILE_EXPIRY: f64 = 2_678_400.0;

/// Blob key used when none is supplied
pub const BASE_KEY: &str = "default";

/// Stem of the cache snapshot file
pub(crate) const CACHE_KEY: &str = "cache";

/// Scratch directory name inside a namespace
pub(crate) const TEMP_DIR: &str = "tmp";

/// Blob directory name inside a namespace
pub(crate) const DATA_DIR: &str = "var";

/// Operating mode, trading durability against write amplification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// No disk I/O ever occurs; writes are no-ops, reads return nothing
    Memory,
    /// Loaded lazily, flushed on request or when the store is dropped
    Auto,
    /// Every mutating cache call synchronously flushes to disk
    Flush,
}

impl PersistMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistMode::Memory => "memory",
            PersistMode::Auto => "auto",
            PersistMode::Flush => "flush",
        }
    }

    /// Parse a mode name as found in configuration
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Some(PersistMode::Memory),
            "auto" => Some(PersistMode::Auto),
            "flush" => Some(PersistMode::Flush),
            _ => None,
        }
    }
}

impl std::fmt::Display for PersistMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PersistMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        PersistMode::parse(value).ok_or_else(|| format!("unknown persist mode: {value}"))
    }
}

/// Input accepted by the blob tier's `write`
///
/// A closed sum over the three shapes callers hand us; streams are drained
/// once at the call boundary.
pub enum BlobSource<'a> {
    Bytes(Vec<u8>),
    Text(String),
    Reader(Box<dyn Read + 'a>),
}

impl BlobSource<'_> {
    fn into_bytes(self) -> std::io::Result<Vec<u8>> {
        match self {
            BlobSource::Bytes(data) => Ok(data),
            BlobSource::Text(text) => Ok(text.into_bytes()),
            BlobSource::Reader(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }
}

impl From<&[u8]> for BlobSource<'_> {
    fn from(data: &[u8]) -> Self {
        BlobSource::Bytes(data.to_vec())
    }
}

impl From<Vec<u8>> for BlobSource<'_> {
    fn from(data: Vec<u8>) -> Self {
        BlobSource::Bytes(data)
    }
}

impl From<&str> for BlobSource<'_> {
    fn from(text: &str) -> Self {
        BlobSource::Text(text.to_string())
    }
}

impl From<String> for BlobSource<'_> {
    fn from(text: String) -> Self {
        BlobSource::Text(text)
    }
}

impl<'a, R: Read + 'a> From<Box<R>> for BlobSource<'a> {
    fn from(reader: Box<R>) -> Self {
        BlobSource::Reader(reader)
    }
}

/// Read handle over a stored blob, plain or gzip
pub struct BlobReader {
    inner: BlobStream,
}

enum BlobStream {
    Plain(fs::File),
    Gzip(GzDecoder<fs::File>),
}

impl BlobReader {
    fn new(file: fs::File, compress: bool) -> Self {
        let inner = if compress {
            BlobStream::Gzip(GzDecoder::new(file))
        } else {
            BlobStream::Plain(file)
        };
        BlobReader { inner }
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            BlobStream::Plain(file) => file.read(buf),
            BlobStream::Gzip(decoder) => decoder.read(buf),
        }
    }
}

/// Selection for the guarded [`PersistentStore::delete`] sweep
///
/// Defaulting mirrors the store's call conventions: with nothing selected
/// everything is swept; selecting `all` pulls `temp` and `cache` in with
/// it unless they are pinned explicitly.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Blob keys to remove
    pub keys: Vec<String>,
    /// Remove every blob file
    pub all: Option<bool>,
    /// Sweep the scratch directory
    pub temp: Option<bool>,
    /// Remove the cache snapshot and its backup
    pub cache: Option<bool>,
    /// Only remove files whose names match the machine-generated pattern
    pub validate: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        DeleteOptions {
            validate: true,
            ..Default::default()
        }
    }
}

/// Embedded, file-backed key/value cache and blob store for one namespace
pub struct PersistentStore {
    namespace: String,
    mode: PersistMode,
    base_path: Option<PathBuf>,
    temp_path: Option<PathBuf>,
    data_path: Option<PathBuf>,
    max_file_size: u64,

    /// Persistent cache changes pending flush
    dirty: bool,
    /// In-memory cache tier; None until first touched
    cache: Option<HashMap<String, CacheObject>>,
    /// Files whose mtime gets bumped on the next flush
    renew: HashSet<PathBuf>,

    // Lazily computed disk accounting
    cache_size: Option<u64>,
    cache_files: HashMap<bool, Vec<PathBuf>>,
}

impl PersistentStore {
    /// Create a store for `(root path, namespace, mode)`
    ///
    /// A bad namespace errors immediately. Everything disk-related
    /// degrades instead: no path means `Memory` mode, and a failure to
    /// prepare the namespace directories silently demotes to `Memory`.
    pub fn new(
        path: Option<&Path>,
        namespace: &str,
        mode: Option<PersistMode>,
    ) -> Result<PersistentStore> {
        validate_namespace(namespace)?;

        let (mode, base_path) = match path {
            Some(path) => (
                mode.unwrap_or(PersistMode::Auto),
                Some(path.join(namespace)),
            ),
            None => (PersistMode::Memory, None),
        };

        let temp_path = base_path.as_ref().map(|base| base.join(TEMP_DIR));
        let data_path = base_path.as_ref().map(|base| base.join(DATA_DIR));

        let mut store = PersistentStore {
            namespace: namespace.to_string(),
            mode,
            base_path,
            temp_path,
            data_path,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            dirty: false,
            cache: None,
            renew: HashSet::new(),
            cache_size: None,
            cache_files: HashMap::new(),
        };

        store.prepare(true);
        Ok(store)
    }

    /// In-memory store bound to no disk at all
    pub fn memory(namespace: &str) -> Result<PersistentStore> {
        PersistentStore::new(None, namespace, None)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn mode(&self) -> PersistMode {
        self.mode
    }

    /// Namespace directory, when one exists
    pub fn path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// Full path of the cache snapshot file
    pub fn cache_file(&self) -> Option<PathBuf> {
        self.base_path
            .as_ref()
            .map(|base| base.join(format!("{CACHE_KEY}{EXTENSION}")))
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Adjust the namespace disk quota; 0 disables it
    pub fn set_max_file_size(&mut self, max_file_size: u64) {
        self.max_file_size = max_file_size;
    }

    /// Prepare the namespace/temp/data directories
    ///
    /// Any creation failure demotes the store to `Memory` mode. When a
    /// live cache survives a disrupted environment the store is marked
    /// dirty so the rebuilt directories receive a fresh snapshot.
    fn prepare(&mut self, flush: bool) {
        if self.mode == PersistMode::Memory {
            return;
        }

        for dir in [&self.base_path, &self.temp_path, &self.data_path] {
            let Some(dir) = dir else { continue };
            if let Err(e) = fs::create_dir_all(dir) {
                debug!("Could not create store directory: {}", dir.display());
                debug!("Persistent storage exception: {e}");
                self.mode = PersistMode::Memory;
            }
        }

        if self.mode == PersistMode::Memory {
            warn!("The persistent storage could not be fully initialized; operating in memory mode");
        } else if self.cache.as_ref().is_some_and(|cache| !cache.is_empty()) {
            // Recovery taking place
            self.dirty = true;
            warn!("The persistent storage environment was disrupted");
            if self.mode == PersistMode::Flush && flush {
                self.flush_inner(false, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Cache tier
    // ------------------------------------------------------------------

    /// Fetch a value from the cache tier
    ///
    /// Returns `None` when the key is absent, the entry expired, or the
    /// cache cannot be loaded. Reading a present key queues the snapshot
    /// file for an mtime renewal on the next flush (unless a flush is
    /// already pending), cooperating with out-of-process pruning.
    pub fn get(&mut self, key: &str) -> Option<CacheValue> {
        if !self.ensure_cache() {
            return None;
        }

        let present = self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.contains_key(key));
        if present && self.mode != PersistMode::Memory && !self.dirty {
            if let Some(cache_file) = self.cache_file() {
                self.renew.insert(cache_file);
            }
        }

        self.cache
            .as_ref()
            .and_then(|cache| cache.get(key))
            .filter(|object| object.is_live())
            .map(|object| object.value().clone())
    }

    /// Strict fetch: errors instead of returning a sentinel
    pub fn must_get(&mut self, key: &str) -> Result<CacheValue> {
        if !self.ensure_cache() {
            return Err(StoreError::CacheUnavailable);
        }
        self.get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
    }

    /// Store a value: never expires, persistent, lazily written
    pub fn set(&mut self, key: &str, value: impl Into<CacheValue>) -> Result<bool> {
        self.set_with(key, value, Expiry::Never, true, true)
    }

    /// Store a value with full control over expiry, persistence, laziness
    ///
    /// With `lazy`, a new entry carrying the same payload (value and
    /// persistence; expiry is ignored) skips the write entirely - this is
    /// what keeps `Flush` mode from writing a snapshot per rate-limit
    /// tick. Only persistent entries mark the store dirty; non-persistent
    /// entries never reach disk.
    pub fn set_with(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        expires: Expiry,
        persistent: bool,
        lazy: bool,
    ) -> Result<bool> {
        validate_key(key)?;
        let object = CacheObject::new(value, expires, persistent)?;

        if !self.ensure_cache() {
            return Ok(false);
        }
        let Some(cache) = self.cache.as_mut() else {
            return Ok(false);
        };

        if lazy {
            if let Some(existing) = cache.get(key) {
                if existing.same_payload(&object) {
                    // Nothing further to do
                    return Ok(true);
                }
            }
        }

        cache.insert(key.to_string(), object);
        if persistent {
            self.dirty = true;
        }

        if self.dirty && self.mode == PersistMode::Flush {
            return Ok(self.flush(false));
        }
        Ok(true)
    }

    /// Strict removal of a single cache entry
    pub fn remove(&mut self, key: &str) -> Result<()> {
        if !self.ensure_cache() {
            return Err(StoreError::CacheUnavailable);
        }
        let Some(cache) = self.cache.as_mut() else {
            return Err(StoreError::CacheUnavailable);
        };

        match cache.remove(key) {
            Some(object) => {
                if object.persistent() {
                    self.dirty = true;
                }
            }
            None => return Err(StoreError::KeyNotFound(key.to_string())),
        }

        if self.dirty && self.mode == PersistMode::Flush {
            self.flush(false);
        }
        Ok(())
    }

    /// Remove the named entries, or every entry when `keys` is empty
    pub fn clear(&mut self, keys: &[&str]) -> bool {
        if !self.ensure_cache() {
            return false;
        }
        let Some(cache) = self.cache.as_mut() else {
            return false;
        };

        if keys.is_empty() {
            if !cache.is_empty() {
                self.dirty = true;
                cache.clear();
            }
        } else {
            for key in keys {
                if cache.remove(*key).is_some() {
                    self.dirty = true;
                }
            }
        }

        if self.dirty && self.mode == PersistMode::Flush {
            return self.flush(false);
        }
        true
    }

    /// Drop expired entries; returns whether anything was removed
    ///
    /// The dirty flag is raised only when a removed entry was persistent,
    /// since only those have an on-disk footprint to rewrite.
    pub fn prune(&mut self) -> bool {
        if !self.ensure_cache() {
            return false;
        }
        let Some(cache) = self.cache.as_mut() else {
            return false;
        };

        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, object)| !object.is_live())
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = false;
        for key in expired {
            if let Some(object) = cache.remove(&key) {
                removed = true;
                if object.persistent() {
                    self.dirty = true;
                }
            }
        }

        if self.dirty && self.mode == PersistMode::Flush {
            self.flush(false);
        }
        removed
    }

    /// True when the key is present and not expired
    pub fn contains(&mut self, key: &str) -> bool {
        if !self.ensure_cache() {
            return false;
        }
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(key))
            .is_some_and(|object| object.is_live())
    }

    /// Every key currently held by the cache tier (expired ones included)
    pub fn keys(&mut self) -> Vec<String> {
        if !self.ensure_cache() {
            return Vec::new();
        }
        self.cache
            .as_ref()
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ensure_cache(&mut self) -> bool {
        if self.cache.is_some() {
            return true;
        }
        self.load_cache(false)
    }

    /// Load the cache snapshot from disk
    ///
    /// Individual corrupt records are dropped (and the store marked dirty
    /// so the cleaned set is written back). An unreadable file is
    /// self-healing: delete it and retry once from empty; a second
    /// failure is a hard load failure.
    fn load_cache(&mut self, recovery: bool) -> bool {
        self.dirty = false;

        if self.mode == PersistMode::Memory {
            self.cache = Some(HashMap::new());
            return true;
        }

        let Some(cache_file) = self.cache_file() else {
            self.cache = Some(HashMap::new());
            return true;
        };

        let parsed = match fs::File::open(&cache_file) {
            Ok(file) => {
                let mut raw = String::new();
                match GzDecoder::new(file).read_to_string(&mut raw) {
                    Ok(_) => serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw).ok(),
                    Err(_) => None,
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // No cache to load
                self.cache = Some(HashMap::new());
                return true;
            }
            Err(e) => {
                warn!(
                    "Could not load persistent cache for namespace {}",
                    self.namespace
                );
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        let Some(entries) = parsed else {
            warn!(
                "Corrupted persistent cache content: {}",
                cache_file.display()
            );
            if !recovery {
                if !remove_quiet(&cache_file) {
                    return false;
                }
                return self.load_cache(true);
            }
            return false;
        };

        let mut cache = HashMap::new();
        for (key, raw) in entries {
            let object = serde_json::from_value::<CacheRecord>(raw)
                .ok()
                .and_then(|record| CacheObject::from_record(&record, true, true));
            match object {
                Some(object) => {
                    cache.insert(key, object);
                }
                None => {
                    // Track that the load set shrank
                    self.dirty = true;
                }
            }
        }
        self.cache = Some(cache);
        true
    }

    /// Persist the cache tier
    ///
    /// Cheap when there is nothing to do: pending mtime renewals are
    /// drained first, then a clean store returns immediately unless
    /// `force` is set. An empty cache is represented on disk by rotating
    /// the snapshot away rather than writing an empty document.
    pub fn flush(&mut self, force: bool) -> bool {
        self.flush_inner(force, false)
    }

    fn flush_inner(&mut self, force: bool, recovery: bool) -> bool {
        if self.mode == PersistMode::Memory {
            return true;
        }

        // Renewals queued by blob reads apply even when the cache tier
        // was never loaded
        let pending: Vec<PathBuf> = self.renew.drain().collect();
        for path in pending {
            renew_mtime(&path);
        }

        if self.cache.is_none() {
            return true;
        }

        if !force && !self.dirty {
            trace!("Persistent cache is consistent with memory map");
            return true;
        }

        if recovery {
            self.prepare(false);
        }

        self.cache_size = None;
        self.cache_files.clear();

        let Some(cache_file) = self.cache_file() else {
            return true;
        };
        let Some(temp_path) = self.temp_path.clone() else {
            return true;
        };

        if self.cache.as_ref().is_some_and(|cache| cache.is_empty()) {
            // No entries left; the snapshot file itself goes away
            let backup = backup_path(&cache_file);
            if !remove_quiet(&backup) {
                return false;
            }
            match fs::rename(&cache_file, &backup) {
                Ok(()) => trace!("Cache backup file created: {}", backup.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Could not remove stale cache file: {}",
                        cache_file.display()
                    );
                    debug!("Persistent storage exception: {e}");
                    return false;
                }
            }
            self.dirty = false;
            return true;
        }

        let temp = match NamedTempFile::new_in(&temp_path) {
            Ok(temp) => temp,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // The scratch directory vanished underneath us
                if !recovery {
                    return self.flush_inner(true, true);
                }
                return false;
            }
            Err(e) => {
                error!("Temporary directory inaccessible: {}", temp_path.display());
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        // Only the persistent, still-live subset reaches disk
        let snapshot: BTreeMap<&String, CacheRecord> = self
            .cache
            .as_ref()
            .map(|cache| {
                cache
                    .iter()
                    .filter(|(_, object)| object.persistent() && object.is_live())
                    .map(|(key, object)| (key, object.to_record()))
                    .collect()
            })
            .unwrap_or_default();

        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Cache snapshot could not be encoded: {e}");
                return false;
            }
        };

        let mut encoder = GzEncoder::new(temp.as_file(), Compression::default());
        if let Err(e) = encoder.write_all(&payload).and_then(|_| encoder.finish().map(|_| ())) {
            error!("Temporary file inaccessible: {}", temp.path().display());
            debug!("Persistent storage exception: {e}");
            return false;
        }

        let src = match temp.into_temp_path().keep() {
            Ok(src) => src,
            Err(e) => {
                error!("Temporary file could not be kept for install");
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        if !install(&src, &cache_file) {
            let _ = fs::remove_file(&src);
            return false;
        }

        self.dirty = false;
        true
    }

    // ------------------------------------------------------------------
    // Blob tier
    // ------------------------------------------------------------------

    /// Write a blob under `key`, gzip-compressed
    pub fn write<'a>(&mut self, key: &str, data: impl Into<BlobSource<'a>>) -> Result<bool> {
        self.write_with(Some(key), data, true)
    }

    /// Write a blob with full control
    ///
    /// Returns `Ok(false)` for anything disk-shaped going wrong: memory
    /// mode, an unreadable input stream, I/O failures, or the namespace
    /// quota rejecting the new size. The quota check runs strictly before
    /// installation, so a rejected write leaves any previous blob for the
    /// key byte-identical.
    pub fn write_with<'a>(
        &mut self,
        key: Option<&str>,
        data: impl Into<BlobSource<'a>>,
        compress: bool,
    ) -> Result<bool> {
        let key = key.unwrap_or(BASE_KEY);
        validate_key(key)?;

        let data = match data.into().into_bytes() {
            Ok(data) => data,
            Err(e) => {
                warn!("Could not drain input stream for persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return Ok(false);
            }
        };

        if self.mode == PersistMode::Memory {
            // Nothing further can be done
            return Ok(false);
        }

        Ok(self.write_blob(key, &data, compress, false))
    }

    fn write_blob(&mut self, key: &str, data: &[u8], compress: bool, recovery: bool) -> bool {
        if recovery {
            // Attempt to recover from a bad directory structure
            self.prepare(false);
        }

        let Some(data_path) = self.data_path.clone() else {
            return false;
        };
        let Some(temp_path) = self.temp_path.clone() else {
            return false;
        };
        let io_file = data_path.join(format!("{key}{EXTENSION}"));

        let prev_size = match fs::metadata(&io_file) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => {
                warn!("Could not write with persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        let temp = match NamedTempFile::new_in(&temp_path) {
            Ok(temp) => temp,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Directory path is gone, preventing the file creation
                if !recovery {
                    return self.write_blob(key, data, compress, true);
                }
                return false;
            }
            Err(e) => {
                warn!("Could not write to persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        let written = if compress {
            let mut encoder = GzEncoder::new(temp.as_file(), Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish().map(|_| ()))
        } else {
            (&mut temp.as_file()).write_all(data)
        };
        if let Err(e) = written {
            warn!("Could not write to persistent key: {key}");
            debug!("Persistent storage exception: {e}");
            return false;
        }

        let new_size = match fs::metadata(temp.path()) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("Could not write to persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };
        trace!("Wrote {new_size} bytes of data to persistent key: {key}");

        // Quota check happens strictly before installation
        if self.max_file_size > 0 {
            let projected = new_size
                .saturating_add(self.size_with(true, true))
                .saturating_sub(prev_size);
            if projected > self.max_file_size {
                warn!(
                    "Persistent content exceeds allowable maximum file length ({}KB); provided {}KB",
                    self.max_file_size / 1024,
                    new_size / 1024
                );
                return false;
            }
        }

        let src = match temp.into_temp_path().keep() {
            Ok(src) => src,
            Err(e) => {
                warn!("Could not write to persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return false;
            }
        };

        if !install(&src, &io_file) {
            let _ = fs::remove_file(&src);
            return false;
        }

        self.cache_size = None;
        self.cache_files.clear();
        true
    }

    /// Read the blob stored under `key` (gzip on, renewing its mtime)
    pub fn read(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.read_with(Some(key), true, false)
    }

    /// Read a blob with full control
    ///
    /// At most `max_file_size` bytes are returned. A missing file and
    /// disk trouble both come back as `Ok(None)`; only a bad key errors.
    ///
    /// Known quirk, kept deliberately: the file's mtime renewal is queued
    /// *unless* `expires` is true - passing `expires = true` is how a
    /// caller marks a read as exempt from keep-alive.
    pub fn read_with(
        &mut self,
        key: Option<&str>,
        compress: bool,
        expires: bool,
    ) -> Result<Option<Vec<u8>>> {
        let key = key.unwrap_or(BASE_KEY);

        let reader = match self.open(Some(key), compress) {
            Ok(reader) => reader,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(StoreError::Io(e)) => {
                warn!("Could not read with persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut results = Vec::new();
        if let Err(e) = reader
            .take(self.max_file_size)
            .read_to_end(&mut results)
        {
            warn!("Could not read with persistent key: {key}");
            debug!("Persistent storage exception: {e}");
            return Ok(None);
        }

        if !expires {
            if let Some(data_path) = self.data_path.as_ref() {
                self.renew.insert(data_path.join(format!("{key}{EXTENSION}")));
            }
        }

        Ok(Some(results))
    }

    /// Open a raw read handle over a stored blob
    ///
    /// Strict access: a missing blob (or memory mode) is
    /// [`StoreError::NotFound`], distinct from other I/O failures, so
    /// callers can branch on absence versus corruption.
    pub fn open(&mut self, key: Option<&str>, compress: bool) -> Result<BlobReader> {
        let key = key.unwrap_or(BASE_KEY);
        validate_key(key)?;

        let io_file = match (self.mode, self.data_path.as_ref()) {
            (PersistMode::Memory, _) | (_, None) => {
                return Err(StoreError::NotFound(PathBuf::from(format!(
                    "{key}{EXTENSION}"
                ))))
            }
            (_, Some(data_path)) => data_path.join(format!("{key}{EXTENSION}")),
        };

        match fs::File::open(&io_file) {
            Ok(file) => Ok(BlobReader::new(file, compress)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(io_file)),
            Err(e) => {
                warn!("Could not read with persistent key: {key}");
                debug!("Persistent storage exception: {e}");
                Err(StoreError::Io(e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    /// Regular files under the namespace root, excluding bookkeeping files
    pub fn files(&mut self) -> Vec<PathBuf> {
        self.files_with(true, true)
    }

    /// File listing with control over exclusions and memoization
    ///
    /// With `exclude`, the cache backup, the scratch directory's
    /// contents, and blob backups are dropped from the listing - these
    /// are the files that do not count against the namespace quota.
    pub fn files_with(&mut self, exclude: bool, lazy: bool) -> Vec<PathBuf> {
        if lazy {
            if let Some(cached) = self.cache_files.get(&exclude) {
                return cached.clone();
            }
        }

        if self.mode == PersistMode::Memory {
            self.cache_files.insert(true, Vec::new());
            self.cache_files.insert(false, Vec::new());
            return Vec::new();
        }

        let Some(base_path) = self.base_path.clone() else {
            return Vec::new();
        };

        let mut listing = Vec::new();
        walk_files(&base_path, &mut listing);
        listing.sort();

        if exclude {
            let cache_backup = base_path.join(format!("{CACHE_KEY}{BACKUP_EXTENSION}"));
            let temp_path = self.temp_path.clone();
            let data_path = self.data_path.clone();
            listing.retain(|path| {
                if *path == cache_backup {
                    return false;
                }
                if temp_path
                    .as_ref()
                    .is_some_and(|temp| path.starts_with(temp) && *path != *temp)
                {
                    return false;
                }
                let is_blob_backup = data_path
                    .as_ref()
                    .is_some_and(|data| path.parent() == Some(data.as_path()))
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.ends_with(BACKUP_EXTENSION));
                !is_blob_backup
            });
        }

        self.cache_files.insert(exclude, listing.clone());
        listing
    }

    /// Total bytes this namespace occupies on disk (quota-relevant files)
    pub fn size(&mut self) -> u64 {
        self.size_with(true, true)
    }

    /// Disk usage with control over exclusions and memoization
    pub fn size_with(&mut self, exclude: bool, lazy: bool) -> u64 {
        if lazy {
            if let Some(size) = self.cache_size {
                return size;
            }
        }

        if self.mode == PersistMode::Memory {
            self.cache_size = Some(0);
            return 0;
        }

        let mut total: u64 = 0;
        for path in self.files_with(exclude, lazy) {
            match fs::metadata(&path) {
                Ok(meta) => total += meta.len(),
                Err(_) => {
                    // Inaccessible directory contents invalidate the count
                    total = 0;
                    break;
                }
            }
        }

        self.cache_size = Some(total);
        total
    }

    /// Remove the blob files for the given keys
    pub fn delete_keys(&mut self, keys: &[&str]) -> bool {
        self.delete(DeleteOptions {
            keys: keys.iter().map(|key| key.to_string()).collect(),
            ..DeleteOptions::new()
        })
    }

    /// Remove everything this namespace has on disk
    pub fn delete_all(&mut self) -> bool {
        self.delete(DeleteOptions::new())
    }

    /// Guarded file sweep
    ///
    /// Scratch files go unconditionally when selected. The cache
    /// snapshot/backup and blob files are only removed when their names
    /// match the machine-generated pattern (while `validate` is on), a
    /// safety valve against deleting user-placed files sharing the
    /// directory. Returns false if any removal failed.
    pub fn delete(&mut self, options: DeleteOptions) -> bool {
        let mut has_error = false;

        let explicit = !options.keys.is_empty()
            || options.temp.unwrap_or(false)
            || options.cache.unwrap_or(false);
        let all = options.all.unwrap_or(!explicit);
        let temp = options.temp.unwrap_or(all);
        let cache = options.cache.unwrap_or(all);

        let named = Regex::new(&format!(
            r"(?i)^(?P<key>.+)({}|{})$",
            regex::escape(BACKUP_EXTENSION),
            regex::escape(EXTENSION)
        ))
        .unwrap();

        if cache && self.cache.as_ref().is_some_and(|c| !c.is_empty()) {
            if let Some(map) = self.cache.as_mut() {
                map.clear();
            }
            self.dirty = false;
        }

        let base_path = self.base_path.clone();
        let temp_path = self.temp_path.clone();
        let data_path = self.data_path.clone();

        for path in self.files_with(false, true) {
            let parent = path.parent().map(Path::to_path_buf);
            let fname = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string();

            let stem = named.captures(&fname).and_then(|captures| {
                let key = captures.name("key")?.as_str();
                is_identifier(key).then(|| key.to_string())
            });

            if parent == base_path && cache {
                if options.validate && stem.as_deref() != Some(CACHE_KEY) {
                    debug!("File cleanup ignoring file: {}", path.display());
                    continue;
                }
            } else if parent == data_path && (!options.keys.is_empty() || all) {
                if options.validate && stem.is_none() {
                    debug!("File cleanup ignoring file: {}", path.display());
                    continue;
                }
                let matched = stem
                    .as_ref()
                    .is_some_and(|key| options.keys.iter().any(|want| want == key));
                if !all && !matched {
                    debug!("File cleanup ignoring file: {}", path.display());
                    continue;
                }
            } else if parent == temp_path && temp {
                // Scratch contents need no further verification
            } else {
                debug!("File cleanup ignoring file: {}", path.display());
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => info!("Removed persistent file: {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    has_error = true;
                    error!("Failed to remove persistent file: {}", path.display());
                    debug!("Persistent storage exception: {e}");
                }
            }
        }

        self.cache_size = None;
        self.cache_files.clear();

        !has_error
    }
}

impl Drop for PersistentStore {
    /// Scoped teardown: an `Auto` store persists pending changes when its
    /// owning scope ends, on every exit path.
    fn drop(&mut self) {
        if self.mode == PersistMode::Auto {
            self.flush(false);
        }
    }
}

/// Bump a file's access/modification time, best-effort
fn renew_mtime(path: &Path) {
    let now = SystemTime::now();
    let times = fs::FileTimes::new().set_accessed(now).set_modified(now);
    match fs::File::options().append(true).open(path) {
        Ok(file) => match file.set_times(times) {
            Ok(()) => trace!("File timestamp updated: {}", path.display()),
            Err(e) => {
                debug!("Could not update file timestamp: {}", path.display());
                debug!("Persistent storage exception: {e}");
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            debug!("Could not update file timestamp: {}", path.display());
            debug!("Persistent storage exception: {e}");
        }
    }
}

/// Collect regular files below `dir`, recursively; unreadable directories
/// contribute nothing
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => walk_files(&path, out),
            Ok(kind) if kind.is_file() => out.push(path),
            _ => {}
        }
    }
}
