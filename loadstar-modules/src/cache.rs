//! On-disk compile cache
//!
//! One file per entry, named `<fingerprint>.bin`:
//!
//! ```text
//! magic "LSBC" | format u16 | fingerprint [32] | engine len u16 | engine
//! | payload len u64 | payload | sha256(payload) [32]
//! ```
//!
//! Entries are validated in full on every read; anything that does not check
//! out is deleted and treated as a miss. `index.json` keeps access order and
//! hit counts between runs and is rebuilt from the directory when missing.

use crate::config::CompileCacheConfig;
use crate::engine::{Bytecode, CompileError, CompileOptions};
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::stats::{percentage, CompileCacheStats};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

const MAGIC: &[u8; 4] = b"LSBC";
const FORMAT_VERSION: u16 = 1;
const ENTRY_EXTENSION: &str = "bin";
const INDEX_FILE: &str = "index.json";
const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    size: u64,
    last_access: DateTime<Utc>,
    /// Access sequence number; orders entries with equal timestamps
    seq: u64,
    hits: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u16,
    entries: BTreeMap<String, EntryMeta>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    hits: u64,
    misses: u64,
    writes: u64,
    errors: u64,
    evictions: u64,
}

/// Outcome of `CompileCache::lookup`
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Fingerprint, Bytecode),
    Miss(Fingerprint),
}

/// Size-bounded, content-addressed bytecode store
#[derive(Debug)]
pub struct CompileCache {
    directory: PathBuf,
    portable_root: Option<PathBuf>,
    size_limit: u64,
    entries: FxHashMap<Fingerprint, EntryMeta>,
    current_size: u64,
    clock: u64,
    counters: Counters,
    dirty: bool,
}

impl CompileCache {
    /// Open (creating if needed) the cache directory and scan its contents
    pub fn open(config: &CompileCacheConfig) -> Result<Self, CacheError> {
        let directory = config.directory.clone();
        fs::create_dir_all(&directory).map_err(|error| CacheError::Io {
            path: directory.clone(),
            error,
        })?;

        let portable_root = if config.portable {
            config
                .portable_root
                .clone()
                .or_else(|| std::env::current_dir().ok())
        } else {
            None
        };

        let mut cache = Self {
            directory,
            portable_root,
            size_limit: config.size_limit,
            entries: FxHashMap::default(),
            current_size: 0,
            clock: 0,
            counters: Counters::default(),
            dirty: false,
        };
        cache.scan()?;
        cache.enforce_limit();

        info!(
            "Compile cache enabled at {} ({} entries, {} bytes, portable: {})",
            cache.directory.display(),
            cache.entries.len(),
            cache.current_size,
            cache.portable_root.is_some()
        );
        Ok(cache)
    }

    /// Rebuild the in-memory index from the directory and `index.json`
    fn scan(&mut self) -> Result<(), CacheError> {
        let mut index = self.read_index();
        let read_dir = fs::read_dir(&self.directory).map_err(|error| CacheError::Io {
            path: self.directory.clone(),
            error,
        })?;

        for dir_entry in read_dir.flatten() {
            let path = dir_entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with(TEMP_PREFIX) {
                trace!("Removing stray temp file {}", path.display());
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Could not remove stray temp file {}: {}", path.display(), e);
                }
                continue;
            }

            let Some(fingerprint) = entry_fingerprint(name) else {
                continue;
            };
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            let size = metadata.len();

            let meta = match index.remove(&fingerprint.to_hex()) {
                Some(meta) if meta.size == size => meta,
                _ => {
                    self.dirty = true;
                    EntryMeta {
                        size,
                        last_access: metadata
                            .modified()
                            .map(DateTime::<Utc>::from)
                            .unwrap_or_else(|_| Utc::now()),
                        seq: 0,
                        hits: 0,
                    }
                }
            };
            self.clock = self.clock.max(meta.seq);
            self.current_size += size;
            self.entries.insert(fingerprint, meta);
        }

        if !index.is_empty() {
            // Indexed entries whose files are gone
            self.dirty = true;
        }
        debug!(
            "Scanned compile cache: {} entries, {} bytes",
            self.entries.len(),
            self.current_size
        );
        Ok(())
    }

    fn read_index(&self) -> BTreeMap<String, EntryMeta> {
        let path = self.directory.join(INDEX_FILE);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Could not read compile cache index {}: {}", path.display(), e);
                return BTreeMap::new();
            }
        };
        match serde_json::from_slice::<CacheIndex>(&content) {
            Ok(index) if index.version == FORMAT_VERSION => index.entries,
            Ok(index) => {
                debug!("Ignoring compile cache index version {}", index.version);
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Ignoring malformed compile cache index: {}", e);
                BTreeMap::new()
            }
        }
    }

    /// Return cached bytecode for `source`, compiling and storing it on a miss.
    ///
    /// Cache failures never surface here: they are counted and the source is
    /// compiled as if nothing was cached. Only the compiler's own error is
    /// returned.
    pub fn get_or_compile<F>(
        &mut self,
        source: &[u8],
        engine_version: &str,
        options: &CompileOptions,
        compile: F,
    ) -> Result<(Fingerprint, Bytecode), CompileError>
    where
        F: FnOnce(&[u8], &CompileOptions) -> Result<Bytecode, CompileError>,
    {
        match self.lookup(source, engine_version, options) {
            CacheLookup::Hit(fingerprint, bytecode) => Ok((fingerprint, bytecode)),
            CacheLookup::Miss(fingerprint) => {
                let bytecode = compile(source, options)?;
                self.store(fingerprint, engine_version, &bytecode);
                Ok((fingerprint, bytecode))
            }
        }
    }

    /// Look `source` up without compiling. A miss carries the fingerprint to
    /// `store` the compiled result under.
    pub fn lookup(&mut self, source: &[u8], engine_version: &str, options: &CompileOptions) -> CacheLookup {
        let fingerprint = self.fingerprint(source, engine_version, options);

        match self.read_entry(fingerprint, engine_version) {
            Ok(Some(bytecode)) => {
                self.counters.hits += 1;
                debug!("Compile cache hit: {:?}", fingerprint);
                return CacheLookup::Hit(fingerprint, bytecode);
            }
            Ok(None) => {
                self.counters.misses += 1;
                debug!("Compile cache miss: {:?}", fingerprint);
            }
            Err(e) => {
                self.counters.misses += 1;
                self.counters.errors += 1;
                warn!("Discarding unusable compile cache entry: {}", e);
                self.remove(fingerprint);
            }
        }
        CacheLookup::Miss(fingerprint)
    }

    /// The fingerprint `source` would be cached under
    pub fn fingerprint(&self, source: &[u8], engine_version: &str, options: &CompileOptions) -> Fingerprint {
        Fingerprint::compute(source, engine_version, options, self.portable_root.as_deref())
    }

    fn entry_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.directory
            .join(format!("{}.{}", fingerprint.to_hex(), ENTRY_EXTENSION))
    }

    fn read_entry(
        &mut self,
        fingerprint: Fingerprint,
        engine_version: &str,
    ) -> Result<Option<Bytecode>, CacheError> {
        let path = self.entry_path(fingerprint);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(meta) = self.entries.remove(&fingerprint) {
                    self.current_size = self.current_size.saturating_sub(meta.size);
                    self.dirty = true;
                }
                return Ok(None);
            }
            Err(error) => return Err(CacheError::Io { path, error }),
        };

        let payload = decode_entry(&data, fingerprint, engine_version)
            .map_err(|reason| CacheError::Corrupt {
                path: path.clone(),
                reason,
            })?;

        let seq = self.tick();
        let size = data.len() as u64;
        match self.entries.get_mut(&fingerprint) {
            Some(meta) => {
                meta.hits += 1;
                meta.last_access = Utc::now();
                meta.seq = seq;
            }
            None => {
                // Written by someone else since the scan
                self.current_size += size;
                self.entries.insert(
                    fingerprint,
                    EntryMeta {
                        size,
                        last_access: Utc::now(),
                        seq,
                        hits: 1,
                    },
                );
            }
        }
        self.dirty = true;
        Ok(Some(Bytecode::from(payload)))
    }

    /// Write compiled bytecode under `fingerprint`. Write failures are counted, not returned.
    pub fn store(&mut self, fingerprint: Fingerprint, engine_version: &str, bytecode: &Bytecode) {
        let data = encode_entry(fingerprint, engine_version, bytecode.as_bytes());
        let size = data.len() as u64;
        if size > self.size_limit {
            debug!(
                "Not caching {:?}: {} bytes exceeds the {} byte limit",
                fingerprint, size, self.size_limit
            );
            return;
        }

        let path = self.entry_path(fingerprint);
        if let Err(error) = write_atomic(&self.directory, &path, &data) {
            self.counters.errors += 1;
            warn!("Failed to write compile cache entry {}: {}", path.display(), error);
            return;
        }

        self.counters.writes += 1;
        let seq = self.tick();
        let previous = self.entries.insert(
            fingerprint,
            EntryMeta {
                size,
                last_access: Utc::now(),
                seq,
                hits: 0,
            },
        );
        if let Some(previous) = previous {
            self.current_size = self.current_size.saturating_sub(previous.size);
        }
        self.current_size += size;
        self.dirty = true;
        trace!("Wrote compile cache entry {:?} ({} bytes)", fingerprint, size);

        self.enforce_limit();
    }

    /// Evict least recently used entries until the size budget holds
    fn enforce_limit(&mut self) {
        while self.current_size > self.size_limit {
            let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, meta)| (meta.seq, meta.last_access))
                .map(|(fingerprint, _)| *fingerprint)
            else {
                break;
            };
            if self.remove(victim) {
                self.counters.evictions += 1;
                debug!("Evicted compile cache entry {:?}", victim);
            }
        }
    }

    /// Delete one entry. Returns whether it was present.
    pub fn remove(&mut self, fingerprint: Fingerprint) -> bool {
        let path = self.entry_path(fingerprint);
        let meta = self.entries.remove(&fingerprint);
        if let Some(meta) = &meta {
            self.current_size = self.current_size.saturating_sub(meta.size);
            self.dirty = true;
        }
        match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => meta.is_some(),
            Err(e) => {
                warn!("Could not remove compile cache entry {}: {}", path.display(), e);
                meta.is_some()
            }
        }
    }

    /// Delete every entry file in the directory, including ones written by
    /// other instances; returns how many were removed
    pub fn clear(&mut self) -> usize {
        let mut removed = 0;
        match fs::read_dir(&self.directory) {
            Ok(read_dir) => {
                for dir_entry in read_dir.flatten() {
                    let path = dir_entry.path();
                    let is_entry = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(entry_fingerprint)
                        .is_some();
                    if !is_entry {
                        continue;
                    }
                    match fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!("Could not remove compile cache entry {}: {}", path.display(), e)
                        }
                    }
                }
            }
            Err(e) => warn!(
                "Could not list compile cache directory {}: {}",
                self.directory.display(),
                e
            ),
        }
        self.entries.clear();
        self.current_size = 0;
        self.dirty = true;
        if let Err(e) = self.flush() {
            warn!("Could not write compile cache index: {}", e);
        }
        info!("Cleared compile cache: {} entries removed", removed);
        removed
    }

    /// Whether an entry for `fingerprint` is known
    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.entries.contains_key(&fingerprint)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Whether fingerprints are location independent
    pub fn is_portable(&self) -> bool {
        self.portable_root.is_some()
    }

    /// Current counters
    pub fn stats(&self) -> CompileCacheStats {
        let c = self.counters;
        CompileCacheStats {
            hits: c.hits,
            misses: c.misses,
            writes: c.writes,
            errors: c.errors,
            evictions: c.evictions,
            current_size: self.current_size,
            size_limit: self.size_limit,
            hit_rate: percentage(c.hits, c.hits + c.misses),
            utilization: percentage(self.current_size, self.size_limit),
        }
    }

    /// Persist the index if it changed
    pub fn flush(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }
        let index = CacheIndex {
            version: FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|(fingerprint, meta)| (fingerprint.to_hex(), meta.clone()))
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&index)?;
        let path = self.directory.join(INDEX_FILE);
        write_atomic(&self.directory, &path, &data)
            .map_err(|error| CacheError::Io { path, error })?;
        self.dirty = false;
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl Drop for CompileCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Could not write compile cache index on shutdown: {}", e);
        }
    }
}

/// Fingerprint named by an entry file name, `<hex>.bin`
fn entry_fingerprint(file_name: &str) -> Option<Fingerprint> {
    file_name
        .strip_suffix(ENTRY_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .and_then(Fingerprint::from_hex)
}

/// Write through a temp file in the same directory and rename into place
fn write_atomic(directory: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(directory)?;
    temp.write_all(data)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn encode_entry(fingerprint: Fingerprint, engine_version: &str, payload: &[u8]) -> Vec<u8> {
    let engine = engine_version.as_bytes();
    let engine_len = engine.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(4 + 2 + 32 + 2 + engine_len + 8 + payload.len() + 32);

    out.extend_from_slice(MAGIC);
    // Writes into a Vec cannot fail
    let _ = out.write_u16::<LittleEndian>(FORMAT_VERSION);
    out.extend_from_slice(fingerprint.as_bytes());
    let _ = out.write_u16::<LittleEndian>(engine_len as u16);
    out.extend_from_slice(&engine[..engine_len]);
    let _ = out.write_u64::<LittleEndian>(payload.len() as u64);
    out.extend_from_slice(payload);
    out.extend_from_slice(&Sha256::digest(payload));
    out
}

fn decode_entry(data: &[u8], expected: Fingerprint, engine_version: &str) -> Result<Vec<u8>, String> {
    let mut cursor = Cursor::new(data);
    let truncated = |_: io::Error| "truncated entry".to_string();

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic).map_err(truncated)?;
    if &magic != MAGIC {
        return Err("bad magic".to_string());
    }

    let version = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    if version != FORMAT_VERSION {
        return Err(format!("unsupported format version {}", version));
    }

    let mut fingerprint = [0u8; 32];
    cursor.read_exact(&mut fingerprint).map_err(truncated)?;
    if Fingerprint::from_bytes(fingerprint) != expected {
        return Err("fingerprint mismatch".to_string());
    }

    let engine_len = cursor.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut engine = vec![0u8; engine_len];
    cursor.read_exact(&mut engine).map_err(truncated)?;
    if engine != engine_version.as_bytes() {
        return Err("engine version mismatch".to_string());
    }

    let payload_len = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
    let remaining = (data.len() as u64).saturating_sub(cursor.position());
    if remaining != payload_len.saturating_add(32) {
        return Err(format!(
            "payload length {} does not match entry size",
            payload_len
        ));
    }

    let mut payload = vec![0u8; payload_len as usize];
    cursor.read_exact(&mut payload).map_err(truncated)?;
    let mut checksum = [0u8; 32];
    cursor.read_exact(&mut checksum).map_err(truncated)?;
    if Sha256::digest(&payload).as_slice() != &checksum[..] {
        return Err("checksum mismatch".to_string());
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    const ENGINE: &str = "test-engine 1.0";

    fn config(dir: &Path, limit: u64) -> CompileCacheConfig {
        CompileCacheConfig {
            directory: dir.to_path_buf(),
            portable: false,
            size_limit: limit,
            portable_root: None,
        }
    }

    fn echo(source: &[u8], _: &CompileOptions) -> Result<Bytecode, CompileError> {
        let mut out = b"BC:".to_vec();
        out.extend_from_slice(source);
        Ok(Bytecode::from(out))
    }

    fn load(cache: &mut CompileCache, source: &str) -> (Fingerprint, Bytecode) {
        cache
            .get_or_compile(source.as_bytes(), ENGINE, &CompileOptions::default(), echo)
            .unwrap()
    }

    #[test]
    fn test_miss_then_hit() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();

        let (fp, first) = load(&mut cache, "a = 1");
        let compiled = Cell::new(false);
        let (fp2, second) = cache
            .get_or_compile(b"a = 1", ENGINE, &CompileOptions::default(), |s, o| {
                compiled.set(true);
                echo(s, o)
            })
            .unwrap();

        assert_eq!(fp, fp2);
        assert_eq!(first, second);
        assert!(!compiled.get());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
        assert_eq!(stats.hit_rate, 50.0);
        assert!(temp_dir.path().join(format!("{}.bin", fp.to_hex())).is_file());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let size = {
            let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
            load(&mut cache, "x");
            load(&mut cache, "y");
            cache.stats().current_size
        };
        assert!(temp_dir.path().join(INDEX_FILE).is_file());

        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().current_size, size);
        load(&mut cache, "x");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_corrupt_entry_is_miss_and_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        let (fp, original) = load(&mut cache, "payload");

        let path = temp_dir.path().join(format!("{}.bin", fp.to_hex()));
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 40;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        let (_, recompiled) = load(&mut cache, "payload");
        assert_eq!(recompiled, original);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.errors, stats.writes), (0, 2, 1, 2));

        // Rewritten entry is valid again
        load(&mut cache, "payload");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_garbage_and_truncated_files_rejected() {
        let fp = Fingerprint::compute(b"s", ENGINE, &CompileOptions::default(), None);
        let entry = encode_entry(fp, ENGINE, b"code");
        assert_eq!(decode_entry(&entry, fp, ENGINE).unwrap(), b"code");
        assert!(decode_entry(b"garbage", fp, ENGINE).is_err());
        assert!(decode_entry(&entry[..entry.len() - 1], fp, ENGINE).is_err());
        assert!(decode_entry(&entry, fp, "other engine").is_err());
        let other = Fingerprint::compute(b"t", ENGINE, &CompileOptions::default(), None);
        assert_eq!(decode_entry(&entry, other, ENGINE).unwrap_err(), "fingerprint mismatch");
    }

    #[test]
    fn test_eviction_keeps_size_under_limit() {
        let temp_dir = TempDir::new().unwrap();
        let entry_size = encode_entry(
            Fingerprint::compute(b"0000", ENGINE, &CompileOptions::default(), None),
            ENGINE,
            b"BC:0000",
        )
        .len() as u64;
        let mut cache = CompileCache::open(&config(temp_dir.path(), entry_size * 3)).unwrap();

        let (first, _) = load(&mut cache, "0000");
        load(&mut cache, "0001");
        load(&mut cache, "0002");
        // Touch the first so the second becomes least recently used
        load(&mut cache, "0000");
        let (fourth, _) = load(&mut cache, "0003");

        let stats = cache.stats();
        assert!(stats.current_size <= stats.size_limit);
        assert_eq!(stats.evictions, 1);
        assert!(cache.contains(first));
        assert!(cache.contains(fourth));
        assert_eq!(cache.len(), 3);
        assert_eq!(stats.utilization, 100.0);
    }

    #[test]
    fn test_oversized_entry_bypassed() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 64)).unwrap();
        let big = "x".repeat(500);
        load(&mut cache, &big);
        let stats = cache.stats();
        assert_eq!((stats.misses, stats.writes, stats.current_size), (1, 0, 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_removes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        load(&mut cache, "a");
        load(&mut cache, "b");

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().current_size, 0);
        assert_eq!(cache.clear(), 0);
        let leftovers = fs::read_dir(temp_dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().map_or(false, |x| x == "bin"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_clear_removes_entries_of_other_instances() {
        let temp_dir = TempDir::new().unwrap();
        let mut first = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        let mut second = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        load(&mut first, "a");
        let (theirs, _) = load(&mut second, "b");
        assert!(!first.contains(theirs));

        assert_eq!(first.clear(), 2);
        assert!(!temp_dir.path().join(format!("{}.bin", theirs.to_hex())).exists());
        assert!(temp_dir.path().join(INDEX_FILE).is_file());
    }

    #[test]
    fn test_lookup_then_store() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        let options = CompileOptions::default();

        let CacheLookup::Miss(fp) = cache.lookup(b"x = 1", ENGINE, &options) else {
            panic!("empty cache reported a hit");
        };
        let bytecode = echo(b"x = 1", &options).unwrap();
        cache.store(fp, ENGINE, &bytecode);

        match cache.lookup(b"x = 1", ENGINE, &options) {
            CacheLookup::Hit(hit, cached) => {
                assert_eq!(hit, fp);
                assert_eq!(cached, bytecode);
            }
            CacheLookup::Miss(_) => panic!("stored entry missed"),
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.writes), (1, 1, 1));
    }

    #[test]
    fn test_startup_scan_removes_temp_files_and_rebuilds_index() {
        let temp_dir = TempDir::new().unwrap();
        let fp = Fingerprint::compute(b"s", ENGINE, &CompileOptions::default(), None);
        fs::write(
            temp_dir.path().join(format!("{}.bin", fp.to_hex())),
            encode_entry(fp, ENGINE, b"BC:s"),
        )
        .unwrap();
        fs::write(temp_dir.path().join(".tmpXYZ"), b"partial").unwrap();
        fs::write(temp_dir.path().join(INDEX_FILE), b"{ not json").unwrap();

        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        assert!(!temp_dir.path().join(".tmpXYZ").exists());
        assert!(cache.contains(fp));
        load(&mut cache, "s");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_compile_error_is_not_cached() {
        let temp_dir = TempDir::new().unwrap();
        let mut cache = CompileCache::open(&config(temp_dir.path(), 1 << 20)).unwrap();
        let err = cache
            .get_or_compile(b"bad", ENGINE, &CompileOptions::default(), |_, _| {
                Err(CompileError::at_line("unexpected token", 1))
            })
            .unwrap_err();
        assert_eq!(err.line, Some(1));
        assert_eq!(cache.stats().writes, 0);
        assert!(cache.is_empty());
    }
}
