//! File content cache for storing hydrated file bodies.
//!
//! Uses a hash-based directory structure for efficient storage and lookup:
//! `{cache_root}/content/{first_2_chars_of_hash}/{rest_of_hash}`.
//!
//! Open handles are tracked per item ID so that repeated `open` calls return
//! the same handle; read-at and write-at offsets on the same item therefore
//! observe each other regardless of which FUSE file handle they arrived
//! through.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use onemount_core::ItemId;

use crate::CacheError;

/// A single-instance handle to one cached body.
///
/// All I/O goes through the inner file descriptor, which stays valid across
/// the rename performed by ID reconciliation.
pub struct CacheHandle {
    file: Mutex<File>,
    refs: AtomicU64,
}

impl CacheHandle {
    fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
            refs: AtomicU64::new(0),
        }
    }

    /// Reads up to `size` bytes at `offset`; short reads at EOF truncate the
    /// result.
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, CacheError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Writes `data` at `offset`, extending the file as needed.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32, CacheError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len() as u32)
    }

    /// Truncates or extends the body to `size` bytes.
    pub fn truncate(&self, size: u64) -> Result<(), CacheError> {
        let file = self.file.lock().unwrap();
        file.set_len(size)?;
        Ok(())
    }

    /// Current body length.
    pub fn len(&self) -> Result<u64, CacheError> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len())
    }

    /// True when the body is empty.
    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Flushes the body to stable storage.
    pub fn sync(&self) -> Result<(), CacheError> {
        let file = self.file.lock().unwrap();
        file.sync_all()?;
        Ok(())
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the ref count, returning the remaining count. A release
    /// without a matching retain stays at zero.
    fn release(&self) -> u64 {
        self.refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or(0)
    }

    /// Open reference count.
    pub fn refs(&self) -> u64 {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Manages cached file bodies on disk.
pub struct ContentCache {
    content_dir: PathBuf,
    handles: DashMap<ItemId, Arc<CacheHandle>>,
}

impl ContentCache {
    /// Creates the cache, making the content directory if needed.
    pub fn new(cache_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let content_dir = cache_root.into().join("content");
        fs::create_dir_all(&content_dir)?;
        Ok(Self {
            content_dir,
            handles: DashMap::new(),
        })
    }

    /// Deterministic on-disk path for an item's body.
    pub fn content_path(&self, id: &ItemId) -> PathBuf {
        let hash = Self::hash_id(id);
        let (prefix, rest) = hash.split_at(2);
        self.content_dir.join(prefix).join(rest)
    }

    /// Path for an in-progress download of this item.
    pub fn partial_path(&self, id: &ItemId) -> PathBuf {
        let mut path = self.content_path(id);
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        path.set_file_name(format!("{filename}.partial"));
        path
    }

    /// Stores a complete body, replacing any existing object.
    ///
    /// Writes go through the open handle when one exists so concurrent
    /// readers observe the replacement.
    pub fn insert(&self, id: &ItemId, data: &[u8]) -> Result<(), CacheError> {
        if let Some(handle) = self.handles.get(id) {
            handle.truncate(0)?;
            handle.write_at(0, data)?;
            return Ok(());
        }
        let path = self.content_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        Ok(())
    }

    /// Opens (or re-opens) the single handle for an item, creating a
    /// zero-length body if none exists.
    pub fn open(&self, id: &ItemId) -> Result<Arc<CacheHandle>, CacheError> {
        let entry = self.handles.entry(id.clone());
        let handle = match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let path = self.content_path(id);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                let handle = Arc::new(CacheHandle::new(file));
                vacant.insert(Arc::clone(&handle));
                handle
            }
        };
        handle.retain();
        Ok(handle)
    }

    /// Releases one reference to the item's handle, dropping the registry
    /// entry when the last reference goes away.
    pub fn close(&self, id: &ItemId) {
        let mut drop_entry = false;
        if let Some(handle) = self.handles.get(id) {
            drop_entry = handle.release() == 0;
        }
        if drop_entry {
            self.handles.remove_if(id, |_, h| h.refs() == 0);
        }
    }

    /// Removes the cached body and any partial download.
    ///
    /// Tolerates concurrent `close`: the registry entry is dropped
    /// unconditionally and open descriptors stay readable until their owners
    /// release them.
    pub fn delete(&self, id: &ItemId) -> Result<(), CacheError> {
        self.handles.remove(id);
        let path = self.content_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let partial = self.partial_path(id);
        if partial.exists() {
            let _ = fs::remove_file(&partial);
        }
        Ok(())
    }

    /// Reads the complete body; an absent object yields an empty buffer.
    pub fn get(&self, id: &ItemId) -> Result<Vec<u8>, CacheError> {
        if let Some(handle) = self.handles.get(id) {
            let len = handle.len()?;
            return handle.read_at(0, len.min(u32::MAX as u64) as u32);
        }
        let path = self.content_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read(&path)?)
    }

    /// Whether a body exists for this item.
    pub fn has(&self, id: &ItemId) -> bool {
        self.handles.contains_key(id) || self.content_path(id).exists()
    }

    /// Size of the cached body, when present.
    pub fn size(&self, id: &ItemId) -> Option<u64> {
        fs::metadata(self.content_path(id)).map(|m| m.len()).ok()
    }

    /// Promotes a finished partial download into place: fsync, then rename.
    pub fn commit_partial(&self, id: &ItemId) -> Result<(), CacheError> {
        let partial = self.partial_path(id);
        let file = File::open(&partial)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&partial, self.content_path(id))?;
        Ok(())
    }

    /// Renames the cached object from `old` to `new` during ID
    /// reconciliation. Open handles follow: the file descriptor survives the
    /// rename and the registry entry is re-keyed.
    pub fn move_id(&self, old: &ItemId, new: &ItemId) -> Result<(), CacheError> {
        let old_path = self.content_path(old);
        if old_path.exists() {
            let new_path = self.content_path(new);
            if let Some(parent) = new_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&old_path, &new_path)?;
        }
        if let Some((_, handle)) = self.handles.remove(old) {
            self.handles.insert(new.clone(), handle);
        }
        Ok(())
    }

    /// Total bytes on disk.
    pub fn disk_usage(&self) -> Result<u64, CacheError> {
        let mut total = 0u64;
        if self.content_dir.exists() {
            for entry in fs::read_dir(&self.content_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    for file in fs::read_dir(entry.path())? {
                        let file = file?;
                        if file.file_type()?.is_file() {
                            total += file.metadata()?.len();
                        }
                    }
                }
            }
        }
        Ok(total)
    }

    /// Removes objects whose mtime is older than `max_age`, returning the
    /// number removed. Partial files are always fair game once stale.
    pub fn sweep_expired(&self, max_age: Duration) -> Result<u64, CacheError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0u64;
        if !self.content_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                if !file.file_type()?.is_file() {
                    continue;
                }
                let mtime = file.metadata()?.modified()?;
                if mtime < cutoff && Self::remove_quiet(&file.path()) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Crash recovery: removes leftover `.partial` downloads. Metadata is
    /// untouched; the affected entries are still ghosts and re-hydrate on
    /// demand.
    pub fn sweep_partials(&self) -> Result<u64, CacheError> {
        let mut removed = 0u64;
        if !self.content_dir.exists() {
            return Ok(0);
        }
        for entry in fs::read_dir(&self.content_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let is_partial = file
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".partial");
                if is_partial && Self::remove_quiet(&file.path()) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn remove_quiet(path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to expire cache object");
                false
            }
        }
    }

    fn hash_id(id: &ItemId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
