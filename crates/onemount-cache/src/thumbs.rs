//! Thumbnail cache keyed by `(item id, size)`.

use std::{
    fs,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use sha2::{Digest, Sha256};

use onemount_core::ItemId;

use crate::CacheError;

/// Thumbnail size classes served by the Graph API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailSize {
    Small,
    Medium,
    Large,
}

impl ThumbnailSize {
    /// Directory name for this size class.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailSize::Small => "small",
            ThumbnailSize::Medium => "medium",
            ThumbnailSize::Large => "large",
        }
    }

    /// All size classes.
    #[must_use]
    pub fn all() -> [ThumbnailSize; 3] {
        [
            ThumbnailSize::Small,
            ThumbnailSize::Medium,
            ThumbnailSize::Large,
        ]
    }
}

/// On-disk thumbnail store under `{cache_root}/thumbnails/{size}/`.
pub struct ThumbnailCache {
    thumb_dir: PathBuf,
}

impl ThumbnailCache {
    pub fn new(cache_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let thumb_dir = cache_root.into().join("thumbnails");
        for size in ThumbnailSize::all() {
            fs::create_dir_all(thumb_dir.join(size.as_str()))?;
        }
        Ok(Self { thumb_dir })
    }

    /// Deterministic path for one `(id, size)` object.
    pub fn path(&self, id: &ItemId, size: ThumbnailSize) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.thumb_dir.join(size.as_str()).join(hash)
    }

    /// Stores a thumbnail body.
    pub fn insert(
        &self,
        id: &ItemId,
        size: ThumbnailSize,
        data: &[u8],
    ) -> Result<(), CacheError> {
        fs::write(self.path(id, size), data)?;
        Ok(())
    }

    /// Reads a thumbnail when present.
    pub fn get(&self, id: &ItemId, size: ThumbnailSize) -> Option<Vec<u8>> {
        fs::read(self.path(id, size)).ok()
    }

    /// Whether a thumbnail exists for this `(id, size)`.
    pub fn has(&self, id: &ItemId, size: ThumbnailSize) -> bool {
        self.path(id, size).exists()
    }

    /// Removes all size classes for an item.
    pub fn delete(&self, id: &ItemId) -> Result<(), CacheError> {
        for size in ThumbnailSize::all() {
            let path = self.path(id, size);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Removes thumbnails whose mtime is older than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> Result<u64, CacheError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0u64;
        for size in ThumbnailSize::all() {
            let dir = self.thumb_dir.join(size.as_str());
            if !dir.exists() {
                continue;
            }
            for file in fs::read_dir(&dir)? {
                let file = file?;
                if !file.file_type()?.is_file() {
                    continue;
                }
                if file.metadata()?.modified()? < cutoff
                    && fs::remove_file(file.path()).is_ok()
                {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
