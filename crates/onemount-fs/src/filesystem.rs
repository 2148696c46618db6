//! FUSE operation adapter
//!
//! Maps kernel requests onto the synchronization core while preserving the
//! POSIX errno mapping. The adapter itself holds no durable state: every
//! operation resolves through the inode graph, consults the metadata store
//! for state, hits the content cache or queues a hydration, and marks
//! entries dirty + enqueues uploads for writes.
//!
//! Rules baked in here:
//! - restricted-name checks precede any remote call
//! - offline creations synthesize `local-` IDs, go `dirty_local`, and stay
//!   visible through the pending-remote overlay
//! - `release` closes the cache handle; it never forces an upload to finish
//! - directory listings come from cache when fresh, otherwise through a
//!   high-priority metadata request

use std::ffi::{c_int, OsStr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use onemount_cache::{CacheHandle, ContentCache};
use onemount_core::domain::{
    validate_name, Entry, FileStatus, ItemState, OfflineChange, OfflineChangeKind, Priority,
    TransitionCause, NAME_MAX,
};
use onemount_core::ports::{DriveQuota, RemoteDrive, RemoteItem};
use onemount_core::{CoreError, ItemId, NodeId};
use onemount_store::{MetadataStore, OfflineLog};

use crate::download::DownloadManager;
use crate::error::FsError;
use crate::inode::{Inode, InodeGraph};
use crate::offline::OfflineTracker;
use crate::requests::{MetadataRequest, MetadataRequestManager, MetadataResponse};
use crate::status::StatusNotifier;
use crate::upload::UploadManager;
use crate::xattr;

/// TTL for FUSE attribute caching.
const TTL: Duration = Duration::from_secs(1);

/// FUSE open flag telling the kernel cached data is still valid.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// How long a fetched child listing counts as fresh.
const CHILDREN_TTL: Duration = Duration::from_secs(30);

/// Everything the adapter needs from the composition root.
pub struct FsHandles {
    pub store: Arc<MetadataStore>,
    pub cache: Arc<ContentCache>,
    pub graph: Arc<InodeGraph>,
    pub downloads: DownloadManager,
    pub uploads: UploadManager,
    pub requests: MetadataRequestManager,
    pub offline: Arc<OfflineTracker>,
    pub offline_log: Arc<OfflineLog>,
    pub notifier: Arc<StatusNotifier>,
    pub remote: Arc<dyn RemoteDrive>,
    pub quota: Arc<RwLock<Option<DriveQuota>>>,
    pub root_id: ItemId,
}

/// One open file descriptor.
struct OpenHandle {
    id: ItemId,
    cache: Option<Arc<CacheHandle>>,
    wrote: AtomicBool,
}

/// The `fuser::Filesystem` implementation.
pub struct OneMountFs {
    rt: Handle,
    h: FsHandles,
    cache_capacity_bytes: u64,
    next_fh: AtomicU64,
    handles: DashMap<u64, Arc<OpenHandle>>,
}

impl OneMountFs {
    pub fn new(rt: Handle, handles: FsHandles, cache_capacity_gb: u32) -> Self {
        Self {
            rt,
            h: handles,
            cache_capacity_bytes: cache_capacity_gb as u64 * 1024 * 1024 * 1024,
            next_fh: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Attr plumbing
    // ------------------------------------------------------------------

    fn attr_for(&self, inode: &Inode) -> FileAttr {
        let kind = if inode.is_directory() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let size = inode.size();
        let mtime = inode.mtime();
        FileAttr {
            ino: inode.node_id().get(),
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: if inode.is_directory() { 0o755 } else { 0o644 },
            nlink: if inode.is_directory() { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn node(&self, ino: u64) -> Result<Arc<Inode>, FsError> {
        self.h
            .graph
            .get(ino)
            .ok_or_else(|| FsError::Core(CoreError::NotFound(format!("inode {ino}"))))
    }

    fn dir_node(&self, ino: u64) -> Result<Arc<Inode>, FsError> {
        let inode = self.node(ino)?;
        if !inode.is_directory() {
            return Err(FsError::NotADirectory);
        }
        Ok(inode)
    }

    fn checked_name(name: &OsStr) -> Result<&str, FsError> {
        let name = name
            .to_str()
            .ok_or_else(|| FsError::Core(CoreError::InvalidArgument("non-UTF-8 name".into())))?;
        if name.len() > NAME_MAX {
            return Err(FsError::Core(CoreError::InvalidArgument(format!(
                "name exceeds {NAME_MAX} bytes"
            ))));
        }
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Directory listing
    // ------------------------------------------------------------------

    /// Refreshes a directory's children through the metadata request
    /// manager unless the cached listing is fresh or we are offline.
    /// Pending-remote children live in the store and are merged regardless
    /// of what the server returns.
    fn ensure_children(&self, dir: &Arc<Inode>) -> Result<(), FsError> {
        if self.h.offline.is_offline() || dir.children_fresh(CHILDREN_TTL) {
            return Ok(());
        }
        if dir.id().is_local() {
            // the directory itself is not on the server yet
            return Ok(());
        }

        let response = self.rt.block_on(
            self.h
                .requests
                .request(MetadataRequest::Children(dir.id()), Priority::High),
        );
        match response {
            Ok(MetadataResponse::Children(items)) => {
                self.rt.block_on(self.merge_children(dir, items))?;
                dir.mark_children_fetched();
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // fetch errors never reach userspace; serve the cached view
                warn!(dir = %dir.id(), error = %e, "Child listing fetch failed, serving cached view");
                if e.is_offline() {
                    self.h.offline.set_offline();
                }
                Ok(())
            }
        }
    }

    async fn merge_children(
        &self,
        dir: &Arc<Inode>,
        items: Vec<RemoteItem>,
    ) -> Result<(), FsError> {
        let dir_id = dir.id();
        for item in items {
            if item.is_deleted {
                continue;
            }
            if let Some(existing) = self.h.store.try_get(&item.id).await? {
                self.h.graph.upsert(&existing);
                continue;
            }
            // a pending-remote child just became visible: the delta loop owns
            // full reconciliation, so leave the pending row in place here
            if let Some(pending) = self.h.store.lookup_child(&dir_id, &item.name).await? {
                if pending.pending_remote {
                    continue;
                }
            }
            let entry = Entry::new_remote(
                item.id.clone(),
                dir_id.clone(),
                item.name.clone(),
                item.kind(),
                item.size,
                item.hash.clone(),
                item.etag.clone(),
                item.mtime.unwrap_or_else(chrono::Utc::now),
            );
            if let Err(e) = self.h.store.create(&entry, TransitionCause::CreateRemote).await {
                debug!(id = %entry.id, error = %e, "Skipping child merge");
                continue;
            }
            self.h.graph.upsert(&entry);
        }
        Ok(())
    }

    fn listing(&self, dir: &Arc<Inode>) -> Vec<Arc<Inode>> {
        let mut children = self.h.graph.children_of(&dir.id());
        children.sort_by(|a, b| a.name().cmp(&b.name()));
        children
    }

    // ------------------------------------------------------------------
    // Core operations (Result-returning; the trait impl maps to errnos)
    // ------------------------------------------------------------------

    fn do_lookup(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        let dir = self.dir_node(parent)?;
        if let Some(found) = self.h.graph.lookup(&dir.id(), name) {
            return Ok(self.attr_for(&found));
        }
        // the name may exist remotely but not be projected yet
        self.ensure_children(&dir)?;
        let found = self
            .h
            .graph
            .lookup(&dir.id(), name)
            .ok_or_else(|| FsError::Core(CoreError::NotFound(name.to_string())))?;
        Ok(self.attr_for(&found))
    }

    fn do_getattr(&self, ino: u64) -> Result<FileAttr, FsError> {
        let inode = self.node(ino)?;
        Ok(self.attr_for(&inode))
    }

    fn do_setattr(&self, ino: u64, size: Option<u64>, mtime: Option<SystemTime>) -> Result<FileAttr, FsError> {
        let inode = self.node(ino)?;
        if let Some(new_size) = size {
            if inode.is_directory() {
                return Err(FsError::IsADirectory);
            }
            let id = inode.id();
            let handle = self.h.cache.open(&id)?;
            handle.truncate(new_size)?;
            self.h.cache.close(&id);
            inode.set_size(new_size);
            self.mark_dirty(&inode)?;
            let updated = self.rt.block_on(self.h.store.update(&id, |entry| {
                entry.size = new_size;
                entry.mtime = chrono::Utc::now();
            }))?;
            self.h.graph.upsert(&updated);
        }
        if let Some(mtime) = mtime {
            inode.set_mtime(mtime);
        }
        Ok(self.attr_for(&inode))
    }

    fn do_mkdir(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        validate_name(name)?;
        let dir = self.dir_node(parent)?;
        if self.h.graph.lookup(&dir.id(), name).is_some() {
            return Err(FsError::Core(CoreError::AlreadyExists(name.to_string())));
        }

        let entry = Entry::new_local_dir(dir.id(), name)?;
        self.rt
            .block_on(self.h.store.create(&entry, TransitionCause::CreateLocalDirty))?;
        let inode = self.h.graph.upsert(&entry);

        if self.h.offline.is_offline() {
            self.track_offline(OfflineChange::new(
                entry.id.clone(),
                OfflineChangeKind::Create,
                self.path_of(&entry.id),
            ));
        } else {
            let uploads = self.h.uploads.clone();
            let id = entry.id.clone();
            self.rt.spawn(async move {
                if let Err(e) = uploads.queue(&id, Priority::High).await {
                    warn!(id = %id, error = %e, "Failed to queue directory creation");
                }
            });
        }
        self.h
            .notifier
            .emit(self.path_of(&entry.id), FileStatus::LocalModified);
        Ok(self.attr_for(&inode))
    }

    fn do_create(&self, parent: u64, name: &str) -> Result<(FileAttr, u64), FsError> {
        validate_name(name)?;
        let dir = self.dir_node(parent)?;
        if self.h.graph.lookup(&dir.id(), name).is_some() {
            return Err(FsError::Core(CoreError::AlreadyExists(name.to_string())));
        }

        let entry = Entry::new_local_file(dir.id(), name)?;
        self.rt
            .block_on(self.h.store.create(&entry, TransitionCause::CreateLocalDirty))?;
        let inode = self.h.graph.upsert(&entry);

        if self.h.offline.is_offline() {
            self.track_offline(OfflineChange::new(
                entry.id.clone(),
                OfflineChangeKind::Create,
                self.path_of(&entry.id),
            ));
        }

        let handle = self.h.cache.open(&entry.id)?;
        inode.retain_handle();
        inode.set_local_changes(true);
        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            Arc::new(OpenHandle {
                id: entry.id.clone(),
                cache: Some(handle),
                wrote: AtomicBool::new(true),
            }),
        );
        self.h
            .notifier
            .emit(self.path_of(&entry.id), FileStatus::LocalModified);
        Ok((self.attr_for(&inode), fh))
    }

    fn do_open(&self, ino: u64, flags: i32) -> Result<(u64, u32), FsError> {
        let inode = self.node(ino)?;
        if inode.is_directory() {
            return Err(FsError::IsADirectory);
        }
        self.h.requests.touch_foreground();

        if inode.is_virtual() {
            let fh = self.alloc_fh();
            self.handles.insert(
                fh,
                Arc::new(OpenHandle {
                    id: inode.id(),
                    cache: None,
                    wrote: AtomicBool::new(false),
                }),
            );
            return Ok((fh, FOPEN_KEEP_CACHE));
        }

        let id = inode.id();
        // a ghost needs its body before reads can be served
        if inode.state() == ItemState::Ghost && !self.h.cache.has(&id) {
            if self.h.offline.is_offline() {
                return Err(FsError::Core(CoreError::NetworkUnavailable(
                    "body not cached and filesystem is offline".into(),
                )));
            }
            let downloads = self.h.downloads.clone();
            let session = downloads.queue(&id, Priority::High)?;
            self.rt.block_on(session.wait())?;
            if let Some(entry) = self.rt.block_on(self.h.store.try_get(&id))? {
                self.h.graph.upsert(&entry);
            }
        }

        let handle = self.h.cache.open(&id)?;
        if flags & libc::O_TRUNC != 0 {
            handle.truncate(0)?;
            inode.set_size(0);
            self.mark_dirty(&inode)?;
        }
        inode.retain_handle();
        let fh = self.alloc_fh();
        self.handles.insert(
            fh,
            Arc::new(OpenHandle {
                id,
                cache: Some(handle),
                wrote: AtomicBool::new(false),
            }),
        );
        Ok((fh, FOPEN_KEEP_CACHE))
    }

    fn do_read(&self, ino: u64, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        let inode = self.node(ino)?;
        if let Some(content) = inode.virtual_content() {
            let start = (offset as usize).min(content.len());
            let end = (start + size as usize).min(content.len());
            return Ok(content[start..end].to_vec());
        }
        let handle = self
            .handles
            .get(&fh)
            .ok_or_else(|| FsError::Core(CoreError::InvalidArgument("bad file handle".into())))?;
        let cache = handle
            .cache
            .as_ref()
            .ok_or_else(|| FsError::Core(CoreError::InvalidArgument("bad file handle".into())))?;
        Ok(cache.read_at(offset.max(0) as u64, size)?)
    }

    fn do_write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> Result<u32, FsError> {
        let inode = self.node(ino)?;
        if inode.is_virtual() {
            // virtual nodes absorb writes without propagating them
            return Ok(data.len() as u32);
        }
        let handle = self
            .handles
            .get(&fh)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| FsError::Core(CoreError::InvalidArgument("bad file handle".into())))?;
        let cache = handle
            .cache
            .as_ref()
            .ok_or_else(|| FsError::Core(CoreError::InvalidArgument("bad file handle".into())))?;

        let written = cache.write_at(offset.max(0) as u64, data)?;
        let end = offset.max(0) as u64 + written as u64;
        if end > inode.size() {
            inode.set_size(end);
        }
        inode.set_mtime(SystemTime::now());
        handle.wrote.store(true, Ordering::SeqCst);
        self.mark_dirty(&inode)?;
        Ok(written)
    }

    fn do_release(&self, _ino: u64, fh: u64) -> Result<(), FsError> {
        let Some((_, handle)) = self.handles.remove(&fh) else {
            return Ok(());
        };
        let id = handle.id.clone();
        if let Some(inode) = self.h.graph.get_by_id(&id) {
            inode.release_handle();
        }
        if handle.cache.is_some() {
            self.h.cache.close(&id);
        }

        if handle.wrote.load(Ordering::SeqCst) {
            // persist the final size and hand the dirty body to the uploader;
            // release itself never waits for the upload
            let size = self.h.cache.size(&id).unwrap_or(0);
            let updated = self.rt.block_on(self.h.store.update(&id, |entry| {
                entry.size = size;
                entry.mtime = chrono::Utc::now();
            }))?;
            self.h.graph.upsert(&updated);

            if !self.h.offline.is_offline() {
                let uploads = self.h.uploads.clone();
                let id = id.clone();
                self.rt.spawn(async move {
                    if let Err(e) = uploads.queue(&id, Priority::Normal).await {
                        warn!(id = %id, error = %e, "Failed to queue upload on release");
                    }
                });
            }
        }
        Ok(())
    }

    fn do_fsync(&self, fh: u64) -> Result<(), FsError> {
        if let Some(handle) = self.handles.get(&fh) {
            if let Some(cache) = handle.cache.as_ref() {
                cache.sync()?;
            }
        }
        Ok(())
    }

    fn do_unlink(&self, parent: u64, name: &str, expect_dir: bool) -> Result<(), FsError> {
        let dir = self.dir_node(parent)?;
        let target = self
            .h
            .graph
            .lookup(&dir.id(), name)
            .ok_or_else(|| FsError::Core(CoreError::NotFound(name.to_string())))?;

        if expect_dir {
            if !target.is_directory() {
                return Err(FsError::NotADirectory);
            }
            let children = self.rt.block_on(self.h.store.children(&target.id()))?;
            if !children.is_empty() || !self.h.graph.children_of(&target.id()).is_empty() {
                return Err(FsError::NotEmpty);
            }
        } else if target.is_directory() {
            return Err(FsError::IsADirectory);
        }

        let id = target.id();
        let path = self.path_of(&id);
        let was_local_only = id.is_local();

        // stop any pending upload for this item
        let uploads = self.h.uploads.clone();
        let cancel_id = id.clone();
        self.rt.block_on(async move { uploads.cancel(&cancel_id).await });

        self.h.cache.delete(&id)?;
        self.rt.block_on(self.h.store.transition(
            &id,
            ItemState::Deleted,
            TransitionCause::Unlink,
        ))?;
        self.h.graph.remove(&id);
        self.h.notifier.forget(&path);

        if was_local_only {
            // never reached the server; no tombstone to confirm
            self.rt.block_on(self.h.store.delete(&id))?;
        } else if self.h.offline.is_offline() {
            self.track_offline(OfflineChange::new(id, OfflineChangeKind::Delete, path));
        } else {
            // tombstone remotely, purge the retained row once confirmed
            let remote = Arc::clone(&self.h.remote);
            let store = Arc::clone(&self.h.store);
            self.rt.spawn(async move {
                match remote.delete(&id).await {
                    Ok(()) | Err(CoreError::NotFound(_)) => {
                        if let Err(e) = store.delete(&id).await {
                            warn!(id = %id, error = %e, "Failed to purge confirmed tombstone");
                        }
                    }
                    Err(e) => warn!(id = %id, error = %e, "Remote delete failed; tombstone retained"),
                }
            });
        }
        Ok(())
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), FsError> {
        validate_name(newname)?;
        let src_dir = self.dir_node(parent)?;
        let dst_dir = self.dir_node(newparent)?;
        let source = self
            .h
            .graph
            .lookup(&src_dir.id(), name)
            .ok_or_else(|| FsError::Core(CoreError::NotFound(name.to_string())))?;

        // POSIX rename replaces an existing target
        if let Some(existing) = self.h.graph.lookup(&dst_dir.id(), newname) {
            if existing.node_id() != source.node_id() {
                self.do_unlink(newparent, newname, existing.is_directory())?;
            }
        }

        let id = source.id();
        let updated = self
            .rt
            .block_on(self.h.store.reparent(&id, &dst_dir.id(), newname))?;
        self.h.graph.rename(&id, &dst_dir.id(), newname);
        self.h.graph.upsert(&updated);

        if id.is_local() {
            // the pending upload will create it under the new placement
            return Ok(());
        }
        if self.h.offline.is_offline() {
            self.track_offline(OfflineChange::new(
                id,
                OfflineChangeKind::Rename {
                    new_parent: dst_dir.id(),
                    new_name: newname.to_string(),
                },
                self.path_of(&source.id()),
            ));
        } else {
            let remote = Arc::clone(&self.h.remote);
            let store = Arc::clone(&self.h.store);
            let new_parent = dst_dir.id();
            let new_name = newname.to_string();
            self.rt.spawn(async move {
                match remote.rename(&id, &new_parent, &new_name).await {
                    Ok(item) => {
                        let etag = item.etag;
                        let _ = store.update(&id, |entry| entry.etag = etag).await;
                    }
                    Err(e) => warn!(id = %id, error = %e, "Remote rename failed"),
                }
            });
        }
        Ok(())
    }

    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, FsError> {
        let dir = self.dir_node(ino)?;
        self.ensure_children(&dir)?;

        let parent_ino = dir
            .parent_id()
            .and_then(|pid| self.h.graph.get_by_id(&pid))
            .map(|p| p.node_id().get())
            .unwrap_or(NodeId::ROOT.get());

        let mut entries = vec![
            (dir.node_id().get(), FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in self.listing(&dir) {
            let kind = if child.is_directory() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child.node_id().get(), kind, child.name()));
        }
        Ok(entries)
    }

    fn do_statfs(&self) -> (u64, u64, u64) {
        const BLOCK_SIZE: u64 = 4096;
        let quota = *self.h.quota.read().unwrap();
        let (total, free) = match quota {
            Some(q) if q.total > 0 => (q.total, q.remaining),
            // best effort: fall back to the configured cache capacity
            _ => {
                let used = self.h.cache.disk_usage().unwrap_or(0);
                (
                    self.cache_capacity_bytes,
                    self.cache_capacity_bytes.saturating_sub(used),
                )
            }
        };
        (total / BLOCK_SIZE, free / BLOCK_SIZE, BLOCK_SIZE)
    }

    fn do_getxattr(&self, ino: u64, name: &str) -> Result<Vec<u8>, FsError> {
        let inode = self.node(ino)?;
        if xattr::is_reserved(name) {
            let progress = if name == xattr::XATTR_PROGRESS {
                let id = inode.id();
                self.h
                    .downloads
                    .progress(&id)
                    .or_else(|| self.h.uploads.progress(&id))
            } else {
                None
            };
            return xattr::get_reserved(&inode, name, progress).ok_or(FsError::NoData);
        }
        inode.xattr(name).ok_or(FsError::NoData)
    }

    fn do_setxattr(&self, ino: u64, name: &str, value: &[u8]) -> Result<(), FsError> {
        let inode = self.node(ino)?;
        if xattr::is_reserved(name) {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EACCES)));
        }
        if !name.starts_with("user.") {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(
                libc::ENOTSUP,
            )));
        }
        inode.set_xattr(name, value.to_vec());
        Ok(())
    }

    fn do_removexattr(&self, ino: u64, name: &str) -> Result<(), FsError> {
        let inode = self.node(ino)?;
        if xattr::is_reserved(name) {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(libc::EACCES)));
        }
        if !inode.remove_xattr(name) {
            return Err(FsError::NoData);
        }
        Ok(())
    }

    fn do_listxattr(&self, ino: u64) -> Result<Vec<u8>, FsError> {
        let inode = self.node(ino)?;
        let mut data = Vec::new();
        for name in xattr::reserved_xattrs() {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        for name in inode.xattr_names() {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Marks an inode dirty, journaling the first transition per edit burst.
    fn mark_dirty(&self, inode: &Arc<Inode>) -> Result<(), FsError> {
        let id = inode.id();
        let state = inode.state();
        if state != ItemState::DirtyLocal {
            let cause = match state {
                ItemState::Hydrated => TransitionCause::LocalModify,
                ItemState::Ghost => TransitionCause::LocalWriteOnStub,
                _ => TransitionCause::AdditionalLocalEdit,
            };
            let updated = self
                .rt
                .block_on(self.h.store.transition(&id, ItemState::DirtyLocal, cause))?;
            self.h.graph.upsert(&updated);
            self.h
                .notifier
                .emit(self.path_of(&id), FileStatus::LocalModified);
        }
        if self.h.offline.is_offline() && !inode.has_local_changes() {
            self.track_offline(OfflineChange::new(
                id.clone(),
                OfflineChangeKind::Modify,
                self.path_of(&id),
            ));
        }
        inode.set_local_changes(true);
        Ok(())
    }

    fn track_offline(&self, change: OfflineChange) {
        let log = Arc::clone(&self.h.offline_log);
        self.rt.block_on(async move {
            if let Err(e) = log.append(&change).await {
                warn!(id = %change.id, error = %e, "Failed to track offline change");
            }
        });
    }

    fn path_of(&self, id: &ItemId) -> String {
        self.h
            .graph
            .path_of(id)
            .unwrap_or_else(|| format!("/{id}"))
    }
}

// ============================================================================
// Filesystem trait implementation
// ============================================================================

/// Replies with a mapped errno and logs the failure.
macro_rules! reply_err {
    ($reply:expr, $err:expr, $op:literal) => {{
        let err = $err;
        debug!(op = $op, errno = err.errno(), error = %err, "FUSE op failed");
        $reply.error(err.errno());
    }};
}

impl Filesystem for OneMountFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!(inodes = self.h.graph.len(), "FUSE filesystem ready");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(
            open_handles = self.handles.len(),
            "FUSE filesystem shutting down"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::checked_name(name) {
            Ok(n) => n,
            Err(e) => return reply_err!(reply, e, "lookup"),
        };
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply_err!(reply, e, "lookup"),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply_err!(reply, e, "getattr"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mtime = mtime.map(|t| match t {
            TimeOrNow::SpecificTime(t) => t,
            TimeOrNow::Now => SystemTime::now(),
        });
        match self.do_setattr(ino, size, mtime) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply_err!(reply, e, "setattr"),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match Self::checked_name(name) {
            Ok(n) => n,
            Err(e) => return reply_err!(reply, e, "mkdir"),
        };
        match self.do_mkdir(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply_err!(reply, e, "mkdir"),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::checked_name(name) {
            Ok(n) => n,
            Err(e) => return reply_err!(reply, e, "rmdir"),
        };
        match self.do_unlink(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "rmdir"),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::checked_name(name) {
            Ok(n) => n,
            Err(e) => return reply_err!(reply, e, "unlink"),
        };
        match self.do_unlink(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "unlink"),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match Self::checked_name(name) {
            Ok(n) => n,
            Err(e) => return reply_err!(reply, e, "create"),
        };
        match self.do_create(parent, name) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, FOPEN_KEEP_CACHE),
            Err(e) => reply_err!(reply, e, "create"),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok((fh, open_flags)) => reply.opened(fh, open_flags),
            Err(e) => reply_err!(reply, e, "open"),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.do_read(ino, fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply_err!(reply, e, "read"),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.do_write(ino, fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply_err!(reply, e, "write"),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // writes land in the cache synchronously; uploads are asynchronous
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.do_fsync(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "fsync"),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.do_release(ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "release"),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (Self::checked_name(name), Self::checked_name(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply_err!(reply, e, "rename"),
        };
        match self.do_rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "rename"),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.dir_node(ino) {
            Ok(_) => reply.opened(self.alloc_fh(), 0),
            Err(e) => reply_err!(reply, e, "opendir"),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => return reply_err!(reply, e, "readdir"),
        };
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break; // buffer full
            }
        }
        reply.ok();
    }

    fn readdirplus(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => return reply_err!(reply, e, "readdirplus"),
        };
        for (i, (child_ino, _kind, name)) in
            entries.into_iter().enumerate().skip(offset.max(0) as usize)
        {
            let attr = match self.do_getattr(child_ino) {
                Ok(attr) => attr,
                Err(_) => continue,
            };
            if reply.add(child_ino, (i + 1) as i64, &name, &TTL, &attr, 0) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.do_getxattr(ino, name) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (value.len() as u32) <= size {
                    reply.data(&value);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply_err!(reply, e, "getxattr"),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.do_setxattr(ino, name, value) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "setxattr"),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.do_listxattr(ino) {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if (data.len() as u32) <= size {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply_err!(reply, e, "listxattr"),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match self.do_removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, e, "removexattr"),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let (blocks, bfree, bsize) = self.do_statfs();
        reply.statfs(blocks, bfree, bfree, 0, 0, bsize as u32, 255, bsize as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use onemount_core::config::UploadConfig;
    use onemount_core::domain::StateController;
    use onemount_core::ports::{DeltaPage, UploadHandle};
    use onemount_core::DeltaCursor;
    use onemount_store::{DatabasePool, UploadStore};
    use std::path::Path;

    /// Remote stub for adapter tests; the fixtures run offline, so nothing
    /// here should ever be reached except through explicit online paths.
    struct NullRemote;

    #[async_trait]
    impl RemoteDrive for NullRemote {
        async fn probe(&self) -> Result<(), CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn get_root(&self) -> Result<RemoteItem, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError> {
            Err(CoreError::NotFound(id.to_string()))
        }
        async fn list_children(&self, _id: &ItemId) -> Result<Vec<RemoteItem>, CoreError> {
            Ok(Vec::new())
        }
        async fn download_to(&self, _id: &ItemId, _dest: &Path) -> Result<u64, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn upload_small(
            &self,
            _parent_id: &ItemId,
            _name: &str,
            _data: &[u8],
        ) -> Result<RemoteItem, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn create_upload_session(
            &self,
            _parent_id: &ItemId,
            _name: &str,
        ) -> Result<UploadHandle, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn upload_chunk(
            &self,
            _upload_url: &str,
            _data: &[u8],
            _offset: u64,
            _total: u64,
        ) -> Result<Option<RemoteItem>, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn cancel_upload_session(&self, _upload_url: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn mkdir(&self, _parent_id: &ItemId, _name: &str) -> Result<RemoteItem, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn rename(
            &self,
            _id: &ItemId,
            _new_parent: &ItemId,
            _new_name: &str,
        ) -> Result<RemoteItem, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
        async fn delete(&self, _id: &ItemId) -> Result<(), CoreError> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<&DeltaCursor>) -> Result<DeltaPage, CoreError> {
            Ok(DeltaPage::default())
        }
        async fn quota(&self) -> Result<DriveQuota, CoreError> {
            Err(CoreError::NetworkUnavailable("null remote".into()))
        }
    }

    struct Fixture {
        rt: tokio::runtime::Runtime,
        fs: OneMountFs,
        offline_log: Arc<OfflineLog>,
        store: Arc<MetadataStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(offline: bool) -> Fixture {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let (store, offline_log, fs) = rt.block_on(async {
            let pool = DatabasePool::in_memory().await.unwrap();
            let store = Arc::new(MetadataStore::new(
                pool.clone(),
                Arc::new(StateController::new()),
            ));
            let uploads_store = Arc::new(UploadStore::new(pool.clone()));
            let offline_log = Arc::new(OfflineLog::new(pool));
            let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
            let graph = Arc::new(InodeGraph::new());
            let notifier = Arc::new(StatusNotifier::new(64));
            let remote: Arc<dyn RemoteDrive> = Arc::new(NullRemote);

            let root_id = ItemId::new("root").unwrap();
            let root = Entry::root(root_id.clone());
            store
                .create(&root, TransitionCause::CreateLocalHydrated)
                .await
                .unwrap();
            graph.upsert(&root);

            let downloads = crate::download::DownloadManager::new(
                1,
                100,
                Arc::clone(&store),
                Arc::clone(&cache),
                Arc::clone(&graph),
                Arc::clone(&remote),
                Arc::clone(&notifier),
            )
            .unwrap();
            let uploads = UploadManager::new(
                UploadConfig::default(),
                Arc::clone(&store),
                uploads_store,
                Arc::clone(&cache),
                Arc::clone(&graph),
                Arc::clone(&offline_log),
                Arc::clone(&remote),
                Arc::clone(&notifier),
            )
            .unwrap();
            let requests = MetadataRequestManager::new(
                Arc::clone(&remote),
                Duration::from_secs(30),
                500,
            );

            let handles = FsHandles {
                store: Arc::clone(&store),
                cache,
                graph,
                downloads,
                uploads,
                requests,
                offline: Arc::new(OfflineTracker::new(offline)),
                offline_log: Arc::clone(&offline_log),
                notifier,
                remote,
                quota: Arc::new(RwLock::new(None)),
                root_id,
            };
            (store, offline_log, handles)
        });

        let fs = OneMountFs::new(rt.handle().clone(), fs, 64);
        Fixture {
            rt,
            fs,
            offline_log,
            store,
            _dir: dir,
        }
    }

    fn names_of(entries: &[(u64, FileType, String)]) -> Vec<String> {
        entries.iter().map(|(_, _, n)| n.clone()).collect()
    }

    #[test]
    fn test_restricted_names_rejected_before_anything_else() {
        let fx = fixture(true);
        for name in ["CON", "a:b", "desktop.ini", "_vti_bin"] {
            let err = fx.fs.do_mkdir(1, name).unwrap_err();
            assert_eq!(err.errno(), libc::EINVAL, "{name}");
        }
    }

    #[test]
    fn test_offline_mkdir_is_visible_and_tracked() {
        let fx = fixture(true);
        let attr = fx.fs.do_mkdir(1, "pkg").unwrap();
        assert_eq!(attr.kind, FileType::Directory);

        // visible through readdir
        let entries = fx.fs.do_readdir(1).unwrap();
        assert!(names_of(&entries).contains(&"pkg".to_string()));

        // a dirty local entry with a local id
        let entry = fx
            .rt
            .block_on(fx.store.lookup_child(&ItemId::new("root").unwrap(), "pkg"))
            .unwrap()
            .unwrap();
        assert!(entry.id.is_local());
        assert_eq!(entry.state, ItemState::DirtyLocal);
        assert!(entry.pending_remote);

        // tracked in the offline log
        let changes = fx.rt.block_on(fx.offline_log.all()).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1.kind, OfflineChangeKind::Create);
    }

    #[test]
    fn test_write_then_read_roundtrip_offline() {
        let fx = fixture(true);
        let (attr, fh) = fx.fs.do_create(1, "notes.txt").unwrap();

        let written = fx.fs.do_write(attr.ino, fh, 0, b"offline words").unwrap();
        assert_eq!(written, 13);
        assert_eq!(fx.fs.do_read(attr.ino, fh, 0, 1024).unwrap(), b"offline words");

        // size visible through getattr after the write
        assert_eq!(fx.fs.do_getattr(attr.ino).unwrap().size, 13);
        fx.fs.do_release(attr.ino, fh).unwrap();

        // reopening sees the same bytes
        let (fh2, _) = fx.fs.do_open(attr.ino, 0).unwrap();
        assert_eq!(fx.fs.do_read(attr.ino, fh2, 0, 1024).unwrap(), b"offline words");
        fx.fs.do_release(attr.ino, fh2).unwrap();
    }

    #[test]
    fn test_mkdir_rmdir_roundtrip() {
        let fx = fixture(true);
        let before = fx.fs.do_readdir(1).unwrap().len();

        fx.fs.do_mkdir(1, "tmp").unwrap();
        fx.fs.do_unlink(1, "tmp", true).unwrap();

        assert_eq!(fx.fs.do_readdir(1).unwrap().len(), before);
        // local-only directory leaves no tombstone behind
        let gone = fx
            .rt
            .block_on(fx.store.lookup_child(&ItemId::new("root").unwrap(), "tmp"))
            .unwrap();
        assert!(gone.is_none());
    }

    #[test]
    fn test_rmdir_refuses_non_empty() {
        let fx = fixture(true);
        let dir_attr = fx.fs.do_mkdir(1, "full").unwrap();
        fx.fs.do_create(dir_attr.ino, "inner.txt").unwrap();

        let err = fx.fs.do_unlink(1, "full", true).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn test_unlink_missing_is_enoent() {
        let fx = fixture(true);
        let err = fx.fs.do_unlink(1, "ghost.txt", false).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_create_duplicate_is_eexist() {
        let fx = fixture(true);
        fx.fs.do_create(1, "dup.txt").unwrap();
        let err = fx.fs.do_create(1, "Dup.TXT").unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn test_open_ghost_while_offline_is_eremoteio() {
        let fx = fixture(true);
        let entry = fx.rt.block_on(async {
            let entry = Entry::new_remote(
                ItemId::new("G1").unwrap(),
                ItemId::new("root").unwrap(),
                "cloud.bin".to_string(),
                onemount_core::ItemKind::File,
                100,
                None,
                None,
                chrono::Utc::now(),
            );
            fx.store
                .create(&entry, TransitionCause::CreateRemote)
                .await
                .unwrap();
            entry
        });
        let inode = fx.fs.h.graph.upsert(&entry);

        let err = fx.fs.do_open(inode.node_id().get(), 0).unwrap_err();
        assert_eq!(err.errno(), libc::EREMOTEIO);
    }

    #[test]
    fn test_rename_preserves_node_and_moves_entry() {
        let fx = fixture(true);
        let (attr, fh) = fx.fs.do_create(1, "old.txt").unwrap();
        fx.fs.do_release(attr.ino, fh).unwrap();
        let dir_attr = fx.fs.do_mkdir(1, "docs").unwrap();

        fx.fs.do_rename(1, "old.txt", dir_attr.ino, "new.txt").unwrap();

        // old name gone, new lookup finds the same node
        assert_eq!(
            fx.fs.do_lookup(1, "old.txt").unwrap_err().errno(),
            libc::ENOENT
        );
        let moved = fx.fs.do_lookup(dir_attr.ino, "new.txt").unwrap();
        assert_eq!(moved.ino, attr.ino);
    }

    #[test]
    fn test_rename_replaces_existing_target() {
        let fx = fixture(true);
        let (a, fh_a) = fx.fs.do_create(1, "a.txt").unwrap();
        fx.fs.do_release(a.ino, fh_a).unwrap();
        let (b, fh_b) = fx.fs.do_create(1, "b.txt").unwrap();
        fx.fs.do_release(b.ino, fh_b).unwrap();

        fx.fs.do_rename(1, "a.txt", 1, "b.txt").unwrap();
        let found = fx.fs.do_lookup(1, "b.txt").unwrap();
        assert_eq!(found.ino, a.ino);
    }

    #[test]
    fn test_xattr_surface() {
        let fx = fixture(true);
        let (attr, fh) = fx.fs.do_create(1, "x.txt").unwrap();
        fx.fs.do_release(attr.ino, fh).unwrap();

        // reserved attributes are readable
        let state = fx.fs.do_getxattr(attr.ino, "user.onemount.state").unwrap();
        assert_eq!(state, b"dirty_local");

        // no transfer in flight, so progress does not exist
        assert_eq!(
            fx.fs
                .do_getxattr(attr.ino, "user.onemount.progress")
                .unwrap_err()
                .errno(),
            libc::ENODATA
        );

        // and write-protected
        let err = fx
            .fs
            .do_setxattr(attr.ino, "user.onemount.state", b"hydrated")
            .unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);

        // user attributes round-trip through the in-memory map
        fx.fs.do_setxattr(attr.ino, "user.comment", b"hello").unwrap();
        assert_eq!(fx.fs.do_getxattr(attr.ino, "user.comment").unwrap(), b"hello");
        let listing = fx.fs.do_listxattr(attr.ino).unwrap();
        let listed = String::from_utf8(listing).unwrap();
        assert!(listed.contains("user.onemount.state"));
        assert!(listed.contains("user.comment"));

        fx.fs.do_removexattr(attr.ino, "user.comment").unwrap();
        assert_eq!(
            fx.fs.do_getxattr(attr.ino, "user.comment").unwrap_err().errno(),
            libc::ENODATA
        );

        // non-user namespaces are unsupported
        let err = fx
            .fs
            .do_setxattr(attr.ino, "security.selinux", b"x")
            .unwrap_err();
        assert_eq!(err.errno(), libc::ENOTSUP);
    }

    #[test]
    fn test_statfs_falls_back_to_cache_capacity() {
        let fx = fixture(true);
        let (blocks, _bfree, bsize) = fx.fs.do_statfs();
        assert_eq!(bsize, 4096);
        assert_eq!(blocks, 64 * 1024 * 1024 * 1024 / 4096);
    }

    #[test]
    fn test_statfs_uses_quota_when_known() {
        let fx = fixture(true);
        *fx.fs.h.quota.write().unwrap() = Some(DriveQuota {
            total: 4096 * 1000,
            used: 4096 * 250,
            remaining: 4096 * 750,
        });
        let (blocks, bfree, _bsize) = fx.fs.do_statfs();
        assert_eq!(blocks, 1000);
        assert_eq!(bfree, 750);
    }

    #[test]
    fn test_truncate_marks_dirty() {
        let fx = fixture(true);
        let (attr, fh) = fx.fs.do_create(1, "t.txt").unwrap();
        fx.fs.do_write(attr.ino, fh, 0, b"0123456789").unwrap();
        fx.fs.do_release(attr.ino, fh).unwrap();

        let updated = fx.fs.do_setattr(attr.ino, Some(4), None).unwrap();
        assert_eq!(updated.size, 4);

        let (fh2, _) = fx.fs.do_open(attr.ino, 0).unwrap();
        assert_eq!(fx.fs.do_read(attr.ino, fh2, 0, 100).unwrap(), b"0123");
        fx.fs.do_release(attr.ino, fh2).unwrap();
    }
}
