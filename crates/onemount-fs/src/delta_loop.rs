//! Delta/realtime loop
//!
//! One task pulls the incremental change feed and applies it to the local
//! catalog. The polling interval adapts: recent foreground metadata activity
//! pins the fast interval; otherwise notifier health decides (healthy push
//! channel = slow fallback polling, degraded = baseline, failed = short
//! recovery cadence). Push notifications wake the loop immediately.
//!
//! The delta cursor is committed only after a change set has been fully
//! ingested; a crash in between replays the set instead of losing it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_conflict::{detect, ConflictResolver};
use onemount_core::config::DeltaConfig;
use onemount_core::domain::{Entry, FileStatus, ItemState, Priority, TransitionCause};
use onemount_core::ports::{RemoteDrive, RemoteItem};
use onemount_core::{CoreError, ItemId};
use onemount_store::{MetadataStore, OfflineLog};

use crate::inode::InodeGraph;
use crate::offline::{OfflineDrainer, OfflineTracker};
use crate::realtime::{ChangeSignal, NotifierHealth, RealtimeHandle};
use crate::requests::MetadataRequestManager;
use crate::status::StatusNotifier;
use crate::upload::UploadManager;

/// Ingests the remote change feed.
pub struct DeltaLoop {
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    graph: Arc<InodeGraph>,
    remote: Arc<dyn RemoteDrive>,
    resolver: Arc<ConflictResolver>,
    offline_log: Arc<OfflineLog>,
    offline: Arc<OfflineTracker>,
    drainer: Arc<OfflineDrainer>,
    uploads: UploadManager,
    requests: MetadataRequestManager,
    notifier: Arc<StatusNotifier>,
    config: DeltaConfig,
    root_id: ItemId,
    signals: Option<mpsc::Receiver<ChangeSignal>>,
    health: watch::Receiver<NotifierHealth>,
}

impl DeltaLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        graph: Arc<InodeGraph>,
        remote: Arc<dyn RemoteDrive>,
        resolver: Arc<ConflictResolver>,
        offline_log: Arc<OfflineLog>,
        offline: Arc<OfflineTracker>,
        drainer: Arc<OfflineDrainer>,
        uploads: UploadManager,
        requests: MetadataRequestManager,
        notifier: Arc<StatusNotifier>,
        config: DeltaConfig,
        root_id: ItemId,
        realtime: RealtimeHandle,
    ) -> Self {
        let RealtimeHandle {
            signals, health, ..
        } = realtime;
        Self {
            store,
            cache,
            graph,
            remote,
            resolver,
            offline_log,
            offline,
            drainer,
            uploads,
            requests,
            notifier,
            config,
            root_id,
            signals,
            health,
        }
    }

    /// The interval until the next poll, from activity and notifier health.
    fn current_interval(&self) -> Duration {
        let activity_window = Duration::from_secs(self.config.activity_window_secs);
        if let Some(idle) = self.requests.foreground_idle() {
            if idle < activity_window {
                return Duration::from_secs(self.config.active_interval_secs);
            }
        }
        match *self.health.borrow() {
            NotifierHealth::Healthy => Duration::from_secs(self.config.realtime_fallback_secs),
            NotifierHealth::Degraded => Duration::from_secs(self.config.default_interval_secs),
            NotifierHealth::Failed => Duration::from_secs(self.config.recovery_interval_secs),
            NotifierHealth::Unknown => Duration::from_secs(self.config.default_interval_secs),
        }
    }

    /// Runs until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            active_secs = self.config.active_interval_secs,
            default_secs = self.config.default_interval_secs,
            "Delta loop starting"
        );
        loop {
            let interval = self.current_interval();
            let mut signals = self.signals.take();
            let woke_by_signal = {
                let wait_signal = async {
                    match signals.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Delta loop stopping");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => false,
                    signal = wait_signal => signal.is_some(),
                }
            };
            self.signals = signals;
            if woke_by_signal {
                debug!("Realtime signal received, syncing now");
            }

            let cycle = std::panic::AssertUnwindSafe(self.sync_once())
                .catch_unwind()
                .await;
            let cycle = match cycle {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("Delta cycle panicked; loop continues");
                    continue;
                }
            };
            match cycle {
                Ok(applied) => {
                    if applied > 0 {
                        debug!(applied, "Delta changes applied");
                    }
                    if self.offline.is_offline() {
                        self.offline.set_online();
                        if let Err(e) = self.drainer.drain_on_reconnect().await {
                            warn!(error = %e, "Offline drain failed");
                            if e.is_offline() {
                                self.offline.set_offline();
                            }
                        }
                    }
                }
                Err(e) if e.is_offline() => self.offline.set_offline(),
                Err(e) => warn!(error = %e, "Delta sync failed"),
            }
        }
    }

    /// One full delta cycle: fetch, ingest in server order, commit cursor.
    pub async fn sync_once(&self) -> Result<usize, CoreError> {
        let cursor = self.store.cursor().await.map_err(CoreError::from)?;
        let page = match self.remote.delta(cursor.as_ref()).await {
            Ok(page) => page,
            // an expired cursor (410 Gone) forces a full resync
            Err(CoreError::InvalidArgument(reason)) => {
                warn!(reason = %reason, "Delta cursor rejected, resetting for full resync");
                self.store.clear_cursor().await.map_err(CoreError::from)?;
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut applied = 0usize;
        for item in &page.items {
            match self.ingest(item).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(id = %item.id, error = %e, "Failed to ingest delta item")
                }
            }
        }

        // cursor advances only after the whole set was ingested
        if let Some(cursor) = page.cursor {
            self.store.set_cursor(&cursor).await.map_err(CoreError::from)?;
        }
        Ok(applied)
    }

    /// Applies one remote change without clobbering local edits.
    async fn ingest(&self, item: &RemoteItem) -> Result<(), CoreError> {
        if item.id == self.root_id {
            return Ok(());
        }

        let local = self.store.try_get(&item.id).await.map_err(CoreError::from)?;

        // Server visibility of our own pending creation: a delta item whose
        // parent and name match a pending-remote local entry is that entry,
        // arriving before (or instead of) the upload's own response.
        if local.is_none() && !item.is_deleted {
            if let Some(parent_id) = &item.parent_id {
                if let Some(pending) = self
                    .store
                    .lookup_child(parent_id, &item.name)
                    .await
                    .map_err(CoreError::from)?
                {
                    if pending.pending_remote && pending.id.is_local() {
                        debug!(local = %pending.id, server = %item.id, "Pending creation became visible, reconciling");
                        self.store
                            .move_id(&pending.id, &item.id)
                            .await
                            .map_err(CoreError::from)?;
                        self.graph.move_id(&pending.id, &item.id);
                        self.cache
                            .move_id(&pending.id, &item.id)
                            .map_err(CoreError::from)?;
                        self.offline_log
                            .move_id(&pending.id, &item.id)
                            .await
                            .map_err(CoreError::from)?;
                        // this server item IS our own creation; adopt its
                        // version tags and leave the dirty state alone so
                        // the in-flight upload (or the next drain) settles
                        // it, rather than mis-reading it as a conflict
                        let etag = item.etag.clone();
                        let hash = item.hash.clone();
                        let updated = self
                            .store
                            .update(&item.id, |entry| {
                                entry.etag = etag;
                                if hash.is_some() {
                                    entry.content_hash = hash;
                                }
                            })
                            .await
                            .map_err(CoreError::from)?;
                        self.graph.upsert(&updated);
                        return Ok(());
                    }
                }
            }
        }

        let Some(local) = local else {
            return self.ingest_new(item).await;
        };

        // divergence against local edits goes to the resolver
        let last_change = self
            .offline_log
            .last_for_item(&local.id)
            .await
            .map_err(CoreError::from)?;
        let remote_for_detect = if item.is_deleted { None } else { Some(item) };
        if let Some(conflict) = detect(&local, remote_for_detect, last_change.as_ref()) {
            let path = self.graph.path_of(&local.id);
            let outcome = self
                .resolver
                .resolve(conflict)
                .await
                .map_err(|e| CoreError::Conflict(e.to_string()))?;
            if let Some(path) = path {
                self.notifier.emit(path, FileStatus::Conflict);
            }
            if let Some(fork) = &outcome.forked {
                self.graph.upsert(fork);
            }
            if let Some(entry) = self.store.try_get(&item.id).await.map_err(CoreError::from)? {
                self.graph.upsert(&entry);
            }
            if let Some(requeue) = outcome.requeue_upload {
                if let Err(e) = self.uploads.queue(&requeue, Priority::Normal).await {
                    warn!(id = %requeue, error = %e, "Failed to requeue post-conflict upload");
                }
            }
            return Ok(());
        }

        if item.is_deleted {
            return self.ingest_tombstone(&local).await;
        }
        self.ingest_update(&local, item).await
    }

    /// A change for an item we have never seen: a new ghost entry.
    async fn ingest_new(&self, item: &RemoteItem) -> Result<(), CoreError> {
        if item.is_deleted {
            return Ok(()); // tombstone for an unknown item
        }
        let Some(parent_id) = item.parent_id.clone() else {
            return Ok(()); // drive-level noise (e.g. the root facet)
        };
        if self
            .store
            .try_get(&parent_id)
            .await
            .map_err(CoreError::from)?
            .is_none()
        {
            // parent not ingested yet; the next cycle (or full resync)
            // will bring it first
            debug!(id = %item.id, parent = %parent_id, "Skipping delta item with unknown parent");
            return Ok(());
        }

        let entry = Entry::new_remote(
            item.id.clone(),
            parent_id,
            item.name.clone(),
            item.kind(),
            item.size,
            item.hash.clone(),
            item.etag.clone(),
            item.mtime.unwrap_or_else(chrono::Utc::now),
        );
        self.store
            .create(&entry, TransitionCause::CreateRemote)
            .await
            .map_err(CoreError::from)?;
        self.graph.upsert(&entry);
        if let Some(path) = self.graph.path_of(&entry.id) {
            self.notifier.emit(path, FileStatus::Cloud);
        }
        Ok(())
    }

    /// A clean remote tombstone: purge metadata, cache and projection.
    async fn ingest_tombstone(&self, local: &Entry) -> Result<(), CoreError> {
        let path = self.graph.path_of(&local.id);
        self.cache.delete(&local.id).map_err(CoreError::from)?;
        if local.state != ItemState::Deleted {
            self.store
                .transition(&local.id, ItemState::Deleted, TransitionCause::RemoteTombstone)
                .await
                .map_err(CoreError::from)?;
        }
        self.store.delete(&local.id).await.map_err(CoreError::from)?;
        self.graph.remove(&local.id);
        self.uploads.cancel(&local.id).await;
        if let Some(path) = path {
            self.notifier.forget(&path);
        }
        Ok(())
    }

    /// A remote update for a clean local entry: invalidate the body when the
    /// version changed, refresh fields, follow renames.
    async fn ingest_update(&self, local: &Entry, item: &RemoteItem) -> Result<(), CoreError> {
        let etag_differs = match (&local.etag, &item.etag) {
            (Some(l), Some(r)) => l != r,
            (None, Some(_)) => true,
            _ => false,
        };
        let hash_differs = match (&local.content_hash, &item.hash) {
            (Some(l), Some(r)) => l != r,
            (None, Some(_)) => true,
            _ => false,
        };

        if (etag_differs || hash_differs) && local.state == ItemState::Hydrated && !local.is_directory() {
            // stale cached body: evict, keep metadata (size/hash/etag are
            // refreshed below from the remote item)
            self.cache.delete(&local.id).map_err(CoreError::from)?;
            self.store
                .transition(&local.id, ItemState::Ghost, TransitionCause::Eviction)
                .await
                .map_err(CoreError::from)?;
            if let Some(path) = self.graph.path_of(&local.id) {
                self.notifier.emit(path, FileStatus::OutofSync);
            }
        }

        let etag = item.etag.clone();
        let hash = item.hash.clone();
        let size = item.size;
        let mtime = item.mtime;
        let updated = self
            .store
            .update(&local.id, |entry| {
                entry.etag = etag;
                if hash.is_some() {
                    entry.content_hash = hash;
                }
                if !entry.is_directory() {
                    entry.size = size;
                }
                if let Some(mtime) = mtime {
                    entry.mtime = mtime;
                }
            })
            .await
            .map_err(CoreError::from)?;

        // reparent/rename as needed
        let placement_changed = item.name.to_lowercase() != local.name.to_lowercase()
            || (item.parent_id.is_some() && item.parent_id != local.parent_id);
        if placement_changed {
            if let Some(new_parent) = item.parent_id.clone().or_else(|| local.parent_id.clone()) {
                self.store
                    .reparent(&local.id, &new_parent, &item.name)
                    .await
                    .map_err(CoreError::from)?;
                self.graph.rename(&local.id, &new_parent, &item.name);
            }
        }

        self.graph.upsert(&updated);
        Ok(())
    }
}
