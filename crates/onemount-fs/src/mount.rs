//! Composition root
//!
//! Wires typed handles for each subsystem (metadata, content, downloads,
//! uploads, delta, offline, status) through explicit constructor injection;
//! tests can substitute any handle with a stub. A single [`OneMount::spawn`]
//! call starts the background tasks and returns a [`ShutdownHandle`] whose
//! `stop()` cancels the subsystems in the documented order, each bounded by
//! its own grace window:
//!
//! cache cleanup -> delta loop -> download manager -> upload manager ->
//! metadata request manager.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use onemount_cache::{CacheCleaner, ContentCache, ThumbnailCache};
use onemount_conflict::{ConflictResolver, PolicyRules};
use onemount_core::config::Config;
use onemount_core::domain::{Entry, ItemState, StateController};
use onemount_core::ports::{DriveQuota, RemoteDrive};
use onemount_core::ItemId;
use onemount_store::{
    migrate_legacy_bucket, validate_all, DatabasePool, MetadataStore, OfflineLog, UploadStore,
};

use crate::delta_loop::DeltaLoop;
use crate::download::DownloadManager;
use crate::filesystem::{FsHandles, OneMountFs};
use crate::inode::InodeGraph;
use crate::offline::{OfflineDrainer, OfflineTracker};
use crate::realtime::RealtimeTransport;
use crate::requests::MetadataRequestManager;
use crate::status::StatusNotifier;
use crate::upload::UploadManager;

/// Refresh cadence for the statfs quota snapshot.
const QUOTA_REFRESH: Duration = Duration::from_secs(600);

/// The wired-up filesystem core, ready to mount and run.
pub struct OneMount {
    config: Config,
    remote: Arc<dyn RemoteDrive>,
    store: Arc<MetadataStore>,
    offline_log: Arc<OfflineLog>,
    cache: Arc<ContentCache>,
    thumbs: Arc<ThumbnailCache>,
    graph: Arc<InodeGraph>,
    notifier: Arc<StatusNotifier>,
    offline: Arc<OfflineTracker>,
    downloads: DownloadManager,
    uploads: UploadManager,
    requests: MetadataRequestManager,
    drainer: Arc<OfflineDrainer>,
    resolver: Arc<ConflictResolver>,
    quota: Arc<RwLock<Option<DriveQuota>>>,
    root_id: ItemId,
    transport: Option<RealtimeTransport>,
}

impl OneMount {
    /// Opens the on-disk state, runs migrations and recovery, fetches or
    /// restores the drive root, and wires every subsystem.
    pub async fn init(
        config: Config,
        remote: Arc<dyn RemoteDrive>,
        transport: RealtimeTransport,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        // --- durable state ---
        let pool = DatabasePool::new(&config.database_path())
            .await
            .context("opening metadata database")?;
        let migrated = migrate_legacy_bucket(&pool)
            .await
            .context("migrating legacy metadata bucket")?;
        if migrated > 0 {
            info!(rows = migrated, "Migrated legacy metadata bucket");
        }
        let report = validate_all(&pool).await.context("validating catalog")?;
        if !report.is_clean() {
            for row in &report.invalid {
                warn!(id = %row.id, reason = %row.reason, "Invalid catalog row");
            }
        }

        let controller = Arc::new(StateController::new());
        let store = Arc::new(MetadataStore::new(pool.clone(), controller));
        let uploads_store = Arc::new(UploadStore::new(pool.clone()));
        let offline_log = Arc::new(OfflineLog::new(pool));

        // --- on-disk cache + crash recovery ---
        let cache =
            Arc::new(ContentCache::new(&config.cache.root).context("creating content cache")?);
        let thumbs =
            Arc::new(ThumbnailCache::new(&config.cache.root).context("creating thumbnail cache")?);
        let stale = cache.sweep_partials().unwrap_or(0);
        if stale > 0 {
            info!(count = stale, "Removed interrupted downloads from a previous run");
        }

        // --- the drive root: restored from the catalog, else fetched ---
        let offline = Arc::new(OfflineTracker::new(false));
        let mut root: Option<Entry> = None;
        store
            .for_each(|entry| {
                if entry.is_root() {
                    root = Some(entry);
                }
            })
            .await
            .context("scanning for cached root")?;
        let root = match root {
            Some(root) => root,
            None => {
                let fetched = tokio::time::timeout(
                    config.timeouts.init_root(),
                    remote.get_root(),
                )
                .await
                .context("root fetch timed out at init")?
                .context("fetching drive root")?;
                let root = Entry::root(fetched.id);
                store
                    .create(
                        &root,
                        onemount_core::domain::TransitionCause::CreateLocalHydrated,
                    )
                    .await
                    .map_err(onemount_core::CoreError::from)
                    .context("persisting drive root")?;
                root
            }
        };
        let root_id = root.id.clone();

        // --- in-memory projection ---
        let graph = Arc::new(InodeGraph::new());
        graph.upsert(&root);
        let mut entries = Vec::new();
        store.for_each(|entry| entries.push(entry)).await?;
        // parents before children so name-index rows always have a parent
        entries.sort_by_key(|e| e.parent_id.is_some());
        for entry in &entries {
            if !entry.state.is_deleted() {
                graph.upsert(entry);
            }
        }
        graph.insert_virtual(
            &root_id,
            ".xdg-volume-info",
            format!(
                "[Volume Info]\nName={}\nIconFile=.volume-icon\n",
                config.mount.volume_label
            )
            .into_bytes(),
        );

        let notifier = Arc::new(StatusNotifier::new(1024));

        // --- managers ---
        let downloads = DownloadManager::new(
            config.downloads.workers as usize,
            config.downloads.queue_size as usize,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&graph),
            Arc::clone(&remote),
            Arc::clone(&notifier),
        )
        .context("creating download manager")?;

        let uploads = UploadManager::new(
            config.uploads.clone(),
            Arc::clone(&store),
            Arc::clone(&uploads_store),
            Arc::clone(&cache),
            Arc::clone(&graph),
            Arc::clone(&offline_log),
            Arc::clone(&remote),
            Arc::clone(&notifier),
        )
        .context("creating upload manager")?;
        let restarted = uploads.restart_scan().await.context("restart upload scan")?;
        if restarted > 0 {
            info!(count = restarted, "Requeued uploads from a previous run");
        }

        let requests = MetadataRequestManager::new(
            Arc::clone(&remote),
            config.timeouts.metadata_request(),
            config.downloads.queue_size as usize,
        );

        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            PolicyRules::from_config(
                &config.conflicts.default_strategy,
                &config.conflicts.rules,
            ),
        ));

        let drainer = Arc::new(OfflineDrainer::new(
            Arc::clone(&store),
            Arc::clone(&offline_log),
            Arc::clone(&graph),
            Arc::clone(&remote),
            uploads.clone(),
        ));

        Ok(Self {
            config,
            remote,
            store,
            offline_log,
            cache,
            thumbs,
            graph,
            notifier,
            offline,
            downloads,
            uploads,
            requests,
            drainer,
            resolver,
            quota: Arc::new(RwLock::new(None)),
            root_id,
            transport: Some(transport),
        })
    }

    /// Builds the FUSE adapter over the wired handles.
    pub fn filesystem(&self, rt: tokio::runtime::Handle) -> OneMountFs {
        OneMountFs::new(
            rt,
            FsHandles {
                store: Arc::clone(&self.store),
                cache: Arc::clone(&self.cache),
                graph: Arc::clone(&self.graph),
                downloads: self.downloads.clone(),
                uploads: self.uploads.clone(),
                requests: self.requests.clone(),
                offline: Arc::clone(&self.offline),
                offline_log: Arc::clone(&self.offline_log),
                notifier: Arc::clone(&self.notifier),
                remote: Arc::clone(&self.remote),
                quota: Arc::clone(&self.quota),
                root_id: self.root_id.clone(),
            },
            self.config.cache.capacity_gb,
        )
    }

    /// The status query interface.
    pub fn notifier(&self) -> Arc<StatusNotifier> {
        Arc::clone(&self.notifier)
    }

    /// Spawns all background tasks and returns the ordered shutdown handle.
    pub fn spawn(&mut self) -> ShutdownHandle {
        let root_cancel = CancellationToken::new();
        let mut subsystems = Vec::new();
        let default_grace = self.config.timeouts.stop_grace();

        // cache cleanup + maintenance
        let cleanup_token = root_cancel.child_token();
        let cleaner = CacheCleaner::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.thumbs),
            Duration::from_secs(self.config.cache.expiry_days as u64 * 24 * 3600),
            Duration::from_secs(self.config.cache.cleanup_interval_hours as u64 * 3600),
        );
        let maintenance = tokio::spawn(maintenance_loop(
            cleaner,
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            Arc::clone(&self.remote),
            Arc::clone(&self.quota),
            cleanup_token.clone(),
        ));
        subsystems.push(Subsystem {
            name: "cache cleanup",
            token: cleanup_token,
            handle: maintenance,
            grace: default_grace,
        });

        // delta loop (owns the realtime transport)
        let delta_token = root_cancel.child_token();
        let realtime = self
            .transport
            .take()
            .unwrap_or(RealtimeTransport::Poll)
            .start(delta_token.child_token());
        let delta = DeltaLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            Arc::clone(&self.graph),
            Arc::clone(&self.remote),
            Arc::clone(&self.resolver),
            Arc::clone(&self.offline_log),
            Arc::clone(&self.offline),
            Arc::clone(&self.drainer),
            self.uploads.clone(),
            self.requests.clone(),
            Arc::clone(&self.notifier),
            self.config.delta.clone(),
            self.root_id.clone(),
            realtime,
        );
        let delta_task = tokio::spawn(delta.run(delta_token.clone()));
        subsystems.push(Subsystem {
            name: "delta loop",
            token: delta_token,
            handle: delta_task,
            grace: default_grace,
        });

        // download manager
        let download_token = root_cancel.child_token();
        let downloads = self.downloads.clone();
        let download_task = tokio::spawn(downloads.run(download_token.clone()));
        subsystems.push(Subsystem {
            name: "download manager",
            token: download_token,
            handle: download_task,
            grace: default_grace,
        });

        // upload manager (longer grace: it persists progress on the way out)
        let upload_token = root_cancel.child_token();
        let uploads = self.uploads.clone();
        let upload_task = tokio::spawn(uploads.run(upload_token.clone()));
        subsystems.push(Subsystem {
            name: "upload manager",
            token: upload_token,
            handle: upload_task,
            // slightly past the manager's own drain window so the persist
            // step is never cut short
            grace: Duration::from_secs(self.config.uploads.stop_grace_secs + 2),
        });

        // metadata request manager
        let requests_token = root_cancel.child_token();
        let requests = self.requests.clone();
        let requests_task = tokio::spawn(requests.run(requests_token.clone()));
        subsystems.push(Subsystem {
            name: "metadata request manager",
            token: requests_token,
            handle: requests_task,
            grace: default_grace,
        });

        info!("All subsystems running");
        ShutdownHandle {
            root: root_cancel,
            subsystems,
        }
    }
}

struct Subsystem {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
    grace: Duration,
}

/// Stops the subsystems in order, each within its grace window.
pub struct ShutdownHandle {
    root: CancellationToken,
    subsystems: Vec<Subsystem>,
}

impl ShutdownHandle {
    /// Ordered, bounded shutdown.
    pub async fn stop(self) {
        info!("Shutting down subsystems");
        for subsystem in self.subsystems {
            subsystem.token.cancel();
            match tokio::time::timeout(subsystem.grace, subsystem.handle).await {
                Ok(Ok(())) => info!(subsystem = subsystem.name, "Stopped"),
                Ok(Err(e)) => warn!(subsystem = subsystem.name, error = %e, "Task ended abnormally"),
                Err(_) => warn!(
                    subsystem = subsystem.name,
                    grace_secs = subsystem.grace.as_secs(),
                    "Did not stop within its grace window"
                ),
            }
        }
        self.root.cancel();
        info!("Shutdown complete");
    }
}

/// Cleanup, deleted-entry purge and quota refresh on one ticker.
async fn maintenance_loop(
    cleaner: CacheCleaner,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteDrive>,
    quota: Arc<RwLock<Option<DriveQuota>>>,
    cancel: CancellationToken,
) {
    // the quota snapshot wants an early first probe
    let mut quota_timer = tokio::time::interval(QUOTA_REFRESH);
    let mut cleanup_timer = tokio::time::interval(Duration::from_secs(3600));
    cleanup_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = quota_timer.tick() => {
                match remote.quota().await {
                    Ok(snapshot) => *quota.write().unwrap() = Some(snapshot),
                    Err(e) => tracing::debug!(error = %e, "Quota probe failed"),
                }
            }
            _ = cleanup_timer.tick() => {
                cleaner.sweep_once();
                purge_deleted(&store, &cache).await;
            }
        }
    }
    tracing::debug!("Maintenance loop stopped");
}

/// Cache content for tombstoned entries is purged within the next cycle.
async fn purge_deleted(store: &MetadataStore, cache: &ContentCache) {
    match store.in_state(ItemState::Deleted).await {
        Ok(tombstones) => {
            for entry in tombstones {
                if let Err(e) = cache.delete(&entry.id) {
                    warn!(id = %entry.id, error = %e, "Failed to purge cache for tombstone");
                }
            }
        }
        Err(e) => warn!(error = %e, "Tombstone scan failed"),
    }
}
