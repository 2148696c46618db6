//! Upload manager
//!
//! Small bodies go up in a single PUT; larger ones use resumable sessions
//! whose chunk progress is persisted to the `uploads` bucket after every
//! confirmed chunk. The worker loop launches up to `max_in_flight`
//! concurrent uploads from a three-level priority queue, retries errored
//! sessions with exponential backoff, and finalizes completions by
//! reconciling IDs, writing the returned etag and driving
//! `dirty_local -> hydrated`.
//!
//! On restart, persisted sessions that had started are cancelled server-side
//! and requeued from the beginning; their progress fields are preserved so a
//! future resume path has the data it needs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_core::config::UploadConfig;
use onemount_core::domain::{
    FileStatus, ItemState, Priority, TransitionCause, UploadSession,
};
use onemount_core::ports::{RemoteDrive, RemoteItem};
use onemount_core::{CoreError, ItemId};
use onemount_store::{MetadataStore, OfflineLog, UploadStore};

use crate::inode::InodeGraph;
use crate::status::StatusNotifier;

/// Base delay for retry backoff.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Lifecycle of one queued upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Queued,
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl UploadPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadPhase::Completed | UploadPhase::Errored | UploadPhase::Cancelled
        )
    }
}

struct ActiveUpload {
    session: Mutex<UploadSession>,
    phase_tx: watch::Sender<UploadPhase>,
    /// Percentage progress (0-100) for subscribers
    progress_tx: watch::Sender<u8>,
    error: Mutex<Option<CoreError>>,
    cancelled: AtomicBool,
}

impl ActiveUpload {
    fn new(session: UploadSession) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(UploadPhase::Queued);
        // restart-scanned sessions start with their persisted progress
        let (progress_tx, _) = watch::channel(session.progress_percent());
        Arc::new(Self {
            session: Mutex::new(session),
            phase_tx,
            progress_tx,
            error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        })
    }

    fn phase(&self) -> UploadPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: UploadPhase) {
        let _ = self.phase_tx.send(phase);
    }

    fn progress(&self) -> u8 {
        *self.progress_tx.borrow()
    }

    fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress_tx.subscribe()
    }

    /// Publishes the percentage from the session's confirmed bytes.
    fn publish_progress(&self) {
        let pct = self.session.lock().unwrap().progress_percent();
        let _ = self.progress_tx.send(pct);
    }

    fn priority(&self) -> Priority {
        self.session.lock().unwrap().priority
    }

    fn snapshot(&self) -> UploadSession {
        self.session.lock().unwrap().clone()
    }
}

struct Inner {
    store: Arc<MetadataStore>,
    uploads: Arc<UploadStore>,
    cache: Arc<ContentCache>,
    graph: Arc<InodeGraph>,
    offline_log: Arc<OfflineLog>,
    remote: Arc<dyn RemoteDrive>,
    notifier: Arc<StatusNotifier>,
    sessions: DashMap<ItemId, Arc<ActiveUpload>>,
    queues: Mutex<[VecDeque<ItemId>; 3]>,
    backoff_until: Mutex<HashMap<ItemId, Instant>>,
    notify: Notify,
    in_flight: Arc<Semaphore>,
    running: DashMap<ItemId, ()>,
    accepting: AtomicBool,
    config: UploadConfig,
}

/// Priority queue of uploads with persistence and ID reconciliation.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: UploadConfig,
        store: Arc<MetadataStore>,
        uploads: Arc<UploadStore>,
        cache: Arc<ContentCache>,
        graph: Arc<InodeGraph>,
        offline_log: Arc<OfflineLog>,
        remote: Arc<dyn RemoteDrive>,
        notifier: Arc<StatusNotifier>,
    ) -> Result<Self, CoreError> {
        if !(100..=5000).contains(&config.queue_size) {
            return Err(CoreError::InvalidArgument(format!(
                "upload queue size {} outside [100, 5000]",
                config.queue_size
            )));
        }
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight as usize));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                uploads,
                cache,
                graph,
                offline_log,
                remote,
                notifier,
                sessions: DashMap::new(),
                queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
                backoff_until: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                in_flight,
                running: DashMap::new(),
                accepting: AtomicBool::new(true),
                config,
            }),
        })
    }

    // ------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------

    /// Queues an upload for a dirty entry.
    ///
    /// Deduplication per ID: an existing session at the same or higher
    /// priority makes this a no-op; a lower-priority predecessor is
    /// cancelled and replaced.
    pub async fn queue(&self, id: &ItemId, priority: Priority) -> Result<(), CoreError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(CoreError::Storage(
                "upload manager is shutting down".to_string(),
            ));
        }

        if let Some(existing) = self.inner.sessions.get(id).map(|r| Arc::clone(&r)) {
            if !existing.phase().is_terminal() {
                if existing.priority() >= priority {
                    debug!(id = %id, "Upload already queued at >= priority, ignoring");
                    return Ok(());
                }
                debug!(id = %id, "Replacing lower-priority upload session");
                self.cancel_session(id, &existing).await;
            }
        }

        {
            let queues = self.inner.queues.lock().unwrap();
            let total: usize = queues.iter().map(|q| q.len()).sum();
            if total >= self.inner.config.queue_size as usize {
                return Err(CoreError::Storage("upload queue full".to_string()));
            }
        }

        let entry = self.inner.store.get(id).await.map_err(CoreError::from)?;
        let size = self.inner.cache.size(id).unwrap_or(entry.size);
        let session = UploadSession::new(
            id.clone(),
            entry.name.clone(),
            size,
            self.inner.config.chunk_size,
            priority,
        )?;
        self.inner
            .uploads
            .save(&session)
            .await
            .map_err(CoreError::from)?;

        let active = ActiveUpload::new(session);
        self.inner.sessions.insert(id.clone(), active);
        self.inner.queues.lock().unwrap()[priority as usize].push_back(id.clone());
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Purges queued or in-flight work for an ID (used on unlink).
    pub async fn cancel(&self, id: &ItemId) {
        if let Some(active) = self.inner.sessions.get(id).map(|r| Arc::clone(&r)) {
            self.cancel_session(id, &active).await;
        }
        let _ = self.inner.uploads.remove(id).await;
    }

    async fn cancel_session(&self, id: &ItemId, active: &Arc<ActiveUpload>) {
        active.cancelled.store(true, Ordering::SeqCst);
        {
            let mut queues = self.inner.queues.lock().unwrap();
            for queue in queues.iter_mut() {
                queue.retain(|queued| queued != id);
            }
        }
        let upload_url = active.session.lock().unwrap().upload_url.clone();
        if let Some(url) = upload_url {
            if let Err(e) = self.inner.remote.cancel_upload_session(&url).await {
                warn!(id = %id, error = %e, "Failed to cancel upload session server-side");
            }
        }
        active.set_phase(UploadPhase::Cancelled);
        self.inner.sessions.remove_if(id, |_, v| Arc::ptr_eq(v, active));
    }

    /// Waits for the session queued under `id` to reach a terminal phase.
    pub async fn wait(&self, id: &ItemId) -> Result<(), CoreError> {
        let Some(active) = self.inner.sessions.get(id).map(|r| Arc::clone(&r)) else {
            return Ok(());
        };
        let mut rx = active.phase_tx.subscribe();
        loop {
            match *rx.borrow() {
                UploadPhase::Completed => return Ok(()),
                UploadPhase::Cancelled => return Ok(()),
                UploadPhase::Errored => {
                    return Err(active
                        .error
                        .lock()
                        .unwrap()
                        .clone()
                        .unwrap_or_else(|| CoreError::Storage("upload failed".to_string())))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Current chunk progress of a queued or in-flight upload.
    pub fn progress(&self, id: &ItemId) -> Option<u8> {
        self.inner.sessions.get(id).map(|s| s.progress())
    }

    /// Progress subscription, mirroring the download manager's.
    pub fn subscribe_progress(&self, id: &ItemId) -> Option<watch::Receiver<u8>> {
        self.inner.sessions.get(id).map(|s| s.subscribe_progress())
    }

    /// Whether any upload is queued or in flight.
    pub fn has_active_uploads(&self) -> bool {
        if !self.inner.running.is_empty() {
            return true;
        }
        let queues = self.inner.queues.lock().unwrap();
        queues.iter().any(|q| !q.is_empty())
    }

    // ------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------

    /// Scans the `uploads` bucket after a restart. Sessions that had started
    /// are cancelled server-side and requeued from the beginning; persisted
    /// progress is retained in the bucket until the session is requeued.
    pub async fn restart_scan(&self) -> Result<usize, CoreError> {
        let persisted = self
            .inner
            .uploads
            .load_all()
            .await
            .map_err(CoreError::from)?;
        let mut requeued = 0usize;
        for mut session in persisted {
            if session.had_started() {
                if let Some(url) = &session.upload_url {
                    if let Err(e) = self.inner.remote.cancel_upload_session(url).await {
                        warn!(id = %session.id, error = %e, "Stale upload session cancel failed");
                    }
                }
                info!(
                    id = %session.id,
                    last_chunk = session.last_successful_chunk,
                    bytes = session.bytes_uploaded,
                    "Restarting interrupted upload from the beginning"
                );
                session.reset_progress();
            }
            self.inner
                .uploads
                .save(&session)
                .await
                .map_err(CoreError::from)?;

            let id = session.id.clone();
            let priority = session.priority;
            let active = ActiveUpload::new(session);
            self.inner.sessions.insert(id.clone(), active);
            self.inner.queues.lock().unwrap()[priority as usize].push_back(id);
            requeued += 1;
        }
        if requeued > 0 {
            info!(count = requeued, "Requeued persisted upload sessions");
            self.inner.notify.notify_one();
        }
        Ok(requeued)
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    /// Runs the dispatch loop until cancelled, then performs the graceful
    /// shutdown sequence.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            max_in_flight = self.inner.config.max_in_flight,
            "Upload manager starting"
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.notify.notified() => {}
                _ = ticker.tick() => {}
            }
            self.dispatch_ready().await;
        }

        self.shutdown().await;
    }

    /// Launches uploads for every ready queue entry while permits last.
    async fn dispatch_ready(&self) {
        loop {
            let Ok(permit) = Arc::clone(&self.inner.in_flight).try_acquire_owned() else {
                return;
            };
            let Some(id) = self.pop_ready() else {
                drop(permit);
                return;
            };
            let manager = self.clone();
            self.inner.running.insert(id.clone(), ());
            tokio::spawn(async move {
                // a panic in one upload must not leak its running slot
                let work = std::panic::AssertUnwindSafe(manager.process(&id));
                if work.catch_unwind().await.is_err() {
                    tracing::error!(id = %id, "Upload task panicked");
                }
                manager.inner.running.remove(&id);
                manager.inner.notify.notify_one();
                drop(permit);
            });
        }
    }

    /// Pops the highest-priority entry whose backoff window has passed.
    fn pop_ready(&self) -> Option<ItemId> {
        let now = Instant::now();
        let backoff = self.inner.backoff_until.lock().unwrap();
        let mut queues = self.inner.queues.lock().unwrap();
        for queue in queues.iter_mut().rev() {
            if let Some(pos) = queue
                .iter()
                .position(|id| backoff.get(id).map_or(true, |&until| until <= now))
            {
                return queue.remove(pos);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------

    async fn process(&self, id: &ItemId) {
        let Some(active) = self.inner.sessions.get(id).map(|r| Arc::clone(&r)) else {
            return;
        };
        if active.cancelled.load(Ordering::SeqCst) {
            return;
        }
        active.set_phase(UploadPhase::Running);

        let entry = match self.inner.store.get(id).await {
            Ok(entry) => entry,
            Err(_) => {
                // unlinked while queued
                debug!(id = %id, "Entry gone before upload, cancelling session");
                self.cancel_session(id, &active).await;
                return;
            }
        };
        let path = self
            .inner
            .graph
            .path_of(id)
            .unwrap_or_else(|| format!("/{}", entry.name));
        self.inner.notifier.emit(path.clone(), FileStatus::Syncing);

        let result = if entry.is_directory() {
            self.upload_directory(id, &entry).await
        } else {
            self.upload_file(id, &entry, &active).await
        };

        match result {
            Ok(Some(remote_item)) => {
                if let Err(e) = self.finalize(id, &active, remote_item, &path).await {
                    warn!(id = %id, error = %e, "Upload finalization failed");
                    self.record_failure(id, &active, e, &path).await;
                }
            }
            Ok(None) => {
                // cancelled or shutdown mid-stream; progress already persisted
            }
            Err(err) => self.record_failure(id, &active, err, &path).await,
        }
    }

    async fn upload_directory(
        &self,
        id: &ItemId,
        entry: &onemount_core::Entry,
    ) -> Result<Option<RemoteItem>, CoreError> {
        let parent = entry
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::InvalidArgument("upload of root".to_string()))?;
        match self.inner.remote.mkdir(&parent, &entry.name).await {
            Ok(item) => Ok(Some(item)),
            Err(CoreError::AlreadyExists(_)) => {
                self.adopt_existing(id, &parent, &entry.name).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_file(
        &self,
        id: &ItemId,
        entry: &onemount_core::Entry,
        active: &Arc<ActiveUpload>,
    ) -> Result<Option<RemoteItem>, CoreError> {
        let parent = entry
            .parent_id
            .clone()
            .ok_or_else(|| CoreError::InvalidArgument("upload of root".to_string()))?;
        let body = self.inner.cache.get(id).map_err(CoreError::from)?;

        if (body.len() as u64) < self.inner.config.small_threshold {
            let item = match self
                .inner
                .remote
                .upload_small(&parent, &entry.name, &body)
                .await
            {
                Ok(item) => item,
                Err(CoreError::AlreadyExists(_)) => {
                    self.adopt_existing(id, &parent, &entry.name).await?
                }
                Err(e) => return Err(e),
            };
            return Ok(Some(item));
        }

        self.upload_chunked(id, &parent, entry, active, &body).await
    }

    /// Resumable session: chunks of `chunk_size`, progress persisted after
    /// every confirmed chunk. Cancellation is observed at chunk boundaries.
    async fn upload_chunked(
        &self,
        id: &ItemId,
        parent: &ItemId,
        entry: &onemount_core::Entry,
        active: &Arc<ActiveUpload>,
        body: &[u8],
    ) -> Result<Option<RemoteItem>, CoreError> {
        let chunk_size = self.inner.config.chunk_size as usize;
        let total = body.len() as u64;

        let upload_url = {
            let session = active.session.lock().unwrap();
            session.upload_url.clone()
        };
        let upload_url = match upload_url {
            Some(url) => url,
            None => {
                let handle = self
                    .inner
                    .remote
                    .create_upload_session(parent, &entry.name)
                    .await?;
                let snapshot = {
                    let mut session = active.session.lock().unwrap();
                    session.upload_url = Some(handle.upload_url.clone());
                    session.size = total;
                    session.clone()
                };
                self.inner
                    .uploads
                    .save(&snapshot)
                    .await
                    .map_err(CoreError::from)?;
                handle.upload_url
            }
        };

        let start_chunk = active.session.lock().unwrap().last_successful_chunk;
        let total_chunks = active.session.lock().unwrap().total_chunks;

        for chunk_index in start_chunk..total_chunks {
            if active.cancelled.load(Ordering::SeqCst)
                || !self.inner.accepting.load(Ordering::SeqCst)
            {
                debug!(id = %id, chunk = chunk_index, "Upload paused at chunk boundary");
                return Ok(None);
            }

            let offset = chunk_index as usize * chunk_size;
            let end = (offset + chunk_size).min(body.len());
            let chunk = &body[offset..end];

            let maybe_item = self
                .inner
                .remote
                .upload_chunk(&upload_url, chunk, offset as u64, total)
                .await?;

            let snapshot = {
                let mut session = active.session.lock().unwrap();
                session.record_chunk(chunk_index + 1, chunk.len() as u64);
                session.clone()
            };
            active.publish_progress();
            self.inner
                .uploads
                .save(&snapshot)
                .await
                .map_err(CoreError::from)?;

            if let Some(item) = maybe_item {
                return Ok(Some(item));
            }
        }

        Err(CoreError::Storage(format!(
            "upload session for {id} ran out of chunks without a final response"
        )))
    }

    /// name_already_exists recovery: list the parent, locate the duplicate
    /// by name (case-insensitively) and adopt its server ID.
    async fn adopt_existing(
        &self,
        id: &ItemId,
        parent: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, CoreError> {
        info!(id = %id, name, "Name exists remotely, adopting server item");
        let children = self.inner.remote.list_children(parent).await?;
        children
            .into_iter()
            .find(|c| c.name.to_lowercase() == name.to_lowercase())
            .ok_or_else(|| {
                CoreError::NotFound(format!("duplicate of {name} not found in listing"))
            })
    }

    /// Completion: reconcile IDs, write the etag, drive the state machine
    /// and publish the `Local` status.
    async fn finalize(
        &self,
        id: &ItemId,
        active: &Arc<ActiveUpload>,
        remote_item: RemoteItem,
        path: &str,
    ) -> Result<(), CoreError> {
        let new_id = remote_item.id.clone();
        if new_id != *id {
            // ID reconciliation across every subsystem that keys by item ID
            self.inner
                .store
                .move_id(id, &new_id)
                .await
                .map_err(CoreError::from)?;
            self.inner.graph.move_id(id, &new_id);
            self.inner.cache.move_id(id, &new_id).map_err(CoreError::from)?;
            self.inner
                .offline_log
                .move_id(id, &new_id)
                .await
                .map_err(CoreError::from)?;
            let mut session = active.session.lock().unwrap();
            session.old_id = Some(id.clone());
            session.id = new_id.clone();
        }

        let etag = remote_item.etag.clone();
        let hash = remote_item.hash.clone();
        self.inner
            .store
            .update(&new_id, |entry| {
                entry.etag = etag;
                if hash.is_some() {
                    entry.content_hash = hash;
                }
            })
            .await
            .map_err(CoreError::from)?;

        let updated = self
            .inner
            .store
            .transition(&new_id, ItemState::Hydrated, TransitionCause::UploadSuccess)
            .await
            .map_err(CoreError::from)?;
        self.inner.graph.upsert(&updated);

        // the bucket may hold the record under either key
        let _ = self.inner.uploads.remove(id).await;
        let _ = self.inner.uploads.remove(&new_id).await;

        let _ = active.progress_tx.send(100);
        active.set_phase(UploadPhase::Completed);
        self.inner.sessions.remove(id);
        self.inner.notifier.emit(path.to_string(), FileStatus::Local);
        info!(id = %id, new_id = %new_id, "Upload complete");
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &ItemId,
        active: &Arc<ActiveUpload>,
        err: CoreError,
        path: &str,
    ) {
        let retries = {
            let mut session = active.session.lock().unwrap();
            session.retries += 1;
            session.retries
        };

        if !err.is_recoverable() || retries > self.inner.config.max_retries {
            warn!(id = %id, retries, error = %err, "Upload failed permanently");
            *active.error.lock().unwrap() = Some(err);
            active.set_phase(UploadPhase::Errored);
            self.inner.sessions.remove(id);
            let _ = self.inner.uploads.remove(id).await;
            self.inner.notifier.emit(path.to_string(), FileStatus::Error);
            return;
        }

        let delay = RETRY_BASE * 2u32.saturating_pow(retries - 1);
        debug!(id = %id, retries, delay_secs = delay.as_secs(), error = %err, "Upload retry scheduled");
        self.inner
            .backoff_until
            .lock()
            .unwrap()
            .insert(id.clone(), Instant::now() + delay);
        let priority = active.priority();
        active.set_phase(UploadPhase::Queued);
        self.inner.queues.lock().unwrap()[priority as usize].push_back(id.clone());
    }

    // ------------------------------------------------------------------
    // Graceful shutdown
    // ------------------------------------------------------------------

    /// Refuses new enqueues, waits up to the grace window for in-flight
    /// sessions, persists resumable progress, and logs what was still
    /// active.
    async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let grace = Duration::from_secs(self.inner.config.stop_grace_secs);
        info!(grace_secs = grace.as_secs(), "Upload manager draining");

        let deadline = Instant::now() + grace;
        while !self.inner.running.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // persist whatever is still tracked
        let mut remaining: Vec<String> = Vec::new();
        for entry in self.inner.sessions.iter() {
            let snapshot = entry.value().snapshot();
            if !entry.value().phase().is_terminal() {
                remaining.push(snapshot.id.to_string());
                if let Err(e) = self.inner.uploads.save(&snapshot).await {
                    warn!(id = %snapshot.id, error = %e, "Failed to persist upload session");
                }
            }
        }

        if remaining.is_empty() {
            info!("Upload manager stopped with no active sessions");
        } else {
            info!(active = ?remaining, "Upload manager stopped; sessions persisted for restart");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use onemount_core::domain::{Entry, StateController};
    use onemount_core::ports::{DeltaPage, DriveQuota, UploadHandle};
    use onemount_core::{DeltaCursor, ETag};
    use onemount_store::DatabasePool;
    use std::path::Path;
    use std::sync::atomic::AtomicU32;

    const CHUNK: u64 = onemount_core::domain::session::MIN_CHUNK_SIZE; // 1 MiB

    /// Remote stub whose upload behavior is scripted per test.
    struct ScriptedRemote {
        server_id: String,
        /// chunk index (1-based) at which upload_chunk fails, 0 = never
        fail_chunk: AtomicU32,
        chunks_seen: AtomicU32,
        mkdir_conflict: AtomicBool,
        cancelled_sessions: Mutex<Vec<String>>,
    }

    impl ScriptedRemote {
        fn new(server_id: &str) -> Self {
            Self {
                server_id: server_id.to_string(),
                fail_chunk: AtomicU32::new(0),
                chunks_seen: AtomicU32::new(0),
                mkdir_conflict: AtomicBool::new(false),
                cancelled_sessions: Mutex::new(Vec::new()),
            }
        }

        fn item(&self, name: &str, directory: bool) -> RemoteItem {
            RemoteItem {
                id: ItemId::new(&self.server_id).unwrap(),
                name: name.to_string(),
                parent_id: Some(ItemId::new("root").unwrap()),
                size: 0,
                etag: Some(ETag::new("\"server-etag\"").unwrap()),
                hash: None,
                mtime: Some(chrono::Utc::now()),
                is_directory: directory,
                is_deleted: false,
            }
        }
    }

    #[async_trait]
    impl RemoteDrive for ScriptedRemote {
        async fn probe(&self) -> Result<(), CoreError> {
            Ok(())
        }
        async fn get_root(&self) -> Result<RemoteItem, CoreError> {
            unimplemented!("not used")
        }
        async fn get_item(&self, _id: &ItemId) -> Result<RemoteItem, CoreError> {
            unimplemented!("not used")
        }
        async fn list_children(&self, _id: &ItemId) -> Result<Vec<RemoteItem>, CoreError> {
            Ok(vec![self.item("pkg", true)])
        }
        async fn download_to(&self, _id: &ItemId, _dest: &Path) -> Result<u64, CoreError> {
            Ok(0)
        }
        async fn upload_small(
            &self,
            _parent_id: &ItemId,
            name: &str,
            _data: &[u8],
        ) -> Result<RemoteItem, CoreError> {
            Ok(self.item(name, false))
        }
        async fn create_upload_session(
            &self,
            _parent_id: &ItemId,
            _name: &str,
        ) -> Result<UploadHandle, CoreError> {
            Ok(UploadHandle {
                upload_url: "https://upload.example/session".to_string(),
                expires_at: None,
            })
        }
        async fn upload_chunk(
            &self,
            _upload_url: &str,
            _data: &[u8],
            offset: u64,
            total: u64,
        ) -> Result<Option<RemoteItem>, CoreError> {
            let index = self.chunks_seen.fetch_add(1, Ordering::SeqCst) + 1;
            let fail_at = self.fail_chunk.load(Ordering::SeqCst);
            if fail_at != 0 && index == fail_at {
                return Err(CoreError::NetworkUnavailable("chunk failed".to_string()));
            }
            if offset + _data.len() as u64 >= total {
                return Ok(Some(self.item("big.bin", false)));
            }
            Ok(None)
        }
        async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError> {
            self.cancelled_sessions
                .lock()
                .unwrap()
                .push(upload_url.to_string());
            Ok(())
        }
        async fn mkdir(&self, _parent_id: &ItemId, name: &str) -> Result<RemoteItem, CoreError> {
            if self.mkdir_conflict.load(Ordering::SeqCst) {
                return Err(CoreError::AlreadyExists(name.to_string()));
            }
            Ok(self.item(name, true))
        }
        async fn rename(
            &self,
            _id: &ItemId,
            _new_parent: &ItemId,
            _new_name: &str,
        ) -> Result<RemoteItem, CoreError> {
            unimplemented!("not used")
        }
        async fn delete(&self, _id: &ItemId) -> Result<(), CoreError> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<&DeltaCursor>) -> Result<DeltaPage, CoreError> {
            Ok(DeltaPage::default())
        }
        async fn quota(&self) -> Result<DriveQuota, CoreError> {
            Ok(DriveQuota::default())
        }
    }

    struct Fixture {
        manager: UploadManager,
        store: Arc<MetadataStore>,
        uploads: Arc<UploadStore>,
        cache: Arc<ContentCache>,
        graph: Arc<InodeGraph>,
        remote: Arc<ScriptedRemote>,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    async fn fixture(remote: ScriptedRemote) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(MetadataStore::new(
            pool.clone(),
            Arc::new(StateController::new()),
        ));
        let uploads = Arc::new(UploadStore::new(pool.clone()));
        let offline_log = Arc::new(OfflineLog::new(pool));
        let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
        let graph = Arc::new(InodeGraph::new());
        let notifier = Arc::new(StatusNotifier::new(64));
        let remote = Arc::new(remote);

        let root = Entry::root(ItemId::new("root").unwrap());
        store
            .create(&root, TransitionCause::CreateLocalHydrated)
            .await
            .unwrap();
        graph.upsert(&root);

        let mut config = UploadConfig::default();
        config.chunk_size = CHUNK;
        config.small_threshold = 4 * 1024; // 4 KiB keeps test bodies tiny
        config.stop_grace_secs = 2;

        let manager = UploadManager::new(
            config,
            Arc::clone(&store),
            Arc::clone(&uploads),
            Arc::clone(&cache),
            Arc::clone(&graph),
            offline_log,
            Arc::clone(&remote) as Arc<dyn RemoteDrive>,
            notifier,
        )
        .unwrap();

        let cancel = CancellationToken::new();

        Fixture {
            manager,
            store,
            uploads,
            cache,
            graph,
            remote,
            cancel,
            _dir: dir,
        }
    }

    impl Fixture {
        fn start(&self) {
            tokio::spawn(self.manager.clone().run(self.cancel.clone()));
        }
    }

    async fn dirty_file(fx: &Fixture, name: &str, body: &[u8]) -> ItemId {
        let entry = Entry::new_local_file(ItemId::new("root").unwrap(), name).unwrap();
        fx.store
            .create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        fx.graph.upsert(&entry);
        fx.cache.insert(&entry.id, body).unwrap();
        entry.id
    }

    #[tokio::test]
    async fn test_small_upload_reconciles_local_id() {
        let fx = fixture(ScriptedRemote::new("SERVER-X")).await;
        fx.start();
        let local_id = dirty_file(&fx, "new.txt", b"small body").await;
        let node_id = fx.graph.get_by_id(&local_id).unwrap().node_id();
        assert!(local_id.is_local());

        fx.manager.queue(&local_id, Priority::Normal).await.unwrap();
        let mut progress_rx = fx.manager.subscribe_progress(&local_id).unwrap();
        fx.manager.wait(&local_id).await.unwrap();

        // subscribers see the completed upload at 100%
        assert_eq!(*progress_rx.borrow_and_update(), 100);

        let server_id = ItemId::new("SERVER-X").unwrap();
        // store re-keyed
        assert!(fx.store.try_get(&local_id).await.unwrap().is_none());
        let entry = fx.store.get(&server_id).await.unwrap();
        assert_eq!(entry.state, ItemState::Hydrated);
        assert_eq!(entry.etag.unwrap().as_str(), "\"server-etag\"");
        assert!(!entry.pending_remote);

        // node id preserved across reconciliation
        let inode = fx.graph.get_by_id(&server_id).unwrap();
        assert_eq!(inode.node_id(), node_id);
        assert!(fx.graph.get_by_id(&local_id).is_none());

        // cache object renamed
        assert!(!fx.cache.has(&local_id));
        assert_eq!(fx.cache.get(&server_id).unwrap(), b"small body");

        // parent children reference the server id
        let root = fx.store.get(&ItemId::new("root").unwrap()).await.unwrap();
        assert!(root.children.contains(&server_id));
        assert!(!root.children.contains(&local_id));

        // session persisted record cleaned up
        assert!(fx.uploads.load_all().await.unwrap().is_empty());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_queue_is_single_completion() {
        let fx = fixture(ScriptedRemote::new("SRV1")).await;
        let id = dirty_file(&fx, "a.txt", b"body").await;

        // no worker running yet, so both enqueues hit the dedup path
        fx.manager.queue(&id, Priority::Normal).await.unwrap();
        fx.manager.queue(&id, Priority::Normal).await.unwrap();
        assert_eq!(fx.manager.inner.sessions.len(), 1);
        let queued: usize = fx
            .manager
            .inner
            .queues
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.len())
            .sum();
        assert_eq!(queued, 1);

        fx.start();
        fx.manager.wait(&id).await.unwrap();

        // one upload, one completion: exactly one entry under the server id
        let server_id = ItemId::new("SRV1").unwrap();
        assert!(fx.store.try_get(&server_id).await.unwrap().is_some());
        assert_eq!(fx.store.count().await.unwrap(), 2); // root + file
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_chunked_upload_persists_progress_per_chunk() {
        let remote = ScriptedRemote::new("BIG1");
        remote.fail_chunk.store(3, Ordering::SeqCst);
        let fx = fixture(remote).await;
        fx.start();

        // 2.5 chunks worth of data
        let body = vec![7u8; (CHUNK * 2 + CHUNK / 2) as usize];
        let id = dirty_file(&fx, "big.bin", &body).await;
        fx.manager.queue(&id, Priority::Normal).await.unwrap();

        // wait until the third chunk has failed and progress is persisted
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let persisted = fx.uploads.get(&id).await.unwrap();
            if let Some(session) = persisted {
                if session.last_successful_chunk == 2 {
                    assert_eq!(session.bytes_uploaded, 2 * CHUNK);
                    assert!(session.can_resume);
                    // 2 of 2.5 chunks confirmed
                    assert_eq!(fx.manager.progress(&id), Some(80));
                    break;
                }
            }
            assert!(Instant::now() < deadline, "chunk progress never persisted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_restart_scan_cancels_and_requeues() {
        let fx = fixture(ScriptedRemote::new("RSRV")).await;

        // simulate a persisted session from a previous run, two chunks in
        let id = dirty_file(&fx, "resume.bin", &vec![1u8; (CHUNK * 3) as usize]).await;
        let mut session =
            UploadSession::new(id.clone(), "resume.bin", CHUNK * 3, CHUNK, Priority::Normal)
                .unwrap();
        session.upload_url = Some("https://upload.example/old-session".to_string());
        session.record_chunk(1, CHUNK);
        session.record_chunk(2, CHUNK);
        fx.uploads.save(&session).await.unwrap();

        let requeued = fx.manager.restart_scan().await.unwrap();
        assert_eq!(requeued, 1);

        // stale session cancelled server-side
        let cancelled = fx.remote.cancelled_sessions.lock().unwrap().clone();
        assert_eq!(cancelled, vec!["https://upload.example/old-session".to_string()]);

        // progress reset for restart-from-beginning, can_resume preserved
        let reloaded = fx.uploads.get(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_successful_chunk, 0);
        assert_eq!(reloaded.bytes_uploaded, 0);
        assert!(reloaded.upload_url.is_none());
        assert!(reloaded.can_resume);
        assert!(fx.manager.has_active_uploads());
    }

    #[tokio::test]
    async fn test_cancel_purges_queued_work() {
        // no worker spawned: the item stays queued
        let fx = fixture(ScriptedRemote::new("C1")).await;

        let id = dirty_file(&fx, "doomed.txt", b"x").await;
        fx.manager.queue(&id, Priority::Background).await.unwrap();
        assert!(fx.manager.has_active_uploads());

        fx.manager.cancel(&id).await;
        assert!(!fx.manager.has_active_uploads());
        assert!(fx.uploads.get(&id).await.unwrap().is_none());
        // wait returns promptly for a cancelled session
        fx.manager.wait(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_conflict_adopts_server_id() {
        let remote = ScriptedRemote::new("ADOPTED");
        remote.mkdir_conflict.store(true, Ordering::SeqCst);
        let fx = fixture(remote).await;
        fx.start();

        let entry = Entry::new_local_dir(ItemId::new("root").unwrap(), "pkg").unwrap();
        fx.store
            .create(&entry, TransitionCause::CreateLocalDirty)
            .await
            .unwrap();
        fx.graph.upsert(&entry);

        fx.manager.queue(&entry.id, Priority::High).await.unwrap();
        fx.manager.wait(&entry.id).await.unwrap();

        let adopted = ItemId::new("ADOPTED").unwrap();
        let dir = fx.store.get(&adopted).await.unwrap();
        assert_eq!(dir.state, ItemState::Hydrated);
        assert!(fx.store.try_get(&entry.id).await.unwrap().is_none());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let fx = fixture(ScriptedRemote::new("S1")).await;
        fx.start();
        let id = dirty_file(&fx, "late.txt", b"x").await;

        fx.cancel.cancel();
        // let the run loop perform its shutdown sequence
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = fx.manager.queue(&id, Priority::Normal).await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
    }
}
