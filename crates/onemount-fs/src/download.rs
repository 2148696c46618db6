//! Download (hydration) manager
//!
//! A bounded worker pool consumes from a three-level priority queue and
//! fetches file bodies on demand. Queueing is idempotent per item: a second
//! `queue` call for an in-flight ID returns the existing session. Workers
//! stream the body to the cache's partial path, fsync, rename into place and
//! drive the `ghost -> hydrated` transition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_core::domain::{
    DownloadState, FileStatus, ItemState, Priority, TransitionCause,
};
use onemount_core::ports::RemoteDrive;
use onemount_core::{CoreError, ItemId};
use onemount_store::MetadataStore;

use crate::inode::InodeGraph;
use crate::status::StatusNotifier;

/// One hydration in flight (or finished).
pub struct DownloadSession {
    pub id: ItemId,
    state_tx: watch::Sender<DownloadState>,
    /// Percentage progress (0-100) for subscribers
    progress_tx: watch::Sender<u8>,
    total: AtomicU64,
    downloaded: AtomicU64,
    error: Mutex<Option<CoreError>>,
}

impl DownloadSession {
    fn new(id: ItemId) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DownloadState::Queued);
        let (progress_tx, _) = watch::channel(0u8);
        Arc::new(Self {
            id,
            state_tx,
            progress_tx,
            total: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            error: Mutex::new(None),
        })
    }

    /// Current session state, non-blocking.
    pub fn state(&self) -> DownloadState {
        *self.state_tx.borrow()
    }

    /// Current progress as a percentage (0-100). Empty bodies are
    /// immediately complete.
    pub fn progress(&self) -> u8 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return if self.state() == DownloadState::Completed { 100 } else { 0 };
        }
        let downloaded = self.downloaded.load(Ordering::SeqCst);
        ((downloaded * 100) / total).min(100) as u8
    }

    /// Subscribes to progress updates; multiple waiters share the channel.
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress_tx.subscribe()
    }

    /// Error cause once the session is `Errored`.
    pub fn error(&self) -> Option<CoreError> {
        self.error.lock().unwrap().clone()
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Records bytes on disk so far and publishes the percentage.
    fn set_downloaded(&self, bytes: u64) {
        self.downloaded.store(bytes, Ordering::SeqCst);
        let _ = self.progress_tx.send(self.progress());
    }

    fn mark_complete(&self) {
        self.downloaded
            .store(self.total.load(Ordering::SeqCst), Ordering::SeqCst);
        let _ = self.progress_tx.send(100);
    }

    fn set_state(&self, state: DownloadState) {
        let _ = self.state_tx.send(state);
    }

    fn fail(&self, err: CoreError) {
        *self.error.lock().unwrap() = Some(err);
        self.set_state(DownloadState::Errored);
    }

    /// Waits until the session reaches a terminal state.
    pub async fn wait(&self) -> Result<(), CoreError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            match state {
                DownloadState::Completed => return Ok(()),
                DownloadState::Errored => {
                    return Err(self
                        .error()
                        .unwrap_or_else(|| CoreError::Storage("download failed".to_string())))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(CoreError::Storage("download session dropped".to_string()));
            }
        }
    }
}

struct Inner {
    sessions: DashMap<ItemId, Arc<DownloadSession>>,
    queues: Mutex<[VecDeque<ItemId>; 3]>,
    notify: Notify,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    graph: Arc<InodeGraph>,
    remote: Arc<dyn RemoteDrive>,
    notifier: Arc<StatusNotifier>,
    queue_capacity: usize,
}

/// Priority-ordered bounded hydration pool.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
    workers: usize,
}

impl DownloadManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        graph: Arc<InodeGraph>,
        remote: Arc<dyn RemoteDrive>,
        notifier: Arc<StatusNotifier>,
    ) -> Result<Self, CoreError> {
        if !(1..=10).contains(&workers) {
            return Err(CoreError::InvalidArgument(format!(
                "download worker pool size {workers} outside [1, 10]"
            )));
        }
        if !(100..=5000).contains(&queue_capacity) {
            return Err(CoreError::InvalidArgument(format!(
                "download queue size {queue_capacity} outside [100, 5000]"
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                queues: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
                notify: Notify::new(),
                store,
                cache,
                graph,
                remote,
                notifier,
                queue_capacity,
            }),
            workers,
        })
    }

    /// Queues a hydration. Idempotent: a live session for the same ID is
    /// returned instead of queueing a second download.
    pub fn queue(&self, id: &ItemId, priority: Priority) -> Result<Arc<DownloadSession>, CoreError> {
        if let Some(existing) = self.inner.sessions.get(id) {
            if !existing.state().is_terminal() {
                debug!(id = %id, "Hydration already in flight, reusing session");
                return Ok(Arc::clone(&existing));
            }
        }

        {
            let queues = self.inner.queues.lock().unwrap();
            let total: usize = queues.iter().map(|q| q.len()).sum();
            if total >= self.inner.queue_capacity {
                return Err(CoreError::Storage("download queue full".to_string()));
            }
        }

        let session = DownloadSession::new(id.clone());
        self.inner.sessions.insert(id.clone(), Arc::clone(&session));
        self.inner.queues.lock().unwrap()[priority as usize].push_back(id.clone());
        // notify_one stores a permit, so a worker between pop and park still
        // sees the wakeup
        self.inner.notify.notify_one();
        Ok(session)
    }

    /// Non-blocking session state lookup.
    pub fn status(&self, id: &ItemId) -> Option<DownloadState> {
        self.inner.sessions.get(id).map(|s| s.state())
    }

    /// Current progress of an in-flight (or finished) hydration.
    pub fn progress(&self, id: &ItemId) -> Option<u8> {
        self.inner.sessions.get(id).map(|s| s.progress())
    }

    /// Progress subscription for waiters that want percentages rather than
    /// terminal states.
    pub fn subscribe_progress(&self, id: &ItemId) -> Option<watch::Receiver<u8>> {
        self.inner.sessions.get(id).map(|s| s.subscribe_progress())
    }

    /// Blocks until the session for `id` completes or errors. Returns
    /// immediately when no session exists.
    pub async fn wait(&self, id: &ItemId) -> Result<(), CoreError> {
        let Some(session) = self.inner.sessions.get(id).map(|s| Arc::clone(&s)) else {
            return Ok(());
        };
        session.wait().await
    }

    fn pop(&self) -> Option<ItemId> {
        let mut queues = self.inner.queues.lock().unwrap();
        for queue in queues.iter_mut().rev() {
            if let Some(id) = queue.pop_front() {
                return Some(id);
            }
        }
        None
    }

    /// Spawns the worker pool; resolves when all workers have drained after
    /// cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        info!(workers = self.workers, "Download manager starting");
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let manager = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                manager.worker_loop(worker, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Download manager stopped");
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let Some(id) = self.pop() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.notify.notified() => continue,
                }
            };
            debug!(worker, id = %id, "Hydration starting");
            // a panicking hydration must not take the worker down with it
            let hydration = std::panic::AssertUnwindSafe(self.hydrate(&id, &cancel));
            if hydration.catch_unwind().await.is_err() {
                tracing::error!(worker, id = %id, "Hydration task panicked");
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        debug!(worker, "Download worker exiting");
    }

    /// Fetches one body and promotes the entry to `hydrated`.
    async fn hydrate(&self, id: &ItemId, cancel: &CancellationToken) {
        let Some(session) = self.inner.sessions.get(id).map(|s| Arc::clone(&s)) else {
            return;
        };
        session.set_state(DownloadState::Running);

        match self.hydrate_inner(id, &session, cancel).await {
            Ok(path) => {
                session.mark_complete();
                session.set_state(DownloadState::Completed);
                self.inner.notifier.emit(path, FileStatus::Local);
            }
            Err(err) => {
                warn!(id = %id, error = %err, "Hydration failed");
                if let Ok(entry) = self.inner.store.get(id).await {
                    self.inner
                        .notifier
                        .emit(format!("/{}", entry.name), FileStatus::Error);
                }
                session.fail(err);
            }
        }
    }

    async fn hydrate_inner(
        &self,
        id: &ItemId,
        session: &DownloadSession,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let entry = self.inner.store.get(id).await.map_err(CoreError::from)?;
        let path = format!("/{}", entry.name);

        // already satisfied (racing queue calls, refresh-after-eviction)
        if entry.state.has_content() && self.inner.cache.has(id) {
            return Ok(path);
        }
        if entry.state != ItemState::Ghost {
            return Err(CoreError::TransitionDenied {
                from: entry.state.name().to_string(),
                to: ItemState::Hydrated.name().to_string(),
            });
        }
        session.set_total(entry.size);

        self.inner
            .notifier
            .emit(path.clone(), FileStatus::Downloading);

        let partial = self.inner.cache.partial_path(id);
        let fetch = self.inner.remote.download_to(id, &partial);
        tokio::pin!(fetch);
        // progress comes from the growing partial file while the body streams
        let mut progress_tick = tokio::time::interval(std::time::Duration::from_millis(250));
        let written = loop {
            tokio::select! {
                result = &mut fetch => break result?,
                _ = progress_tick.tick() => {
                    if let Ok(meta) = std::fs::metadata(&partial) {
                        session.set_downloaded(meta.len());
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = std::fs::remove_file(&partial);
                    return Err(CoreError::Timeout("hydration cancelled".to_string()));
                }
            }
        };

        if written != entry.size {
            let _ = std::fs::remove_file(&partial);
            return Err(CoreError::Storage(format!(
                "short download for {id}: got {written} bytes, expected {}",
                entry.size
            )));
        }

        self.inner
            .cache
            .commit_partial(id)
            .map_err(CoreError::from)?;
        let updated = self
            .inner
            .store
            .transition(id, ItemState::Hydrated, TransitionCause::HydrationComplete)
            .await
            .map_err(CoreError::from)?;
        self.inner.graph.upsert(&updated);

        debug!(id = %id, bytes = written, "Hydration complete");
        Ok(path)
    }
}
